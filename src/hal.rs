//! The transfer engine shared by the SDIO and HSPI slaves.
//!
//! ## TX
//! A transfer is split into chunks of at most `tx_buf_len` bytes. Each chunk takes the next free
//! TXBD, which gets pointed at the chunk and marked valid, after which `rx_en` is pulsed to make
//! the wrapper pick it up. If the ring is full, we asynchronously wait for the interrupt handler
//! to retire a descriptor, for at most [TX_DESCRIPTOR_TIMEOUT] per chunk.
//!
//! The wrapper clears the valid bit of a TXBD, once the host read its frame. Several frames can
//! complete before the handler runs, while the up frame done bit only latches once. So every
//! such interrupt retires all descriptors in flight, starting from the oldest, up to the first
//! one that is still valid. Released descriptors stay reserved until they are retired, which
//! keeps the descriptors in flight contiguous. Retired descriptors are numbered sequentially,
//! which is what [TxTicket] refers to.
//!
//! ## RX
//! All RXBDs start out valid. Once the host wrote a frame, the wrapper clears the valid bit and
//! raises the down frame done interrupt. The handler then walks the ring from the current RXBD,
//! reports every filled descriptor, marks it valid again and pulses `tx_en`.
//!
//! ## Commands
//! There is only a single command buffer. Once a downlink command was reported, the buffer is
//! marked available again, since the host can't send another command otherwise.

use core::{
    cell::{Cell, RefCell},
    future::poll_fn,
    task::Poll,
};

use atomic_waker::AtomicWaker;
use embassy_sync::blocking_mutex;
use embassy_time::with_timeout;

use crate::{
    config::{DramWindow, RX_DATA_MAX, TX_DATA_MAX, TX_DESCRIPTOR_TIMEOUT},
    dma_list::{BdRing, BufferDescriptor, RxBd, TxBd},
    regs::{Wrapper, WrapperInterrupts},
    resources::{BufDesc, CisBuffer},
    transport::{CisFunction, Transport},
    DefaultRawMutex, SlaveError, SlaveResult,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventKind {
    /// A TX data frame was sent to the host.
    Tx,
    /// A data frame was received from the host.
    Rx,
    /// The host fetched the uplink command.
    TxCmd,
    /// A command was received from the host.
    RxCmd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Something the hardware reported.
pub struct SlaveEvent {
    pub kind: EventKind,
    /// Bus address of the buffer concerned.
    pub addr: u32,
}

/// Receives the events from the interrupt handler.
///
/// This is called in interrupt context and must not block or call back into the HAL.
pub trait EventHandler {
    fn on_event(&self, event: SlaveEvent);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Identifies the last descriptor of a TX transfer.
pub struct TxTicket(u32);

/// Live state of the registered rings.
struct RingState {
    tx_ring: BdRing<TxBd>,
    rx_ring: BdRing<RxBd>,
    /// The next TXBD to fill.
    curr_txbd: usize,
    /// The oldest TXBD, that the hardware hasn't retired yet.
    oldest_txbd: usize,
    tx_in_flight: usize,
    /// The next RXBD, that the hardware will fill.
    curr_rxbd: usize,
    tx_buf_len: u16,
    rx_buf_len: u16,
    cis: Option<[CisBuffer; 2]>,
    tx_queued_seq: u32,
    tx_retired_seq: u32,
}
impl RingState {
    /// Fill the current TXBD, if it was retired.
    fn try_queue(&mut self, addr: u32, len: u16) -> Option<TxTicket> {
        if self.tx_in_flight == self.tx_ring.len() {
            return None;
        }
        let index = self.curr_txbd;
        let txbd = self.tx_ring.get(index);
        if txbd.valid() {
            return None;
        }
        txbd.fill(addr, len);
        self.curr_txbd = self.tx_ring.next_index(index);
        self.tx_in_flight += 1;
        self.tx_queued_seq = self.tx_queued_seq.wrapping_add(1);
        trace!("Queued {} bytes from {:#x} on TXBD {}.", len, addr, index);
        Some(TxTicket(self.tx_queued_seq))
    }
    /// Retire the oldest TXBD in flight, if the hardware released it, and return its buffer
    /// address.
    fn retire_tx(&mut self) -> Option<u32> {
        if self.tx_in_flight == 0 {
            return None;
        }
        let txbd = self.tx_ring.get(self.oldest_txbd);
        if txbd.valid() {
            return None;
        }
        let addr = txbd.txbuf_addr();
        self.oldest_txbd = self.tx_ring.next_index(self.oldest_txbd);
        self.tx_in_flight -= 1;
        self.tx_retired_seq = self.tx_retired_seq.wrapping_add(1);
        Some(addr)
    }
    fn cis(&self, func: CisFunction) -> SlaveResult<&CisBuffer> {
        let cis = self.cis.as_ref().ok_or(SlaveError::InvalidParam)?;
        match func.into_bits() {
            0 => Ok(&cis[0]),
            1 => Ok(&cis[1]),
            _ => Err(SlaveError::InvalidParam),
        }
    }
}

/// The HAL of a slave device.
pub struct SlaveHal<'h, T: Transport, H> {
    transport: T,
    wrapper: Wrapper<T::Regs>,
    dram: DramWindow,
    rings: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Option<RingState>>>,
    handler: blocking_mutex::Mutex<DefaultRawMutex, Cell<Option<&'h H>>>,
    tx_slot_waker: AtomicWaker,
}
impl<'h, T: Transport, H: EventHandler> SlaveHal<'h, T, H> {
    pub fn new(transport: T, wrapper_regs: T::Regs, dram: DramWindow) -> Self {
        Self {
            transport,
            wrapper: Wrapper::new(wrapper_regs),
            dram,
            rings: blocking_mutex::Mutex::new(RefCell::new(None)),
            handler: blocking_mutex::Mutex::new(Cell::new(None)),
            tx_slot_waker: AtomicWaker::new(),
        }
    }
    pub fn transport(&self) -> &T {
        &self.transport
    }
    /// Bring up the protocol registers and unmask the wrapper interrupts.
    pub fn init(&self) {
        self.transport.init();
        self.wrapper.clear_interrupts(WrapperInterrupts::ALL);
        self.wrapper.set_interrupt_mask(WrapperInterrupts::new());
        debug!("{} HAL initialized.", T::NAME);
    }
    pub fn deinit(&self) {
        self.wrapper.set_interrupt_mask(WrapperInterrupts::ALL);
        self.transport.deinit();
        debug!("{} HAL deinitialized.", T::NAME);
    }
    pub fn register_callback(&self, handler: &'h H) {
        self.handler.lock(|cell| cell.set(Some(handler)));
    }
    pub fn unregister_callback(&self) {
        self.handler.lock(|cell| cell.set(None));
    }
    fn emit(&self, kind: EventKind, addr: u32) {
        if let Some(handler) = self.handler.lock(Cell::get) {
            handler.on_event(SlaveEvent { kind, addr });
        }
    }
    fn validate(&self, desc: &BufDesc) -> SlaveResult<()> {
        let cmd_len = desc.cmd_len as usize;
        if cmd_len == 0 || cmd_len > T::CMD_BUF_SIZE_MAX || cmd_len % 4 != 0 {
            error!("Invalid command buffer size {}.", cmd_len);
            return Err(SlaveError::InvalidParam);
        }
        for buf_len in [desc.tx_buf_len, desc.rx_buf_len] {
            if buf_len == 0 || buf_len as usize > T::DATA_BUF_SIZE_MAX {
                error!("Invalid data buffer length {}.", buf_len);
                return Err(SlaveError::InvalidParam);
            }
        }
        let tx_capacity = desc.tx_ring.len() * desc.tx_buf_len as usize;
        let rx_capacity = desc.rx_ring.len() * desc.rx_buf_len as usize;
        if tx_capacity > TX_DATA_MAX || rx_capacity > RX_DATA_MAX {
            error!(
                "Rings hold {} bytes for TX and {} bytes for RX, which is too much.",
                tx_capacity, rx_capacity
            );
            return Err(SlaveError::InvalidParam);
        }
        if !desc.tx_ring.is_linked() || !desc.rx_ring.is_linked() {
            error!("Descriptor rings aren't closed.");
            return Err(SlaveError::InvalidParam);
        }
        let tx_ring_len = desc.tx_ring.len() * size_of::<TxBd>();
        let rx_ring_len = desc.rx_ring.len() * size_of::<RxBd>();
        let in_window = self.dram.contains(desc.cmd_addr, cmd_len)
            && self.dram.contains(desc.tx_ring.bus_base(), tx_ring_len)
            && self.dram.contains(desc.rx_ring.bus_base(), rx_ring_len)
            && (0..desc.rx_ring.len()).all(|index| {
                self.dram.contains(
                    desc.rx_ring.get(index).rxbuf_addr(),
                    desc.rx_buf_len as usize,
                )
            });
        if !in_window {
            error!("Buffer addresses out of range.");
            return Err(SlaveError::InvalidParam);
        }
        match (&desc.cis, T::HAS_CIS) {
            (None, false) => Ok(()),
            (Some(cis), true)
                if cis
                    .iter()
                    .all(|cis| self.dram.contains(cis.bus_addr(), cis.len() as usize)) =>
            {
                Ok(())
            }
            _ => {
                error!("Invalid CIS buffers for {}.", T::NAME);
                Err(SlaveError::InvalidParam)
            }
        }
    }
    /// Validate the buffers and program the wrapper with them.
    ///
    /// Nothing is written to the hardware, if validation fails.
    /// SAFETY:
    /// The memory described by `desc` must stay valid, until [Self::unregister_buf] was called.
    pub unsafe fn register_buf(&self, desc: BufDesc) -> SlaveResult<()> {
        self.validate(&desc)?;
        self.rings.lock(|rings| {
            let mut rings = rings.borrow_mut();
            if rings.is_some() {
                return Err(SlaveError::Busy);
            }
            self.wrapper.set_cmd_buf(desc.cmd_addr, desc.cmd_len);
            self.wrapper.set_down_cmd_buf_available(true);
            self.wrapper.set_tx_link(Some(desc.rx_ring.bus_base()));
            self.wrapper.set_tx_en(true);
            self.wrapper.set_rx_link(Some(desc.tx_ring.bus_base()));
            if let Some([f0, f1]) = &desc.cis {
                self.transport.set_cis_addrs(f0.bus_addr(), f1.bus_addr());
            }
            debug!(
                "Registered {} TXBDs at {:#x} and {} RXBDs at {:#x}.",
                desc.tx_ring.len(),
                desc.tx_ring.bus_base(),
                desc.rx_ring.len(),
                desc.rx_ring.bus_base()
            );
            *rings = Some(RingState {
                tx_ring: desc.tx_ring,
                rx_ring: desc.rx_ring,
                curr_txbd: 0,
                oldest_txbd: 0,
                tx_in_flight: 0,
                curr_rxbd: 0,
                tx_buf_len: desc.tx_buf_len,
                rx_buf_len: desc.rx_buf_len,
                cis: desc.cis,
                tx_queued_seq: 0,
                tx_retired_seq: 0,
            });
            Ok(())
        })
    }
    /// Disconnect the rings from the wrapper.
    pub fn unregister_buf(&self) {
        self.rings.lock(|rings| {
            self.wrapper.set_tx_link(None);
            self.wrapper.set_rx_link(None);
            self.wrapper.set_down_cmd_buf_available(false);
            self.wrapper.set_cmd_buf(0, 0);
            self.transport.set_cis_addrs(0, 0);
            rings.borrow_mut().take();
        });
        // Anyone still waiting for a TXBD has to notice, that the rings are gone.
        self.tx_slot_waker.wake();
    }
    pub fn is_registered(&self) -> bool {
        self.rings.lock(|rings| rings.borrow().is_some())
    }
    /// Number of TXBDs currently owned by the hardware.
    pub fn tx_in_flight(&self) -> usize {
        self.rings.lock(|rings| {
            rings
                .borrow()
                .as_ref()
                .map_or(0, |rings| rings.tx_in_flight)
        })
    }
    /// Check whether the transfer identified by `ticket` was completely sent.
    pub fn tx_done(&self, ticket: TxTicket) -> bool {
        self.rings.lock(|rings| {
            rings.borrow().as_ref().is_some_and(|rings| {
                rings.tx_retired_seq.wrapping_sub(ticket.0) as i32 >= 0
            })
        })
    }
    /// Queue `len` bytes at `addr` for transmission.
    ///
    /// This returns once the last chunk is queued, not once it was sent. If the ring stays full
    /// for too long, [SlaveError::Timeout] is returned and the chunks already queued remain
    /// queued.
    pub async fn tx_dma(&self, addr: u32, len: usize) -> SlaveResult<TxTicket> {
        let (tx_buf_len, capacity) = self
            .rings
            .lock(|rings| {
                rings.borrow().as_ref().map(|rings| {
                    (
                        rings.tx_buf_len as usize,
                        rings.tx_ring.len() * rings.tx_buf_len as usize,
                    )
                })
            })
            .ok_or(SlaveError::NotInitialized)?;
        if len == 0 || len > capacity || !self.dram.contains(addr, len) {
            error!("Invalid TX buffer {:#x} with length {}.", addr, len);
            return Err(SlaveError::InvalidParam);
        }

        let mut ticket = TxTicket(0);
        for offset in (0..len).step_by(tx_buf_len) {
            let chunk_addr = addr + offset as u32;
            let chunk_len = (len - offset).min(tx_buf_len) as u16;
            let queue_chunk = poll_fn(|cx| {
                self.tx_slot_waker.register(cx.waker());
                self.rings.lock(|rings| match rings.borrow_mut().as_mut() {
                    Some(rings) => match rings.try_queue(chunk_addr, chunk_len) {
                        Some(ticket) => Poll::Ready(Ok(ticket)),
                        None => Poll::Pending,
                    },
                    None => Poll::Ready(Err(SlaveError::NotInitialized)),
                })
            });
            ticket = match with_timeout(TX_DESCRIPTOR_TIMEOUT, queue_chunk).await {
                Ok(queued) => queued?,
                Err(_) => {
                    warn!("No TXBD became free for the chunk at offset {}.", offset);
                    return Err(SlaveError::Timeout);
                }
            };
            self.wrapper.set_rx_en(true);
        }
        Ok(ticket)
    }
    fn retire_tx(&self) {
        let ring_len = self
            .rings
            .lock(|rings| rings.borrow().as_ref().map_or(0, |rings| rings.tx_ring.len()));
        let mut retired = 0;
        while retired < ring_len {
            let Some(addr) = self
                .rings
                .lock(|rings| rings.borrow_mut().as_mut().and_then(RingState::retire_tx))
            else {
                break;
            };
            retired += 1;
            trace!("TX frame at {:#x} done.", addr);
            self.tx_slot_waker.wake();
            self.emit(EventKind::Tx, addr);
        }
        if retired == 0 {
            warn!("TX done without a released TXBD.");
        }
    }
    fn receive_frames(&self) {
        let ring_len = self
            .rings
            .lock(|rings| rings.borrow().as_ref().map_or(0, |rings| rings.rx_ring.len()));
        // At most one lap, so a misbehaving DMA engine can't keep us in here.
        for _ in 0..ring_len {
            let filled = self.rings.lock(|rings| {
                let rings = rings.borrow();
                let rings = rings.as_ref()?;
                let rxbd = rings.rx_ring.get(rings.curr_rxbd);
                (!rxbd.valid()).then(|| rxbd.rxbuf_addr())
            });
            let Some(addr) = filled else {
                break;
            };
            trace!("RX frame at {:#x}.", addr);
            self.emit(EventKind::Rx, addr);
            self.rings.lock(|rings| {
                if let Some(rings) = rings.borrow_mut().as_mut() {
                    rings.rx_ring.get(rings.curr_rxbd).set_valid(true);
                    rings.curr_rxbd = rings.rx_ring.next_index(rings.curr_rxbd);
                }
            });
            self.wrapper.set_tx_en(true);
        }
    }
    /// Service the wrapper interrupt.
    ///
    /// Each pending source is acknowledged right before it's serviced, so that an event arriving
    /// in the meantime raises the bit again.
    pub fn on_interrupt(&self) {
        let status = self.wrapper.interrupt_status();
        let serviced =
            WrapperInterrupts::from_bits(status.into_bits() & WrapperInterrupts::ALL.into_bits());
        if serviced.into_bits() == 0 {
            return;
        }
        trace!("Wrapper interrupt status: {:#x}", status.into_bits());
        if serviced.up_frame_done() {
            self.wrapper
                .clear_interrupts(WrapperInterrupts::new().with_up_frame_done(true));
            self.retire_tx();
        }
        if serviced.down_frame_done() {
            self.wrapper
                .clear_interrupts(WrapperInterrupts::new().with_down_frame_done(true));
            self.receive_frames();
        }
        if serviced.up_cmd_done() {
            self.wrapper
                .clear_interrupts(WrapperInterrupts::new().with_up_cmd_done(true));
            let addr = self.wrapper.cmd_buf_addr() + self.wrapper.cmd_buf_size() as u32;
            self.emit(EventKind::TxCmd, addr);
        }
        if serviced.down_cmd_done() {
            self.wrapper
                .clear_interrupts(WrapperInterrupts::new().with_down_cmd_done(true));
            self.emit(EventKind::RxCmd, self.wrapper.cmd_buf_addr());
            self.wrapper.set_down_cmd_buf_available(true);
        }
    }
    pub fn read_cis_reg(&self, func: CisFunction, pos: u32) -> SlaveResult<u32> {
        if !T::HAS_CIS {
            return Err(SlaveError::InvalidParam);
        }
        self.rings.lock(|rings| {
            rings
                .borrow()
                .as_ref()
                .ok_or(SlaveError::NotInitialized)?
                .cis(func)?
                .read(pos)
        })
    }
    pub fn write_cis_reg(&self, func: CisFunction, pos: u32, value: u32) -> SlaveResult<()> {
        if !T::HAS_CIS {
            return Err(SlaveError::InvalidParam);
        }
        self.rings.lock(|rings| {
            rings
                .borrow()
                .as_ref()
                .ok_or(SlaveError::NotInitialized)?
                .cis(func)?
                .write(pos, value)
        })
    }
    /// Size of the RX buffer behind every RXBD.
    pub fn rx_buf_len(&self) -> Option<u16> {
        self.rings
            .lock(|rings| rings.borrow().as_ref().map(|rings| rings.rx_buf_len))
    }
}
