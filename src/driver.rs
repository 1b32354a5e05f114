//! The device level driver, with its lifecycle and the blocking style API.

use core::cell::{Cell, RefCell};

use embassy_sync::{blocking_mutex, channel::Channel, mutex::Mutex};
use embassy_time::{with_timeout, Duration};
use portable_atomic::{AtomicU32, AtomicU8, Ordering};

use crate::{
    config::{BufferLayout, EVENT_QUEUE_DEPTH},
    device::{DeviceDescriptor, PinConfig, PinFunction, Platform},
    hal::{EventHandler, EventKind, SlaveEvent, SlaveHal},
    resources::DmaResources,
    sync::EventFlags,
    transport::{CisFunction, Hspi, Sdio, Transport},
    DefaultRawMutex, SlaveError, SlaveResult,
};

/// A user callback, which gets called from the dispatcher with every event.
pub type EventCallback = &'static (dyn Fn(SlaveEvent) + Sync);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverStatus {
    Uninit,
    /// An init or deinit is in progress.
    Transitioning,
    Inited,
}

/// The part of the driver shared with the interrupt handler.
///
/// This is meant to be placed in a `static`, if the interrupt handler needs to reach the device.
pub struct DriverState {
    status: AtomicU8,
    flags: EventFlags,
    rx_buf_addr: AtomicU32,
    rx_cmd_addr: AtomicU32,
    events: Channel<DefaultRawMutex, SlaveEvent, EVENT_QUEUE_DEPTH>,
    dropped_events: AtomicU32,
    callback: blocking_mutex::Mutex<DefaultRawMutex, Cell<Option<EventCallback>>>,
}
impl DriverState {
    const UNINIT: u8 = 0;
    const TRANSITIONING: u8 = 1;
    const INITED: u8 = 2;

    pub const fn new() -> Self {
        Self {
            status: AtomicU8::new(Self::UNINIT),
            flags: EventFlags::new(),
            rx_buf_addr: AtomicU32::new(0),
            rx_cmd_addr: AtomicU32::new(0),
            events: Channel::new(),
            dropped_events: AtomicU32::new(0),
            callback: blocking_mutex::Mutex::new(Cell::new(None)),
        }
    }
    pub fn status(&self) -> DriverStatus {
        match self.status.load(Ordering::Acquire) {
            Self::UNINIT => DriverStatus::Uninit,
            Self::INITED => DriverStatus::Inited,
            _ => DriverStatus::Transitioning,
        }
    }
    /// Move from `from` to the transitioning state.
    ///
    /// The status falls back to `from`, if the returned [Transition] is dropped unfinished.
    fn begin_transition(&self, from: u8) -> SlaveResult<Transition<'_>> {
        self.status
            .compare_exchange(from, Self::TRANSITIONING, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Transition {
                state: self,
                settle_at: from,
            })
            .map_err(|current| match current {
                Self::INITED => SlaveError::AlreadyInitialized,
                Self::UNINIT => SlaveError::NotInitialized,
                _ => SlaveError::Busy,
            })
    }
    fn finish_transition(&self, to: u8) {
        self.status.store(to, Ordering::Release);
    }
    fn ensure_inited(&self) -> SlaveResult<()> {
        match self.status() {
            DriverStatus::Inited => Ok(()),
            DriverStatus::Uninit => Err(SlaveError::NotInitialized),
            DriverStatus::Transitioning => Err(SlaveError::Busy),
        }
    }
    /// Number of events, that didn't fit into the event queue.
    pub fn dropped_events(&self) -> u32 {
        self.dropped_events.load(Ordering::Relaxed)
    }
    fn set_callback(&self, callback: Option<EventCallback>) {
        self.callback.lock(|cell| cell.set(callback));
    }
    fn dispatch(&self, event: SlaveEvent) {
        if let Some(callback) = self.callback.lock(Cell::get) {
            callback(event);
        }
    }
    /// Deliver queued events to the user callback, until the queue is empty.
    ///
    /// Returns the number of events delivered.
    pub fn dispatch_pending(&self) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.events.try_receive() {
            self.dispatch(event);
            delivered += 1;
        }
        delivered
    }
    /// Deliver events to the user callback forever.
    ///
    /// This should be spawned as a task of its own, so the callback runs in task context.
    pub async fn run_dispatcher(&self) -> ! {
        loop {
            let event = self.events.receive().await;
            self.dispatch(event);
        }
    }
    fn discard_pending(&self) {
        while self.events.try_receive().is_ok() {}
    }
}
impl Default for DriverState {
    fn default() -> Self {
        Self::new()
    }
}
impl EventHandler for DriverState {
    fn on_event(&self, event: SlaveEvent) {
        match event.kind {
            EventKind::Tx => self.flags.set(EventFlags::TX_DONE),
            EventKind::Rx => {
                self.rx_buf_addr.store(event.addr, Ordering::Release);
                self.flags.set(EventFlags::RX_DONE);
            }
            EventKind::RxCmd => {
                self.rx_cmd_addr.store(event.addr, Ordering::Release);
                self.flags.set(EventFlags::RX_CMD_DONE);
            }
            EventKind::TxCmd => {}
        }
        if self.callback.lock(|cell| cell.get().is_none()) {
            return;
        }
        if self.events.try_send(event).is_err() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            warn!("Event queue full, dropping {:?} event.", event.kind);
        }
    }
}

/// An init or deinit in progress.
///
/// This settles the status on drop, so a cancelled transition doesn't leave the device stuck.
struct Transition<'a> {
    state: &'a DriverState,
    settle_at: u8,
}
impl Transition<'_> {
    fn finish(mut self, to: u8) {
        self.settle_at = to;
    }
}
impl Drop for Transition<'_> {
    fn drop(&mut self) {
        self.state.finish_transition(self.settle_at);
    }
}

/// Returns the pins to GPIO, unless disarmed.
struct PinGuard<'a, P: Platform> {
    platform: &'a P,
    pins: &'a [PinConfig],
    armed: bool,
}
impl<P: Platform> PinGuard<'_, P> {
    fn disarm(mut self) {
        self.armed = false;
    }
}
impl<P: Platform> Drop for PinGuard<'_, P> {
    fn drop(&mut self) {
        if self.armed {
            restore_pins(self.platform, self.pins);
        }
    }
}
fn restore_pins<P: Platform>(platform: &P, pins: &[PinConfig]) {
    for pin in pins {
        let gpio = PinConfig {
            pin: pin.pin,
            function: PinFunction::GPIO,
        };
        if platform.set_pin_function(gpio).is_err() {
            warn!("Failed to return pin {} to GPIO.", pin.pin);
        }
    }
}

/// A slave device.
///
/// Operations, which reprogram the hardware, are serialized by an async mutex. A synchronous TX
/// holds it, until the host consumed the data, so only one synchronous TX is outstanding at any
/// time. [Self::rx_data] and [Self::rx_cmd] don't take it.
pub struct SlaveDevice<'res, P: Platform, T: Transport<Regs = P::Regs>> {
    descriptor: DeviceDescriptor,
    platform: &'res P,
    shared: &'res DriverState,
    hal: SlaveHal<'res, T, DriverState>,
    layout: BufferLayout,
    resources: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Option<DmaResources<'res, P>>>>,
    op_lock: Mutex<DefaultRawMutex, ()>,
}
/// A slave device reached over SDIO.
pub type SdioSlave<'res, P> = SlaveDevice<'res, P, Sdio<<P as Platform>::Regs>>;
/// A slave device reached over HSPI.
pub type HspiSlave<'res, P> = SlaveDevice<'res, P, Hspi<<P as Platform>::Regs>>;

impl<'res, P: Platform, T: Transport<Regs = P::Regs>> SlaveDevice<'res, P, T> {
    /// Resolve the device called `name` and prepare a handle for it.
    ///
    /// The hardware isn't touched, until [Self::init] is called.
    pub fn new(
        name: &str,
        platform: &'res P,
        shared: &'res DriverState,
        layout: BufferLayout,
        config: T::Config,
    ) -> SlaveResult<Self> {
        let Some(descriptor) = platform.resolve(name) else {
            error!("No device called {}.", name);
            return Err(SlaveError::InvalidParam);
        };
        let slave_regs = platform.map_registers(descriptor.slave_reg_base)?;
        let wrapper_regs = platform.map_registers(descriptor.wrapper_reg_base)?;
        Ok(Self {
            descriptor,
            platform,
            shared,
            hal: SlaveHal::new(
                T::new(slave_regs, config),
                wrapper_regs,
                platform.dram_window(),
            ),
            layout,
            resources: blocking_mutex::Mutex::new(RefCell::new(None)),
            op_lock: Mutex::new(()),
        })
    }
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
    pub fn status(&self) -> DriverStatus {
        self.shared.status()
    }
    pub fn hal(&self) -> &SlaveHal<'res, T, DriverState> {
        &self.hal
    }
    fn bring_up(&self) -> SlaveResult<()> {
        let sysclk = self.platform.enable_clock(self.descriptor.rcc_device_name)?;
        debug!("{} clock enabled, system clock is {} Hz.", T::NAME, sysclk);

        let pins = PinGuard {
            platform: self.platform,
            pins: self.descriptor.pins,
            armed: true,
        };
        for pin in self.descriptor.pins {
            self.platform.set_pin_function(*pin)?;
        }
        let resources = DmaResources::allocate::<T>(self.layout, self.platform)?;
        // SAFETY: The resources are stored in self until deinit, which unregisters them first.
        unsafe { self.hal.register_buf(resources.buf_desc()) }?;

        self.shared.flags.reset();
        self.hal.register_callback(self.shared);
        self.hal.init();
        self.platform.enable_irq(self.descriptor.irq);
        self.resources.lock(|cell| *cell.borrow_mut() = Some(resources));
        pins.disarm();
        Ok(())
    }
    /// Bring up the device.
    ///
    /// On failure, everything done up to that point is undone.
    pub async fn init(&self) -> SlaveResult<()> {
        let transition = self.shared.begin_transition(DriverState::UNINIT)?;
        let _guard = self.op_lock.lock().await;
        match self.bring_up() {
            Ok(()) => {
                transition.finish(DriverState::INITED);
                info!("{} slave {} initialized.", T::NAME, self.descriptor.name);
                Ok(())
            }
            // Dropping the transition moves us back to uninitialized.
            Err(err) => {
                error!("Failed to initialize {}: {}", self.descriptor.name, err);
                Err(err)
            }
        }
    }
    /// Tear down the device and free all DMA memory.
    pub async fn deinit(&self) -> SlaveResult<()> {
        let transition = self.shared.begin_transition(DriverState::INITED)?;
        // Until the lock is ours, giving up leaves the device initialized.
        let _guard = self.op_lock.lock().await;

        self.shared.flags.reset();
        self.hal.deinit();
        self.platform.disable_irq(self.descriptor.irq);
        self.hal.unregister_callback();
        self.hal.unregister_buf();
        self.resources.lock(|cell| cell.borrow_mut().take());
        restore_pins(self.platform, self.descriptor.pins);
        self.shared.discard_pending();

        transition.finish(DriverState::UNINIT);
        info!("{} slave {} deinitialized.", T::NAME, self.descriptor.name);
        Ok(())
    }
    pub async fn register_callback(&self, callback: EventCallback) -> SlaveResult<()> {
        self.shared.ensure_inited()?;
        let _guard = self.op_lock.lock().await;
        self.shared.set_callback(Some(callback));
        Ok(())
    }
    pub async fn unregister_callback(&self) -> SlaveResult<()> {
        self.shared.ensure_inited()?;
        let _guard = self.op_lock.lock().await;
        self.shared.set_callback(None);
        Ok(())
    }
    /// Send `len` bytes at the bus address `addr` and wait for the host to read all of them.
    ///
    /// A completion of an earlier transfer never satisfies this one.
    pub async fn tx_data_sync(&self, addr: u32, len: usize, timeout_ms: u32) -> SlaveResult<()> {
        self.shared.ensure_inited()?;
        let _guard = self.op_lock.lock().await;
        self.shared.ensure_inited()?;

        let ticket = self.hal.tx_dma(addr, len).await?;
        with_timeout(Duration::from_millis(timeout_ms as u64), async {
            while !self.hal.tx_done(ticket) {
                self.shared.flags.take(EventFlags::TX_DONE).await;
            }
        })
        .await
        .inspect_err(|_| warn!("TX of {} bytes at {:#x} timed out.", len, addr))?;
        Ok(())
    }
    /// Queue `len` bytes at the bus address `addr`, without waiting for the host.
    ///
    /// The memory must stay untouched, until the TX event for it was reported.
    pub async fn tx_data_async(&self, addr: u32, len: usize) -> SlaveResult<()> {
        self.shared.ensure_inited()?;
        let _guard = self.op_lock.lock().await;
        self.shared.ensure_inited()?;
        self.hal.tx_dma(addr, len).await.map(|_| ())
    }
    /// Wait for a frame from the host and return the bus address of its buffer.
    pub async fn rx_data(&self, timeout_ms: u32) -> SlaveResult<u32> {
        self.shared.ensure_inited()?;
        with_timeout(
            Duration::from_millis(timeout_ms as u64),
            self.shared.flags.take(EventFlags::RX_DONE),
        )
        .await?;
        Ok(self.shared.rx_buf_addr.load(Ordering::Acquire))
    }
    /// Wait for a command from the host and return the bus address of the command buffer.
    pub async fn rx_cmd(&self, timeout_ms: u32) -> SlaveResult<u32> {
        self.shared.ensure_inited()?;
        with_timeout(
            Duration::from_millis(timeout_ms as u64),
            self.shared.flags.take(EventFlags::RX_CMD_DONE),
        )
        .await?;
        Ok(self.shared.rx_cmd_addr.load(Ordering::Acquire))
    }
    pub async fn configure(&self, config: T::Config) -> SlaveResult<()> {
        self.shared.ensure_inited()?;
        let _guard = self.op_lock.lock().await;
        self.hal.transport().configure(config)
    }
    pub async fn read_cis_reg(&self, func: CisFunction, pos: u32) -> SlaveResult<u32> {
        self.shared.ensure_inited()?;
        let _guard = self.op_lock.lock().await;
        self.hal.read_cis_reg(func, pos)
    }
    pub async fn write_cis_reg(&self, func: CisFunction, pos: u32, value: u32) -> SlaveResult<()> {
        self.shared.ensure_inited()?;
        let _guard = self.op_lock.lock().await;
        self.hal.write_cis_reg(func, pos, value)
    }
    /// Service the interrupt. This has to be called from the wrapper interrupt.
    pub fn on_interrupt(&self) {
        self.hal.on_interrupt();
    }
    pub async fn run_dispatcher(&self) -> ! {
        self.shared.run_dispatcher().await
    }
    pub fn dispatch_pending(&self) -> usize {
        self.shared.dispatch_pending()
    }
    pub fn dropped_events(&self) -> u32 {
        self.shared.dropped_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::cell::RefCell;
    use std::{
        boxed::Box,
        sync::{Arc, Mutex as StdMutex},
        time::Instant,
        vec::Vec,
    };

    use embassy_futures::{block_on, join::join, yield_now};

    use crate::{
        device::IrqConfig,
        dma_list::BufferDescriptor,
        hal::tests::HostModel,
        regs::{
            tests::{RegisterFile, WRAPPER_W1C},
            SdioProgram, SdioRegisterBlock, WrapperRegisterBlock,
        },
        resources::{tests::PoolAllocator, DmaAllocator, DmaRegion},
        transport::{HspiConfig, SdioConfig},
    };

    const TX_BUF: u32 = 0x2000_0100;

    struct TestPlatform {
        pool: PoolAllocator,
        slave: &'static RegisterFile,
        wrapper: &'static RegisterFile,
        pins: RefCell<Vec<PinConfig>>,
        irq_enabled: Cell<bool>,
        fail_clock: Cell<bool>,
    }
    impl TestPlatform {
        fn new() -> Self {
            Self {
                pool: PoolAllocator::new(0x8000),
                slave: Box::leak(Box::new(RegisterFile::new(&[]))),
                wrapper: Box::leak(Box::new(RegisterFile::new(WRAPPER_W1C))),
                pins: RefCell::new(Vec::new()),
                irq_enabled: Cell::new(false),
                fail_clock: Cell::new(false),
            }
        }
        fn host(&self) -> HostModel<'_> {
            HostModel::new(
                &self.pool,
                self.wrapper,
                BufferLayout::default().tx_link_num as usize,
            )
        }
        fn pin_function(&self, pin: u8) -> Option<PinFunction> {
            self.pins
                .borrow()
                .iter()
                .rev()
                .find(|config| config.pin == pin)
                .map(|config| config.function)
        }
    }
    impl DmaAllocator for TestPlatform {
        fn alloc(&self, len: usize, align: usize) -> Option<DmaRegion> {
            self.pool.alloc(len, align)
        }
        fn free(&self, region: DmaRegion) {
            self.pool.free(region)
        }
    }
    impl Platform for TestPlatform {
        type Regs = &'static RegisterFile;

        fn map_registers(&self, base: u32) -> SlaveResult<Self::Regs> {
            match base {
                0x4000_2400 | 0x4000_2600 => Ok(self.slave),
                0x4000_2800 => Ok(self.wrapper),
                _ => Err(SlaveError::Failed),
            }
        }
        fn enable_clock(&self, _rcc_device_name: &str) -> SlaveResult<u32> {
            if self.fail_clock.get() {
                Err(SlaveError::Failed)
            } else {
                Ok(80_000_000)
            }
        }
        fn set_pin_function(&self, pin: PinConfig) -> SlaveResult<()> {
            self.pins.borrow_mut().push(pin);
            Ok(())
        }
        fn enable_irq(&self, _irq: IrqConfig) {
            self.irq_enabled.set(true);
        }
        fn disable_irq(&self, _irq: IrqConfig) {
            self.irq_enabled.set(false);
        }
    }

    fn sdio<'a>(platform: &'a TestPlatform, state: &'a DriverState) -> SdioSlave<'a, TestPlatform> {
        SdioSlave::new(
            "sdio_slave",
            platform,
            state,
            BufferLayout::default(),
            SdioConfig::default(),
        )
        .unwrap()
    }
    fn recording_callback() -> (EventCallback, Arc<StdMutex<Vec<SlaveEvent>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let recorded = events.clone();
        let callback: EventCallback = Box::leak(Box::new(move |event: SlaveEvent| {
            recorded.lock().unwrap().push(event);
        }));
        (callback, events)
    }

    #[test]
    fn unknown_devices_are_rejected() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        assert_eq!(
            SdioSlave::new(
                "sdio0",
                &platform,
                &state,
                BufferLayout::default(),
                SdioConfig::default()
            )
            .err(),
            Some(SlaveError::InvalidParam)
        );
    }

    #[test]
    fn init_brings_up_everything_and_deinit_undoes_it() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        block_on(device.init()).unwrap();

        assert_eq!(device.status(), DriverStatus::Inited);
        assert!(platform.irq_enabled.get());
        assert_eq!(platform.pin_function(22), Some(PinFunction::Fun4));
        assert_eq!(platform.pool.live.borrow().len(), 6);
        let pr = SdioProgram::from_bits(platform.slave.peek(SdioRegisterBlock::PR));
        assert!(pr.card_ready());
        assert_eq!(
            block_on(device.init()),
            Err(SlaveError::AlreadyInitialized)
        );

        block_on(device.deinit()).unwrap();
        assert_eq!(device.status(), DriverStatus::Uninit);
        assert!(!platform.irq_enabled.get());
        assert!(platform.pool.live.borrow().is_empty());
        assert!(device
            .descriptor()
            .pins
            .iter()
            .all(|pin| platform.pin_function(pin.pin) == Some(PinFunction::GPIO)));
        assert_eq!(platform.wrapper.peek(WrapperRegisterBlock::INT_MSK), 0b1111);
        assert_eq!(platform.wrapper.peek(WrapperRegisterBlock::RX_LINK_EN), 0);
    }

    #[test]
    fn deinit_without_init_touches_nothing() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        assert_eq!(block_on(device.deinit()), Err(SlaveError::NotInitialized));
        assert!(platform.pins.borrow().is_empty());
        assert!(platform.wrapper.writes.borrow().is_empty());
        assert_eq!(
            block_on(device.tx_data_sync(TX_BUF, 16, 10)),
            Err(SlaveError::NotInitialized)
        );
        assert_eq!(block_on(device.rx_data(10)), Err(SlaveError::NotInitialized));
    }

    #[test]
    fn failed_init_rolls_back() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        platform.pool.fail_at.set(Some(3));
        let device = sdio(&platform, &state);
        assert_eq!(block_on(device.init()), Err(SlaveError::NoMemory));
        assert_eq!(device.status(), DriverStatus::Uninit);
        assert!(platform.pool.live.borrow().is_empty());
        assert_eq!(platform.pin_function(27), Some(PinFunction::GPIO));
        assert!(!platform.irq_enabled.get());

        platform.fail_clock.set(true);
        assert_eq!(block_on(device.init()), Err(SlaveError::Failed));
        platform.fail_clock.set(false);
        // The failed attempts left nothing behind, that would block a retry.
        block_on(device.init()).unwrap();
    }

    #[test]
    fn tx_data_sync_times_out_without_the_host() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        block_on(device.init()).unwrap();

        let start = Instant::now();
        assert_eq!(
            block_on(device.tx_data_sync(TX_BUF, 100, 50)),
            Err(SlaveError::Timeout)
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= std::time::Duration::from_millis(49));
        assert!(elapsed < std::time::Duration::from_secs(2));
    }

    #[test]
    fn oversized_tx_is_rejected_before_touching_the_ring() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        block_on(device.init()).unwrap();
        assert_eq!(
            block_on(device.tx_data_async(TX_BUF, 8192 + 1)),
            Err(SlaveError::InvalidParam)
        );
        assert_eq!(device.hal().tx_in_flight(), 0);
        assert!(platform
            .wrapper
            .writes_to(WrapperRegisterBlock::RX_START)
            .is_empty());
    }

    #[test]
    fn sync_transfers_are_serialized() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        block_on(device.init()).unwrap();
        let host = platform.host();

        let first = device.tx_data_sync(TX_BUF, 100, 1000);
        let second = device.tx_data_sync(TX_BUF + 0x100, 100, 1000);
        let consumer = async {
            let mut consumed = Vec::new();
            while consumed.len() < 2 {
                yield_now().await;
                let in_flight = device.hal().tx_in_flight();
                assert!(in_flight <= 1, "Two synchronous transfers were outstanding.");
                if in_flight == 1 {
                    let index = consumed.len() % 8;
                    consumed.push(host.txbd(index).txbuf_addr());
                    host.complete_tx();
                    device.on_interrupt();
                }
            }
            consumed
        };
        let ((first, second), consumed) = block_on(join(join(first, second), consumer));
        assert_eq!((first, second), (Ok(()), Ok(())));
        assert_eq!(consumed, [TX_BUF, TX_BUF + 0x100]);
    }

    #[test]
    fn coalesced_completions_finish_a_sync_transfer() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        block_on(device.init()).unwrap();
        let host = platform.host();

        let transfer = device.tx_data_sync(TX_BUF, 2048, 200);
        let consumer = async {
            while device.hal().tx_in_flight() < 2 {
                yield_now().await;
            }
            host.complete_tx();
            host.complete_tx();
            device.on_interrupt();
        };
        let (result, ()) = block_on(join(transfer, consumer));
        assert_eq!(result, Ok(()));
        assert_eq!(device.hal().tx_in_flight(), 0);
    }

    #[test]
    fn cancelled_deinit_leaves_the_device_initialized() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        block_on(device.init()).unwrap();
        let host = platform.host();

        let transfer = device.tx_data_sync(TX_BUF, 100, 1000);
        let canceller = async {
            while device.hal().tx_in_flight() == 0 {
                yield_now().await;
            }
            // The transfer holds the lock, so the deinit can't get anywhere.
            let deinit = with_timeout(Duration::from_millis(20), device.deinit()).await;
            assert!(deinit.is_err());
            assert_eq!(device.status(), DriverStatus::Inited);
            host.complete_tx();
            device.on_interrupt();
        };
        let (result, ()) = block_on(join(transfer, canceller));
        assert_eq!(result, Ok(()));
        assert!(platform.irq_enabled.get());

        assert_eq!(block_on(device.tx_data_async(TX_BUF, 16)), Ok(()));
        block_on(device.deinit()).unwrap();
        assert_eq!(device.status(), DriverStatus::Uninit);
    }

    #[test]
    fn cancelled_init_leaves_the_device_uninitialized() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);

        let lock = block_on(device.op_lock.lock());
        let init = block_on(with_timeout(Duration::from_millis(20), device.init()));
        assert!(init.is_err());
        assert_eq!(device.status(), DriverStatus::Uninit);
        assert!(platform.pins.borrow().is_empty());
        drop(lock);

        block_on(device.init()).unwrap();
        assert_eq!(device.status(), DriverStatus::Inited);
    }

    #[test]
    fn stale_completions_dont_satisfy_a_sync_transfer() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        block_on(device.init()).unwrap();
        let host = platform.host();

        block_on(device.tx_data_async(TX_BUF, 100)).unwrap();
        let sync = device.tx_data_sync(TX_BUF + 0x100, 100, 1000);
        let consumer = async {
            for _ in 0..5 {
                yield_now().await;
            }
            assert_eq!(device.hal().tx_in_flight(), 2);
            // Completes the asynchronous transfer only.
            host.complete_tx();
            device.on_interrupt();
            for _ in 0..5 {
                yield_now().await;
            }
            assert_eq!(device.hal().tx_in_flight(), 1);
            host.complete_tx();
            device.on_interrupt();
        };
        let (result, ()) = block_on(join(sync, consumer));
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn rx_frames_are_delivered_in_order() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        block_on(device.init()).unwrap();
        let host = platform.host();
        let first = host.rxbd(0).rxbuf_addr();

        for index in 0..5 {
            host.fill_rx(index % 4);
            device.on_interrupt();
            let addr = block_on(device.rx_data(100)).unwrap();
            assert_eq!(addr, first + (index % 4) as u32 * 1024);
        }
        assert_eq!(block_on(device.rx_data(10)), Err(SlaveError::Timeout));
    }

    #[test]
    fn commands_are_received_repeatedly() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        block_on(device.init()).unwrap();
        let host = platform.host();
        let cmd_addr = platform.wrapper.peek(WrapperRegisterBlock::CMD_BADDR);

        for _ in 0..2 {
            platform.wrapper.poke(WrapperRegisterBlock::DM_CMDB_AVL, 0);
            host.send_cmd();
            device.on_interrupt();
            assert_eq!(platform.wrapper.peek(WrapperRegisterBlock::DM_CMDB_AVL), 1);
            assert_eq!(block_on(device.rx_cmd(100)), Ok(cmd_addr));
        }
    }

    #[test]
    fn callbacks_run_from_the_dispatcher() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        block_on(device.init()).unwrap();
        let host = platform.host();

        // Without a callback, nothing is queued.
        host.fill_rx(0);
        device.on_interrupt();
        assert_eq!(device.dispatch_pending(), 0);

        let (callback, events) = recording_callback();
        block_on(device.register_callback(callback)).unwrap();
        host.send_cmd();
        device.on_interrupt();
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(device.dispatch_pending(), 1);
        assert_eq!(events.lock().unwrap()[0].kind, EventKind::RxCmd);

        block_on(device.unregister_callback()).unwrap();
        host.send_cmd();
        device.on_interrupt();
        assert_eq!(device.dispatch_pending(), 0);
    }

    #[test]
    fn overflowing_events_are_counted() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        block_on(device.init()).unwrap();
        let (callback, events) = recording_callback();
        block_on(device.register_callback(callback)).unwrap();
        let host = platform.host();

        for _ in 0..EVENT_QUEUE_DEPTH + 3 {
            host.send_cmd();
            device.on_interrupt();
        }
        assert_eq!(device.dropped_events(), 3);
        assert_eq!(device.dispatch_pending(), EVENT_QUEUE_DEPTH);
        assert_eq!(events.lock().unwrap().len(), EVENT_QUEUE_DEPTH);
    }

    #[test]
    fn reinit_restores_the_ring_topology() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        for _ in 0..2 {
            block_on(device.init()).unwrap();
            let host = platform.host();
            let tx_base = platform.wrapper.peek(WrapperRegisterBlock::RX_LINK_ADDR);
            assert_eq!(host.txbd(7).next(), tx_base);
            assert_eq!((0..4).filter(|index| host.rxbd(*index).valid()).count(), 4);
            assert_eq!(device.hal().tx_in_flight(), 0);
            block_on(device.deinit()).unwrap();
        }
    }

    #[test]
    fn cis_access_goes_through_the_device() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = sdio(&platform, &state);
        block_on(device.init()).unwrap();
        block_on(device.write_cis_reg(CisFunction::Function0, 0, 0x0000_0321)).unwrap();
        assert_eq!(
            block_on(device.read_cis_reg(CisFunction::Function0, 0)),
            Ok(0x321)
        );
        assert_eq!(
            block_on(device.read_cis_reg(CisFunction::Function1, 3)),
            Err(SlaveError::InvalidParam)
        );
    }

    #[test]
    fn hspi_slave_shares_the_engine() {
        let platform = TestPlatform::new();
        let state = DriverState::new();
        let device = HspiSlave::new(
            "hspi_slave",
            &platform,
            &state,
            BufferLayout::default(),
            HspiConfig::default(),
        )
        .unwrap();
        block_on(device.init()).unwrap();
        assert_eq!(platform.pin_function(25), Some(PinFunction::Fun3));
        assert_eq!(
            block_on(device.read_cis_reg(CisFunction::Function0, 0)),
            Err(SlaveError::InvalidParam)
        );
        let host = platform.host();
        let transfer = device.tx_data_sync(TX_BUF, 1500, 1000);
        let consumer = async {
            while device.hal().tx_in_flight() < 2 {
                yield_now().await;
            }
            for _ in 0..2 {
                host.complete_tx();
                device.on_interrupt();
            }
        };
        let (result, ()) = block_on(join(transfer, consumer));
        assert_eq!(result, Ok(()));
    }
}
