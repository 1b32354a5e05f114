use core::{marker::PhantomData, mem::size_of, ptr::NonNull};

use bitfield_struct::bitfield;
use portable_atomic::{fence, Ordering};
use vcell::VolatileCell;

#[bitfield(u32)]
/// First word of every buffer descriptor.
pub struct BdStatus {
    #[bits(31)]
    pub __: u32,
    /// For a TXBD this means, that the DMA engine owns the descriptor. For an RXBD it means, that
    /// the descriptor is empty and may be filled by the DMA engine.
    pub valid: bool,
}

#[bitfield(u32)]
pub struct TxBdInfo {
    #[bits(12)]
    pub txbuf_offset: u16,
    #[bits(14)]
    pub frm_len: u16,
    #[bits(6)]
    pub tx_info_size: u8,
}

/// Operations shared by both descriptor types, which the [BdRing] needs.
pub trait BufferDescriptor: Sized {
    /// Initial state of a descriptor, right after linking.
    fn reset(&self);
    fn valid(&self) -> bool;
    fn set_valid(&self, valid: bool);
    /// Bus address of the next descriptor.
    fn next(&self) -> u32;
    fn set_next(&self, next: u32);
}

#[repr(C)]
/// A transmit buffer descriptor, as the wrapper reads it.
pub struct TxBd {
    status: VolatileCell<BdStatus>,
    info: VolatileCell<TxBdInfo>,
    txbuf_addr: [VolatileCell<u32>; 3],
    next: VolatileCell<u32>,
}
impl TxBd {
    /// Point the descriptor at a frame and hand it to the DMA engine.
    pub fn fill(&self, addr: u32, len: u16) {
        self.txbuf_addr[0].set(addr);
        self.info.set(TxBdInfo::new().with_frm_len(len));
        // The address and length must be visible before the DMA engine sees the valid bit.
        fence(Ordering::Release);
        self.set_valid(true);
    }
    pub fn txbuf_addr(&self) -> u32 {
        self.txbuf_addr[0].get()
    }
    pub fn frm_len(&self) -> u16 {
        self.info.get().frm_len()
    }
}
impl BufferDescriptor for TxBd {
    fn reset(&self) {
        self.status.set(BdStatus::new());
        self.info.set(TxBdInfo::new());
        for addr in self.txbuf_addr.iter() {
            addr.set(0);
        }
    }
    fn valid(&self) -> bool {
        self.status.get().valid()
    }
    fn set_valid(&self, valid: bool) {
        self.status.set(self.status.get().with_valid(valid));
    }
    fn next(&self) -> u32 {
        self.next.get()
    }
    fn set_next(&self, next: u32) {
        self.next.set(next);
    }
}

#[repr(C)]
/// A receive buffer descriptor, as the wrapper reads it.
pub struct RxBd {
    status: VolatileCell<BdStatus>,
    rxbuf_addr: VolatileCell<u32>,
    next: VolatileCell<u32>,
}
impl RxBd {
    pub fn rxbuf_addr(&self) -> u32 {
        self.rxbuf_addr.get()
    }
    pub fn set_rxbuf_addr(&self, addr: u32) {
        self.rxbuf_addr.set(addr);
    }
}
impl BufferDescriptor for RxBd {
    fn reset(&self) {
        self.status.set(BdStatus::new());
        self.rxbuf_addr.set(0);
    }
    fn valid(&self) -> bool {
        self.status.get().valid()
    }
    fn set_valid(&self, valid: bool) {
        self.status.set(self.status.get().with_valid(valid));
    }
    fn next(&self) -> u32 {
        self.next.get()
    }
    fn set_next(&self, next: u32) {
        self.next.set(next);
    }
}

/// A fixed size ring of buffer descriptors in DMA memory.
///
/// Firmware addresses descriptors by index, the successor of `i` always being `(i + 1) % len`.
/// The `next` words in the descriptors only exist for the DMA engine and are written once, when
/// the ring is linked.
pub struct BdRing<D> {
    base: NonNull<D>,
    bus_base: u32,
    len: usize,
    _phantom: PhantomData<D>,
}
unsafe impl<D> Send for BdRing<D> {}
impl<D> Clone for BdRing<D> {
    fn clone(&self) -> Self {
        Self {
            base: self.base,
            bus_base: self.bus_base,
            len: self.len,
            _phantom: PhantomData,
        }
    }
}
impl<D: BufferDescriptor> BdRing<D> {
    /// Take over `len` descriptors at `base`, which the DMA engine sees at `bus_base`.
    ///
    /// Returns [None] for an empty ring.
    /// SAFETY:
    /// `base` must be valid and aligned for `len` descriptors for the entire lifetime of the ring
    /// and must not be accessed by anything else than the ring and the DMA engine.
    pub unsafe fn new(base: NonNull<D>, bus_base: u32, len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        Some(Self {
            base,
            bus_base,
            len,
            _phantom: PhantomData,
        })
    }
    /// Reset every descriptor and close the ring, so that the last one links back to the first.
    pub fn link(&self) {
        for index in 0..self.len {
            let descriptor = self.get(index);
            descriptor.reset();
            descriptor.set_next(self.bus_addr_of(self.next_index(index)));
        }
        trace!(
            "Linked {} descriptors at {:#x}.",
            self.len,
            self.bus_base
        );
    }
    pub const fn len(&self) -> usize {
        self.len
    }
    pub const fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.len
    }
    pub fn get(&self, index: usize) -> &D {
        unsafe { &*self.base.as_ptr().add(index % self.len) }
    }
    /// Bus address of the first descriptor, which is what the wrapper is programmed with.
    pub const fn bus_base(&self) -> u32 {
        self.bus_base
    }
    pub fn bus_addr_of(&self, index: usize) -> u32 {
        self.bus_base + ((index % self.len) * size_of::<D>()) as u32
    }
    /// Map a bus address from a `next` word back to an index.
    pub fn index_of(&self, bus_addr: u32) -> Option<usize> {
        let offset = bus_addr.checked_sub(self.bus_base)? as usize;
        let index = offset / size_of::<D>();
        (offset % size_of::<D>() == 0 && index < self.len).then_some(index)
    }
    /// Check that following `next` from every descriptor leads to its successor.
    pub fn is_linked(&self) -> bool {
        (0..self.len)
            .all(|index| self.index_of(self.get(index).next()) == Some(self.next_index(index)))
    }
    /// Number of descriptors with the valid bit set.
    pub fn count_valid(&self) -> usize {
        (0..self.len).filter(|index| self.get(*index).valid()).count()
    }
}
