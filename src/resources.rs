//! Allocation of the memory shared with the DMA engine.

use core::{
    mem::{align_of, size_of},
    ptr::{self, NonNull},
};

use vcell::VolatileCell;

use crate::{
    config::{BufferLayout, CIS_BUF_MAX, CMD_BUF_MAX, RX_DATA_MAX, TX_DATA_MAX},
    dma_list::{BdRing, BufferDescriptor, RxBd, TxBd},
    transport::Transport,
    SlaveError, SlaveResult,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// A block of memory, that the DMA engine can reach.
pub struct DmaRegion {
    /// Where the CPU sees the block.
    pub ptr: NonNull<u8>,
    /// Where the DMA engine sees the block. This is also what gets validated against the DRAM
    /// window.
    pub bus_addr: u32,
    pub len: usize,
}

/// Heap with the shared capability.
pub trait DmaAllocator {
    /// Allocate `len` bytes aligned to at least `align`.
    fn alloc(&self, len: usize, align: usize) -> Option<DmaRegion>;
    /// Return a region previously handed out by [DmaAllocator::alloc].
    fn free(&self, region: DmaRegion);
}

/// A zeroed [DmaRegion], which is returned to its allocator on drop.
struct DmaBox<'a, A: DmaAllocator + ?Sized> {
    region: DmaRegion,
    allocator: &'a A,
}
impl<'a, A: DmaAllocator + ?Sized> DmaBox<'a, A> {
    fn new(allocator: &'a A, len: usize, align: usize, what: &'static str) -> SlaveResult<Self> {
        let Some(region) = allocator.alloc(len, align) else {
            error!("Failed to allocate {} bytes for the {}.", len, what);
            return Err(SlaveError::NoMemory);
        };
        // Wrap it first, so that it gets freed on the error path too.
        let dma_box = Self { region, allocator };
        if region.len < len
            || region.ptr.as_ptr() as usize % align != 0
            || region.bus_addr as usize % align != 0
        {
            error!("The allocator returned an unusable region for the {}.", what);
            return Err(SlaveError::NoMemory);
        }
        unsafe { ptr::write_bytes(region.ptr.as_ptr(), 0, len) };
        trace!("Allocated {} bytes at {:#x} for the {}.", len, region.bus_addr, what);
        Ok(dma_box)
    }
}
unsafe impl<A: DmaAllocator + Sync + ?Sized> Send for DmaBox<'_, A> {}
impl<A: DmaAllocator + ?Sized> Drop for DmaBox<'_, A> {
    fn drop(&mut self) {
        self.allocator.free(self.region);
    }
}

/// Check a layout against the hard limits of the transport, before anything gets allocated.
pub fn validate_layout<T: Transport>(layout: &BufferLayout) -> SlaveResult<()> {
    let BufferLayout {
        tx_link_num,
        tx_buf_len,
        rx_link_num,
        rx_buf_len,
        cmd_buf_len,
        cis_len,
    } = *layout;
    if tx_link_num == 0 || tx_buf_len == 0 || rx_link_num == 0 || rx_buf_len == 0 {
        error!("Empty {} data ring.", T::NAME);
        return Err(SlaveError::InvalidParam);
    }
    if tx_buf_len as usize > T::DATA_BUF_SIZE_MAX
        || rx_buf_len as usize > T::DATA_BUF_SIZE_MAX
        || layout.tx_capacity() > TX_DATA_MAX
        || layout.rx_capacity() > RX_DATA_MAX
    {
        error!("{} data rings exceed the size limits.", T::NAME);
        return Err(SlaveError::InvalidParam);
    }
    if cmd_buf_len == 0
        || cmd_buf_len as usize > CMD_BUF_MAX.min(T::CMD_BUF_SIZE_MAX)
        || cmd_buf_len % 4 != 0
    {
        error!("Invalid {} command buffer size {}.", T::NAME, cmd_buf_len);
        return Err(SlaveError::InvalidParam);
    }
    if T::HAS_CIS && (cis_len == 0 || cis_len as usize > CIS_BUF_MAX || cis_len % 4 != 0) {
        error!("Invalid CIS size {}.", cis_len);
        return Err(SlaveError::InvalidParam);
    }
    Ok(())
}

/// The CIS of one SDIO function.
pub struct CisBuffer {
    base: NonNull<VolatileCell<u32>>,
    bus_addr: u32,
    len: u16,
}
unsafe impl Send for CisBuffer {}
impl CisBuffer {
    fn new(region: &DmaRegion, len: u16) -> Self {
        Self {
            base: region.ptr.cast(),
            bus_addr: region.bus_addr,
            len,
        }
    }
    pub const fn bus_addr(&self) -> u32 {
        self.bus_addr
    }
    pub const fn len(&self) -> u16 {
        self.len
    }
    fn word(&self, pos: u32) -> SlaveResult<&VolatileCell<u32>> {
        if pos % 4 != 0 || pos >= self.len as u32 {
            return Err(SlaveError::InvalidParam);
        }
        Ok(unsafe { &*self.base.as_ptr().add(pos as usize / 4) })
    }
    pub fn read(&self, pos: u32) -> SlaveResult<u32> {
        self.word(pos).map(VolatileCell::get)
    }
    pub fn write(&self, pos: u32, value: u32) -> SlaveResult<()> {
        self.word(pos).map(|word| word.set(value))
    }
}

/// Everything the HAL needs to program the wrapper.
///
/// The rings and buffers in here point into a [DmaResources] and are only valid while it is
/// alive.
pub struct BufDesc {
    pub cmd_addr: u32,
    pub cmd_len: u16,
    pub tx_ring: BdRing<TxBd>,
    pub tx_buf_len: u16,
    pub rx_ring: BdRing<RxBd>,
    pub rx_buf_len: u16,
    /// The function 0 and function 1 CIS, if the transport has them.
    pub cis: Option<[CisBuffer; 2]>,
}

/// The descriptor rings and buffers shared with the DMA engine.
///
/// Everything is freed again, once this is dropped. Fields are dropped in declaration order,
/// which is the reverse of the allocation order.
pub struct DmaResources<'a, A: DmaAllocator + ?Sized> {
    rx_buf: DmaBox<'a, A>,
    rxbd: DmaBox<'a, A>,
    txbd: DmaBox<'a, A>,
    cmd: DmaBox<'a, A>,
    f1_cis: Option<DmaBox<'a, A>>,
    f0_cis: Option<DmaBox<'a, A>>,
    tx_ring: BdRing<TxBd>,
    rx_ring: BdRing<RxBd>,
    layout: BufferLayout,
}
impl<'a, A: DmaAllocator + ?Sized> DmaResources<'a, A> {
    /// Allocate and link the rings for `layout`.
    ///
    /// If any allocation fails, everything allocated up to that point is freed in reverse order
    /// and [SlaveError::NoMemory] is returned. An invalid layout is rejected, before anything is
    /// allocated.
    pub fn allocate<T: Transport>(layout: BufferLayout, allocator: &'a A) -> SlaveResult<Self> {
        validate_layout::<T>(&layout)?;

        let f0_cis = if T::HAS_CIS {
            Some(DmaBox::new(allocator, layout.cis_len as usize, 4, "F0 CIS")?)
        } else {
            None
        };
        let f1_cis = if T::HAS_CIS {
            Some(DmaBox::new(allocator, layout.cis_len as usize, 4, "F1 CIS")?)
        } else {
            None
        };
        let cmd = DmaBox::new(allocator, layout.cmd_buf_len as usize, 4, "command buffer")?;
        let txbd = DmaBox::new(
            allocator,
            layout.tx_link_num as usize * size_of::<TxBd>(),
            align_of::<TxBd>(),
            "TXBD ring",
        )?;
        let rxbd = DmaBox::new(
            allocator,
            layout.rx_link_num as usize * size_of::<RxBd>(),
            align_of::<RxBd>(),
            "RXBD ring",
        )?;
        let rx_buf = DmaBox::new(allocator, layout.rx_capacity(), 4, "RX buffers")?;

        let tx_ring = unsafe {
            BdRing::<TxBd>::new(
                txbd.region.ptr.cast(),
                txbd.region.bus_addr,
                layout.tx_link_num as usize,
            )
        }
        .ok_or(SlaveError::InvalidParam)?;
        let rx_ring = unsafe {
            BdRing::<RxBd>::new(
                rxbd.region.ptr.cast(),
                rxbd.region.bus_addr,
                layout.rx_link_num as usize,
            )
        }
        .ok_or(SlaveError::InvalidParam)?;
        tx_ring.link();
        rx_ring.link();
        for index in 0..rx_ring.len() {
            let rxbd = rx_ring.get(index);
            rxbd.set_rxbuf_addr(rx_buf.region.bus_addr + (index * layout.rx_buf_len as usize) as u32);
            rxbd.set_valid(true);
        }
        debug!(
            "Allocated {} TXBDs and {} RXBDs for {}.",
            layout.tx_link_num,
            layout.rx_link_num,
            T::NAME
        );
        Ok(Self {
            rx_buf,
            rxbd,
            txbd,
            cmd,
            f1_cis,
            f0_cis,
            tx_ring,
            rx_ring,
            layout,
        })
    }
    /// Describe the rings for the HAL.
    pub fn buf_desc(&self) -> BufDesc {
        let cis = match (&self.f0_cis, &self.f1_cis) {
            (Some(f0), Some(f1)) => Some([
                CisBuffer::new(&f0.region, self.layout.cis_len),
                CisBuffer::new(&f1.region, self.layout.cis_len),
            ]),
            _ => None,
        };
        BufDesc {
            cmd_addr: self.cmd.region.bus_addr,
            cmd_len: self.layout.cmd_buf_len,
            tx_ring: self.tx_ring.clone(),
            tx_buf_len: self.layout.tx_buf_len,
            rx_ring: self.rx_ring.clone(),
            rx_buf_len: self.layout.rx_buf_len,
            cis,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use core::cell::{Cell, RefCell};
    use std::{boxed::Box, vec, vec::Vec};

    use crate::transport::{Hspi, Sdio};
    use crate::regs::tests::RegisterFile;

    pub type TestSdio<'a> = Sdio<&'a RegisterFile>;
    pub type TestHspi<'a> = Hspi<&'a RegisterFile>;

    /// A bump allocator over host memory, which pretends to live at [PoolAllocator::BUS_BASE].
    pub struct PoolAllocator {
        storage: Box<[u32]>,
        offset: Cell<usize>,
        /// Index of the allocation, which should fail.
        pub fail_at: Cell<Option<usize>>,
        allocations: Cell<usize>,
        pub live: RefCell<Vec<u32>>,
        pub freed: RefCell<Vec<u32>>,
    }
    impl PoolAllocator {
        pub const BUS_BASE: u32 = 0x2000_8000;

        pub fn new(len: usize) -> Self {
            Self {
                storage: vec![0u32; len / 4].into_boxed_slice(),
                offset: Cell::new(0),
                fail_at: Cell::new(None),
                allocations: Cell::new(0),
                live: RefCell::new(Vec::new()),
                freed: RefCell::new(Vec::new()),
            }
        }
        /// CPU pointer for a bus address handed out by this pool.
        pub fn translate(&self, bus_addr: u32) -> *mut u8 {
            let offset = (bus_addr - Self::BUS_BASE) as usize;
            assert!(offset < self.storage.len() * 4);
            unsafe { (self.storage.as_ptr() as *mut u8).add(offset) }
        }
        pub fn allocations(&self) -> usize {
            self.allocations.get()
        }
    }
    impl DmaAllocator for PoolAllocator {
        fn alloc(&self, len: usize, align: usize) -> Option<DmaRegion> {
            let index = self.allocations.replace(self.allocations.get() + 1);
            if self.fail_at.get() == Some(index) {
                return None;
            }
            let start = self.offset.get().next_multiple_of(align.max(4));
            if start + len > self.storage.len() * 4 {
                return None;
            }
            self.offset.set(start + len);
            let bus_addr = Self::BUS_BASE + start as u32;
            self.live.borrow_mut().push(bus_addr);
            Some(DmaRegion {
                ptr: NonNull::new(self.translate(bus_addr))?,
                bus_addr,
                len,
            })
        }
        fn free(&self, region: DmaRegion) {
            let mut live = self.live.borrow_mut();
            let position = live
                .iter()
                .position(|bus_addr| *bus_addr == region.bus_addr)
                .expect("double free");
            live.remove(position);
            self.freed.borrow_mut().push(region.bus_addr);
        }
    }

    #[test]
    fn sdio_allocation_links_both_rings() {
        let pool = PoolAllocator::new(0x4000);
        let resources =
            DmaResources::allocate::<TestSdio>(BufferLayout::default(), &pool).unwrap();
        // F0 CIS, F1 CIS, command buffer, TXBDs, RXBDs and the RX buffers.
        assert_eq!(pool.live.borrow().len(), 6);

        let desc = resources.buf_desc();
        assert_eq!(desc.tx_ring.len(), 8);
        assert_eq!(desc.tx_ring.count_valid(), 0);
        assert_eq!(desc.rx_ring.len(), 4);
        assert_eq!(desc.rx_ring.count_valid(), 4);
        assert_eq!(
            desc.tx_ring.get(7).next(),
            desc.tx_ring.bus_base(),
            "The last TXBD must link back to the first one."
        );
        let first_rx_buf = desc.rx_ring.get(0).rxbuf_addr();
        for index in 0..4 {
            assert_eq!(
                desc.rx_ring.get(index).rxbuf_addr(),
                first_rx_buf + index as u32 * 1024
            );
        }
        let [f0, f1] = desc.cis.as_ref().unwrap();
        assert_eq!(f0.len(), 128);
        assert_ne!(f0.bus_addr(), f1.bus_addr());
    }

    #[test]
    fn hspi_has_no_cis() {
        let pool = PoolAllocator::new(0x4000);
        let resources =
            DmaResources::allocate::<TestHspi>(BufferLayout::default(), &pool).unwrap();
        assert_eq!(pool.live.borrow().len(), 4);
        assert!(resources.buf_desc().cis.is_none());
    }

    #[test]
    fn invalid_layouts_allocate_nothing() {
        let pool = PoolAllocator::new(0x4000);
        let layouts = [
            BufferLayout {
                tx_link_num: 9,
                ..Default::default()
            },
            BufferLayout {
                rx_link_num: 5,
                ..Default::default()
            },
            BufferLayout {
                rx_buf_len: 0,
                ..Default::default()
            },
            BufferLayout {
                cmd_buf_len: 250,
                ..Default::default()
            },
            BufferLayout {
                cis_len: 0,
                ..Default::default()
            },
        ];
        for layout in layouts {
            assert_eq!(
                DmaResources::allocate::<TestSdio>(layout, &pool).err(),
                Some(SlaveError::InvalidParam)
            );
        }
        assert_eq!(pool.allocations(), 0);
    }

    #[test]
    fn hspi_limits_are_tighter() {
        let oversized_cmd = BufferLayout {
            cmd_buf_len: 512,
            ..Default::default()
        };
        assert!(validate_layout::<TestSdio>(&oversized_cmd).is_ok());
        assert_eq!(
            validate_layout::<TestHspi>(&oversized_cmd),
            Err(SlaveError::InvalidParam)
        );
        let long_frames = BufferLayout {
            tx_link_num: 4,
            tx_buf_len: 2048,
            ..Default::default()
        };
        assert!(validate_layout::<TestSdio>(&long_frames).is_ok());
        assert_eq!(
            validate_layout::<TestHspi>(&long_frames),
            Err(SlaveError::InvalidParam)
        );
    }

    #[test]
    fn failed_allocations_roll_back_in_reverse_order() {
        for fail_at in 0..6 {
            let pool = PoolAllocator::new(0x4000);
            pool.fail_at.set(Some(fail_at));
            assert_eq!(
                DmaResources::allocate::<TestSdio>(BufferLayout::default(), &pool).err(),
                Some(SlaveError::NoMemory)
            );
            assert!(pool.live.borrow().is_empty());
            let freed = pool.freed.borrow();
            assert_eq!(freed.len(), fail_at);
            assert!(freed.windows(2).all(|pair| pair[0] > pair[1]));
        }
    }

    #[test]
    fn dropping_frees_everything_in_reverse_order() {
        let pool = PoolAllocator::new(0x4000);
        let resources =
            DmaResources::allocate::<TestSdio>(BufferLayout::default(), &pool).unwrap();
        let mut allocated = pool.live.borrow().clone();
        drop(resources);
        allocated.reverse();
        assert_eq!(*pool.freed.borrow(), allocated);
    }

    #[test]
    fn cis_access_is_bounded_and_aligned() {
        let pool = PoolAllocator::new(0x4000);
        let resources =
            DmaResources::allocate::<TestSdio>(BufferLayout::default(), &pool).unwrap();
        let desc = resources.buf_desc();
        let [f0, _] = desc.cis.as_ref().unwrap();
        f0.write(0x7c, 0x000c_0221).unwrap();
        assert_eq!(f0.read(0x7c), Ok(0x000c_0221));
        assert_eq!(f0.read(0x80), Err(SlaveError::InvalidParam));
        assert_eq!(f0.write(0x02, 0), Err(SlaveError::InvalidParam));
    }
}
