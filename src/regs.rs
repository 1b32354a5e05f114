//! Register access for the slave peripherals.
//!
//! Two independent register blocks are involved with every transfer. The wrapper block is shared
//! by the SDIO and HSPI slaves and owns the descriptor rings, the command buffer and the
//! interrupt status. The protocol block is specific to the bus and is only touched during
//! bring-up and for the SDIO CIS.
//!
//! The wrapper names its links from the host's point of view. The `tx` link is what the host
//! transmits, so it carries the RXBD ring of the slave. The `rx` link carries the TXBD ring.

use core::{mem::offset_of, ptr::NonNull};

use bitfield_struct::bitfield;
use volatile_register::RW;

/// Word granular access to a memory mapped register block.
///
/// Offsets are in bytes from the start of the block. This is the seam, at which the hardware can
/// be swapped out for a model.
pub trait RegisterIo {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
    fn modify(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let value = self.read(offset);
        self.write(offset, f(value));
    }
}
impl<R: RegisterIo> RegisterIo for &R {
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }
    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }
}

#[derive(Clone, Copy, Debug)]
/// A register block at a fixed physical address.
pub struct Mmio {
    base: NonNull<RW<u32>>,
}
impl Mmio {
    /// Access the register block at `base`.
    ///
    /// Returns [None] for a null or unaligned base.
    /// SAFETY:
    /// `base` must point to a register block (or memory), which stays valid for as long as this
    /// [Mmio] is used.
    pub unsafe fn new(base: usize) -> Option<Self> {
        if base % 4 != 0 {
            return None;
        }
        NonNull::new(base as *mut RW<u32>).map(|base| Self { base })
    }
    fn register(&self, offset: usize) -> &RW<u32> {
        unsafe { &*self.base.as_ptr().add(offset / 4) }
    }
}
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}
impl RegisterIo for Mmio {
    fn read(&self, offset: usize) -> u32 {
        self.register(offset).read()
    }
    fn write(&self, offset: usize, value: u32) {
        unsafe { self.register(offset).write(value) }
    }
}

#[bitfield(u32)]
/// The four interrupt sources of the wrapper.
///
/// The same layout is used for the status register (write 1 to clear) and the mask register.
pub struct WrapperInterrupts {
    /// An uplink frame was sent to the host, so a TXBD was consumed.
    ///
    /// The host calls this RX frame done.
    pub up_frame_done: bool,
    /// A downlink frame was received from the host, so an RXBD was filled.
    pub down_frame_done: bool,
    /// The host fetched the uplink command.
    pub up_cmd_done: bool,
    /// The host wrote a command into the command buffer.
    pub down_cmd_done: bool,
    #[bits(28)]
    pub __: u32,
}
impl WrapperInterrupts {
    pub const ALL: Self = Self::new()
        .with_up_frame_done(true)
        .with_down_frame_done(true)
        .with_up_cmd_done(true)
        .with_down_cmd_done(true);
}

#[bitfield(u32)]
pub struct CmdBufSize {
    #[bits(12)]
    pub size: u16,
    #[bits(20)]
    pub __: u32,
}

#[repr(C)]
/// Layout of the wrapper register block.
pub struct WrapperRegisterBlock {
    pub int_sts: RW<u32>,
    pub int_msk: RW<u32>,
    pub up_cmd_avl: RW<u32>,
    pub dm_cmdb_avl: RW<u32>,
    pub tx_link_en: RW<u32>,
    pub tx_link_addr: RW<u32>,
    pub tx_start: RW<u32>,
    pub tx_sts: RW<u32>,
    pub rx_link_en: RW<u32>,
    pub rx_link_addr: RW<u32>,
    pub rx_start: RW<u32>,
    pub rx_sts: RW<u32>,
    pub cmd_baddr: RW<u32>,
    pub cmd_buf_size: RW<u32>,
}
impl WrapperRegisterBlock {
    pub const INT_STS: usize = offset_of!(Self, int_sts);
    pub const INT_MSK: usize = offset_of!(Self, int_msk);
    pub const UP_CMD_AVL: usize = offset_of!(Self, up_cmd_avl);
    pub const DM_CMDB_AVL: usize = offset_of!(Self, dm_cmdb_avl);
    pub const TX_LINK_EN: usize = offset_of!(Self, tx_link_en);
    pub const TX_LINK_ADDR: usize = offset_of!(Self, tx_link_addr);
    pub const TX_START: usize = offset_of!(Self, tx_start);
    pub const TX_STS: usize = offset_of!(Self, tx_sts);
    pub const RX_LINK_EN: usize = offset_of!(Self, rx_link_en);
    pub const RX_LINK_ADDR: usize = offset_of!(Self, rx_link_addr);
    pub const RX_START: usize = offset_of!(Self, rx_start);
    pub const RX_STS: usize = offset_of!(Self, rx_sts);
    pub const CMD_BADDR: usize = offset_of!(Self, cmd_baddr);
    pub const CMD_BUF_SIZE: usize = offset_of!(Self, cmd_buf_size);
}

/// Typed access to the wrapper registers.
pub struct Wrapper<R> {
    io: R,
}
impl<R: RegisterIo> Wrapper<R> {
    pub const fn new(io: R) -> Self {
        Self { io }
    }
    pub fn interrupt_status(&self) -> WrapperInterrupts {
        WrapperInterrupts::from_bits(self.io.read(WrapperRegisterBlock::INT_STS))
    }
    /// Acknowledge exactly the interrupts set in `interrupts`.
    pub fn clear_interrupts(&self, interrupts: WrapperInterrupts) {
        self.io.write(WrapperRegisterBlock::INT_STS, interrupts.into_bits());
    }
    /// Set bits mask the corresponding interrupt.
    pub fn set_interrupt_mask(&self, masked: WrapperInterrupts) {
        self.io.write(WrapperRegisterBlock::INT_MSK, masked.into_bits());
    }
    pub fn set_cmd_buf(&self, addr: u32, size: u16) {
        self.io.write(WrapperRegisterBlock::CMD_BADDR, addr);
        self.io
            .write(WrapperRegisterBlock::CMD_BUF_SIZE, CmdBufSize::new().with_size(size).into_bits());
    }
    pub fn cmd_buf_addr(&self) -> u32 {
        self.io.read(WrapperRegisterBlock::CMD_BADDR)
    }
    pub fn cmd_buf_size(&self) -> u16 {
        CmdBufSize::from_bits(self.io.read(WrapperRegisterBlock::CMD_BUF_SIZE)).size()
    }
    /// Tell the hardware, that the command buffer may receive the next downlink command.
    pub fn set_down_cmd_buf_available(&self, available: bool) {
        self.io.write(WrapperRegisterBlock::DM_CMDB_AVL, available as u32);
    }
    /// Program the downlink (RXBD) ring. [None] disables the link.
    pub fn set_tx_link(&self, ring_base: Option<u32>) {
        self.io.write(WrapperRegisterBlock::TX_LINK_ADDR, ring_base.unwrap_or(0));
        self.io.write(WrapperRegisterBlock::TX_LINK_EN, ring_base.is_some() as u32);
    }
    /// Program the uplink (TXBD) ring. [None] disables the link.
    pub fn set_rx_link(&self, ring_base: Option<u32>) {
        self.io.write(WrapperRegisterBlock::RX_LINK_ADDR, ring_base.unwrap_or(0));
        self.io.write(WrapperRegisterBlock::RX_LINK_EN, ring_base.is_some() as u32);
    }
    /// Let the hardware continue filling RXBDs. Self clearing.
    pub fn set_tx_en(&self, enable: bool) {
        self.io.write(WrapperRegisterBlock::TX_START, enable as u32);
    }
    /// Let the hardware pick up the TXBDs marked valid. Self clearing.
    pub fn set_rx_en(&self, enable: bool) {
        self.io.write(WrapperRegisterBlock::RX_START, enable as u32);
    }
}

#[bitfield(u32)]
/// Common I/O area of the SDIO card.
pub struct SdioCia {
    #[bits(4)]
    pub cccr_revision: u8,
    #[bits(4)]
    pub sdio_revision: u8,
    #[bits(4)]
    pub sd_revision: u8,
    #[bits(4)]
    pub io_code: u8,
    pub csa_support: bool,
    #[bits(8)]
    pub ex_io_code: u8,
    pub sps: bool,
    pub shs: bool,
    #[bits(5)]
    pub __: u8,
}

#[bitfield(u32)]
/// Readiness and capability bits reported to the host.
pub struct SdioProgram {
    pub fn1_ready: bool,
    pub fn1_read_ready: bool,
    pub scsi: bool,
    pub sdc: bool,
    pub smb: bool,
    pub srw: bool,
    pub sbs: bool,
    pub s4mi: bool,
    pub lsc: bool,
    pub bls4: bool,
    pub card_ready: bool,
    #[bits(21)]
    pub __: u32,
}

#[repr(C)]
/// Layout of the SDIO slave protocol register block.
pub struct SdioRegisterBlock {
    pub _reserved0: [RW<u32>; 2],
    pub cis_f0_addr: RW<u32>,
    pub cis_f1_addr: RW<u32>,
    pub csa_addr: RW<u32>,
    pub read_addr: RW<u32>,
    pub write_addr: RW<u32>,
    pub ahb_xfer: RW<u32>,
    pub sdio_xfer: RW<u32>,
    pub cia: RW<u32>,
    pub pr: RW<u32>,
    pub _reserved1: RW<u32>,
    pub ocr: RW<u32>,
    pub _reserved2: RW<u32>,
    pub cd_state: RW<u32>,
    pub f1_en: RW<u32>,
}
impl SdioRegisterBlock {
    pub const CIS_F0_ADDR: usize = offset_of!(Self, cis_f0_addr);
    pub const CIS_F1_ADDR: usize = offset_of!(Self, cis_f1_addr);
    pub const CIA: usize = offset_of!(Self, cia);
    pub const PR: usize = offset_of!(Self, pr);
    pub const OCR: usize = offset_of!(Self, ocr);
    pub const F1_EN: usize = offset_of!(Self, f1_en);
}

/// Typed access to the SDIO slave registers.
pub struct SdioRegisters<R> {
    io: R,
}
impl<R: RegisterIo> SdioRegisters<R> {
    pub const fn new(io: R) -> Self {
        Self { io }
    }
    pub fn set_cis_addrs(&self, f0: u32, f1: u32) {
        self.io.write(SdioRegisterBlock::CIS_F0_ADDR, f0);
        self.io.write(SdioRegisterBlock::CIS_F1_ADDR, f1);
    }
    pub fn cia(&self) -> SdioCia {
        SdioCia::from_bits(self.io.read(SdioRegisterBlock::CIA))
    }
    pub fn set_cia(&self, cia: SdioCia) {
        self.io.write(SdioRegisterBlock::CIA, cia.into_bits());
    }
    pub fn modify_program(&self, f: impl FnOnce(SdioProgram) -> SdioProgram) {
        self.io.modify(SdioRegisterBlock::PR, |bits| {
            f(SdioProgram::from_bits(bits)).into_bits()
        });
    }
    pub fn set_ocr(&self, ocr: u32) {
        self.io.write(SdioRegisterBlock::OCR, ocr & 0x00ff_ffff);
    }
}

#[bitfield(u32)]
pub struct HspiCfg {
    pub cpol: bool,
    pub cpha: bool,
    pub tx_always_drive: bool,
    /// Set for most significant byte first.
    pub byte_order: bool,
    #[bits(28)]
    pub __: u32,
}

#[bitfield(u32)]
pub struct HspiModeCfg {
    #[bits(1)]
    pub _reserved: u8,
    /// Burst length in words, encoded as `0 => 1, 1 => 4, 2 => 8`.
    #[bits(2)]
    pub burst_len: u8,
    #[bits(29)]
    pub __: u32,
}

#[bitfield(u32)]
pub struct HspiInterrupts {
    pub tx_underrun: bool,
    pub rx_overrun: bool,
    #[bits(30)]
    pub __: u32,
}

#[repr(C)]
/// Layout of the HSPI slave register block.
pub struct HspiRegisterBlock {
    pub clear_fifo: RW<u32>,
    pub cfg: RW<u32>,
    pub mode_cfg: RW<u32>,
    pub int_mask: RW<u32>,
    pub int_sts: RW<u32>,
    pub _reserved0: RW<u32>,
    pub rx_dat_len: RW<u32>,
}
impl HspiRegisterBlock {
    pub const CLEAR_FIFO: usize = offset_of!(Self, clear_fifo);
    pub const CFG: usize = offset_of!(Self, cfg);
    pub const MODE_CFG: usize = offset_of!(Self, mode_cfg);
    pub const INT_MASK: usize = offset_of!(Self, int_mask);
    pub const INT_STS: usize = offset_of!(Self, int_sts);
}

/// Typed access to the HSPI slave registers.
pub struct HspiRegisters<R> {
    io: R,
}
impl<R: RegisterIo> HspiRegisters<R> {
    pub const fn new(io: R) -> Self {
        Self { io }
    }
    pub fn clear_fifos(&self) {
        self.io.write(HspiRegisterBlock::CLEAR_FIFO, 1);
    }
    pub fn cfg(&self) -> HspiCfg {
        HspiCfg::from_bits(self.io.read(HspiRegisterBlock::CFG))
    }
    pub fn set_cfg(&self, cfg: HspiCfg) {
        self.io.write(HspiRegisterBlock::CFG, cfg.into_bits());
    }
    pub fn set_mode_cfg(&self, mode_cfg: HspiModeCfg) {
        self.io.write(HspiRegisterBlock::MODE_CFG, mode_cfg.into_bits());
    }
    /// Set bits enable the corresponding error interrupt.
    pub fn set_interrupt_enable(&self, enabled: HspiInterrupts) {
        self.io.write(HspiRegisterBlock::INT_MASK, enabled.into_bits());
    }
    pub fn take_interrupts(&self) -> HspiInterrupts {
        let status = self.io.read(HspiRegisterBlock::INT_STS);
        self.io.write(HspiRegisterBlock::INT_STS, status);
        HspiInterrupts::from_bits(status)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use core::cell::RefCell;
    use std::vec::Vec;

    /// In memory model of a register block.
    ///
    /// Registers listed in `write_one_to_clear` clear the written bits instead of storing them.
    /// Every write is recorded.
    pub struct RegisterFile {
        words: RefCell<[u32; 64]>,
        write_one_to_clear: &'static [usize],
        pub writes: RefCell<Vec<(usize, u32)>>,
    }
    impl RegisterFile {
        pub fn new(write_one_to_clear: &'static [usize]) -> Self {
            Self {
                words: RefCell::new([0; 64]),
                write_one_to_clear,
                writes: RefCell::new(Vec::new()),
            }
        }
        /// Set a register behind the firmware's back, like the hardware would.
        pub fn poke(&self, offset: usize, value: u32) {
            self.words.borrow_mut()[offset / 4] = value;
        }
        /// Or bits into a register, like the hardware raising a status bit.
        pub fn raise(&self, offset: usize, bits: u32) {
            self.words.borrow_mut()[offset / 4] |= bits;
        }
        pub fn peek(&self, offset: usize) -> u32 {
            self.words.borrow()[offset / 4]
        }
        pub fn writes_to(&self, offset: usize) -> Vec<u32> {
            self.writes
                .borrow()
                .iter()
                .filter(|(written, _)| *written == offset)
                .map(|(_, value)| *value)
                .collect()
        }
    }
    impl RegisterIo for RegisterFile {
        fn read(&self, offset: usize) -> u32 {
            self.peek(offset)
        }
        fn write(&self, offset: usize, value: u32) {
            self.writes.borrow_mut().push((offset, value));
            let mut words = self.words.borrow_mut();
            if self.write_one_to_clear.contains(&offset) {
                words[offset / 4] &= !value;
            } else {
                words[offset / 4] = value;
            }
        }
    }

    pub const WRAPPER_W1C: &[usize] = &[WrapperRegisterBlock::INT_STS];

    #[test]
    fn wrapper_offsets_match_hardware() {
        type W = WrapperRegisterBlock;
        assert_eq!(W::INT_STS, 0x00);
        assert_eq!(W::DM_CMDB_AVL, 0x0c);
        assert_eq!(W::TX_LINK_ADDR, 0x14);
        assert_eq!(W::RX_START, 0x28);
        assert_eq!(W::CMD_BUF_SIZE, 0x34);
        type S = SdioRegisterBlock;
        assert_eq!(S::CIS_F0_ADDR, 0x08);
        assert_eq!(S::CIA, 0x24);
        assert_eq!(S::PR, 0x28);
        assert_eq!(S::F1_EN, 0x3c);
    }

    #[test]
    fn interrupt_status_is_write_one_to_clear() {
        let regs = RegisterFile::new(WRAPPER_W1C);
        let wrapper = Wrapper::new(&regs);
        regs.raise(WrapperRegisterBlock::INT_STS, 0b1011);
        let status = wrapper.interrupt_status();
        assert!(status.up_frame_done() && status.down_frame_done() && status.down_cmd_done());
        assert!(!status.up_cmd_done());

        wrapper.clear_interrupts(WrapperInterrupts::new().with_down_frame_done(true));
        assert_eq!(regs.peek(WrapperRegisterBlock::INT_STS), 0b1001);
    }

    #[test]
    fn cmd_buf_size_is_twelve_bits() {
        let regs = RegisterFile::new(WRAPPER_W1C);
        let wrapper = Wrapper::new(&regs);
        wrapper.set_cmd_buf(0x2000_0100, 0xfff);
        assert_eq!(wrapper.cmd_buf_size(), 0xfff);
        assert_eq!(wrapper.cmd_buf_addr(), 0x2000_0100);
    }

    #[test]
    fn mmio_accesses_words_at_offsets() {
        let mut block = [0u32; 16];
        let mmio = unsafe { Mmio::new(block.as_mut_ptr() as usize) }.unwrap();
        let wrapper = Wrapper::new(mmio);
        wrapper.set_rx_link(Some(0x2000_0040));
        assert_eq!(block[5], 0);
        assert_eq!(block[9], 0x2000_0040);
        assert_eq!(block[8], 1);
        assert!(unsafe { Mmio::new(0) }.is_none());
        assert!(unsafe { Mmio::new(2) }.is_none());
    }
}
