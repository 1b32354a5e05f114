//! The two buses, over which the slave can be reached.
//!
//! Both buses feed the same wrapper and therefore share the whole transfer engine. What differs
//! is the bring-up of the protocol registers, the size limits and whether the card exposes a CIS.

use core::cell::Cell;

use embassy_sync::blocking_mutex;
use macro_bits::serializable_enum;

use crate::{
    regs::{HspiCfg, HspiInterrupts, HspiModeCfg, HspiRegisters, RegisterIo, SdioCia, SdioRegisters},
    DefaultRawMutex, SlaveResult,
};

/// The protocol specific part of a slave device.
pub trait Transport {
    /// Used in log messages.
    const NAME: &'static str;
    /// Largest command buffer the protocol supports.
    const CMD_BUF_SIZE_MAX: usize;
    /// Largest buffer behind a single data descriptor.
    const DATA_BUF_SIZE_MAX: usize;
    /// Whether the device carries function 0 and 1 CIS buffers.
    const HAS_CIS: bool;
    type Config: Copy + Default;
    type Regs: RegisterIo;

    fn new(regs: Self::Regs, config: Self::Config) -> Self;
    /// Program the protocol registers with the current configuration.
    fn init(&self);
    /// Make the device invisible to the host again.
    fn deinit(&self);
    /// Replace the configuration and apply it.
    fn configure(&self, config: Self::Config) -> SlaveResult<()>;
    fn config(&self) -> Self::Config;
    /// Point the hardware at the CIS buffers.
    fn set_cis_addrs(&self, _f0: u32, _f1: u32) {}
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum CccrRevision: u8 {
        V1_00 => 0,
        V1_10 => 1,
        #[default]
        V1_20 => 2,
        V3_00 => 3
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum SdioRevision: u8 {
        V1_00 => 0,
        V1_10 => 1,
        V1_20 => 2,
        #[default]
        V2_00 => 3,
        V3_00 => 4
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum SdRevision: u8 {
        V1_01 => 0,
        V1_10 => 1,
        #[default]
        V2_00 => 2,
        V3_00 => 3
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// The SDIO function, whose CIS is accessed.
    pub enum CisFunction: u8 {
        #[default]
        Function0 => 0,
        Function1 => 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// What the card reports about itself during enumeration.
pub struct SdioConfig {
    pub cccr_revision: CccrRevision,
    pub sdio_revision: SdioRevision,
    pub sd_revision: SdRevision,
    /// Supported voltage window. Only the lower 24 bits are used.
    pub ocr: u32,
}
impl Default for SdioConfig {
    fn default() -> Self {
        Self {
            cccr_revision: CccrRevision::V1_20,
            sdio_revision: SdioRevision::V2_00,
            sd_revision: SdRevision::V2_00,
            ocr: 0x00ff_8000,
        }
    }
}

/// The SDIO slave.
pub struct Sdio<R> {
    regs: SdioRegisters<R>,
    config: blocking_mutex::Mutex<DefaultRawMutex, Cell<SdioConfig>>,
}
impl<R: RegisterIo> Sdio<R> {
    fn apply(&self, config: SdioConfig) {
        self.regs.set_cia(
            self.regs
                .cia()
                .with_cccr_revision(config.cccr_revision.into_bits())
                .with_sdio_revision(config.sdio_revision.into_bits())
                .with_sd_revision(config.sd_revision.into_bits()),
        );
        self.regs.set_ocr(config.ocr);
    }
}
impl<R: RegisterIo> Transport for Sdio<R> {
    const NAME: &'static str = "SDIO";
    /// `cmd_buf_size` only has twelve bits.
    const CMD_BUF_SIZE_MAX: usize = 0xfff;
    const DATA_BUF_SIZE_MAX: usize = 4096;
    const HAS_CIS: bool = true;
    type Config = SdioConfig;
    type Regs = R;

    fn new(regs: R, config: SdioConfig) -> Self {
        Self {
            regs: SdioRegisters::new(regs),
            config: blocking_mutex::Mutex::new(Cell::new(config)),
        }
    }
    fn init(&self) {
        self.apply(self.config());
        self.regs
            .modify_program(|pr| pr.with_fn1_ready(true).with_card_ready(true));
        debug!("SDIO slave is ready for enumeration.");
    }
    fn deinit(&self) {
        self.regs
            .modify_program(|pr| pr.with_fn1_ready(false).with_card_ready(false));
        self.regs.set_cis_addrs(0, 0);
    }
    fn configure(&self, config: SdioConfig) -> SlaveResult<()> {
        self.config.lock(|cell| cell.set(config));
        self.apply(config);
        Ok(())
    }
    fn config(&self) -> SdioConfig {
        self.config.lock(Cell::get)
    }
    fn set_cis_addrs(&self, f0: u32, f1: u32) {
        self.regs.set_cis_addrs(f0, f1);
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum HspiByteOrder: u8 {
        #[default]
        LowFirst => 0,
        HighFirst => 1
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum HspiBurstLength: u8 {
        OneWord => 0,
        #[default]
        FourWords => 1
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HspiConfig {
    /// Idle level of the clock.
    pub cpol: bool,
    /// Sample on the second clock edge.
    pub cpha: bool,
    /// Keep driving the output, even while not selected.
    pub tx_always_drive: bool,
    pub byte_order: HspiByteOrder,
    pub burst_len: HspiBurstLength,
}

/// The high speed SPI slave.
pub struct Hspi<R> {
    regs: HspiRegisters<R>,
    config: blocking_mutex::Mutex<DefaultRawMutex, Cell<HspiConfig>>,
}
impl<R: RegisterIo> Hspi<R> {
    fn apply(&self, config: HspiConfig) {
        self.regs.set_cfg(
            HspiCfg::new()
                .with_cpol(config.cpol)
                .with_cpha(config.cpha)
                .with_tx_always_drive(config.tx_always_drive)
                .with_byte_order(config.byte_order.into_bits() != 0),
        );
        self.regs
            .set_mode_cfg(HspiModeCfg::new().with_burst_len(config.burst_len.into_bits()));
    }
    /// Read and acknowledge the FIFO error interrupts.
    fn take_errors(&self) -> HspiInterrupts {
        self.regs.take_interrupts()
    }
}
impl<R: RegisterIo> Transport for Hspi<R> {
    const NAME: &'static str = "HSPI";
    const CMD_BUF_SIZE_MAX: usize = 256;
    const DATA_BUF_SIZE_MAX: usize = 1500;
    const HAS_CIS: bool = false;
    type Config = HspiConfig;
    type Regs = R;

    fn new(regs: R, config: HspiConfig) -> Self {
        Self {
            regs: HspiRegisters::new(regs),
            config: blocking_mutex::Mutex::new(Cell::new(config)),
        }
    }
    fn init(&self) {
        self.regs.clear_fifos();
        // Errors from before the FIFOs were cleared are meaningless.
        let stale = self.take_errors();
        if stale.into_bits() != 0 {
            debug!("Discarded stale HSPI errors {:#x}.", stale.into_bits());
        }
        self.apply(self.config());
        self.regs.set_interrupt_enable(HspiInterrupts::new());
        debug!("HSPI slave configured.");
    }
    fn deinit(&self) {
        let errors = self.take_errors();
        if errors.into_bits() != 0 {
            warn!("HSPI reported FIFO errors {:#x}.", errors.into_bits());
        }
        self.regs.clear_fifos();
    }
    fn configure(&self, config: HspiConfig) -> SlaveResult<()> {
        self.config.lock(|cell| cell.set(config));
        self.apply(config);
        Ok(())
    }
    fn config(&self) -> HspiConfig {
        self.config.lock(Cell::get)
    }
}
