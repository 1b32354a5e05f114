//! # `w80x-slave-hal`
//! This is a driver for the SDIO and HSPI slave interfaces of the W80x chips, which let a host
//! processor exchange data frames and commands with the chip.
//! ## Hardware overview
//! This chapter will give a short overview of how data moves between the host and the slave.
//!
//! Both the SDIO and the HSPI slave feed a common block, which we call the wrapper. The protocol
//! registers only handle bring-up, like the CIS pointers and card readiness for SDIO or the clock
//! mode for HSPI. Everything else is done through the wrapper, which is why [SlaveHal] is generic
//! over the [Transport] and otherwise shared.
//!
//! ### Buffer descriptors
//! The wrapper moves data with two rings of buffer descriptors (BDs), which live in memory shared
//! with the DMA engine. Each descriptor has a valid bit, that decides who owns it. The naming is
//! from the host's point of view, so the host's TX link carries the RXBD ring of the slave and the
//! other way around.
//!
//! ### Transmit (TX)
//! To send a frame, we fill the next free TXBD with the address and length of the data and set its
//! valid bit. Pulsing `rx_start` then makes the wrapper pick it up. Once the host read the frame,
//! the wrapper clears the valid bit and raises the up frame done interrupt, on which we retire
//! every released descriptor. Transfers longer than one
//! descriptor buffer are split across consecutive descriptors. If all descriptors are in use,
//! [SlaveHal::tx_dma] asynchronously waits for one to be retired, but only for a bounded time.
//!
//! ### Receive (RX)
//! All RXBDs point at buffers of their own and start out valid. When the host wrote a frame, the
//! wrapper clears the valid bit and raises the down frame done interrupt. We report the buffer,
//! hand the descriptor back to the hardware and pulse `tx_start`.
//!
//! ### Commands
//! Apart from frames, there is a single command buffer. A command from the host raises the down
//! command done interrupt, after which the buffer has to be marked available again.
//!
//! ## Driver structure
//! [SlaveDevice] owns all resources of a device and carries it through its lifecycle. The
//! interrupt handler calls [SlaveDevice::on_interrupt], which only updates the [DriverState] and
//! queues events. User callbacks are run by [DriverState::run_dispatcher] in task context.

#![cfg_attr(not(test), no_std)]
pub(crate) mod fmt;

mod config;
mod device;
mod dma_list;
mod driver;
mod error;
mod hal;
mod regs;
mod resources;
mod sync;
mod transport;

pub use config::*;
pub use device::*;
pub use dma_list::{BdRing, BufferDescriptor, RxBd, TxBd};
pub use driver::*;
pub use error::{SlaveError, SlaveResult};
pub use hal::{EventHandler, EventKind, SlaveEvent, SlaveHal, TxTicket};
pub use regs::{
    CmdBufSize, HspiCfg, HspiInterrupts, HspiModeCfg, HspiRegisterBlock, HspiRegisters, Mmio,
    RegisterIo, SdioCia, SdioProgram, SdioRegisterBlock, SdioRegisters, Wrapper,
    WrapperInterrupts, WrapperRegisterBlock,
};
pub use resources::{validate_layout, BufDesc, CisBuffer, DmaAllocator, DmaRegion, DmaResources};
pub use sync::EventFlags;
pub use transport::*;

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
