//! Resolution of a device name to its hardware description, and everything else the driver needs
//! from the rest of the system.

use macro_bits::serializable_enum;

use crate::{config::DramWindow, regs::RegisterIo, resources::DmaAllocator, SlaveResult};

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// Alternate function of a pad.
    pub enum PinFunction: u8 {
        Fun1 => 1,
        Fun2 => 2,
        Fun3 => 3,
        Fun4 => 4,
        #[default]
        Fun5 => 5,
        Fun6 => 6,
        Fun7 => 7
    }
}
impl PinFunction {
    /// Plain GPIO, which is what pins get returned to after use.
    pub const GPIO: Self = Self::Fun5;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PinConfig {
    pub pin: u8,
    pub function: PinFunction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IrqConfig {
    pub num: u8,
    pub priority: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Hardware description of a slave device.
pub struct DeviceDescriptor {
    pub name: &'static str,
    /// Base of the SDIO or HSPI protocol registers.
    pub slave_reg_base: u32,
    pub wrapper_reg_base: u32,
    pub irq: IrqConfig,
    pub pins: &'static [PinConfig],
    /// The clock controller gating this device.
    pub rcc_device_name: &'static str,
}

const fn pin(pin: u8, function: PinFunction) -> PinConfig {
    PinConfig { pin, function }
}

pub const SDIO_SLAVE: DeviceDescriptor = DeviceDescriptor {
    name: "sdio_slave",
    slave_reg_base: 0x4000_2400,
    wrapper_reg_base: 0x4000_2800,
    irq: IrqConfig {
        num: 0,
        priority: 0,
    },
    // CLK, CMD, DAT0, DAT1, DAT2 and CD/DAT3.
    pins: &[
        pin(22, PinFunction::Fun4),
        pin(23, PinFunction::Fun4),
        pin(24, PinFunction::Fun4),
        pin(25, PinFunction::Fun4),
        pin(26, PinFunction::Fun4),
        pin(27, PinFunction::Fun4),
    ],
    rcc_device_name: "rcc",
};

pub const HSPI_SLAVE: DeviceDescriptor = DeviceDescriptor {
    name: "hspi_slave",
    slave_reg_base: 0x4000_2600,
    wrapper_reg_base: 0x4000_2800,
    irq: IrqConfig {
        num: 0,
        priority: 0,
    },
    // CK, INT, CS, DI and DO.
    pins: &[
        pin(22, PinFunction::Fun3),
        pin(23, PinFunction::Fun3),
        pin(25, PinFunction::Fun3),
        pin(26, PinFunction::Fun3),
        pin(27, PinFunction::Fun3),
    ],
    rcc_device_name: "rcc",
};

/// The slave devices of the W80x family.
pub const W80X_DEVICES: &[DeviceDescriptor] = &[SDIO_SLAVE, HSPI_SLAVE];

pub fn find_device(table: &[DeviceDescriptor], name: &str) -> Option<DeviceDescriptor> {
    table.iter().find(|device| device.name == name).copied()
}

/// The services of the surrounding system, which the driver relies on.
///
/// This covers the device table, register mapping, pin muxing, clocks, the interrupt controller
/// and the shared heap.
pub trait Platform: DmaAllocator {
    type Regs: RegisterIo;

    fn resolve(&self, name: &str) -> Option<DeviceDescriptor> {
        find_device(W80X_DEVICES, name)
    }
    /// Access the register block at `base`.
    fn map_registers(&self, base: u32) -> SlaveResult<Self::Regs>;
    /// Enable the clock of the device and return the system clock.
    fn enable_clock(&self, rcc_device_name: &str) -> SlaveResult<u32>;
    fn set_pin_function(&self, pin: PinConfig) -> SlaveResult<()>;
    fn enable_irq(&self, irq: IrqConfig);
    fn disable_irq(&self, irq: IrqConfig);
    /// The memory reachable by the DMA engine.
    fn dram_window(&self) -> DramWindow {
        DramWindow::W80X
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_devices_are_found_by_name() {
        let sdio = find_device(W80X_DEVICES, "sdio_slave").unwrap();
        assert_eq!(sdio.slave_reg_base, 0x4000_2400);
        assert_eq!(sdio.wrapper_reg_base, 0x4000_2800);
        assert_eq!(sdio.pins.len(), 6);
        assert!(sdio.pins.iter().all(|pin| pin.function == PinFunction::Fun4));

        let hspi = find_device(W80X_DEVICES, "hspi_slave").unwrap();
        assert_eq!(hspi.wrapper_reg_base, sdio.wrapper_reg_base);
        assert_eq!(hspi.pins.len(), 5);

        assert!(find_device(W80X_DEVICES, "sdio").is_none());
    }
}
