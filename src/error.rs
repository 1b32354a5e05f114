use core::fmt;

use embassy_time::TimeoutError;

/// Result type used throughout the crate.
pub type SlaveResult<T = ()> = Result<T, SlaveError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Everything that can go wrong while talking to the slave peripheral.
///
/// All of these are recoverable. Validation errors are always reported before anything was
/// written to the hardware.
pub enum SlaveError {
    /// A zero or oversized length, an address outside the DRAM window, a misaligned command
    /// buffer size or an unsupported CIS function.
    InvalidParam,
    /// The DMA allocator could not satisfy a request. Everything allocated in the same call has
    /// already been released again.
    NoMemory,
    /// The device is not in the initialized state.
    NotInitialized,
    /// The device was already initialized.
    AlreadyInitialized,
    /// Another task is currently initializing or tearing down the device.
    Busy,
    /// A wait exceeded its deadline.
    Timeout,
    /// A lower layer failed for a reason not covered by the other variants.
    Failed,
}

impl fmt::Display for SlaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::SlaveError::*;
        let explain = match self {
            InvalidParam => "Invalid parameters",
            NoMemory => "Out of DMA memory",
            NotInitialized => "Device not initialized",
            AlreadyInitialized => "Device already initialized",
            Busy => "Device busy",
            Timeout => "Timed out",
            Failed => "Operation failed",
        };
        write!(f, "{}", explain)
    }
}

impl From<TimeoutError> for SlaveError {
    fn from(_: TimeoutError) -> Self {
        Self::Timeout
    }
}
