//! Driver error type

use core::fmt;

use helix_hal::HalError;

/// Result type for SD/MMC operations
pub type SdResult<T> = Result<T, SdError>;

/// SD/MMC driver errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// Malformed request (bad buffer, width, partition or range)
    InvalidArgument,
    /// No media present or controller not initialized
    NotReady,
    /// Line-idle wait, completion wait or hardware timeout expired
    Timeout,
    /// Command or data CRC error reported by the controller
    CrcError,
    /// Generic hardware failure, including failed tuning and failed switches
    DeviceError,
    /// Controller state or descriptor memory could not be allocated
    OutOfResources,
    /// The platform refused an operation
    Unsupported,
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdError::InvalidArgument => write!(f, "Invalid argument"),
            SdError::NotReady => write!(f, "Device not ready"),
            SdError::Timeout => write!(f, "Timeout"),
            SdError::CrcError => write!(f, "CRC error"),
            SdError::DeviceError => write!(f, "Device error"),
            SdError::OutOfResources => write!(f, "Out of resources"),
            SdError::Unsupported => write!(f, "Operation not supported"),
        }
    }
}

impl From<HalError> for SdError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::InvalidParameter | HalError::InvalidAddress => SdError::InvalidArgument,
            HalError::Timeout => SdError::Timeout,
            HalError::OutOfMemory => SdError::OutOfResources,
            HalError::NotInitialized => SdError::NotReady,
            HalError::NotSupported => SdError::Unsupported,
            HalError::HardwareError | HalError::ResourceBusy => SdError::DeviceError,
        }
    }
}
