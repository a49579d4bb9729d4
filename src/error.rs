use crate::types::StreamKind;
use std::time::Duration;

/// Errors raised while discovering devices and driving their streams.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("No device found within {timeout:?}")]
    NoDeviceFound { timeout: Duration },

    #[error("Device {device}: {kind} stream not available")]
    CapabilityUnavailable { device: String, kind: StreamKind },

    #[error("Device {device}: {kind} callback registration rejected: {reason}")]
    RegistrationRejected {
        device: String,
        kind: StreamKind,
        reason: String,
    },

    #[error("No configured stream could be started on any device")]
    NothingStarted,

    #[error("SDK error: {0}")]
    Sdk(String),

    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("HID command failed: {0}")]
    HidCommand(String),

    #[error("Invalid response: expected prefix 0x01, got 0x{0:02x}")]
    InvalidResponse(u8),

    #[error("Command echo mismatch")]
    CommandMismatch,

    #[error("Stream stopped")]
    StreamStopped,

    #[error("Invalid configuration value {key}={value:?}")]
    Config { key: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Errors that only take one stream or device out of service.
    ///
    /// Everything else crossed the SDK boundary unexpectedly and is fatal to
    /// the process.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            CaptureError::CapabilityUnavailable { .. }
                | CaptureError::RegistrationRejected { .. }
                | CaptureError::NoDeviceFound { .. }
        )
    }
}
