use std::io;
use thiserror::Error;

/// Errors raised by the ScientISST Sense driver.
///
/// Every fallible operation in the crate returns [`Result<T>`]. CRC failures
/// are not represented here: a bad CRC drives the resynchronisation loop in
/// [`Sense::read`](crate::Sense::read) instead of surfacing to the caller.
#[derive(Debug, Error)]
pub enum SenseError {
    /// The device address is not a MAC literal in any accepted form.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Opening the transport failed or timed out.
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    /// A write did not drain or a read did not complete within the deadline.
    #[error("failed contacting device: {0}")]
    ContactingDevice(String),
    /// The command requires an idle device but an acquisition is running.
    #[error("device not idle")]
    NotIdle,
    /// `read`/`stop` called with no acquisition running.
    #[error("device not in acquisition mode")]
    NotInAcquisition,
    /// Out-of-range channel, duplicate channel, bad API, bad DAC/battery
    /// value, or wrong trigger length.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// The requested operating mode is advertised by the device but not
    /// implemented by this driver.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// The acquisition stream died before delivering a single frame.
    #[error("unknown error: acquisition stream ended unexpectedly")]
    Unknown,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SenseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_diagnostics() {
        let e = SenseError::InvalidAddress("not a mac".into());
        assert_eq!(e.to_string(), "invalid address: not a mac");

        let e = SenseError::ContactingDevice("write queue not drained".into());
        assert_eq!(
            e.to_string(),
            "failed contacting device: write queue not drained"
        );
    }

    #[test]
    fn from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broken");
        let e: SenseError = io_err.into();
        assert!(matches!(e, SenseError::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<SenseError>();
        assert_sync::<SenseError>();
    }
}
