use crate::domain::CoreError;

/// Port for the microphone.
///
/// Only availability matters to the core; audio frames travel on the
/// transport.
pub trait CaptureDevice: Send + Sync {
    /// Returns `CoreError::NoCaptureDevice` when no input device exists.
    fn check_available(&self) -> Result<(), CoreError>;
}
