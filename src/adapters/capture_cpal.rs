use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Device;
use tracing::{debug, warn};

use crate::domain::CoreError;
use crate::ports::CaptureDevice;

/// Microphone availability check on the platform's default audio host.
///
/// No stream is opened; audio itself travels on the realtime transport.
pub struct CpalCapture {
    device_name: Option<String>,
}

impl CpalCapture {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    fn find_device(&self) -> Option<Device> {
        let host = cpal::default_host();

        if let Some(name) = self.device_name.as_deref() {
            match host.input_devices() {
                Ok(devices) => {
                    for device in devices {
                        if device.name().is_ok_and(|n| n == name) {
                            return Some(device);
                        }
                    }
                    warn!(device = %name, "Selected input device not found, falling back to default");
                }
                Err(e) => warn!(error = %e, "Failed to enumerate input devices"),
            }
        }

        host.default_input_device()
    }
}

impl CaptureDevice for CpalCapture {
    fn check_available(&self) -> Result<(), CoreError> {
        let device = self.find_device().ok_or(CoreError::NoCaptureDevice)?;
        debug!(device = ?device.name().ok(), "Input device available");
        Ok(())
    }
}
