use crate::protocol::{self, Features, PREFIX_DEVICE_TO_HOST, REPORT_SIZE};
use crate::{CaptureError, Result};
use hidapi::{HidDevice, HidResult};
use std::time::Duration;

/// Time the firmware needs between a command write and its input report.
const COMMAND_SETTLE: Duration = Duration::from_millis(20);

/// The three HID calls the transport needs.
pub trait ReportDevice: Send {
    fn write(&self, data: &[u8]) -> HidResult<usize>;
    fn get_input_report(&self, buf: &mut [u8]) -> HidResult<usize>;
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> HidResult<usize>;
}

impl ReportDevice for HidDevice {
    fn write(&self, data: &[u8]) -> HidResult<usize> {
        HidDevice::write(self, data)
    }

    fn get_input_report(&self, buf: &mut [u8]) -> HidResult<usize> {
        HidDevice::get_input_report(self, buf)
    }

    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> HidResult<usize> {
        HidDevice::read_timeout(self, buf, timeout_ms)
    }
}

/// Control and report channel to one XR50 over its HID interface.
///
/// The 0x02 host-to-device prefix doubles as the output report id, so a
/// framed command goes to `write()` unchanged.
pub struct HidTransport {
    device: Box<dyn ReportDevice>,
}

impl HidTransport {
    pub fn new(device: impl ReportDevice + 'static) -> Self {
        Self {
            device: Box::new(device),
        }
    }

    fn send(&self, frame: &[u8; REPORT_SIZE]) -> Result<()> {
        self.device
            .write(frame)
            .map_err(|e| CaptureError::HidCommand(format!("write failed: {}", e)))?;
        std::thread::sleep(COMMAND_SETTLE);
        Ok(())
    }

    fn receive(&self) -> Result<Vec<u8>> {
        let mut buf = [0u8; REPORT_SIZE + 1];
        buf[0] = PREFIX_DEVICE_TO_HOST;
        let len = self
            .device
            .get_input_report(&mut buf)
            .map_err(|e| CaptureError::HidCommand(format!("get_input_report failed: {}", e)))?;
        Ok(buf[..len].to_vec())
    }

    /// Send `cmd` and return the response payload after the command echo.
    pub fn query(&self, cmd: &[u8]) -> Result<Vec<u8>> {
        self.send(&protocol::build_command(cmd))?;
        let response = self.receive()?;
        let offset = protocol::validate_response(&response, cmd)?;
        Ok(response[offset..].to_vec())
    }

    pub fn read_uuid(&self) -> Result<String> {
        Ok(protocol::extract_string(&self.query(protocol::CMD_UUID)?))
    }

    pub fn read_version(&self) -> Result<String> {
        Ok(protocol::extract_string(&self.query(protocol::CMD_VERSION)?))
    }

    pub fn read_features(&self) -> Result<Features> {
        Ok(protocol::parse_features(&self.query(protocol::CMD_FEATURES)?))
    }

    /// The firmware acknowledges configure and edge-stream commands with an
    /// unspecified report, so only the write is checked.
    fn fire(&self, frame: &[u8; REPORT_SIZE], what: &str) -> Result<()> {
        self.send(frame)?;
        if let Err(e) = self.receive() {
            log::debug!("{}: no acknowledgement ({})", what, e);
        }
        Ok(())
    }

    pub fn configure(&self, edge: bool, embedded_algo: bool) -> Result<()> {
        self.fire(&protocol::build_configure_cmd(edge, embedded_algo), "configure")
    }

    pub fn edge_stream(&self, start: bool) -> Result<()> {
        self.fire(&protocol::build_edge_stream_cmd(start), "edge stream")
    }

    /// Read one interrupt report; `Ok(0)` on timeout.
    pub fn read_report(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        Ok(self.device.read_timeout(buf, timeout.as_millis() as i32)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hidapi::HidError;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeDevice {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        response: Option<Vec<u8>>,
        write_fails: bool,
    }

    fn hid_error(message: &str) -> HidError {
        HidError::HidApiError {
            message: message.to_string(),
        }
    }

    impl ReportDevice for FakeDevice {
        fn write(&self, data: &[u8]) -> HidResult<usize> {
            if self.write_fails {
                return Err(hid_error("pipe error"));
            }
            self.written.lock().push(data.to_vec());
            Ok(data.len())
        }

        fn get_input_report(&self, buf: &mut [u8]) -> HidResult<usize> {
            let response = self.response.as_ref().ok_or_else(|| hid_error("no report"))?;
            buf[..response.len()].copy_from_slice(response);
            Ok(response.len())
        }

        fn read_timeout(&self, _buf: &mut [u8], _timeout_ms: i32) -> HidResult<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_command_without_acknowledgement_succeeds() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let transport = HidTransport::new(FakeDevice {
            written: Arc::clone(&written),
            ..FakeDevice::default()
        });

        transport.edge_stream(true).unwrap();
        let written = written.lock();
        assert_eq!(written.len(), 1);
        assert_eq!(&written[0][..4], &[0x02, 0xA2, 0x33, 1]);
    }

    #[test]
    fn test_write_failure_is_reported() {
        let transport = HidTransport::new(FakeDevice {
            write_fails: true,
            ..FakeDevice::default()
        });
        assert!(matches!(
            transport.configure(true, false),
            Err(CaptureError::HidCommand(_))
        ));
    }

    #[test]
    fn test_query_reads_payload() {
        let mut response = vec![PREFIX_DEVICE_TO_HOST];
        response.extend_from_slice(protocol::CMD_VERSION);
        response.extend_from_slice(b"3.2.1\0");
        let transport = HidTransport::new(FakeDevice {
            response: Some(response),
            ..FakeDevice::default()
        });
        assert_eq!(transport.read_version().unwrap(), "3.2.1");
        assert!(transport.read_uuid().is_err());
    }
}
