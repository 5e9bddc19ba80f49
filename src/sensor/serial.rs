use crate::bus::packet::PACKET_LEN;
use crate::error::AppError;
use crate::sensor::{SensorDiscovery, SensorEvent, SensorLink, label_matches};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[cfg(target_os = "linux")]
use rppal::uart::{Parity, Uart};
#[cfg(target_os = "linux")]
use std::time::Duration;

#[cfg(target_os = "linux")]
const READ_CHUNK: usize = 64;

/// Serial device found during a scan: the name it was matched on and the
/// canonical device path used as its label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    pub label: String,
}

/// List devices in `device_dir` (normally `/dev/serial/by-id`) whose entry
/// name matches `pattern`. A missing directory means nothing is attached.
pub fn list_matching_ports(device_dir: &Path, pattern: &str) -> Result<Vec<PortCandidate>, AppError> {
    let entries = match std::fs::read_dir(device_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(AppError::Discovery(format!(
                "failed to list {}: {err}",
                device_dir.display()
            )));
        }
    };

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|err| AppError::Discovery(format!("failed to read directory entry: {err}")))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !label_matches(&name, pattern) {
            continue;
        }
        let path = entry.path();
        let label = std::fs::canonicalize(&path)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        // Several by-id aliases can point at the same tty.
        if seen.insert(label.clone()) {
            candidates.push(PortCandidate { name, label });
        }
    }
    candidates.sort_by(|a, b| a.label.cmp(&b.label));
    Ok(candidates)
}

pub struct SerialDiscovery {
    device_dir: PathBuf,
    baud_rate: u32,
}

impl SerialDiscovery {
    pub fn new(device_dir: impl Into<PathBuf>, baud_rate: u32) -> Self {
        Self {
            device_dir: device_dir.into(),
            baud_rate,
        }
    }
}

impl SensorDiscovery for SerialDiscovery {
    type Link = SerialLink;

    fn discover(
        &mut self,
        pattern: &str,
        opened: &HashSet<String>,
    ) -> Result<Vec<SerialLink>, AppError> {
        let mut links = Vec::new();
        for candidate in list_matching_ports(&self.device_dir, pattern)? {
            if opened.contains(&candidate.label) {
                debug!(port = %candidate.label, "Sensor port already open, skipping");
                continue;
            }
            debug!(port = %candidate.label, name = %candidate.name, "Found sensor port");

            match SerialLink::open(&candidate.label, self.baud_rate) {
                Ok(link) => links.push(link),
                Err(err) => {
                    warn!(port = %candidate.label, error = %err, "Failed to open sensor port");
                }
            }
        }
        Ok(links)
    }
}

fn serial_error(port: &str, err: impl fmt::Display) -> AppError {
    AppError::Serial {
        port: port.to_string(),
        message: err.to_string(),
    }
}

#[cfg(target_os = "linux")]
pub struct SerialLink {
    label: String,
    uart: Uart,
}

#[cfg(target_os = "linux")]
impl SerialLink {
    /// Open the device at 8N1 with zero-timeout reads and non-blocking writes.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, AppError> {
        let mut uart =
            Uart::with_path(path, baud_rate, Parity::None, 8, 1).map_err(|err| serial_error(path, err))?;
        uart.set_read_mode(0, Duration::ZERO)
            .map_err(|err| serial_error(path, err))?;
        uart.set_write_mode(false)
            .map_err(|err| serial_error(path, err))?;
        Ok(Self {
            label: path.to_string(),
            uart,
        })
    }
}

#[cfg(target_os = "linux")]
impl SensorLink for SerialLink {
    fn label(&self) -> &str {
        &self.label
    }

    fn drain_events(&mut self) -> Result<Vec<SensorEvent>, AppError> {
        let mut events = Vec::new();
        let mut buffer = [0u8; READ_CHUNK];
        loop {
            let read = self
                .uart
                .read(&mut buffer)
                .map_err(|err| serial_error(&self.label, err))?;
            events.extend(buffer[..read].iter().map(|byte| *byte as SensorEvent));
            if read < buffer.len() {
                break;
            }
        }
        Ok(events)
    }

    fn send(&mut self, frame: &[u8; PACKET_LEN]) -> Result<(), AppError> {
        let written = self
            .uart
            .write(frame)
            .map_err(|err| serial_error(&self.label, err))?;
        if written != PACKET_LEN {
            return Err(serial_error(
                &self.label,
                format!("short write: {written} of {PACKET_LEN} bytes"),
            ));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
pub struct SerialLink {
    label: String,
}

#[cfg(not(target_os = "linux"))]
impl SerialLink {
    pub fn open(path: &str, _baud_rate: u32) -> Result<Self, AppError> {
        Err(serial_error(path, "serial sensor links require Linux"))
    }
}

#[cfg(not(target_os = "linux"))]
impl SensorLink for SerialLink {
    fn label(&self) -> &str {
        &self.label
    }

    fn drain_events(&mut self) -> Result<Vec<SensorEvent>, AppError> {
        Err(serial_error(&self.label, "serial sensor links require Linux"))
    }

    fn send(&mut self, _frame: &[u8; PACKET_LEN]) -> Result<(), AppError> {
        Err(serial_error(&self.label, "serial sensor links require Linux"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(tag: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let dir = std::env::temp_dir().join(format!("occupancy-bridge-{tag}-{unique}"));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn matching_ports_are_listed_by_label() -> Result<(), Box<dyn std::error::Error>> {
        let dir = scratch_dir("ports")?;
        fs::write(dir.join("usb-Arduino__www.arduino.cc__0043_A-if00"), "")?;
        fs::write(dir.join("usb-arduino_LLC_Uno_B-if00"), "")?;
        fs::write(dir.join("usb-FTDI_FT232R_USB_UART_C-if00"), "")?;

        let ports = list_matching_ports(&dir, "Arduino")?;
        let _ = fs::remove_dir_all(&dir);

        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|port| label_matches(&port.name, "arduino")));
        assert!(ports[0].label < ports[1].label);
        Ok(())
    }

    #[test]
    fn missing_device_dir_means_no_ports() -> Result<(), Box<dyn std::error::Error>> {
        let dir = scratch_dir("missing")?.join("by-id");

        let ports = list_matching_ports(&dir, "Arduino")?;

        assert!(ports.is_empty());
        Ok(())
    }

    #[test]
    fn discovery_skips_open_labels() -> Result<(), Box<dyn std::error::Error>> {
        let dir = scratch_dir("skip")?;
        fs::write(dir.join("usb-Arduino_A-if00"), "")?;
        let ports = list_matching_ports(&dir, "Arduino")?;
        let opened: HashSet<String> = ports.iter().map(|port| port.label.clone()).collect();

        let mut discovery = SerialDiscovery::new(&dir, 9600);
        let links = discovery.discover("Arduino", &opened)?;
        let _ = fs::remove_dir_all(&dir);

        assert!(links.is_empty());
        Ok(())
    }
}
