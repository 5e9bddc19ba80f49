use crate::bus::packet::PACKET_LEN;
use crate::error::AppError;
use std::collections::HashSet;

pub mod mock;
pub mod serial;

/// Signed occupancy change reported by one device, one byte on the wire.
pub type SensorEvent = i8;

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_PORT_PATTERN: &str = "Arduino";
pub const DEFAULT_DEVICE_DIR: &str = "/dev/serial/by-id";

/// One open connection to a sensor device.
///
/// Reads never block: `drain_events` returns whatever is buffered, possibly
/// nothing. Writes are best-effort and never acknowledged.
pub trait SensorLink {
    fn label(&self) -> &str;
    fn drain_events(&mut self) -> Result<Vec<SensorEvent>, AppError>;
    fn send(&mut self, frame: &[u8; PACKET_LEN]) -> Result<(), AppError>;
}

pub trait SensorDiscovery {
    type Link: SensorLink;

    /// Open every attached device matching `pattern` whose label is not in `opened`.
    fn discover(
        &mut self,
        pattern: &str,
        opened: &HashSet<String>,
    ) -> Result<Vec<Self::Link>, AppError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorInfo {
    pub label: String,
    pub events_received: u64,
    pub read_failures: u64,
    pub write_failures: u64,
    pub last_write_ok: bool,
}

/// Case-insensitive substring match of a device label against the configured pattern.
pub fn label_matches(label: &str, pattern: &str) -> bool {
    label.to_lowercase().contains(&pattern.to_lowercase())
}
