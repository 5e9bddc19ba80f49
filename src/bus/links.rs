use crate::bus::packet::{PACKET_LEN, to_hex};
use crate::sensor::{SensorInfo, SensorLink};
use tracing::{debug, warn};

/// An open sensor link together with its delivery counters.
#[derive(Debug)]
pub struct OpenLink<L> {
    pub link: L,
    events_received: u64,
    read_failures: u64,
    write_failures: u64,
    last_write_ok: bool,
}

impl<L: SensorLink> OpenLink<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            events_received: 0,
            read_failures: 0,
            write_failures: 0,
            last_write_ok: true,
        }
    }

    pub fn label(&self) -> &str {
        self.link.label()
    }

    pub fn info(&self) -> SensorInfo {
        SensorInfo {
            label: self.link.label().to_string(),
            events_received: self.events_received,
            read_failures: self.read_failures,
            write_failures: self.write_failures,
            last_write_ok: self.last_write_ok,
        }
    }
}

/// Drain every link and return the summed delta.
///
/// A link that fails to read contributes nothing this cycle; the others are
/// still drained.
pub fn drain_all<L: SensorLink>(links: &mut [OpenLink<L>]) -> i64 {
    let mut total: i64 = 0;
    for open in links.iter_mut() {
        match open.link.drain_events() {
            Ok(events) => {
                open.events_received += events.len() as u64;
                total += events.iter().map(|event| i64::from(*event)).sum::<i64>();
            }
            Err(err) => {
                open.read_failures += 1;
                warn!(port = %open.link.label(), error = %err, "Failed to read sensor events");
            }
        }
    }
    total
}

/// Send `frame` to every link. Returns how many writes succeeded; a failed
/// write is logged and never retried.
pub fn broadcast<L: SensorLink>(links: &mut [OpenLink<L>], frame: &[u8; PACKET_LEN]) -> usize {
    let mut delivered = 0;
    for open in links.iter_mut() {
        match open.link.send(frame) {
            Ok(()) => {
                delivered += 1;
                open.last_write_ok = true;
                debug!(
                    port = %open.link.label(),
                    packet = %to_hex(frame),
                    "Sent update packet to sensor"
                );
            }
            Err(err) => {
                open.write_failures += 1;
                open.last_write_ok = false;
                warn!(port = %open.link.label(), error = %err, "Failed to send update packet");
            }
        }
    }
    delivered
}
