//! Update frame broadcast to every sensor.
//!
//! Layout (big-endian, no padding):
//!
//! ```text
//! +--------+-----------+----------+----------+
//! | 0xFFFF | occupancy | capacity | feedback |
//! |  2 B   |    2 B    |   2 B    |   1 B    |
//! +--------+-----------+----------+----------+
//! ```
//!
//! Receivers synchronise on the header value and the fixed length; there is
//! no checksum and no length prefix.

use crate::forecast::feedback::FeedbackCode;
use crate::occupancy::{Capacity, SENTINEL};
use thiserror::Error;

pub const PACKET_LEN: usize = 7;
pub const HEADER: [u8; 2] = SENTINEL.to_be_bytes();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("occupancy collides with frame header value 0xffff")]
    OccupancySentinel,
    #[error("capacity collides with frame header value 0xffff")]
    CapacitySentinel,
    #[error("frame length {0} (expected 7)")]
    Length(usize),
    #[error("missing frame header")]
    Header,
    #[error("unknown feedback byte {0}")]
    Feedback(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePacket {
    pub occupancy: u16,
    pub capacity: u16,
    pub feedback: FeedbackCode,
}

impl UpdatePacket {
    pub fn new(
        occupancy: u16,
        capacity: Capacity,
        feedback: FeedbackCode,
    ) -> Result<Self, PacketError> {
        if occupancy == SENTINEL {
            return Err(PacketError::OccupancySentinel);
        }
        Ok(Self {
            occupancy,
            capacity: capacity.get(),
            feedback,
        })
    }

    pub fn encode(&self) -> [u8; PACKET_LEN] {
        let occupancy = self.occupancy.to_be_bytes();
        let capacity = self.capacity.to_be_bytes();
        [
            HEADER[0],
            HEADER[1],
            occupancy[0],
            occupancy[1],
            capacity[0],
            capacity[1],
            self.feedback.as_byte(),
        ]
    }

    /// Parse a frame as a sensor would receive it.
    pub fn decode(frame: &[u8]) -> Result<Self, PacketError> {
        if frame.len() != PACKET_LEN {
            return Err(PacketError::Length(frame.len()));
        }
        if frame[..2] != HEADER {
            return Err(PacketError::Header);
        }
        let occupancy = u16::from_be_bytes([frame[2], frame[3]]);
        if occupancy == SENTINEL {
            return Err(PacketError::OccupancySentinel);
        }
        let capacity = u16::from_be_bytes([frame[4], frame[5]]);
        if capacity == SENTINEL {
            return Err(PacketError::CapacitySentinel);
        }
        let feedback = FeedbackCode::from_byte(frame[6]).ok_or(PacketError::Feedback(frame[6]))?;
        Ok(Self {
            occupancy,
            capacity,
            feedback,
        })
    }
}

/// Encode raw field values, rejecting any that would collide with the header.
pub fn encode(
    occupancy: u16,
    capacity: u16,
    feedback: FeedbackCode,
) -> Result<[u8; PACKET_LEN], PacketError> {
    if occupancy == SENTINEL {
        return Err(PacketError::OccupancySentinel);
    }
    if capacity == SENTINEL {
        return Err(PacketError::CapacitySentinel);
    }
    Ok(UpdatePacket {
        occupancy,
        capacity,
        feedback,
    }
    .encode())
}

pub fn to_hex(frame: &[u8]) -> String {
    frame.iter().map(|byte| format!("{byte:02x}")).collect()
}
