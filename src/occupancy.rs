//! Bounded occupancy counter and the configured venue capacity.
//!
//! Both values travel in 2-byte big-endian fields of the sensor update frame,
//! where `0xFFFF` marks the start of a frame. Neither value may ever take the
//! sentinel, so the representable range stops at `0xFFFE`.

use crate::error::AppError;

/// Reserved 2-byte value used as the frame header.
pub const SENTINEL: u16 = u16::MAX;
/// Largest occupancy or capacity that can be carried in a frame.
pub const MAX_COUNT: u16 = SENTINEL - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity(u16);

impl Capacity {
    /// Validate a configured capacity. Anything outside `1..=65534` is fatal.
    pub fn new(value: i64) -> Result<Self, AppError> {
        if value < 1 || value > i64::from(MAX_COUNT) {
            return Err(AppError::CapacityOutOfRange(value));
        }
        Ok(Self(value as u16))
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

/// Occupancy accumulated from sensor deltas, clamped to `[0, MAX_COUNT]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OccupancyCounter {
    value: u16,
}

impl OccupancyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u16 {
        self.value
    }

    /// Apply a signed delta and return the new value.
    ///
    /// Results below zero or above [`MAX_COUNT`] are clamped; the counter never
    /// wraps and never reports an error.
    pub fn apply(&mut self, delta: i64) -> u16 {
        let next = i64::from(self.value)
            .saturating_add(delta)
            .clamp(0, i64::from(MAX_COUNT));
        self.value = next as u16;
        self.value
    }
}
