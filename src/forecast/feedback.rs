use crate::forecast::ForecastRange;
use serde::Serialize;

/// Feedback shown on the sensor indicators, carried in the last frame byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FeedbackCode {
    BelowRange = 1,
    InRange = 2,
    AboveRange = 3,
    Unavailable = 4,
}

impl FeedbackCode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::BelowRange),
            2 => Some(Self::InRange),
            3 => Some(Self::AboveRange),
            4 => Some(Self::Unavailable),
            _ => None,
        }
    }
}

/// Compare current occupancy with the forecast range for this minute.
///
/// Bounds are inclusive. A missing range, or one with non-finite bounds,
/// yields [`FeedbackCode::Unavailable`].
pub fn classify(occupancy: u16, range: Option<ForecastRange>) -> FeedbackCode {
    let Some(range) = range else {
        return FeedbackCode::Unavailable;
    };
    if !range.lower.is_finite() || !range.upper.is_finite() {
        return FeedbackCode::Unavailable;
    }

    let occupancy = f64::from(occupancy);
    if occupancy < range.lower {
        FeedbackCode::BelowRange
    } else if occupancy > range.upper {
        FeedbackCode::AboveRange
    } else {
        FeedbackCode::InRange
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(lower: f64, upper: f64) -> Option<ForecastRange> {
        Some(ForecastRange { lower, upper })
    }

    #[test]
    fn occupancy_inside_range_is_in_range() {
        assert_eq!(classify(50, range(40.0, 60.0)), FeedbackCode::InRange);
    }

    #[test]
    fn boundaries_are_inclusive() {
        assert_eq!(classify(40, range(40.0, 60.0)), FeedbackCode::InRange);
        assert_eq!(classify(60, range(40.0, 60.0)), FeedbackCode::InRange);
    }

    #[test]
    fn occupancy_outside_range_is_classified_by_side() {
        assert_eq!(classify(39, range(40.0, 60.0)), FeedbackCode::BelowRange);
        assert_eq!(classify(61, range(40.0, 60.0)), FeedbackCode::AboveRange);
    }

    #[test]
    fn fractional_bounds_compare_numerically() {
        assert_eq!(classify(3, range(3.2, 7.9)), FeedbackCode::BelowRange);
        assert_eq!(classify(8, range(3.2, 7.9)), FeedbackCode::AboveRange);
        assert_eq!(classify(0, range(-1.5, 0.4)), FeedbackCode::InRange);
    }

    #[test]
    fn missing_range_is_unavailable() {
        assert_eq!(classify(50, None), FeedbackCode::Unavailable);
    }

    #[test]
    fn non_finite_bounds_are_unavailable() {
        assert_eq!(classify(5, range(f64::NAN, 10.0)), FeedbackCode::Unavailable);
        assert_eq!(
            classify(5, range(0.0, f64::INFINITY)),
            FeedbackCode::Unavailable
        );
    }

    #[test]
    fn wire_bytes_match_codes() {
        assert_eq!(FeedbackCode::BelowRange.as_byte(), 1);
        assert_eq!(FeedbackCode::InRange.as_byte(), 2);
        assert_eq!(FeedbackCode::AboveRange.as_byte(), 3);
        assert_eq!(FeedbackCode::Unavailable.as_byte(), 4);
        assert_eq!(FeedbackCode::from_byte(0), None);
        assert_eq!(FeedbackCode::from_byte(2), Some(FeedbackCode::InRange));
    }
}
