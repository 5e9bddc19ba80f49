use crate::forecast::feedback::FeedbackCode;
use crate::state::BridgePhase;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthSuccessResponse {
    pub phase: BridgePhase,
    pub links: usize,
    pub forecast_points: usize,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct OccupancySuccessResponse {
    pub occupancy: u16,
    pub capacity: u16,
    pub feedback: FeedbackCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast_lower: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast_upper: Option<f64>,
    /// When the values were last broadcast to the sensors.
    pub updated_at: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Ok,
    Error,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SensorStatusResponse {
    pub label: String,
    pub status: SensorStatus,
    pub events_received: u64,
    pub read_failures: u64,
    pub write_failures: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SensorsSuccessResponse {
    pub sensors: Vec<SensorStatusResponse>,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotRunning,
    NoData,
    SensorUnavailable,
    InternalError,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ErrorResponse {
    pub error_code: ErrorCode,
    pub error_message: String,
    pub timestamp: String,
}
