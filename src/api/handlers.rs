use crate::api::responses::{
    ErrorCode, ErrorResponse, HealthSuccessResponse, OccupancySuccessResponse, SensorStatus,
    SensorStatusResponse, SensorsSuccessResponse,
};
use crate::sensor::SensorInfo;
use crate::state::{AppState, BridgePhase};
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::error;

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

#[derive(Debug)]
enum TimestampError {
    Format(time::error::Format),
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampError::Format(err) => write!(f, "timestamp format error: {err}"),
        }
    }
}

pub enum ApiResponse<T> {
    Success { status: StatusCode, body: T },
    Error { status: StatusCode, body: ErrorResponse },
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        match self {
            ApiResponse::Success { status, body } => (status, Json(body)).into_response(),
            ApiResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub type HealthResponse = ApiResponse<HealthSuccessResponse>;
pub type OccupancyResponse = ApiResponse<OccupancySuccessResponse>;
pub type SensorsResponse = ApiResponse<SensorsSuccessResponse>;

pub async fn get_health(State(state): State<Arc<RwLock<AppState>>>) -> impl IntoResponse {
    build_health_response(state, SystemTime::now())
}

pub async fn get_occupancy(State(state): State<Arc<RwLock<AppState>>>) -> impl IntoResponse {
    build_occupancy_response(state, SystemTime::now())
}

pub async fn get_sensors(State(state): State<Arc<RwLock<AppState>>>) -> impl IntoResponse {
    build_sensors_response(state, SystemTime::now())
}

fn build_health_response(state: Arc<RwLock<AppState>>, now: SystemTime) -> HealthResponse {
    let guard = match state.read() {
        Ok(guard) => guard,
        Err(_) => {
            return internal_error("/api/health", "state lock poisoned while reading phase");
        }
    };
    let phase = guard.phase();
    let links = guard.sensors().len();
    let forecast_points = guard.forecast_points();
    drop(guard);

    let timestamp = match format_timestamp(now) {
        Ok(formatted) => formatted,
        Err(_) => return internal_error("/api/health", "timestamp formatting failure"),
    };

    let status = match phase {
        BridgePhase::Running => StatusCode::OK,
        BridgePhase::AwaitingForecast | BridgePhase::AwaitingSensors => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };

    ApiResponse::Success {
        status,
        body: HealthSuccessResponse {
            phase,
            links,
            forecast_points,
            timestamp,
        },
    }
}

fn build_occupancy_response(state: Arc<RwLock<AppState>>, now: SystemTime) -> OccupancyResponse {
    let guard = match state.read() {
        Ok(guard) => guard,
        Err(_) => {
            return internal_error("/api/occupancy", "state lock poisoned while reading snapshot");
        }
    };
    let snapshot = guard.snapshot().cloned();
    drop(guard);

    let Some(snapshot) = snapshot else {
        return unavailable(
            "/api/occupancy",
            ErrorCode::NoData,
            "No occupancy broadcast yet",
            now,
        );
    };

    let updated_at = match format_timestamp(snapshot.timestamp) {
        Ok(formatted) => formatted,
        Err(_) => return internal_error("/api/occupancy", "timestamp formatting failure"),
    };

    ApiResponse::Success {
        status: StatusCode::OK,
        body: OccupancySuccessResponse {
            occupancy: snapshot.occupancy,
            capacity: snapshot.capacity,
            feedback: snapshot.feedback,
            forecast_lower: snapshot.forecast.map(|range| range.lower),
            forecast_upper: snapshot.forecast.map(|range| range.upper),
            updated_at,
        },
    }
}

fn build_sensors_response(state: Arc<RwLock<AppState>>, now: SystemTime) -> SensorsResponse {
    let guard = match state.read() {
        Ok(guard) => guard,
        Err(_) => {
            return internal_error("/api/sensors", "state lock poisoned while reading sensors");
        }
    };
    let sensors: Vec<SensorStatusResponse> = guard.sensors().iter().map(map_sensor_info).collect();
    drop(guard);

    if sensors.is_empty() {
        return unavailable(
            "/api/sensors",
            ErrorCode::SensorUnavailable,
            "No sensor connected",
            now,
        );
    }

    let timestamp = match format_timestamp(now) {
        Ok(formatted) => formatted,
        Err(_) => return internal_error("/api/sensors", "timestamp formatting failure"),
    };

    ApiResponse::Success {
        status: StatusCode::OK,
        body: SensorsSuccessResponse { sensors, timestamp },
    }
}

fn map_sensor_info(sensor: &SensorInfo) -> SensorStatusResponse {
    let status = if sensor.last_write_ok {
        SensorStatus::Ok
    } else {
        SensorStatus::Error
    };
    SensorStatusResponse {
        label: sensor.label.clone(),
        status,
        events_received: sensor.events_received,
        read_failures: sensor.read_failures,
        write_failures: sensor.write_failures,
    }
}

fn unavailable<T>(
    route: &str,
    error_code: ErrorCode,
    message: &str,
    now: SystemTime,
) -> ApiResponse<T> {
    match format_timestamp(now) {
        Ok(formatted) => ApiResponse::Error {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: ErrorResponse {
                error_code,
                error_message: message.to_string(),
                timestamp: formatted,
            },
        },
        Err(_) => internal_error(route, "timestamp formatting failure"),
    }
}

fn internal_error<T>(route: &str, message: &str) -> ApiResponse<T> {
    error!(route = route, message = message, "Internal error while handling request");
    let formatted = format_timestamp(SystemTime::now()).unwrap_or_else(|err| {
        error!(error = %err, "Failed to format internal error timestamp");
        OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
    });
    ApiResponse::Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ErrorResponse {
            error_code: ErrorCode::InternalError,
            error_message: INTERNAL_ERROR_MESSAGE.to_string(),
            timestamp: formatted,
        },
    }
}

fn format_timestamp(timestamp: SystemTime) -> Result<String, TimestampError> {
    let datetime = OffsetDateTime::from(timestamp);
    datetime.format(&Rfc3339).map_err(TimestampError::Format)
}
