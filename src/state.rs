use crate::forecast::ForecastRange;
use crate::forecast::feedback::FeedbackCode;
use crate::sensor::SensorInfo;
use serde::Serialize;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgePhase {
    AwaitingForecast,
    AwaitingSensors,
    Running,
}

/// What was last broadcast to the sensors.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancySnapshot {
    pub occupancy: u16,
    pub capacity: u16,
    pub feedback: FeedbackCode,
    pub forecast: Option<ForecastRange>,
    pub timestamp: SystemTime,
}

/// Read-only view of the engine for the status API. Written by the engine
/// thread only.
#[derive(Debug)]
pub struct AppState {
    phase: BridgePhase,
    sensors: Vec<SensorInfo>,
    snapshot: Option<OccupancySnapshot>,
    forecast_points: usize,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            phase: BridgePhase::AwaitingForecast,
            sensors: Vec::new(),
            snapshot: None,
            forecast_points: 0,
        }
    }

    pub fn phase(&self) -> BridgePhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: BridgePhase) {
        self.phase = phase;
    }

    pub fn sensors(&self) -> &[SensorInfo] {
        &self.sensors
    }

    pub fn set_sensors(&mut self, sensors: Vec<SensorInfo>) {
        self.sensors = sensors;
    }

    pub fn snapshot(&self) -> Option<&OccupancySnapshot> {
        self.snapshot.as_ref()
    }

    pub fn set_snapshot(&mut self, snapshot: OccupancySnapshot) {
        self.snapshot = Some(snapshot);
    }

    pub fn forecast_points(&self) -> usize {
        self.forecast_points
    }

    pub fn set_forecast_points(&mut self, points: usize) {
        self.forecast_points = points;
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
