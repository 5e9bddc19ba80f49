use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("capacity out of range: {0} (expected 1-65534)")]
    CapacityOutOfRange(i64),
    #[error("packet error: {0}")]
    Packet(#[from] crate::bus::packet::PacketError),
    #[error("serial error on {port}: {message}")]
    Serial { port: String, message: String },
    #[error("discovery error: {0}")]
    Discovery(String),
    #[error("forecast client error: {0}")]
    Forecast(#[from] crate::forecast::ForecastError),
}
