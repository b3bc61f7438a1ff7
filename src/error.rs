use thiserror::Error;

use crate::port::identifier::PortId;

pub type GarageResult<T> = Result<T, GarageError>;

#[derive(Debug, Error)]
pub enum GarageError {
  #[error("invalid configuration: {0}")]
  Config(String),
  #[error(transparent)]
  #[cfg(feature = "arm")]
  Gpio(#[from] rppal::gpio::Error),
  #[error(transparent)]
  SimulatedGpio(#[from] crate::gpio::simulated::Error),
  #[error("GPIO {0} has not been claimed")]
  PinNotClaimed(u8),
  #[error("unknown port: {0}")]
  UnknownPort(PortId),
  #[error("failed to read sensors of {port}: {source}")]
  SensorRead {
    port: PortId,
    #[source]
    source: Box<GarageError>,
  },
  #[error("relay of {port} failed: {source}")]
  Relay {
    port: PortId,
    #[source]
    source: Box<GarageError>,
  },
  #[error("no timing data recorded for {0}")]
  TimingNotRecorded(PortId),
  #[error("failed to write state file: {0}")]
  Store(#[source] std::io::Error),
  #[error(transparent)]
  JoinError(#[from] tokio::task::JoinError),
  #[error(transparent)]
  Json(#[from] serde_json::Error),
  #[error(transparent)]
  MqttClient(#[from] rumqttc::ClientError),
  #[error(transparent)]
  MqttConnection(#[from] rumqttc::ConnectionError),
  #[error("HTTP server failed: {0}")]
  Http(#[source] std::io::Error),
}
