//! GPIO line abstraction shared by the relay and the reed sensors.
//!
//! The concrete backend is picked once in `main`: `rppal` when built with the `arm` feature, otherwise the in-memory
//! [`SimulatedGpio`](simulated::SimulatedGpio).

use std::{fmt, sync::Arc};

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::GarageResult;

#[cfg(feature = "arm")]
pub mod hardware;
pub mod simulated;

/// A digital level on a pin
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Level {
  Low,
  High,
}

impl Level {
  pub fn inverse(self) -> Level {
    match self {
      Level::Low => Level::High,
      Level::High => Level::Low,
    }
  }
}

impl fmt::Display for Level {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Level::Low => write!(f, "low"),
      Level::High => write!(f, "high"),
    }
  }
}

/// Internal resistor applied to sensor inputs
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Pull {
  Up,
  Down,
  Off,
}

/// A level change observed on an input pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
  pub pin: u8,
  pub level: Level,
}

pub type EdgeSender = mpsc::UnboundedSender<Edge>;
pub type EdgeReceiver = mpsc::UnboundedReceiver<Edge>;

pub trait GpioBackend: fmt::Debug + Send + Sync {
  /// Claim `pin` as an output, driven to `initial` straight away.
  fn claim_output(&self, pin: u8, initial: Level) -> GarageResult<()>;

  fn claim_input(&self, pin: u8, pull: Pull) -> GarageResult<()>;

  fn write(&self, pin: u8, level: Level) -> GarageResult<()>;

  fn read(&self, pin: u8) -> GarageResult<Level>;

  /// Deliver every level change of an input pin (both edges) along `edges`.
  fn watch(&self, pin: u8, edges: EdgeSender) -> GarageResult<()>;

  /// Free every claimed line. Calling it again is a no-op.
  fn release(&self);
}

#[cfg(feature = "arm")]
pub fn backend() -> GarageResult<Arc<dyn GpioBackend>> {
  Ok(Arc::new(hardware::HardwareGpio::new()?))
}

#[cfg(not(feature = "arm"))]
pub fn backend() -> GarageResult<Arc<dyn GpioBackend>> {
  log::warn!("Built without the `arm` feature, using simulated GPIO");
  Ok(Arc::new(simulated::SimulatedGpio::new()))
}
