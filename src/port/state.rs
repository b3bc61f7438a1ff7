use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::sensor::SensorRole;

/// Where a port is, as far as the sensors and any outstanding command can tell
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
  Open,
  Closed,
  /// Travelling under a commanded operation
  Moving,
  /// Neither end sensor is active and no command is outstanding
  Partial,
  /// Both end sensors are active at once
  SensorError,
  /// Not read yet
  Unknown,
  /// Halted mid travel by an explicit stop
  Stopped,
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Status::Open => write!(f, "open"),
      Status::Closed => write!(f, "closed"),
      Status::Moving => write!(f, "moving"),
      Status::Partial => write!(f, "partial"),
      Status::SensorError => write!(f, "sensor_error"),
      Status::Unknown => write!(f, "unknown"),
      Status::Stopped => write!(f, "stopped"),
    }
  }
}

/// The way a commanded operation is taking the port
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  Open,
  Close,
}

impl Direction {
  /// The status reached once the travel completes
  pub fn target(self) -> Status {
    match self {
      Direction::Open => Status::Open,
      Direction::Close => Status::Closed,
    }
  }

  /// The sensor that confirms the travel completed
  pub fn expected_sensor(self) -> SensorRole {
    match self {
      Direction::Open => SensorRole::Open,
      Direction::Close => SensorRole::Closed,
    }
  }

  /// The sensor the port leaves when the travel starts
  pub fn starting_sensor(self) -> SensorRole {
    self.expected_sensor().opposite()
  }
}

impl fmt::Display for Direction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Direction::Open => write!(f, "open"),
      Direction::Close => write!(f, "close"),
    }
  }
}

impl PartialEq<Direction> for Status {
  fn eq(&self, other: &Direction) -> bool {
    *self == other.target()
  }
}

/// A commanded open/close that has not been confirmed by the sensors yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
  pub direction: Direction,
  /// When the relay pulse was requested
  pub started: Instant,
  /// When the starting sensor released, i.e. the motor began moving the port
  pub released: Option<Instant>,
  /// Cleared by an explicit stop
  pub moving: bool,
  /// Distinguishes this operation from later ones, so a stale timeout can't clear a newer operation
  pub generation: u64,
}

impl Operation {
  pub fn new(direction: Direction, started: Instant, generation: u64) -> Self {
    Operation {
      direction,
      started,
      released: None,
      moving: true,
      generation,
    }
  }
}
