use std::fmt;

use serde::{Deserialize, Serialize};

use super::state::Status;
use crate::{
  config::gpio::BcmPin,
  error::GarageResult,
  gpio::{GpioBackend, Level},
};

/// Which end stop a reed sensor sits at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorRole {
  Open,
  Closed,
}

impl SensorRole {
  pub fn opposite(self) -> SensorRole {
    match self {
      SensorRole::Open => SensorRole::Closed,
      SensorRole::Closed => SensorRole::Open,
    }
  }
}

impl fmt::Display for SensorRole {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SensorRole::Open => write!(f, "open"),
      SensorRole::Closed => write!(f, "closed"),
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorPins {
  pub open: BcmPin,
  pub closed: BcmPin,
}

impl SensorPins {
  pub fn pin(&self, role: SensorRole) -> BcmPin {
    match role {
      SensorRole::Open => self.open,
      SensorRole::Closed => self.closed,
    }
  }
}

/// Whether each end sensor is currently triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorLevels {
  pub open_active: bool,
  pub closed_active: bool,
}

impl SensorLevels {
  pub fn new(open_active: bool, closed_active: bool) -> Self {
    SensorLevels {
      open_active,
      closed_active,
    }
  }

  pub fn is_active(&self, role: SensorRole) -> bool {
    match role {
      SensorRole::Open => self.open_active,
      SensorRole::Closed => self.closed_active,
    }
  }

  pub fn with(mut self, role: SensorRole, active: bool) -> Self {
    match role {
      SensorRole::Open => self.open_active = active,
      SensorRole::Closed => self.closed_active = active,
    }
    self
  }

  pub fn classify(&self, operation_outstanding: bool) -> Status {
    classify(self.open_active, self.closed_active, operation_outstanding)
  }
}

/// Classify two end sensors in to a position.
///
/// Both inactive means `Moving` while a commanded operation is outstanding, otherwise the port was left (or moved
/// by hand) somewhere in between.
pub fn classify(open_active: bool, closed_active: bool, operation_outstanding: bool) -> Status {
  match (open_active, closed_active) {
    (true, false) => Status::Open,
    (false, true) => Status::Closed,
    (false, false) if operation_outstanding => Status::Moving,
    (false, false) => Status::Partial,
    (true, true) => Status::SensorError,
  }
}

/// Reads a port's pair of reed sensors
#[derive(Debug)]
pub struct SensorReader {
  pins: SensorPins,
  active: Level,
}

impl SensorReader {
  pub fn new(pins: SensorPins, active: Level) -> Self {
    SensorReader { pins, active }
  }

  pub fn is_active(&self, level: Level) -> bool {
    level == self.active
  }

  /// Read both sensors. A failed read is returned as is, never defaulted.
  pub fn read(&self, gpio: &dyn GpioBackend) -> GarageResult<SensorLevels> {
    let open = gpio.read(self.pins.open.number())?;
    let closed = gpio.read(self.pins.closed.number())?;
    Ok(SensorLevels::new(self.is_active(open), self.is_active(closed)))
  }
}

#[cfg(test)]
mod tests {
  use std::convert::TryFrom;

  use super::*;
  use crate::gpio::{simulated::SimulatedGpio, Pull};

  #[test]
  fn classification_table() {
    assert_eq!(classify(true, false, false), Status::Open);
    assert_eq!(classify(false, true, false), Status::Closed);
    assert_eq!(classify(false, false, false), Status::Partial);
    assert_eq!(classify(true, true, false), Status::SensorError);

    assert_eq!(classify(true, false, true), Status::Open);
    assert_eq!(classify(false, true, true), Status::Closed);
    assert_eq!(classify(false, false, true), Status::Moving);
    assert_eq!(classify(true, true, true), Status::SensorError);
  }

  #[test]
  fn classification_is_deterministic() {
    for open in [true, false] {
      for closed in [true, false] {
        for outstanding in [true, false] {
          assert_eq!(classify(open, closed, outstanding), classify(open, closed, outstanding));
        }
      }
    }
  }

  fn pins() -> SensorPins {
    SensorPins {
      open: BcmPin::try_from(23).unwrap(),
      closed: BcmPin::try_from(24).unwrap(),
    }
  }

  #[test]
  fn reads_active_low_sensors() {
    let gpio = SimulatedGpio::new();
    gpio.claim_input(23, Pull::Up).unwrap();
    gpio.claim_input(24, Pull::Up).unwrap();
    let reader = SensorReader::new(pins(), Level::Low);

    assert_eq!(reader.read(&gpio).unwrap(), SensorLevels::new(false, false));
    gpio.set_input(24, Level::Low).unwrap();
    assert_eq!(reader.read(&gpio).unwrap(), SensorLevels::new(false, true));
    assert_eq!(reader.read(&gpio).unwrap().classify(false), Status::Closed);
  }

  #[test]
  fn reads_active_high_sensors() {
    let gpio = SimulatedGpio::new();
    gpio.claim_input(23, Pull::Down).unwrap();
    gpio.claim_input(24, Pull::Down).unwrap();
    gpio.set_input(23, Level::High).unwrap();
    let reader = SensorReader::new(pins(), Level::High);

    assert_eq!(reader.read(&gpio).unwrap().classify(false), Status::Open);
  }

  #[test]
  fn read_faults_are_not_defaulted() {
    let gpio = SimulatedGpio::new();
    gpio.claim_input(23, Pull::Up).unwrap();
    gpio.claim_input(24, Pull::Up).unwrap();
    gpio.fail_reads(24, true);
    let reader = SensorReader::new(pins(), Level::Low);

    assert!(reader.read(&gpio).is_err());
  }

  #[test]
  fn replacing_one_level() {
    let levels = SensorLevels::new(false, true).with(SensorRole::Closed, false);
    assert_eq!(levels, SensorLevels::new(false, false));
    assert!(!levels.is_active(SensorRole::Open));
  }
}
