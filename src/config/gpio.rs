use std::{convert::TryFrom, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};

use crate::gpio::{Level, Pull};

/// Highest BCM line exposed on the 40 pin header
/// See: https://pinout.xyz/
const MAX_BCM_PIN: u8 = 27;

/// A GPIO pin by its BCM number
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "u8", into = "u8")]
pub struct BcmPin(u8);

impl BcmPin {
  pub fn number(self) -> u8 {
    self.0
  }
}

impl TryFrom<u8> for BcmPin {
  type Error = String;

  fn try_from(number: u8) -> Result<Self, Self::Error> {
    if number <= MAX_BCM_PIN {
      Ok(BcmPin(number))
    }
    else {
      Err(format!("GPIO {} is not a BCM pin on the header (0-{})", number, MAX_BCM_PIN))
    }
  }
}

impl From<BcmPin> for u8 {
  fn from(pin: BcmPin) -> Self {
    pin.0
  }
}

impl fmt::Display for BcmPin {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "GPIO {}", self.0)
  }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
  /// The level that energises a relay (most relay boards are active low)
  pub relay_active: Level,

  /// The level a reed sensor reports when triggered
  pub sensor_active: Level,

  /// The internal resistor used for the sensor inputs
  pub pull: Pull,

  #[serde_as(as = "DurationSecondsWithFrac<f64>")]
  /// How long the relay is held, emulating a press of the remote's button
  pub pulse_duration: Duration,

  #[serde_as(as = "DurationSecondsWithFrac<f64>")]
  /// How long a sensor input must hold a level before it counts, absorbing reed switch chatter
  pub debounce: Duration,
}

impl Default for GpioConfig {
  fn default() -> Self {
    GpioConfig {
      relay_active: Level::Low,
      sensor_active: Level::Low,
      pull: Pull::Up,
      pulse_duration: Duration::from_millis(500),
      debounce: Duration::from_millis(200),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_pins_only() {
    assert_eq!(BcmPin::try_from(27).unwrap().number(), 27);
    assert!(BcmPin::try_from(28).is_err());
  }

  #[test]
  fn deserialises_levels_and_durations() {
    let config: GpioConfig = toml::from_str(
      r#"
        relay_active = "high"
        pull = "down"
        pulse_duration = 0.25
      "#,
    )
    .unwrap();
    assert_eq!(config.relay_active, Level::High);
    assert_eq!(config.sensor_active, Level::Low);
    assert_eq!(config.pull, Pull::Down);
    assert_eq!(config.pulse_duration, Duration::from_millis(250));
    assert_eq!(config.debounce, Duration::from_millis(200));
  }
}
