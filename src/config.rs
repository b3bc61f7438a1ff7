use std::{
  collections::{BTreeMap, HashMap},
  fs,
  net::SocketAddr,
  path::{Path, PathBuf},
};

use log::LevelFilter;
use serde::Deserialize;

use self::gpio::{BcmPin, GpioConfig};
use crate::{
  error::{GarageError, GarageResult},
  mqtt_client::MqttClientConfig,
  port::{identifier::PortId, sensor::SensorPins},
  timing::{TimeoutPolicy, TimingConfig},
};

pub mod gpio;

pub const DEFAULT_CONFIG_PATH: &str = "garage-config.toml";

#[derive(Debug, Deserialize)]
pub struct Config {
  #[serde(default = "default_log_level")]
  pub log_level: LevelFilter,

  /// Where timing history and calibration are persisted
  #[serde(default = "default_state_path")]
  pub state_path: PathBuf,

  #[serde(default)]
  pub http: HttpConfig,

  #[serde(default)]
  pub gpio: GpioConfig,

  #[serde(default)]
  pub timing: TimingConfig,

  /// Status changes are published to MQTT when set
  pub mqtt: Option<MqttClientConfig>,

  /// All ports (doors) to control
  pub ports: BTreeMap<PortId, PortConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
  /// The relay wired in parallel with the opener's push button
  pub relay: BcmPin,
  pub sensors: SensorPins,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
  pub bind: SocketAddr,
}

impl Default for HttpConfig {
  fn default() -> Self {
    HttpConfig {
      bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
    }
  }
}

fn default_log_level() -> LevelFilter {
  LevelFilter::Info
}

fn default_state_path() -> PathBuf {
  PathBuf::from("garage-state.json")
}

impl Config {
  pub fn load(path: impl AsRef<Path>) -> GarageResult<Config> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
      .map_err(|err| GarageError::Config(format!("unable to read {}: {}", path.display(), err)))?;
    Config::parse(&contents)
  }

  pub fn parse(contents: &str) -> GarageResult<Config> {
    let config: Config = toml::from_str(contents).map_err(|err| GarageError::Config(err.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  /// Reject anything that would leave a pin assignment undefined or ambiguous
  pub fn validate(&self) -> GarageResult<()> {
    if self.ports.is_empty() {
      return Err(GarageError::Config("no ports configured".to_string()));
    }

    let mut claimed: HashMap<BcmPin, String> = HashMap::new();
    for (identifier, port) in &self.ports {
      let uses = [
        (port.relay, "relay"),
        (port.sensors.open, "open sensor"),
        (port.sensors.closed, "closed sensor"),
      ];
      for (pin, role) in uses {
        let usage = format!("{} of {}", role, identifier);
        if let Some(previous) = claimed.insert(pin, usage.clone()) {
          return Err(GarageError::Config(format!(
            "{} is assigned to both the {} and the {}",
            pin, previous, usage
          )));
        }
      }
    }

    let pulse = self.gpio.pulse_duration;
    if pulse.is_zero() || pulse.as_secs_f64() > 5.0 {
      return Err(GarageError::Config(format!(
        "pulse_duration must be between 0 and 5 seconds, got {:?}",
        pulse
      )));
    }

    if self.gpio.debounce.as_secs_f64() > 1.0 {
      return Err(GarageError::Config(format!(
        "debounce must be at most 1 second, got {:?}",
        self.gpio.debounce
      )));
    }

    if self.timing.history_length == 0 {
      return Err(GarageError::Config("timing history_length must be at least 1".to_string()));
    }

    match self.timing.policy {
      TimeoutPolicy::Adaptive { margin, ceiling } => {
        if ceiling.is_zero() || margin >= ceiling {
          return Err(GarageError::Config(format!(
            "adaptive timeout needs 0 <= margin < ceiling, got margin {:?} and ceiling {:?}",
            margin, ceiling
          )));
        }
      }
      TimeoutPolicy::Fixed { timeout } => {
        if timeout.is_zero() {
          return Err(GarageError::Config("fixed timeout must be positive".to_string()));
        }
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  const EXAMPLE: &str = r#"
    state_path = "/var/lib/portgarage/state.json"

    [http]
    bind = "127.0.0.1:8080"

    [timing]
    default_open_time = 14.5
    history_length = 3
    policy = { kind = "fixed", timeout = 45.0 }

    [ports.port1]
    relay = 14
    sensors = { open = 23, closed = 24 }

    [ports.port2]
    relay = 25
    sensors = { open = 20, closed = 21 }
  "#;

  #[test]
  fn parses_example() {
    let config = Config::parse(EXAMPLE).unwrap();
    assert_eq!(config.log_level, LevelFilter::Info);
    assert_eq!(config.http.bind, "127.0.0.1:8080".parse().unwrap());
    assert_eq!(config.ports.len(), 2);

    let port1 = &config.ports[&PortId::from("port1")];
    assert_eq!(port1.relay.number(), 14);
    assert_eq!(port1.sensors.open.number(), 23);
    assert_eq!(port1.sensors.closed.number(), 24);

    assert_eq!(config.timing.default_open_time, Duration::from_millis(14_500));
    assert_eq!(config.timing.history_length, 3);
    assert_eq!(
      config.timing.policy,
      TimeoutPolicy::Fixed {
        timeout: Duration::from_secs(45)
      }
    );
    assert!(config.mqtt.is_none());
  }

  #[test]
  fn rejects_missing_ports() {
    let err = Config::parse("log_level = \"debug\"").unwrap_err();
    assert!(matches!(err, GarageError::Config(_)));
  }

  #[test]
  fn rejects_incomplete_pin_mapping() {
    let err = Config::parse(
      r#"
        [ports.port1]
        relay = 14
        sensors = { open = 23 }
      "#,
    )
    .unwrap_err();
    assert!(matches!(err, GarageError::Config(_)));
  }

  #[test]
  fn rejects_pins_off_the_header() {
    let err = Config::parse(
      r#"
        [ports.port1]
        relay = 40
        sensors = { open = 23, closed = 24 }
      "#,
    )
    .unwrap_err();
    assert!(matches!(err, GarageError::Config(_)));
  }

  #[test]
  fn rejects_shared_pins() {
    let err = Config::parse(
      r#"
        [ports.port1]
        relay = 14
        sensors = { open = 23, closed = 24 }

        [ports.port2]
        relay = 25
        sensors = { open = 24, closed = 21 }
      "#,
    )
    .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("GPIO 24"), "{}", message);
  }

  #[test]
  fn rejects_margin_above_ceiling() {
    let err = Config::parse(
      r#"
        [timing]
        policy = { kind = "adaptive", margin = 70.0, ceiling = 60.0 }

        [ports.port1]
        relay = 14
        sensors = { open = 23, closed = 24 }
      "#,
    )
    .unwrap_err();
    assert!(matches!(err, GarageError::Config(_)));
  }

  #[test]
  fn rejects_long_debounce() {
    let err = Config::parse(
      r#"
        [gpio]
        debounce = 2.5

        [ports.port1]
        relay = 14
        sensors = { open = 23, closed = 24 }
      "#,
    )
    .unwrap_err();
    assert!(matches!(err, GarageError::Config(_)));
  }
}
