//! The JSON state file shared with other tools on the Pi.
//!
//! Every save replaces the whole file: the document is written to a sibling `.tmp` file, synced, then renamed over
//! the original, so readers never see a partially written document.

use std::{
  collections::BTreeMap,
  ffi::OsString,
  fs::{self, File},
  io::{self, Write},
  path::PathBuf,
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
  config::{gpio::BcmPin, Config},
  error::{GarageError, GarageResult},
  port::{identifier::PortId, sensor::SensorPins},
  timing::{PortCalibration, PortTiming},
};

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct PersistedState {
  pub relay_pins: BTreeMap<PortId, BcmPin>,
  pub sensor_pins: BTreeMap<PortId, SensorPins>,
  pub timing: BTreeMap<PortId, PortTiming>,
  pub calibration: BTreeMap<PortId, PortCalibration>,
}

impl PersistedState {
  /// Replace the recorded pin maps with the ones in `config`
  pub fn with_pins(mut self, config: &Config) -> Self {
    self.relay_pins = config
      .ports
      .iter()
      .map(|(identifier, port)| (identifier.clone(), port.relay))
      .collect();
    self.sensor_pins = config
      .ports
      .iter()
      .map(|(identifier, port)| (identifier.clone(), port.sensors))
      .collect();
    self
  }
}

#[derive(Debug, Clone)]
pub struct StateStore {
  path: PathBuf,
}

impl StateStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    StateStore { path: path.into() }
  }

  /// Load the persisted state, falling back to an empty state if the file is absent or malformed
  pub fn load(&self) -> PersistedState {
    let contents = match fs::read_to_string(&self.path) {
      Ok(contents) => contents,
      Err(err) if err.kind() == io::ErrorKind::NotFound => {
        debug!("No state file at {}, starting empty", self.path.display());
        return PersistedState::default();
      }
      Err(err) => {
        warn!("Unable to read state file {}, starting empty: {}", self.path.display(), err);
        return PersistedState::default();
      }
    };

    serde_json::from_str(&contents).unwrap_or_else(|err| {
      warn!("State file {} is malformed, starting empty: {}", self.path.display(), err);
      PersistedState::default()
    })
  }

  pub fn save(&self, state: &PersistedState) -> GarageResult<()> {
    let json = serde_json::to_vec_pretty(state)?;
    let temporary = self.temporary_path();

    let mut file = File::create(&temporary).map_err(GarageError::Store)?;
    file.write_all(&json).map_err(GarageError::Store)?;
    file.sync_all().map_err(GarageError::Store)?;
    drop(file);

    fs::rename(&temporary, &self.path).map_err(GarageError::Store)?;
    debug!("Saved state to {}", self.path.display());
    Ok(())
  }

  fn temporary_path(&self) -> PathBuf {
    let mut path = OsString::from(self.path.as_os_str());
    path.push(".tmp");
    PathBuf::from(path)
  }
}

#[cfg(test)]
mod tests {
  use std::convert::TryFrom;

  use super::*;

  #[test]
  fn absent_file_is_empty_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    assert_eq!(store.load(), PersistedState::default());
  }

  #[test]
  fn malformed_file_is_empty_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    fs::write(&path, "{\"timing\": {\"port1\": ").unwrap();
    assert_eq!(StateStore::new(&path).load(), PersistedState::default());
  }

  #[test]
  fn save_replaces_whole_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    fs::write(&path, "garbage that is much longer than the document that replaces it ".repeat(100)).unwrap();
    let store = StateStore::new(&path);

    let mut state = PersistedState::default();
    state.relay_pins.insert("port1".into(), BcmPin::try_from(14).unwrap());
    store.save(&state).unwrap();

    assert_eq!(store.load(), state);
    assert!(!dir.path().join("state.json.tmp").exists());

    let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["relay_pins"]["port1"], 14);
  }

  #[test]
  fn unknown_sections_are_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    fs::write(&path, r#"{"polling_interval_ms": 2000, "calibration": {}}"#).unwrap();
    assert_eq!(StateStore::new(&path).load(), PersistedState::default());
  }
}
