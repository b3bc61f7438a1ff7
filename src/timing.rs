use std::{
  collections::VecDeque,
  sync::{Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use tokio::{sync::Mutex as AsyncMutex, task};

use crate::{
  error::GarageResult,
  port::{identifier::PortId, state::Direction},
  store::{PersistedState, StateStore},
};

/// How long an operation may stay moving before it's considered failed
#[serde_as]
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TimeoutPolicy {
  /// The port's average travel time (or the default before any history) plus `margin`, capped at `ceiling`
  Adaptive {
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    margin: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    ceiling: Duration,
  },
  Fixed {
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    timeout: Duration,
  },
}

impl TimeoutPolicy {
  pub fn timeout(&self, expected: Duration) -> Duration {
    match *self {
      TimeoutPolicy::Adaptive { margin, ceiling } => (expected + margin).min(ceiling),
      TimeoutPolicy::Fixed { timeout } => timeout,
    }
  }
}

impl Default for TimeoutPolicy {
  fn default() -> Self {
    TimeoutPolicy::Adaptive {
      margin: Duration::from_secs(4),
      ceiling: Duration::from_secs(60),
    }
  }
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TimingConfig {
  #[serde_as(as = "DurationSecondsWithFrac<f64>")]
  /// Expected opening time before any travel has been measured
  pub default_open_time: Duration,

  #[serde_as(as = "DurationSecondsWithFrac<f64>")]
  /// Expected closing time before any travel has been measured
  pub default_close_time: Duration,

  /// How many samples are kept per direction
  pub history_length: usize,

  pub policy: TimeoutPolicy,
}

impl Default for TimingConfig {
  fn default() -> Self {
    TimingConfig {
      default_open_time: Duration::from_secs(15),
      default_close_time: Duration::from_secs(15),
      history_length: 5,
      policy: TimeoutPolicy::default(),
    }
  }
}

impl TimingConfig {
  pub fn default_time(&self, direction: Direction) -> Duration {
    match direction {
      Direction::Open => self.default_open_time,
      Direction::Close => self.default_close_time,
    }
  }
}

fn round2(value: f64) -> f64 {
  (value * 100.0).round() / 100.0
}

/// Rolling travel times, in seconds, for one direction
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct DirectionTiming {
  pub last: Option<f64>,
  pub avg: Option<f64>,
  pub history: VecDeque<f64>,
}

impl DirectionTiming {
  /// Append a sample, dropping the oldest beyond `max_length`
  pub fn push(&mut self, seconds: f64, max_length: usize) -> f64 {
    let sample = round2(seconds);
    self.history.push_back(sample);
    self.trim(max_length);
    self.last = Some(sample);
    sample
  }

  /// Drop samples that can't be a travel time, returning how many were dropped
  fn discard_invalid(&mut self) -> usize {
    let before = self.history.len();
    self.history.retain(|sample| sample.is_finite() && *sample >= 0.0);
    if !self.last.map_or(true, |last| last.is_finite() && last >= 0.0) {
      self.last = self.history.back().copied();
    }
    before - self.history.len()
  }

  fn trim(&mut self, max_length: usize) {
    while self.history.len() > max_length {
      self.history.pop_front();
    }
    self.avg = if self.history.is_empty() {
      None
    }
    else {
      Some(round2(self.history.iter().sum::<f64>() / self.history.len() as f64))
    };
  }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct PortTiming {
  pub open: DirectionTiming,
  pub close: DirectionTiming,
}

impl PortTiming {
  pub fn direction(&self, direction: Direction) -> &DirectionTiming {
    match direction {
      Direction::Open => &self.open,
      Direction::Close => &self.close,
    }
  }

  pub fn direction_mut(&mut self, direction: Direction) -> &mut DirectionTiming {
    match direction {
      Direction::Open => &mut self.open,
      Direction::Close => &mut self.close,
    }
  }
}

/// Breakdown of one measured travel
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Calibration {
  /// Seconds from the relay pulse until the starting sensor released
  pub relay_delay: Option<f64>,
  /// Seconds from the starting sensor releasing until the expected sensor triggered
  pub sensor_to_sensor: Option<f64>,
  pub total: f64,
  pub measured_at: DateTime<Local>,
}

impl Calibration {
  pub fn new(total: Duration, relay_delay: Option<Duration>) -> Self {
    Calibration {
      relay_delay: relay_delay.map(|delay| round2(delay.as_secs_f64())),
      sensor_to_sensor: relay_delay.map(|delay| round2(total.saturating_sub(delay).as_secs_f64())),
      total: round2(total.as_secs_f64()),
      measured_at: Local::now(),
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct PortCalibration {
  pub open: Option<Calibration>,
  pub close: Option<Calibration>,
}

/// Records travel times per port and direction, persisting them on every change.
///
/// Saves run on the blocking pool, one at a time, always writing the latest state.
#[derive(Debug)]
pub struct TimingRecorder {
  config: TimingConfig,
  store: StateStore,
  state: Mutex<PersistedState>,
  saving: AsyncMutex<()>,
}

impl TimingRecorder {
  pub fn new(config: TimingConfig, store: StateStore, mut state: PersistedState) -> Self {
    for (port, timing) in state.timing.iter_mut() {
      for direction in [Direction::Open, Direction::Close] {
        let timing = timing.direction_mut(direction);
        let discarded = timing.discard_invalid();
        if discarded > 0 {
          warn!("Discarded {} invalid {} samples restored for {}", discarded, direction, port);
        }
        // the configured length may have shrunk since the history was saved
        timing.trim(config.history_length);
      }
    }

    TimingRecorder {
      config,
      store,
      state: Mutex::new(state),
      saving: AsyncMutex::new(()),
    }
  }

  fn state(&self) -> MutexGuard<'_, PersistedState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  async fn save(&self) -> GarageResult<()> {
    let _saving = self.saving.lock().await;
    // taken under the save lock, so a slower earlier save can never overwrite a newer state
    let snapshot = self.state().clone();
    let store = self.store.clone();
    task::spawn_blocking(move || store.save(&snapshot)).await?
  }

  fn push_sample(&self, state: &mut PersistedState, port: &PortId, direction: Direction, duration: Duration) -> f64 {
    state
      .timing
      .entry(port.clone())
      .or_default()
      .direction_mut(direction)
      .push(duration.as_secs_f64(), self.config.history_length)
  }

  /// Record a completed travel and return the stored (rounded) sample
  pub async fn record(&self, port: &PortId, direction: Direction, duration: Duration) -> GarageResult<f64> {
    let sample = self.push_sample(&mut self.state(), port, direction, duration);
    info!("{} {} took {}s", port, direction, sample);
    self.save().await?;
    Ok(sample)
  }

  /// Record a completed travel along with its calibration breakdown
  pub async fn record_travel(
    &self,
    port: &PortId,
    direction: Direction,
    duration: Duration,
    relay_delay: Option<Duration>,
  ) -> GarageResult<f64> {
    let calibration = Calibration::new(duration, relay_delay);
    debug!("{} {} calibration: {:?}", port, direction, calibration);
    let sample = {
      let mut state = self.state();
      let calibrations = state.calibration.entry(port.clone()).or_default();
      match direction {
        Direction::Open => calibrations.open = Some(calibration),
        Direction::Close => calibrations.close = Some(calibration),
      }
      self.push_sample(&mut state, port, direction, duration)
    };
    info!("{} {} took {}s", port, direction, sample);
    self.save().await?;
    Ok(sample)
  }

  pub fn average(&self, port: &PortId, direction: Direction) -> Option<f64> {
    self
      .state()
      .timing
      .get(port)
      .and_then(|timing| timing.direction(direction).avg)
  }

  /// The travel time to expect, from history when there is any
  pub fn expected(&self, port: &PortId, direction: Direction) -> Duration {
    self
      .average(port, direction)
      .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
      .unwrap_or_else(|| self.config.default_time(direction))
  }

  /// How long an operation may stay moving before it's considered failed
  pub fn timeout(&self, port: &PortId, direction: Direction) -> Duration {
    self.config.policy.timeout(self.expected(port, direction))
  }

  pub fn timing(&self, port: &PortId) -> Option<PortTiming> {
    self.state().timing.get(port).cloned()
  }

  pub fn calibration(&self, port: &PortId) -> Option<PortCalibration> {
    self.state().calibration.get(port).cloned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn recorder(history_length: usize) -> (tempfile::TempDir, TimingRecorder) {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    let config = TimingConfig {
      history_length,
      ..TimingConfig::default()
    };
    (dir, TimingRecorder::new(config, store, PersistedState::default()))
  }

  #[tokio::test]
  async fn history_keeps_most_recent_samples() {
    let (_dir, recorder) = recorder(3);
    let port = PortId::from("port1");
    for seconds in [10.0, 11.0, 12.0, 13.0] {
      recorder.record(&port, Direction::Open, Duration::from_secs_f64(seconds)).await.unwrap();
    }

    let timing = recorder.timing(&port).unwrap();
    assert_eq!(timing.open.history, VecDeque::from(vec![11.0, 12.0, 13.0]));
    assert_eq!(timing.open.last, Some(13.0));
    assert_eq!(timing.open.avg, Some(12.0));
    assert_eq!(timing.close, DirectionTiming::default());
  }

  #[tokio::test]
  async fn samples_are_rounded() {
    let (_dir, recorder) = recorder(5);
    let port = PortId::from("port1");
    let sample = recorder
      .record(&port, Direction::Close, Duration::from_millis(12_346))
      .await
      .unwrap();
    assert_eq!(sample, 12.35);
  }

  #[tokio::test]
  async fn records_are_persisted() {
    let (dir, recorder) = recorder(5);
    let port = PortId::from("port2");
    recorder.record(&port, Direction::Close, Duration::from_secs(9)).await.unwrap();

    let reloaded = StateStore::new(dir.path().join("state.json")).load();
    assert_eq!(reloaded.timing[&port].close.last, Some(9.0));
  }

  #[test]
  fn restored_history_is_trimmed() {
    let dir = tempfile::tempdir().unwrap();
    let port = PortId::from("port1");
    let mut state = PersistedState::default();
    let timing = state.timing.entry(port.clone()).or_default();
    for seconds in [1.0, 2.0, 3.0, 4.0] {
      timing.open.push(seconds, 10);
    }

    let config = TimingConfig {
      history_length: 2,
      ..TimingConfig::default()
    };
    let recorder = TimingRecorder::new(config, StateStore::new(dir.path().join("state.json")), state);
    assert_eq!(recorder.timing(&port).unwrap().open.history, VecDeque::from(vec![3.0, 4.0]));
    assert_eq!(recorder.average(&port, Direction::Open), Some(3.5));
  }

  #[tokio::test]
  async fn timeout_uses_defaults_until_measured() {
    let (_dir, recorder) = recorder(5);
    let port = PortId::from("port1");
    assert_eq!(recorder.timeout(&port, Direction::Open), Duration::from_secs(19));

    recorder.record(&port, Direction::Open, Duration::from_secs(10)).await.unwrap();
    assert_eq!(recorder.timeout(&port, Direction::Open), Duration::from_secs(14));
    assert_eq!(recorder.timeout(&port, Direction::Close), Duration::from_secs(19));
  }

  #[test]
  fn adaptive_timeout_is_capped() {
    let policy = TimeoutPolicy::Adaptive {
      margin: Duration::from_secs(5),
      ceiling: Duration::from_secs(30),
    };
    assert_eq!(policy.timeout(Duration::from_secs(40)), Duration::from_secs(30));
    assert_eq!(policy.timeout(Duration::from_secs(10)), Duration::from_secs(15));

    let fixed = TimeoutPolicy::Fixed {
      timeout: Duration::from_secs(45),
    };
    assert_eq!(fixed.timeout(Duration::from_secs(10)), Duration::from_secs(45));
  }

  #[tokio::test]
  async fn travel_records_calibration() {
    let (_dir, recorder) = recorder(5);
    let port = PortId::from("port1");
    recorder
      .record_travel(
        &port,
        Direction::Open,
        Duration::from_millis(12_500),
        Some(Duration::from_millis(750)),
      )
      .await
      .unwrap();

    let calibration = recorder.calibration(&port).unwrap().open.unwrap();
    assert_eq!(calibration.relay_delay, Some(0.75));
    assert_eq!(calibration.sensor_to_sensor, Some(11.75));
    assert_eq!(calibration.total, 12.5);
    assert_eq!(recorder.timing(&port).unwrap().open.history, VecDeque::from(vec![12.5]));
  }

  #[test]
  fn invalid_restored_samples_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(
      &path,
      r#"{"timing": {"port1": {"open": {"last": -30.0, "avg": -30.0, "history": [-30.0]},
                               "close": {"last": 1e300, "avg": 1e300, "history": [12.0, 1e300]}}}}"#,
    )
    .unwrap();
    let store = StateStore::new(&path);
    let state = store.load();
    let recorder = TimingRecorder::new(TimingConfig::default(), store, state);
    let port = PortId::from("port1");

    let timing = recorder.timing(&port).unwrap();
    assert!(timing.open.history.is_empty());
    assert_eq!(timing.open.avg, None);
    assert_eq!(timing.open.last, None);
    assert_eq!(recorder.expected(&port, Direction::Open), Duration::from_secs(15));

    // huge but finite values parse, yet can't be a duration
    assert_eq!(timing.close.history.len(), 2);
    assert_eq!(recorder.expected(&port, Direction::Close), Duration::from_secs(15));
    assert_eq!(recorder.timeout(&port, Direction::Close), Duration::from_secs(19));
  }
}
