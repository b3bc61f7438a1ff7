use std::{fmt, sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::{
  sync::{broadcast, Mutex},
  time::{self, Instant},
};

use self::{
  identifier::PortId,
  outcome::{Action, CommandOutcome, OutcomeStatus},
  relay::Relay,
  sensor::{SensorLevels, SensorReader, SensorRole},
  state::{Direction, Operation, Status},
};
use crate::{
  error::{GarageError, GarageResult},
  gpio::{GpioBackend, Level},
  timing::TimingRecorder,
};

pub mod identifier;
pub mod outcome;
pub mod relay;
pub mod sensor;
pub mod state;

/// Published whenever the status reported for a port changes
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
  pub port: PortId,
  pub status: Status,
}

#[derive(Debug)]
struct PortState {
  /// Driven by the sensors alone
  status: Status,
  levels: Option<SensorLevels>,
  operation: Option<Operation>,
  generation: u64,
}

impl PortState {
  fn moving_operation(&self) -> Option<Operation> {
    self.operation.filter(|operation| operation.moving)
  }

  /// The status callers see: an operation in flight takes precedence over the sensors
  fn reported(&self) -> Status {
    if self.moving_operation().is_some() {
      Status::Moving
    }
    else {
      self.status
    }
  }
}

/// A completed travel, observed from the pulse through to the expected sensor triggering
#[derive(Debug)]
struct Travel {
  direction: Direction,
  elapsed: Duration,
  relay_delay: Option<Duration>,
}

/// One garage door: its relay, its two reed sensors and the state machine between them
#[derive(Debug)]
pub struct Port {
  identifier: PortId,
  relay: Relay,
  sensors: SensorReader,
  gpio: Arc<dyn GpioBackend>,
  timing: Arc<TimingRecorder>,
  changes: broadcast::Sender<StatusChange>,
  state: Mutex<PortState>,
}

impl fmt::Display for Port {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Port ({})", self.identifier)
  }
}

impl Port {
  pub fn new(
    identifier: PortId,
    relay: Relay,
    sensors: SensorReader,
    gpio: Arc<dyn GpioBackend>,
    timing: Arc<TimingRecorder>,
    changes: broadcast::Sender<StatusChange>,
  ) -> Port {
    Port {
      identifier,
      relay,
      sensors,
      gpio,
      timing,
      changes,
      state: Mutex::new(PortState {
        status: Status::Unknown,
        levels: None,
        operation: None,
        generation: 0,
      }),
    }
  }

  pub fn identifier(&self) -> &PortId {
    &self.identifier
  }

  pub fn relay(&self) -> &Relay {
    &self.relay
  }

  /// The last known status, without touching the pins
  pub async fn status(&self) -> Status {
    self.state.lock().await.reported()
  }

  /// The outstanding operation, if any
  pub async fn operation(&self) -> Option<Operation> {
    self.state.lock().await.operation
  }

  fn read_levels(&self) -> GarageResult<SensorLevels> {
    self.sensors.read(self.gpio.as_ref()).map_err(|err| GarageError::SensorRead {
      port: self.identifier.clone(),
      source: Box::new(err),
    })
  }

  /// Read the sensors now and return the resulting status. Read faults are returned to the caller.
  pub async fn refresh(&self) -> GarageResult<Status> {
    let mut state = self.state.lock().await;
    let levels = self.read_levels()?;
    let before = state.reported();
    // a read alone never times a travel, only an observed edge does
    self.apply_levels(&mut state, levels, None, Instant::now());
    self.publish_change(before, &state);
    Ok(state.reported())
  }

  pub async fn open(self: &Arc<Self>) -> CommandOutcome {
    self.command(Direction::Open).await
  }

  pub async fn close(self: &Arc<Self>) -> CommandOutcome {
    self.command(Direction::Close).await
  }

  async fn command(self: &Arc<Self>, direction: Direction) -> CommandOutcome {
    let mut note = None;
    let (generation, started) = {
      let mut state = self.state.lock().await;
      let reported = state.reported();

      if reported == direction {
        debug!("{} is already {}, ignoring {}", self, reported, direction);
        return CommandOutcome::already(self.identifier.clone(), direction);
      }
      if reported == Status::Moving {
        info!("{} is already moving, rejecting {}", self, direction);
        return CommandOutcome::new(self.identifier.clone(), direction.into(), OutcomeStatus::Busy)
          .with_note(Some("another operation is in progress".to_string()));
      }
      if reported == Status::SensorError {
        // commands stay available with a faulty sensor
        warn!("{} has a sensor error, sending {} anyway", self, direction);
        note = Some("sensor error, position could not be confirmed".to_string());
      }

      state.generation += 1;
      let started = Instant::now();
      let before = state.reported();
      state.operation = Some(Operation::new(direction, started, state.generation));
      self.publish_change(before, &state);
      (state.generation, started)
    };

    info!("{} triggering relay to {}", self, direction);
    if let Err(err) = self.relay.trigger(self.gpio.as_ref()).await {
      let err = GarageError::Relay {
        port: self.identifier.clone(),
        source: Box::new(err),
      };
      error!("{} aborted {}: {}", self, direction, err);
      self.abort(generation).await;
      return CommandOutcome::failed(self.identifier.clone(), direction.into(), err.to_string());
    }

    let timeout = self.timing.timeout(&self.identifier, direction);
    self.spawn_watchdog(generation, started + timeout);

    CommandOutcome::initiated(self.identifier.clone(), direction).with_note(note)
  }

  /// Clear the operation started with `generation` after its pulse failed
  async fn abort(&self, generation: u64) {
    let mut state = self.state.lock().await;
    if state.operation.map(|operation| operation.generation) == Some(generation) {
      let before = state.reported();
      state.operation = None;
      self.publish_change(before, &state);
    }
  }

  fn spawn_watchdog(self: &Arc<Self>, generation: u64, deadline: Instant) {
    let port = Arc::clone(self);
    tokio::spawn(async move {
      time::sleep_until(deadline).await;
      port.expire(generation).await;
    });
  }

  /// Give up on an operation that never reached its expected sensor
  pub async fn expire(&self, generation: u64) {
    let mut state = self.state.lock().await;
    match state.moving_operation() {
      Some(operation) if operation.generation == generation => {
        error!(
          "{} did not confirm {} within {:?}, position unconfirmed",
          self,
          operation.direction,
          operation.started.elapsed()
        );
        let before = state.reported();
        state.operation = None;
        state.status = Status::Partial;
        self.publish_change(before, &state);
      }
      _ => {}
    }
  }

  /// Stop a moving port. The opener only has the one button, so this is another pulse.
  pub async fn stop(&self) -> CommandOutcome {
    let generation = match self.state.lock().await.moving_operation() {
      Some(operation) => operation.generation,
      None => {
        debug!("{} is not moving, ignoring stop", self);
        return CommandOutcome::new(self.identifier.clone(), Action::Stop, OutcomeStatus::NotMoving);
      }
    };

    let relay = self.relay.acquire().await;
    // the operation may have finished while an earlier pulse held the relay
    if !self.is_moving(generation).await {
      info!("{} finished moving before the stop pulse, not sending it", self);
      return CommandOutcome::new(self.identifier.clone(), Action::Stop, OutcomeStatus::NotMoving)
        .with_note(Some("the port finished moving before the stop pulse".to_string()));
    }

    info!("{} triggering relay to stop", self);
    if let Err(err) = relay.pulse(self.gpio.as_ref()).await {
      let err = GarageError::Relay {
        port: self.identifier.clone(),
        source: Box::new(err),
      };
      error!("{} failed to stop: {}", self, err);
      return CommandOutcome::failed(self.identifier.clone(), Action::Stop, err.to_string());
    }
    drop(relay);

    let mut state = self.state.lock().await;
    let before = state.reported();
    let stopped = match state.operation.as_mut() {
      Some(operation) if operation.moving && operation.generation == generation => {
        operation.moving = false;
        true
      }
      _ => false,
    };
    if stopped {
      state.status = Status::Stopped;
      self.publish_change(before, &state);
      CommandOutcome::new(self.identifier.clone(), Action::Stop, OutcomeStatus::Stopped)
    }
    else {
      warn!("{} finished moving during the stop pulse", self);
      CommandOutcome::new(self.identifier.clone(), Action::Stop, OutcomeStatus::NotMoving)
        .with_note(Some("the port finished moving during the stop pulse".to_string()))
    }
  }

  async fn is_moving(&self, generation: u64) -> bool {
    self
      .state
      .lock()
      .await
      .moving_operation()
      .map_or(false, |operation| operation.generation == generation)
  }

  /// React to a level change on one of the port's sensors
  pub async fn handle_edge(&self, role: SensorRole, level: Level) -> GarageResult<()> {
    self.handle_edge_at(role, level, Instant::now()).await
  }

  /// React to a sensor level that settled at `at`, which may be a little while ago when edges are debounced
  pub async fn handle_edge_at(&self, role: SensorRole, level: Level, at: Instant) -> GarageResult<()> {
    let active = self.sensors.is_active(level);
    let travel = {
      let mut state = self.state.lock().await;
      let levels = match state.levels {
        Some(levels) if levels.is_active(role) == active => {
          debug!("{} {} sensor unchanged, ignoring edge", self, role);
          return Ok(());
        }
        Some(levels) => levels,
        None => self.read_levels()?,
      }
      .with(role, active);
      debug!("{} {} sensor {}, levels {:?}", self, role, if active { "active" } else { "inactive" }, levels);

      let before = state.reported();
      let travel = self.apply_levels(&mut state, levels, Some((role, active)), at);
      self.publish_change(before, &state);
      travel
    };

    if let Some(travel) = travel {
      self
        .timing
        .record_travel(&self.identifier, travel.direction, travel.elapsed, travel.relay_delay)
        .await?;
    }
    Ok(())
  }

  /// Move the state machine on from new sensor levels seen at `now`, `edge` being the transition that caused them
  /// (if any).
  ///
  /// Returns the travel to record when an operation completed on the expected sensor triggering.
  fn apply_levels(
    &self,
    state: &mut PortState,
    levels: SensorLevels,
    edge: Option<(SensorRole, bool)>,
    now: Instant,
  ) -> Option<Travel> {
    state.levels = Some(levels);

    let mut operation = match state.moving_operation() {
      Some(operation) => operation,
      None => {
        self.apply_untracked(state, levels);
        return None;
      }
    };

    let direction = operation.direction;
    let expected = direction.expected_sensor();
    let starting = direction.starting_sensor();

    if edge == Some((starting, true)) {
      warn!(
        "{} {} sensor triggered while trying to {}, assuming a manual interruption",
        self, starting, direction
      );
      state.operation = None;
      state.status = Status::Partial;
      return None;
    }

    if levels.is_active(expected) && !levels.is_active(starting) {
      state.operation = None;
      state.status = direction.target();

      if edge == Some((expected, true)) {
        let elapsed = now.saturating_duration_since(operation.started);
        info!("{} finished {} after {:?}", self, direction, elapsed);
        return Some(Travel {
          direction,
          elapsed,
          relay_delay: operation
            .released
            .map(|released| released.saturating_duration_since(operation.started)),
        });
      }
      info!("{} confirmed {} without the {} sensor changing, not timing it", self, direction.target(), expected);
      return None;
    }

    if edge == Some((starting, false)) && operation.released.is_none() {
      operation.released = Some(now);
      state.operation = Some(operation);
      debug!(
        "{} left the {} sensor after {:?}",
        self,
        starting,
        now.saturating_duration_since(operation.started)
      );
    }
    state.status = levels.classify(true);
    None
  }

  /// Sensor changes with no commanded operation in flight
  fn apply_untracked(&self, state: &mut PortState, levels: SensorLevels) {
    let status = levels.classify(false);
    match status {
      // stays stopped until commanded again or an end stop is reached
      Status::Partial if state.status == Status::Stopped => {}
      Status::Partial => {
        if matches!(state.status, Status::Open | Status::Closed) {
          info!("{} moved from {} without a command", self, state.status);
        }
        state.status = Status::Partial;
      }
      Status::Open | Status::Closed => {
        // a stopped operation is finished with once the port reaches an end stop
        state.operation = None;
        state.status = status;
      }
      _ => state.status = status,
    }
  }

  fn publish_change(&self, before: Status, state: &PortState) {
    let after = state.reported();
    if before != after {
      info!("{} status changed: {} -> {}", self, before, after);
      // nobody listening is fine
      let _ = self.changes.send(StatusChange {
        port: self.identifier.clone(),
        status: after,
      });
    }
  }
}
