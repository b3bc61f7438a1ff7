use std::{
  collections::{BTreeMap, HashMap},
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use log::{debug, info, warn};
use tokio::{sync::broadcast, time::Instant};

use crate::{
  config::Config,
  error::{GarageError, GarageResult},
  gpio::{Edge, EdgeSender, GpioBackend},
  port::{
    identifier::PortId,
    outcome::CommandOutcome,
    relay::Relay,
    sensor::{SensorReader, SensorRole},
    state::Status,
    Port, StatusChange,
  },
  store::StateStore,
  timing::{PortCalibration, PortTiming, TimingRecorder},
};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Owns every port and the GPIO lines they were built on
#[derive(Debug)]
pub struct Controller {
  ports: BTreeMap<PortId, Arc<Port>>,
  /// Which port and sensor an input pin belongs to
  registrations: HashMap<u8, (PortId, SensorRole)>,
  gpio: Arc<dyn GpioBackend>,
  timing: Arc<TimingRecorder>,
  changes: broadcast::Sender<StatusChange>,
  shut_down: AtomicBool,
}

impl Controller {
  /// Claim every configured line, subscribe to sensor edges and read the initial positions.
  ///
  /// Any failure to claim a line is fatal; lines claimed so far are released again.
  pub async fn new(
    config: &Config,
    gpio: Arc<dyn GpioBackend>,
    store: StateStore,
    edges: EdgeSender,
  ) -> GarageResult<Controller> {
    let registrations = match Self::claim(config, gpio.as_ref(), edges) {
      Ok(registrations) => registrations,
      Err(err) => {
        gpio.release();
        return Err(err);
      }
    };

    let state = store.load().with_pins(config);
    let timing = Arc::new(TimingRecorder::new(config.timing.clone(), store, state));
    let (changes, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

    let ports: BTreeMap<PortId, Arc<Port>> = config
      .ports
      .iter()
      .map(|(identifier, port)| {
        let relay = Relay::new(
          port.relay.number(),
          config.gpio.relay_active,
          config.gpio.pulse_duration,
        );
        let port = Port::new(
          identifier.clone(),
          relay,
          SensorReader::new(port.sensors, config.gpio.sensor_active),
          Arc::clone(&gpio),
          Arc::clone(&timing),
          changes.clone(),
        );
        (identifier.clone(), Arc::new(port))
      })
      .collect();

    for port in ports.values() {
      match port.refresh().await {
        Ok(status) => info!("{} is {}", port, status),
        Err(err) => warn!("{} initial read failed, status unknown: {}", port, err),
      }
    }

    Ok(Controller {
      ports,
      registrations,
      gpio,
      timing,
      changes,
      shut_down: AtomicBool::new(false),
    })
  }

  fn claim(
    config: &Config,
    gpio: &dyn GpioBackend,
    edges: EdgeSender,
  ) -> GarageResult<HashMap<u8, (PortId, SensorRole)>> {
    let mut registrations = HashMap::new();
    for (identifier, port) in &config.ports {
      gpio.claim_output(port.relay.number(), config.gpio.relay_active.inverse())?;
      debug!("Claimed {} as relay of {}", port.relay, identifier);

      for role in [SensorRole::Open, SensorRole::Closed] {
        let pin = port.sensors.pin(role);
        gpio.claim_input(pin.number(), config.gpio.pull)?;
        gpio.watch(pin.number(), edges.clone())?;
        debug!("Watching {} as {} sensor of {}", pin, role, identifier);
        registrations.insert(pin.number(), (identifier.clone(), role));
      }
    }
    Ok(registrations)
  }

  pub fn port(&self, identifier: &str) -> GarageResult<&Arc<Port>> {
    self
      .ports
      .get(identifier)
      .ok_or_else(|| GarageError::UnknownPort(identifier.into()))
  }

  pub async fn open(&self, identifier: &str) -> GarageResult<CommandOutcome> {
    Ok(self.port(identifier)?.open().await)
  }

  pub async fn close(&self, identifier: &str) -> GarageResult<CommandOutcome> {
    Ok(self.port(identifier)?.close().await)
  }

  pub async fn stop(&self, identifier: &str) -> GarageResult<CommandOutcome> {
    Ok(self.port(identifier)?.stop().await)
  }

  /// The cached status of one port
  pub async fn status(&self, identifier: &str) -> GarageResult<Status> {
    Ok(self.port(identifier)?.status().await)
  }

  /// The cached status of every port
  pub async fn statuses(&self) -> BTreeMap<PortId, Status> {
    let mut statuses = BTreeMap::new();
    for (identifier, port) in &self.ports {
      statuses.insert(identifier.clone(), port.status().await);
    }
    statuses
  }

  /// Re-read a port's sensors before reporting its status
  pub async fn read_status(&self, identifier: &str) -> GarageResult<Status> {
    self.port(identifier)?.refresh().await
  }

  pub fn timing(&self, identifier: &str) -> GarageResult<PortTiming> {
    let port = self.port(identifier)?;
    self
      .timing
      .timing(port.identifier())
      .ok_or_else(|| GarageError::TimingNotRecorded(port.identifier().clone()))
  }

  pub fn calibration(&self, identifier: &str) -> GarageResult<PortCalibration> {
    let port = self.port(identifier)?;
    self
      .timing
      .calibration(port.identifier())
      .ok_or_else(|| GarageError::TimingNotRecorded(port.identifier().clone()))
  }

  /// Route a sensor edge to the port it belongs to
  pub async fn dispatch(&self, edge: Edge) -> GarageResult<()> {
    self.dispatch_at(edge, Instant::now()).await
  }

  /// Route a sensor edge whose level settled at `at`
  pub async fn dispatch_at(&self, edge: Edge, at: Instant) -> GarageResult<()> {
    let (identifier, role) = match self.registrations.get(&edge.pin) {
      Some(registration) => registration,
      None => {
        debug!("Ignoring edge on unregistered GPIO {}", edge.pin);
        return Ok(());
      }
    };
    self
      .port(identifier.as_str())?
      .handle_edge_at(*role, edge.level, at)
      .await
  }

  pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
    self.changes.subscribe()
  }

  /// Drive every relay inactive and free the GPIO lines. Only the first call does anything.
  pub fn shutdown(&self) {
    if self.shut_down.swap(true, Ordering::SeqCst) {
      return;
    }

    for port in self.ports.values() {
      if let Err(err) = port.relay().reset(self.gpio.as_ref()) {
        warn!("{} relay could not be reset: {}", port, err);
      }
    }
    self.gpio.release();
    info!("Released GPIO");
  }
}

#[cfg(test)]
mod tests {
  use tokio::sync::mpsc;

  use super::*;
  use crate::gpio::{simulated::SimulatedGpio, Level};

  const CONFIG: &str = r#"
    [ports.port1]
    relay = 14
    sensors = { open = 23, closed = 24 }

    [ports.port2]
    relay = 15
    sensors = { open = 25, closed = 8 }
  "#;

  async fn controller(gpio: Arc<SimulatedGpio>) -> (tempfile::TempDir, Controller) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::parse(CONFIG).unwrap();
    let (edges, _) = mpsc::unbounded_channel();
    let controller = Controller::new(&config, gpio, StateStore::new(dir.path().join("state.json")), edges)
      .await
      .unwrap();
    (dir, controller)
  }

  #[tokio::test]
  async fn claims_relays_inactive() {
    let gpio = Arc::new(SimulatedGpio::new());
    let (_dir, _controller) = controller(gpio.clone()).await;
    assert_eq!(gpio.level(14), Some(Level::High));
    assert_eq!(gpio.level(15), Some(Level::High));
    assert!(gpio.is_claimed(8));
  }

  #[tokio::test]
  async fn unknown_port_is_rejected() {
    let (_dir, controller) = controller(Arc::new(SimulatedGpio::new())).await;
    assert!(matches!(
      controller.open("port3").await,
      Err(GarageError::UnknownPort(port)) if port.as_str() == "port3"
    ));
    assert!(matches!(controller.timing("port1"), Err(GarageError::TimingNotRecorded(_))));
  }

  #[tokio::test]
  async fn initial_read_failure_leaves_port_unknown() {
    let gpio = Arc::new(SimulatedGpio::new());
    gpio.fail_reads(23, true);
    let (_dir, controller) = controller(gpio.clone()).await;

    // both sensors pulled up and inactive
    assert_eq!(controller.status("port2").await.unwrap(), Status::Partial);
    assert_eq!(controller.status("port1").await.unwrap(), Status::Unknown);
    assert!(controller.read_status("port1").await.is_err());

    gpio.fail_reads(23, false);
    gpio.set_input(24, Level::Low).unwrap();
    assert_eq!(controller.read_status("port1").await.unwrap(), Status::Closed);
  }

  #[tokio::test]
  async fn edges_route_by_pin() {
    let gpio = Arc::new(SimulatedGpio::new());
    let (_dir, controller) = controller(gpio.clone()).await;

    gpio.set_input(8, Level::Low).unwrap();
    controller.dispatch(Edge { pin: 8, level: Level::Low }).await.unwrap();
    controller.dispatch(Edge { pin: 4, level: Level::Low }).await.unwrap();

    let statuses = controller.statuses().await;
    assert_eq!(statuses[&PortId::from("port2")], Status::Closed);
    assert_eq!(statuses[&PortId::from("port1")], Status::Partial);
  }

  #[tokio::test]
  async fn failed_claim_releases_lines() {
    let gpio = Arc::new(SimulatedGpio::new());
    gpio.claim_input(24, crate::gpio::Pull::Up).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (edges, _) = mpsc::unbounded_channel();

    let result = Controller::new(
      &Config::parse(CONFIG).unwrap(),
      gpio.clone(),
      StateStore::new(dir.path().join("state.json")),
      edges,
    )
    .await;
    assert!(result.is_err());
    assert_eq!(gpio.releases(), 1);
    assert!(!gpio.is_claimed(14));
  }

  #[tokio::test]
  async fn shutdown_releases_once() {
    let gpio = Arc::new(SimulatedGpio::new());
    let (_dir, controller) = controller(gpio.clone()).await;

    controller.shutdown();
    controller.shutdown();
    assert_eq!(gpio.releases(), 1);
    assert!(!gpio.is_claimed(14));
  }
}
