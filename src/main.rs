#![warn(rust_2018_idioms)]

use std::{env, path::PathBuf, process, sync::Arc};

use portgarage::{
  config::{Config, DEFAULT_CONFIG_PATH},
  controller::Controller,
  error::GarageResult,
  gpio, http,
  monitor::Monitor,
  mqtt_client::{MqttClient, StatusPublisher},
  store::StateStore,
};
use simple_logger::SimpleLogger;
use tokio::{signal, sync::mpsc};

#[tokio::main]
async fn main() {
  let path = env::args_os()
    .nth(1)
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

  let config = match Config::load(&path) {
    Ok(config) => config,
    Err(err) => {
      eprintln!("Unable to load {}: {}", path.display(), err);
      process::exit(1);
    }
  };

  if let Err(err) = SimpleLogger::new()
    .with_level(config.log_level)
    .with_module_level("rumqttc", log::LevelFilter::Warn)
    .init()
  {
    eprintln!("Unable to initialise logging: {}", err);
  }

  if let Err(err) = run(config).await {
    log::error!("Fatal: {}", err);
    process::exit(1);
  }
}

/// Runs until interrupted, then puts every relay back to inactive
async fn run(config: Config) -> GarageResult<()> {
  let backend = gpio::backend()?;
  let (edges_tx, edges_rx) = mpsc::unbounded_channel();
  let store = StateStore::new(&config.state_path);
  let controller = Arc::new(Controller::new(&config, backend, store, edges_tx).await?);

  tokio::spawn(Monitor::new(Arc::clone(&controller), edges_rx, config.gpio.debounce).run());

  if let Some(mqtt_config) = config.mqtt.clone() {
    let client = MqttClient::with_config(mqtt_config);
    let publisher = StatusPublisher::new(
      client.client(),
      client.config().status_topic_prefix.clone(),
      Arc::clone(&controller),
    );
    client.spawn();
    tokio::spawn(async move {
      if let Err(err) = publisher.run().await {
        log::error!("Status publisher stopped: {}", err);
      }
    });
  }

  let served = http::serve(&config.http, Arc::clone(&controller), async {
    if let Err(err) = signal::ctrl_c().await {
      log::error!("Unable to listen for shutdown signal: {}", err);
      std::future::pending::<()>().await;
    }
    log::info!("Shutting down");
  })
  .await;

  controller.shutdown();
  served
}
