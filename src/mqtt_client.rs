use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::{task::JoinHandle, time::sleep};

pub use self::publisher::StatusPublisher;

mod publisher;

const CHANNEL_CAPACITY: usize = 10;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct MqttClientConfig {
  pub host: String,
  #[serde(default = "default_port")]
  pub port: u16,
  #[serde(default = "default_client_id")]
  pub client_id: String,
  pub username: Option<String>,
  pub password: Option<String>,

  /// Retained `online` once connected, and `offline` as the last will
  #[serde(default = "default_availability_topic")]
  pub availability_topic: String,
  #[serde(default = "default_online")]
  pub online_availability: String,
  #[serde(default = "default_offline")]
  pub offline_availability: String,

  /// Statuses are published to `<prefix>/<port>/status`
  #[serde(default = "default_status_topic_prefix")]
  pub status_topic_prefix: String,
}

fn default_port() -> u16 {
  1883
}

fn default_client_id() -> String {
  "portgarage".to_string()
}

fn default_availability_topic() -> String {
  "portgarage/availability".to_string()
}

fn default_online() -> String {
  "online".to_string()
}

fn default_offline() -> String {
  "offline".to_string()
}

fn default_status_topic_prefix() -> String {
  "portgarage".to_string()
}

pub struct MqttClient {
  config: MqttClientConfig,
  client: AsyncClient,
  event_loop: EventLoop,
}

impl MqttClient {
  pub fn with_config(config: MqttClientConfig) -> MqttClient {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_last_will(LastWill::new(
      &config.availability_topic,
      config.offline_availability.as_bytes().to_vec(),
      QoS::AtLeastOnce,
      true,
    ));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
      options.set_credentials(username, password);
    }

    let (client, event_loop) = AsyncClient::new(options, CHANNEL_CAPACITY);
    MqttClient {
      config,
      client,
      event_loop,
    }
  }

  pub fn config(&self) -> &MqttClientConfig {
    &self.config
  }

  pub fn client(&self) -> AsyncClient {
    self.client.clone()
  }

  /// Drive the connection forever, announcing availability on every (re)connect.
  ///
  /// Broker trouble is logged and retried, it never reaches door control.
  pub fn spawn(self) -> JoinHandle<()> {
    let MqttClient {
      config,
      client,
      mut event_loop,
    } = self;

    tokio::spawn(async move {
      loop {
        match event_loop.poll().await {
          Ok(Event::Incoming(Packet::ConnAck(_))) => {
            info!("Connected to MQTT broker {}:{}", config.host, config.port);
            if let Err(err) = client.try_publish(
              &config.availability_topic,
              QoS::AtLeastOnce,
              true,
              config.online_availability.as_bytes(),
            ) {
              error!("Failed to announce availability: {}", err);
            }
          }
          Ok(event) => debug!("MQTT event: {:?}", event),
          Err(err) => {
            error!("MQTT connection error, retrying in 5 seconds: {}", err);
            // wait some time for the broker to come back online
            sleep(RECONNECT_DELAY).await;
          }
        }
      }
    })
  }
}
