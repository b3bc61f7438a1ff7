use std::{collections::BTreeMap, sync::Arc};

use log::{debug, info, warn};
use rumqttc::{AsyncClient, QoS};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
  controller::Controller,
  error::GarageResult,
  port::{identifier::PortId, state::Status, StatusChange},
};

/// Mirrors every port's status onto a retained MQTT topic
pub struct StatusPublisher {
  client: AsyncClient,
  prefix: String,
  controller: Arc<Controller>,
  changes: broadcast::Receiver<StatusChange>,
}

pub fn status_topic(prefix: &str, port: &PortId) -> String {
  format!("{}/{}/status", prefix, port)
}

impl StatusPublisher {
  pub fn new(client: AsyncClient, prefix: impl Into<String>, controller: Arc<Controller>) -> Self {
    let changes = controller.subscribe();
    StatusPublisher {
      client,
      prefix: prefix.into(),
      controller,
      changes,
    }
  }

  async fn publish(&self, port: &PortId, status: Status) -> GarageResult<()> {
    let topic = status_topic(&self.prefix, port);
    debug!("Publishing {} to {}", status, topic);
    self
      .client
      .publish(topic, QoS::AtLeastOnce, true, status.to_string())
      .await?;
    Ok(())
  }

  async fn publish_all(&self, statuses: BTreeMap<PortId, Status>) -> GarageResult<()> {
    for (port, status) in &statuses {
      self.publish(port, *status).await?;
    }
    Ok(())
  }

  /// Publish the current statuses, then every change as it happens
  pub async fn run(mut self) -> GarageResult<()> {
    self.publish_all(self.controller.statuses().await).await?;

    loop {
      match self.changes.recv().await {
        Ok(change) => self.publish(&change.port, change.status).await?,
        Err(RecvError::Lagged(skipped)) => {
          // only the latest status matters, so catch up from the controller
          warn!("Status publisher skipped {} changes, republishing all", skipped);
          self.publish_all(self.controller.statuses().await).await?;
        }
        Err(RecvError::Closed) => {
          info!("Status changes closed, publisher stopping");
          return Ok(());
        }
      }
    }
  }
}
