use std::{collections::HashMap, future, sync::Arc, time::Duration};

use log::{debug, error};
use tokio::time::{self, Instant};

use crate::{
  controller::Controller,
  gpio::{Edge, EdgeReceiver, Level},
};

/// A level waiting out the debounce window
#[derive(Debug, Clone, Copy)]
struct Settling {
  level: Level,
  since: Instant,
}

/// Feeds sensor edges to the controller one at a time, in the order they settled.
///
/// A pin's level is only passed on once it has held for the debounce window, stamped with the time of its last change.
pub struct Monitor {
  controller: Arc<Controller>,
  edges: EdgeReceiver,
  debounce: Duration,
  settling: HashMap<u8, Settling>,
}

impl Monitor {
  pub fn new(controller: Arc<Controller>, edges: EdgeReceiver, debounce: Duration) -> Self {
    Monitor {
      controller,
      edges,
      debounce,
      settling: HashMap::new(),
    }
  }

  /// Runs until every edge sender is gone
  pub async fn run(mut self) {
    loop {
      let deadline = self.settling.values().map(|settling| settling.since + self.debounce).min();
      tokio::select! {
        edge = self.edges.recv() => match edge {
          Some(edge) => {
            debug!("Edge on GPIO {} ({})", edge.pin, edge.level);
            self.settling.insert(edge.pin, Settling {
              level: edge.level,
              since: Instant::now(),
            });
          }
          None => break,
        },
        _ = Self::sleep_until(deadline) => {}
      }
      self.dispatch_settled(Some(Instant::now())).await;
    }

    // nothing else will arrive, so whatever is still settling is final
    self.dispatch_settled(None).await;
    debug!("Edge channel closed, monitor stopping");
  }

  async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
      Some(deadline) => time::sleep_until(deadline).await,
      None => future::pending().await,
    }
  }

  /// Dispatch every level that has held until `now`, or all of them without a `now`
  async fn dispatch_settled(&mut self, now: Option<Instant>) {
    let debounce = self.debounce;
    let mut settled: Vec<(u8, Settling)> = self
      .settling
      .iter()
      .filter(|(_, settling)| now.map_or(true, |now| settling.since + debounce <= now))
      .map(|(pin, settling)| (*pin, *settling))
      .collect();
    settled.sort_by_key(|(_, settling)| settling.since);

    for (pin, settling) in settled {
      self.settling.remove(&pin);
      let edge = Edge {
        pin,
        level: settling.level,
      };
      if let Err(err) = self.controller.dispatch_at(edge, settling.since).await {
        error!("Failed to handle edge on GPIO {}: {}", pin, err);
      }
    }
  }
}
