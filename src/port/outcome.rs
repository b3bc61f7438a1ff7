use serde::Serialize;

use super::{identifier::PortId, state::Direction};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
  Open,
  Close,
  Stop,
}

impl From<Direction> for Action {
  fn from(direction: Direction) -> Self {
    match direction {
      Direction::Open => Action::Open,
      Direction::Close => Action::Close,
    }
  }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
  AlreadyOpen,
  AlreadyClosed,
  Opening,
  Closing,
  /// Rejected, another operation is in flight
  Busy,
  NotMoving,
  Stopped,
  Failed,
}

/// What became of an open, close or stop command
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
  pub port: PortId,
  pub action: Action,
  pub status: OutcomeStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub note: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl CommandOutcome {
  pub fn new(port: PortId, action: Action, status: OutcomeStatus) -> Self {
    CommandOutcome {
      port,
      action,
      status,
      note: None,
      error: None,
    }
  }

  pub fn with_note(mut self, note: Option<String>) -> Self {
    self.note = note;
    self
  }

  pub fn failed(port: PortId, action: Action, error: String) -> Self {
    CommandOutcome {
      error: Some(error),
      ..CommandOutcome::new(port, action, OutcomeStatus::Failed)
    }
  }

  pub fn already(port: PortId, direction: Direction) -> Self {
    let status = match direction {
      Direction::Open => OutcomeStatus::AlreadyOpen,
      Direction::Close => OutcomeStatus::AlreadyClosed,
    };
    CommandOutcome::new(port, direction.into(), status)
  }

  pub fn initiated(port: PortId, direction: Direction) -> Self {
    let status = match direction {
      Direction::Open => OutcomeStatus::Opening,
      Direction::Close => OutcomeStatus::Closing,
    };
    CommandOutcome::new(port, direction.into(), status)
  }

  pub fn is_failure(&self) -> bool {
    self.status == OutcomeStatus::Failed
  }
}
