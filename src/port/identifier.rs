use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

/// An identifier for a port.
///
/// Defined by the port's configuration key, i.e. [ports.identifier-here]
///
/// Also used to key the port's persisted timing history.
#[derive(Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord, Clone)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<String> for PortId {
  fn from(string: String) -> Self {
    PortId(string)
  }
}

impl From<&str> for PortId {
  fn from(string: &str) -> Self {
    PortId(string.to_string())
  }
}

impl Borrow<str> for PortId {
  fn borrow(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for PortId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}
