//! Mimics the GPIO backend without the need to compile to ARM and use physical hardware.
//!
//! Inputs are driven with [`SimulatedGpio::set_input`], which also delivers the edge to a registered watcher, and
//! I/O faults can be injected per pin.

use std::{
  collections::{HashMap, HashSet},
  sync::{Mutex, MutexGuard, PoisonError},
};

use log::debug;
use thiserror::Error;

use super::{Edge, EdgeSender, GpioBackend, Level, Pull};
use crate::error::{GarageError, GarageResult};

#[derive(Debug, Error)]
pub enum Error {
  #[error("simulated read fault on GPIO {0}")]
  Read(u8),
  #[error("simulated write fault on GPIO {0}")]
  Write(u8),
  #[error("GPIO {0} is already claimed")]
  Claimed(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
  Input,
  Output,
}

#[derive(Debug)]
struct Line {
  mode: Mode,
  level: Level,
  watcher: Option<EdgeSender>,
}

#[derive(Debug, Default)]
struct Lines {
  lines: HashMap<u8, Line>,
  /// Outlives the lines, so writes made just before a release can still be inspected
  writes: HashMap<u8, Vec<Level>>,
  failing_reads: HashSet<u8>,
  failing_writes: HashSet<u8>,
  fail_next_write: HashSet<u8>,
  releases: usize,
}

#[derive(Debug, Default)]
pub struct SimulatedGpio {
  inner: Mutex<Lines>,
}

impl SimulatedGpio {
  pub fn new() -> SimulatedGpio {
    SimulatedGpio::default()
  }

  fn lines(&self) -> MutexGuard<'_, Lines> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn claim(&self, pin: u8, mode: Mode, level: Level) -> GarageResult<()> {
    let mut lines = self.lines();
    if lines.lines.contains_key(&pin) {
      return Err(Error::Claimed(pin).into());
    }
    lines.lines.insert(
      pin,
      Line {
        mode,
        level,
        watcher: None,
      },
    );
    Ok(())
  }

  /// Change the level seen on an input pin, emitting an edge if it changed
  pub fn set_input(&self, pin: u8, level: Level) -> GarageResult<()> {
    let mut lines = self.lines();
    let line = lines
      .lines
      .get_mut(&pin)
      .filter(|line| line.mode == Mode::Input)
      .ok_or(GarageError::PinNotClaimed(pin))?;

    if line.level != level {
      line.level = level;
      if let Some(watcher) = &line.watcher {
        let _ = watcher.send(Edge { pin, level });
      }
    }
    Ok(())
  }

  /// The level currently driven on (or seen by) a pin
  pub fn level(&self, pin: u8) -> Option<Level> {
    self.lines().lines.get(&pin).map(|line| line.level)
  }

  /// Every successful write made to an output pin, oldest first, including those from before a release
  pub fn writes(&self, pin: u8) -> Vec<Level> {
    self.lines().writes.get(&pin).cloned().unwrap_or_default()
  }

  pub fn fail_reads(&self, pin: u8, fail: bool) {
    let mut lines = self.lines();
    if fail {
      lines.failing_reads.insert(pin);
    }
    else {
      lines.failing_reads.remove(&pin);
    }
  }

  pub fn fail_writes(&self, pin: u8, fail: bool) {
    let mut lines = self.lines();
    if fail {
      lines.failing_writes.insert(pin);
    }
    else {
      lines.failing_writes.remove(&pin);
    }
  }

  /// Fail only the next write to `pin`
  pub fn fail_next_write(&self, pin: u8) {
    self.lines().fail_next_write.insert(pin);
  }

  pub fn is_claimed(&self, pin: u8) -> bool {
    self.lines().lines.contains_key(&pin)
  }

  /// How many times claimed lines were actually released
  pub fn releases(&self) -> usize {
    self.lines().releases
  }
}

impl GpioBackend for SimulatedGpio {
  fn claim_output(&self, pin: u8, initial: Level) -> GarageResult<()> {
    self.claim(pin, Mode::Output, initial)?;
    debug!("Simulated GPIO {} claimed as output ({})", pin, initial);
    Ok(())
  }

  fn claim_input(&self, pin: u8, pull: Pull) -> GarageResult<()> {
    let level = match pull {
      Pull::Up => Level::High,
      Pull::Down | Pull::Off => Level::Low,
    };
    self.claim(pin, Mode::Input, level)?;
    debug!("Simulated GPIO {} claimed as input ({:?})", pin, pull);
    Ok(())
  }

  fn write(&self, pin: u8, level: Level) -> GarageResult<()> {
    let mut lines = self.lines();
    if lines.fail_next_write.remove(&pin) || lines.failing_writes.contains(&pin) {
      return Err(Error::Write(pin).into());
    }
    let line = lines
      .lines
      .get_mut(&pin)
      .filter(|line| line.mode == Mode::Output)
      .ok_or(GarageError::PinNotClaimed(pin))?;
    line.level = level;
    lines.writes.entry(pin).or_default().push(level);
    Ok(())
  }

  fn read(&self, pin: u8) -> GarageResult<Level> {
    let lines = self.lines();
    if lines.failing_reads.contains(&pin) {
      return Err(Error::Read(pin).into());
    }
    lines
      .lines
      .get(&pin)
      .map(|line| line.level)
      .ok_or(GarageError::PinNotClaimed(pin))
  }

  fn watch(&self, pin: u8, edges: EdgeSender) -> GarageResult<()> {
    let mut lines = self.lines();
    let line = lines
      .lines
      .get_mut(&pin)
      .filter(|line| line.mode == Mode::Input)
      .ok_or(GarageError::PinNotClaimed(pin))?;
    line.watcher = Some(edges);
    Ok(())
  }

  fn release(&self) {
    let mut lines = self.lines();
    if !lines.lines.is_empty() {
      lines.lines.clear();
      lines.releases += 1;
    }
  }
}
