use std::time::Duration;

use log::{debug, error};
use tokio::sync::{Mutex, MutexGuard};

use crate::{
  error::GarageResult,
  gpio::{GpioBackend, Level},
};

/// The relay wired in parallel with the opener's button.
///
/// The opener toggles on a press, so the relay is only ever pulsed, never held.
#[derive(Debug)]
pub struct Relay {
  pin: u8,
  active: Level,
  pulse_duration: Duration,
  /// Held for the length of a pulse so two pulses for the same port never overlap
  mutex: Mutex<()>,
}

/// Drives the relay back to its inactive level when dropped, unless released explicitly first
struct ReleaseGuard<'a> {
  gpio: &'a dyn GpioBackend,
  pin: u8,
  inactive: Level,
  armed: bool,
}

impl ReleaseGuard<'_> {
  fn release(mut self) -> GarageResult<()> {
    self.armed = false;
    self.gpio.write(self.pin, self.inactive)
  }
}

impl Drop for ReleaseGuard<'_> {
  fn drop(&mut self) {
    if self.armed {
      if let Err(err) = self.gpio.write(self.pin, self.inactive) {
        error!("Failed to release relay on GPIO {}: {}", self.pin, err);
      }
    }
  }
}

impl Relay {
  pub fn new(pin: u8, active: Level, pulse_duration: Duration) -> Self {
    Relay {
      pin,
      active,
      pulse_duration,
      mutex: Mutex::new(()),
    }
  }

  pub fn inactive(&self) -> Level {
    self.active.inverse()
  }

  /// Wait until no other pulse is in progress and hold the relay until the returned lock is dropped
  pub async fn acquire(&self) -> RelayLock<'_> {
    let guard = self.mutex.lock().await;
    debug!("Locked relay on GPIO {}", self.pin);
    RelayLock {
      relay: self,
      _guard: guard,
    }
  }

  /// Press the button: active for `pulse_duration`, then back to inactive.
  ///
  /// The inactive level is restored on every exit path, including a failed write or the future being dropped.
  pub async fn trigger(&self, gpio: &dyn GpioBackend) -> GarageResult<()> {
    self.acquire().await.pulse(gpio).await
  }

  /// Drive the relay inactive without pulsing
  pub fn reset(&self, gpio: &dyn GpioBackend) -> GarageResult<()> {
    gpio.write(self.pin, self.inactive())
  }
}

/// Exclusive use of a relay, see [`Relay::acquire`]
pub struct RelayLock<'a> {
  relay: &'a Relay,
  _guard: MutexGuard<'a, ()>,
}

impl RelayLock<'_> {
  pub async fn pulse(&self, gpio: &dyn GpioBackend) -> GarageResult<()> {
    let relay = self.relay;
    let release = ReleaseGuard {
      gpio,
      pin: relay.pin,
      inactive: relay.inactive(),
      armed: true,
    };
    gpio.write(relay.pin, relay.active)?;
    tokio::time::sleep(relay.pulse_duration).await;
    release.release()
  }
}

impl Drop for RelayLock<'_> {
  fn drop(&mut self) {
    debug!("Unlocked relay on GPIO {}", self.relay.pin);
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use tokio::time::Instant;

  use super::*;
  use crate::gpio::simulated::SimulatedGpio;

  fn relay_gpio() -> SimulatedGpio {
    let gpio = SimulatedGpio::new();
    gpio.claim_output(14, Level::High).unwrap();
    gpio
  }

  #[tokio::test(start_paused = true)]
  async fn pulses_active_then_inactive() {
    let gpio = relay_gpio();
    let relay = Relay::new(14, Level::Low, Duration::from_millis(500));

    let start = Instant::now();
    relay.trigger(&gpio).await.unwrap();

    assert_eq!(start.elapsed(), Duration::from_millis(500));
    assert_eq!(gpio.writes(14), vec![Level::Low, Level::High]);
    assert_eq!(gpio.level(14), Some(Level::High));
  }

  #[tokio::test(start_paused = true)]
  async fn failed_press_still_releases() {
    let gpio = relay_gpio();
    let relay = Relay::new(14, Level::Low, Duration::from_millis(500));

    gpio.fail_next_write(14);
    assert!(relay.trigger(&gpio).await.is_err());
    assert_eq!(gpio.writes(14), vec![Level::High]);
  }

  #[tokio::test(start_paused = true)]
  async fn cancelled_pulse_releases() {
    let gpio = relay_gpio();
    let relay = Relay::new(14, Level::Low, Duration::from_secs(1));

    let cancelled = tokio::time::timeout(Duration::from_millis(100), relay.trigger(&gpio)).await;
    assert!(cancelled.is_err());
    assert_eq!(gpio.writes(14), vec![Level::Low, Level::High]);
  }

  #[tokio::test(start_paused = true)]
  async fn pulses_for_one_relay_do_not_overlap() {
    let gpio = Arc::new(relay_gpio());
    let relay = Arc::new(Relay::new(14, Level::Low, Duration::from_millis(500)));

    let start = Instant::now();
    let first = {
      let (gpio, relay) = (Arc::clone(&gpio), Arc::clone(&relay));
      tokio::spawn(async move { relay.trigger(gpio.as_ref()).await })
    };
    let second = {
      let (gpio, relay) = (Arc::clone(&gpio), Arc::clone(&relay));
      tokio::spawn(async move { relay.trigger(gpio.as_ref()).await })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(start.elapsed(), Duration::from_secs(1));
    assert_eq!(gpio.writes(14), vec![Level::Low, Level::High, Level::Low, Level::High]);
  }

  #[tokio::test(start_paused = true)]
  async fn held_relay_delays_other_pulses() {
    let gpio = Arc::new(relay_gpio());
    let relay = Arc::new(Relay::new(14, Level::Low, Duration::from_millis(500)));

    let lock = relay.acquire().await;
    let start = Instant::now();
    let waiting = {
      let (gpio, relay) = (Arc::clone(&gpio), Arc::clone(&relay));
      tokio::spawn(async move { relay.trigger(gpio.as_ref()).await })
    };
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(gpio.writes(14).is_empty());

    drop(lock);
    waiting.await.unwrap().unwrap();
    assert_eq!(start.elapsed(), Duration::from_millis(2500));
    assert_eq!(gpio.writes(14), vec![Level::Low, Level::High]);
  }
}
