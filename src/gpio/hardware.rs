use std::{
  collections::HashMap,
  sync::{Mutex, MutexGuard, PoisonError},
};

use log::debug;
use rppal::gpio::{self, Gpio, InputPin, OutputPin, Trigger};

use super::{EdgeSender, GpioBackend, Level, Pull};
use crate::error::{GarageError, GarageResult};

impl From<Level> for gpio::Level {
  fn from(level: Level) -> Self {
    match level {
      Level::Low => gpio::Level::Low,
      Level::High => gpio::Level::High,
    }
  }
}

impl From<gpio::Level> for Level {
  fn from(level: gpio::Level) -> Self {
    match level {
      gpio::Level::Low => Level::Low,
      gpio::Level::High => Level::High,
    }
  }
}

/// GPIO through rppal's memory mapped `/dev/gpiomem` access
#[derive(Debug)]
pub struct HardwareGpio {
  gpio: Gpio,
  outputs: Mutex<HashMap<u8, OutputPin>>,
  inputs: Mutex<HashMap<u8, InputPin>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HardwareGpio {
  pub fn new() -> GarageResult<Self> {
    Ok(HardwareGpio {
      gpio: Gpio::new()?,
      outputs: Mutex::new(HashMap::new()),
      inputs: Mutex::new(HashMap::new()),
    })
  }
}

impl GpioBackend for HardwareGpio {
  fn claim_output(&self, pin: u8, initial: Level) -> GarageResult<()> {
    let mut output = self.gpio.get(pin)?.into_output();
    output.write(initial.into());
    debug!("Claimed GPIO {} as output ({})", pin, initial);
    locked(&self.outputs).insert(pin, output);
    Ok(())
  }

  fn claim_input(&self, pin: u8, pull: Pull) -> GarageResult<()> {
    let pin_handle = self.gpio.get(pin)?;
    let input = match pull {
      Pull::Up => pin_handle.into_input_pullup(),
      Pull::Down => pin_handle.into_input_pulldown(),
      Pull::Off => pin_handle.into_input(),
    };
    debug!("Claimed GPIO {} as input ({:?})", pin, pull);
    locked(&self.inputs).insert(pin, input);
    Ok(())
  }

  fn write(&self, pin: u8, level: Level) -> GarageResult<()> {
    let mut outputs = locked(&self.outputs);
    let output = outputs.get_mut(&pin).ok_or(GarageError::PinNotClaimed(pin))?;
    output.write(level.into());
    Ok(())
  }

  fn read(&self, pin: u8) -> GarageResult<Level> {
    let inputs = locked(&self.inputs);
    let input = inputs.get(&pin).ok_or(GarageError::PinNotClaimed(pin))?;
    Ok(input.read().into())
  }

  fn watch(&self, pin: u8, edges: EdgeSender) -> GarageResult<()> {
    let mut inputs = locked(&self.inputs);
    let input = inputs.get_mut(&pin).ok_or(GarageError::PinNotClaimed(pin))?;
    // rppal invokes this from its interrupt thread, only the pin number is captured
    input.set_async_interrupt(Trigger::Both, move |level| {
      let _ = edges.send(super::Edge {
        pin,
        level: level.into(),
      });
    })?;
    Ok(())
  }

  fn release(&self) {
    let mut inputs = locked(&self.inputs);
    for input in inputs.values_mut() {
      let _ = input.clear_async_interrupt();
    }
    inputs.clear();
    // dropping the pins resets them to their original mode
    locked(&self.outputs).clear();
  }
}
