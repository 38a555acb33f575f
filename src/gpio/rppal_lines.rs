use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rppal::gpio::{Bias, Event, Gpio, InputPin, OutputPin, Trigger};
use tracing::{debug, info};

use super::{check_line, Direction, Edge, EdgeEvent, EdgeSource, HardwareError, LineBackend, Pull};

// longest single interrupt poll, bounds how late a wake request is noticed
const WAKE_SLICE: Duration = Duration::from_millis(10);

enum ConfiguredLine {
    Input(InputPin),
    Output(OutputPin),
}

/// Raspberry Pi GPIO lines through rppal
///
/// Plain lines are kept open in a table until reconfigured. Edge subscriptions
/// use rppal's synchronous interrupts, which timestamp each edge in the kernel.
pub struct RppalLines {
    gpio: Gpio,
    lines: Mutex<HashMap<u8, ConfiguredLine>>,
    pulls: Mutex<HashMap<u8, Pull>>,
    wake_requested: AtomicBool,
}

impl RppalLines {
    pub fn new() -> Result<Self, HardwareError> {
        let gpio = Gpio::new()?;
        info!("GPIO backend opened");
        Ok(Self {
            gpio,
            lines: Mutex::new(HashMap::new()),
            pulls: Mutex::new(HashMap::new()),
            wake_requested: AtomicBool::new(false),
        })
    }

    fn bias_for(&self, line_id: u8) -> Bias {
        bias(self.pulls.lock().get(&line_id).copied().unwrap_or_default())
    }
}

fn bias(pull: Pull) -> Bias {
    match pull {
        Pull::Off => Bias::Off,
        Pull::Down => Bias::PullDown,
        Pull::Up => Bias::PullUp,
    }
}

impl std::fmt::Debug for RppalLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RppalLines")
            .field("configured", &self.lines.lock().len())
            .finish()
    }
}

/// Both-edge interrupt subscription on one input pin
pub struct RppalSource {
    line_id: u8,
    gpio: Gpio,
    pin: InputPin,
    // edges pulled off the interrupt queue during a readiness wait
    stash: Mutex<Vec<EdgeEvent>>,
}

impl EdgeSource for RppalSource {
    fn line_id(&self) -> u8 {
        self.line_id
    }

    fn read_edges(&self, out: &mut Vec<EdgeEvent>) -> Result<(), HardwareError> {
        out.append(&mut self.stash.lock());
        while let Some((_, event)) = self
            .gpio
            .poll_interrupts(&[&self.pin], false, Some(Duration::ZERO))
            .map_err(map_poll_error)?
        {
            if let Some(edge) = edge_from_event(&event) {
                out.push(edge);
            }
        }
        Ok(())
    }
}

impl Drop for RppalSource {
    fn drop(&mut self) {
        debug!("Releasing edge subscription on line {}", self.line_id);
    }
}

impl LineBackend for RppalLines {
    type Source = RppalSource;

    fn configure_line(&self, line_id: u8, direction: Direction) -> Result<(), HardwareError> {
        check_line(line_id)?;
        let mut lines = self.lines.lock();
        // release the previous handle before asking rppal for the pin again
        lines.remove(&line_id);
        let pin = self.gpio.get(line_id)?;
        let line = match direction {
            Direction::Input => {
                let mut input = pin.into_input();
                input.set_bias(self.bias_for(line_id));
                ConfiguredLine::Input(input)
            }
            Direction::Output => ConfiguredLine::Output(pin.into_output_low()),
        };
        lines.insert(line_id, line);
        debug!("Line {} configured as {:?}", line_id, direction);
        Ok(())
    }

    fn write_line(&self, line_id: u8, high: bool) -> Result<(), HardwareError> {
        match self.lines.lock().get_mut(&line_id) {
            Some(ConfiguredLine::Output(pin)) => {
                if high {
                    pin.set_high();
                } else {
                    pin.set_low();
                }
                Ok(())
            }
            Some(ConfiguredLine::Input(_)) => {
                Err(HardwareError::WrongDirection(line_id, Direction::Output))
            }
            None => Err(HardwareError::NotConfigured(line_id)),
        }
    }

    fn read_line(&self, line_id: u8) -> Result<bool, HardwareError> {
        match self.lines.lock().get(&line_id) {
            Some(ConfiguredLine::Input(pin)) => Ok(pin.is_high()),
            Some(ConfiguredLine::Output(pin)) => Ok(pin.is_set_high()),
            None => Err(HardwareError::NotConfigured(line_id)),
        }
    }

    fn set_pull(&self, line_id: u8, pull: Pull) -> Result<(), HardwareError> {
        check_line(line_id)?;
        let mut lines = self.lines.lock();
        match lines.get_mut(&line_id) {
            Some(ConfiguredLine::Input(pin)) => pin.set_bias(bias(pull)),
            Some(ConfiguredLine::Output(_)) => {
                return Err(HardwareError::WrongDirection(line_id, Direction::Input));
            }
            None => {}
        }
        self.pulls.lock().insert(line_id, pull);
        debug!("Line {} pull set to {:?}", line_id, pull);
        Ok(())
    }

    fn subscribe_edges(&self, line_id: u8) -> Result<RppalSource, HardwareError> {
        check_line(line_id)?;
        if self.lines.lock().contains_key(&line_id) {
            return Err(HardwareError::LineBusy(line_id));
        }

        let mut pin = self.gpio.get(line_id)?.into_input();
        pin.set_bias(self.bias_for(line_id));
        pin.set_interrupt(Trigger::Both, None)?;
        info!("Subscribed to both edges on line {}", line_id);

        Ok(RppalSource {
            line_id,
            gpio: self.gpio.clone(),
            pin,
            stash: Mutex::new(Vec::new()),
        })
    }

    fn wait_ready(
        &self,
        sources: &[&RppalSource],
        timeout: Duration,
    ) -> Result<Vec<usize>, HardwareError> {
        let pins: Vec<&InputPin> = sources.iter().map(|source| &source.pin).collect();
        let deadline = Instant::now() + timeout;

        let (pin, event) = loop {
            if self.wake_requested.swap(false, Ordering::AcqRel) {
                return Ok(Vec::new());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let slice = (deadline - now).min(WAKE_SLICE);
            if let Some(hit) = self
                .gpio
                .poll_interrupts(&pins, false, Some(slice))
                .map_err(map_poll_error)?
            {
                break hit;
            }
        };

        let mut ready = Vec::new();
        stash_event(sources, &mut ready, pin.pin(), &event);

        // collect whatever else is already queued without blocking again
        while let Some((pin, event)) = self
            .gpio
            .poll_interrupts(&pins, false, Some(Duration::ZERO))
            .map_err(map_poll_error)?
        {
            stash_event(sources, &mut ready, pin.pin(), &event);
        }

        Ok(ready)
    }

    fn wake(&self) {
        self.wake_requested.store(true, Ordering::Release);
    }
}

fn stash_event(sources: &[&RppalSource], ready: &mut Vec<usize>, line_id: u8, event: &Event) {
    let Some(index) = sources.iter().position(|s| s.line_id == line_id) else {
        return;
    };
    if let Some(edge) = edge_from_event(event) {
        sources[index].stash.lock().push(edge);
    }
    if !ready.contains(&index) {
        ready.push(index);
    }
}

fn edge_from_event(event: &Event) -> Option<EdgeEvent> {
    let edge = match event.trigger {
        Trigger::RisingEdge => Edge::Rising,
        Trigger::FallingEdge => Edge::Falling,
        _ => return None,
    };
    Some(EdgeEvent {
        edge,
        timestamp_ns: u64::try_from(event.timestamp.as_nanos()).unwrap_or(u64::MAX),
    })
}

fn map_poll_error(err: rppal::gpio::Error) -> HardwareError {
    match err {
        rppal::gpio::Error::Io(ref e) if e.kind() == io::ErrorKind::Interrupted => {
            HardwareError::Interrupted
        }
        other => HardwareError::Gpio(other),
    }
}
