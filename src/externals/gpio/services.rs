use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rppal::gpio::{Event, Gpio, InputPin, OutputPin, Trigger};
use tracing::{debug, warn};

use super::{Edge, EdgeCallback, GpioError, GpioService, Pull};

/// State shared between the service and the interrupt thread of one line.
struct LineShared {
    callbacks: Mutex<Vec<(Edge, EdgeCallback)>>,
    latch_edge: Mutex<Option<Edge>>,
    latch: AtomicBool,
    debounce: Mutex<Option<Duration>>,
    last_event: Mutex<Option<Instant>>,
}

impl LineShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            callbacks: Mutex::new(Vec::new()),
            latch_edge: Mutex::new(None),
            latch: AtomicBool::new(false),
            debounce: Mutex::new(None),
            last_event: Mutex::new(None),
        })
    }

    /// Runs on the GPIO library's interrupt thread.
    fn handle(&self, event: Event) {
        let rising = matches!(event.trigger, Trigger::RisingEdge);
        let now = Instant::now();
        {
            let mut last = self.last_event.lock().expect("gpio line lock poisoned");
            let window = *self.debounce.lock().expect("gpio line lock poisoned");
            if let (Some(previous), Some(window)) = (*last, window) {
                if now.duration_since(previous) < window {
                    return;
                }
            }
            *last = Some(now);
        }
        if let Some(edge) = *self.latch_edge.lock().expect("gpio line lock poisoned") {
            if edge.matches(rising) {
                self.latch.store(true, Ordering::SeqCst);
            }
        }
        let mut callbacks = self.callbacks.lock().expect("gpio line lock poisoned");
        for (edge, callback) in callbacks.iter_mut() {
            if edge.matches(rising) {
                callback(rising);
            }
        }
    }
}

struct InputLine {
    pin: InputPin,
    shared: Arc<LineShared>,
    watching: bool,
}

impl InputLine {
    /// One OS-level detector per line; everything else chains in software.
    fn ensure_watching(&mut self) -> Result<(), GpioError> {
        if self.watching {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        self.pin
            .set_async_interrupt(Trigger::Both, None, move |event| shared.handle(event))
            .map_err(|e| GpioError::Backend(e.to_string()))?;
        self.watching = true;
        Ok(())
    }

    fn set_debounce_if_unset(&self, debounce: Duration) {
        let mut window = self.shared.debounce.lock().expect("gpio line lock poisoned");
        if window.is_none() && !debounce.is_zero() {
            *window = Some(debounce);
        }
    }
}

enum ConfiguredLine {
    Output(OutputPin),
    Input(InputLine),
}

/// GPIO service over the Raspberry Pi peripheral library.
pub struct RppalGpioService {
    gpio: Gpio,
    lines: Mutex<HashMap<u8, ConfiguredLine>>,
}

impl RppalGpioService {
    pub fn new() -> Result<Self, GpioError> {
        let gpio = Gpio::new().map_err(|e| GpioError::Backend(e.to_string()))?;
        Ok(Self { gpio, lines: Mutex::new(HashMap::new()) })
    }
}

impl GpioService for RppalGpioService {
    fn configure_output(&self, line: u8) -> Result<(), GpioError> {
        let mut lines = self.lines.lock().expect("gpio registry lock poisoned");
        match lines.get(&line) {
            Some(ConfiguredLine::Output(_)) => return Ok(()),
            Some(ConfiguredLine::Input(_)) => return Err(GpioError::NotAnOutput(line)),
            None => {}
        }
        let pin = self
            .gpio
            .get(line)
            .map_err(|e| GpioError::Backend(e.to_string()))?
            .into_output_low();
        debug!("Configured gpio {} as output.", line);
        lines.insert(line, ConfiguredLine::Output(pin));
        Ok(())
    }

    fn configure_input(&self, line: u8, pull: Pull) -> Result<(), GpioError> {
        let mut lines = self.lines.lock().expect("gpio registry lock poisoned");
        match lines.get(&line) {
            Some(ConfiguredLine::Input(_)) => return Ok(()),
            Some(ConfiguredLine::Output(_)) => return Err(GpioError::NotAnInput(line)),
            None => {}
        }
        let pin = self.gpio.get(line).map_err(|e| GpioError::Backend(e.to_string()))?;
        let pin = match pull {
            Pull::Up => pin.into_input_pullup(),
            Pull::None => pin.into_input(),
        };
        debug!("Configured gpio {} as input.", line);
        lines.insert(
            line,
            ConfiguredLine::Input(InputLine { pin, shared: LineShared::new(), watching: false }),
        );
        Ok(())
    }

    fn read(&self, line: u8) -> Result<bool, GpioError> {
        let lines = self.lines.lock().expect("gpio registry lock poisoned");
        match lines.get(&line) {
            Some(ConfiguredLine::Output(pin)) => Ok(pin.is_set_high()),
            Some(ConfiguredLine::Input(input)) => Ok(input.pin.is_high()),
            None => Err(GpioError::NotConfigured(line)),
        }
    }

    fn write(&self, line: u8, level: bool) -> Result<(), GpioError> {
        let mut lines = self.lines.lock().expect("gpio registry lock poisoned");
        match lines.get_mut(&line) {
            Some(ConfiguredLine::Output(pin)) => {
                if level {
                    pin.set_high();
                } else {
                    pin.set_low();
                }
                Ok(())
            }
            Some(ConfiguredLine::Input(_)) => Err(GpioError::NotAnOutput(line)),
            None => Err(GpioError::NotConfigured(line)),
        }
    }

    fn add_edge_callback(
        &self,
        line: u8,
        edge: Edge,
        debounce: Duration,
        callback: EdgeCallback,
    ) -> Result<(), GpioError> {
        let mut lines = self.lines.lock().expect("gpio registry lock poisoned");
        let input = match lines.get_mut(&line) {
            Some(ConfiguredLine::Input(input)) => input,
            Some(ConfiguredLine::Output(_)) => return Err(GpioError::NotAnInput(line)),
            None => return Err(GpioError::NotConfigured(line)),
        };
        input.shared.callbacks.lock().expect("gpio line lock poisoned").push((edge, callback));
        input.set_debounce_if_unset(debounce);
        input.ensure_watching()
    }

    fn enable_edge_latch(
        &self,
        line: u8,
        edge: Edge,
        debounce: Duration,
    ) -> Result<(), GpioError> {
        let mut lines = self.lines.lock().expect("gpio registry lock poisoned");
        let input = match lines.get_mut(&line) {
            Some(ConfiguredLine::Input(input)) => input,
            Some(ConfiguredLine::Output(_)) => return Err(GpioError::NotAnInput(line)),
            None => return Err(GpioError::NotConfigured(line)),
        };
        *input.shared.latch_edge.lock().expect("gpio line lock poisoned") = Some(edge);
        input.set_debounce_if_unset(debounce);
        input.ensure_watching()
    }

    fn event_detected(&self, line: u8) -> bool {
        let lines = self.lines.lock().expect("gpio registry lock poisoned");
        match lines.get(&line) {
            Some(ConfiguredLine::Input(input)) => input.shared.latch.swap(false, Ordering::SeqCst),
            _ => false,
        }
    }

    fn cleanup(&self) {
        let mut lines = self.lines.lock().expect("gpio registry lock poisoned");
        for (line, configured) in lines.iter_mut() {
            if let ConfiguredLine::Output(pin) = configured {
                pin.set_low();
                debug!("De-energized gpio {}.", line);
            }
        }
        // dropping the pins releases them back to the OS
        lines.clear();
        warn!("GPIO released.");
    }
}
