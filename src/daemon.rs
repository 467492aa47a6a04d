//! Process-wide supervision: the LED registry, the shutdown and reboot
//! buttons, and the final de-energizing of everything the daemon touched.

use std::collections::HashMap;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::config::DaemonSettings;
use crate::externals::gpio::{Edge, GpioError, GpioService, Pull};

/// How long a button has to stay down before its action runs.
const BUTTON_HOLD_TIME: Duration = Duration::from_secs(2);
const BUTTON_DEBOUNCE: Duration = Duration::from_millis(50);
const BLINK_PERIOD: Duration = Duration::from_millis(500);
const BLINK_TIMES: u32 = 3;

pub struct Supervisor {
    gpio: Arc<dyn GpioService>,
    leds: Mutex<HashMap<String, u8>>,
}

impl Supervisor {
    pub fn new(gpio: Arc<dyn GpioService>) -> Arc<Self> {
        Arc::new(Self { gpio, leds: Mutex::new(HashMap::new()) })
    }

    /// Configure the ready LED and the shutdown/reboot buttons.
    pub fn setup(self: &Arc<Self>, settings: &DaemonSettings) -> Result<(), GpioError> {
        self.register_led("ready", settings.ready_led_gpio)?;
        self.register_hold_button(
            settings.shutdown_gpio,
            settings.shutdown_command.clone(),
            "Shutdown",
        )?;
        self.register_hold_button(settings.reboot_gpio, settings.reboot_command.clone(), "Reboot")
    }

    pub fn register_led(&self, name: &str, line: u8) -> Result<(), GpioError> {
        self.gpio.configure_output(line)?;
        self.leds.lock().expect("led registry lock poisoned").insert(name.to_string(), line);
        Ok(())
    }

    /// Turn a named LED on or off. Unknown names are a no-op.
    pub fn led(&self, name: &str, on: bool) {
        let line = self.leds.lock().expect("led registry lock poisoned").get(name).copied();
        if let Some(line) = line {
            if let Err(e) = self.gpio.write(line, on) {
                error!("Failed to drive the {} LED. Error: {}", name, e);
            }
        }
    }

    /// Blink a named LED, blocking the calling thread. Unknown names are
    /// a no-op. The LED ends up on.
    pub fn blink(&self, name: &str, period: Duration, times: u32) {
        let line = self.leds.lock().expect("led registry lock poisoned").get(name).copied();
        let Some(line) = line else { return };
        for _ in 0..times {
            let _ = self.gpio.write(line, false);
            thread::sleep(period);
            let _ = self.gpio.write(line, true);
            thread::sleep(period);
        }
    }

    /// De-energize every registered LED.
    pub fn shutdown_leds(&self) {
        let leds = self.leds.lock().expect("led registry lock poisoned");
        for line in leds.values() {
            let _ = self.gpio.write(*line, false);
        }
    }

    /// A button between the line and ground: pulled up, falling edge,
    /// confirmed by re-reading after a two second hold.
    fn register_hold_button(
        self: &Arc<Self>,
        line: u8,
        command: Vec<String>,
        action: &'static str,
    ) -> Result<(), GpioError> {
        self.gpio.configure_input(line, Pull::Up)?;
        let supervisor = Arc::clone(self);
        self.gpio.add_edge_callback(
            line,
            Edge::Falling,
            BUTTON_DEBOUNCE,
            Box::new(move |_| supervisor.handle_hold_button(line, &command, action)),
        )
    }

    /// Runs on the GPIO callback thread; blocking here is fine.
    fn handle_hold_button(&self, line: u8, command: &[String], action: &str) {
        info!("{} button pressed. Hold for 2s to confirm.", action);
        thread::sleep(BUTTON_HOLD_TIME);
        match self.gpio.read(line) {
            // negative logic: still low means still held down
            Ok(false) => {}
            _ => {
                info!("{} released, nothing to do.", action);
                return;
            }
        }
        self.blink("ready", BLINK_PERIOD, BLINK_TIMES);
        let Some((program, arguments)) = command.split_first() else {
            error!("No {} command configured.", action);
            return;
        };
        info!("Running the {} command.", action);
        if let Err(e) = Command::new(program).args(arguments).status() {
            error!("Failed to run the {} command. Error: {}", action, e);
        }
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::externals::gpio::mock::MockGpio;

    #[test]
    fn test_led_registry_drives_outputs() {
        let gpio = MockGpio::new();
        let supervisor = Supervisor::new(Arc::clone(&gpio) as Arc<dyn GpioService>);
        supervisor.register_led("ready", 18).unwrap();
        supervisor.led("ready", true);
        assert!(gpio.output(18));
        supervisor.led("ready", false);
        assert!(!gpio.output(18));
    }

    #[test]
    fn test_unknown_led_is_a_no_op() {
        let gpio = MockGpio::new();
        let supervisor = Supervisor::new(Arc::clone(&gpio) as Arc<dyn GpioService>);
        supervisor.led("missing", true);
        supervisor.blink("missing", Duration::from_millis(1), 2);
        assert!(gpio.write_history().is_empty());
    }

    #[test]
    fn test_blink_toggles_and_ends_on() {
        let gpio = MockGpio::new();
        let supervisor = Supervisor::new(Arc::clone(&gpio) as Arc<dyn GpioService>);
        supervisor.register_led("ready", 18).unwrap();
        supervisor.blink("ready", Duration::from_millis(1), 3);
        let writes = gpio.write_history();
        assert_eq!(writes.len(), 6);
        assert_eq!(writes.last(), Some(&(18, true)));
        assert!(gpio.output(18));
    }

    #[test]
    fn test_shutdown_leds_turns_everything_off() {
        let gpio = MockGpio::new();
        let supervisor = Supervisor::new(Arc::clone(&gpio) as Arc<dyn GpioService>);
        supervisor.register_led("ready", 18).unwrap();
        supervisor.led("ready", true);
        supervisor.shutdown_leds();
        assert!(!gpio.output(18));
    }
}
