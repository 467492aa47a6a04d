//! The per-machine control interface: a cycle-synchronous state machine
//! driving the valve bank in lockstep with the photocell, with the pump
//! and justification-wedge model derived from the signals it sends.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::InterfaceSettings;
use crate::externals::gpio::{Edge, GpioError, GpioService, Pull};
use crate::externals::valves::{ValveBank, ValveBankError};
use crate::models::mode::{
    ModeRequest, OperationMode, Row16Mode, Row16Request, UnknownMode, UnknownRow16Mode,
};
use crate::models::rpm::CycleMeter;
use crate::models::state::{MachineState, StateReport};
use crate::models::wedge::WedgePosition;
use crate::signals::{
    add_missing_o15, convert_hmn, convert_kmn, convert_o15, convert_unitshift, normalize,
    ordered_signals, strip_16, strip_o15,
};

/// Granularity of the sensor busy-wait.
const SENSOR_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Hold time of the motor start/stop pulse.
const MOTOR_PULSE: Duration = Duration::from_millis(500);
/// Revolutions the machine must complete before casting may begin.
const STARTUP_REVOLUTIONS: u32 = 3;

#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("unsupported operation mode: {0}")]
    UnsupportedMode(String),
    #[error("unsupported row 16 mode: {0}")]
    UnsupportedRow16Mode(String),
    #[error("interface is busy")]
    InterfaceBusy,
    #[error("interface is not started")]
    NotStarted,
    #[error("machine stopped")]
    MachineStopped,
    #[error(transparent)]
    Gpio(#[from] GpioError),
    #[error(transparent)]
    Valves(#[from] ValveBankError),
}

impl From<UnknownMode> for InterfaceError {
    fn from(err: UnknownMode) -> Self {
        Self::UnsupportedMode(err.0)
    }
}

impl From<UnknownRow16Mode> for InterfaceError {
    fn from(err: UnknownRow16Mode) -> Self {
        Self::UnsupportedRow16Mode(err.0)
    }
}

/// Valve actuation requested over the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValveRequest {
    /// Report the current combination without touching anything.
    Query,
    Off,
    On(Vec<String>),
}

/// Photocell state shared with the GPIO edge callback. The callback runs
/// on the GPIO library's thread, the interface polls from the cycle loop.
pub struct SensorWatch {
    level: AtomicBool,
    meter: CycleMeter,
}

impl SensorWatch {
    fn new() -> Self {
        Self { level: AtomicBool::new(false), meter: CycleMeter::new() }
    }

    pub fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    fn record_edge(&self, rising: bool) {
        self.level.store(rising, Ordering::SeqCst);
        if rising {
            self.meter.record(Instant::now());
        }
    }
}

pub struct Interface {
    name: String,
    settings: InterfaceSettings,
    gpio: Arc<dyn GpioService>,
    valves: Box<dyn ValveBank>,
    signal_order: Vec<String>,
    sensor: Arc<SensorWatch>,
    state: MachineState,
    signals: Vec<String>,
    /// Explicit mode overrides; `None` substitutes the configured default.
    operation_mode: Option<OperationMode>,
    row16_mode: Option<Option<Row16Mode>>,
    /// Mode the machine was started in. Casting cycles are refused unless
    /// the machine was brought up for casting (water and motor running).
    startup_mode: Option<OperationMode>,
}

impl Interface {
    pub fn new(
        name: impl Into<String>,
        settings: InterfaceSettings,
        gpio: Arc<dyn GpioService>,
        valves: Box<dyn ValveBank>,
    ) -> Result<Self, InterfaceError> {
        let pins = settings.pins;
        gpio.configure_input(pins.sensor, Pull::None)?;
        gpio.configure_input(pins.emergency_stop, Pull::None)?;
        for line in
            [pins.error_led, pins.working_led, pins.air, pins.water, pins.motor_start, pins.motor_stop]
        {
            gpio.configure_output(line)?;
        }
        gpio.enable_edge_latch(pins.emergency_stop, Edge::Falling, settings.debounce)?;

        let sensor = Arc::new(SensorWatch::new());
        let watch = Arc::clone(&sensor);
        gpio.add_edge_callback(
            pins.sensor,
            Edge::Both,
            settings.debounce,
            Box::new(move |rising| watch.record_edge(rising)),
        )?;

        let signal_order = settings.signal_order();
        Ok(Self {
            name: name.into(),
            settings,
            gpio,
            valves,
            signal_order,
            sensor,
            state: MachineState::default(),
            signals: Vec::new(),
            operation_mode: None,
            row16_mode: None,
            startup_mode: None,
        })
    }

    pub fn description(&self) -> String {
        format!("Raspberry Pi interface ({})", self.valves.name())
    }

    pub fn operation_mode(&self) -> OperationMode {
        self.operation_mode.unwrap_or(self.settings.default_mode)
    }

    pub fn row16_mode(&self) -> Option<Row16Mode> {
        self.row16_mode.unwrap_or(self.settings.default_row16_mode)
    }

    pub fn set_operation_mode(
        &mut self,
        request: ModeRequest,
    ) -> Result<OperationMode, InterfaceError> {
        match request {
            ModeRequest::Reset => self.operation_mode = None,
            ModeRequest::Set(OperationMode::Testing) => {
                self.operation_mode = Some(OperationMode::Testing);
            }
            ModeRequest::Set(mode) => {
                if !self.settings.supported_modes.contains(&mode) {
                    return Err(InterfaceError::UnsupportedMode(mode.to_string()));
                }
                self.operation_mode = Some(mode);
            }
        }
        Ok(self.operation_mode())
    }

    pub fn set_row16_mode(
        &mut self,
        request: Row16Request,
    ) -> Result<Option<Row16Mode>, InterfaceError> {
        match request {
            Row16Request::Reset => self.row16_mode = None,
            Row16Request::Set(None) => self.row16_mode = Some(None),
            Row16Request::Set(Some(mode))
                if self.operation_mode() == OperationMode::Casting =>
            {
                if !self.settings.supported_row16_modes.contains(&mode) {
                    return Err(InterfaceError::UnsupportedRow16Mode(mode.to_string()));
                }
                self.row16_mode = Some(Some(mode));
            }
            // testing and punching take any of the known attachments
            Row16Request::Set(Some(mode)) => self.row16_mode = Some(Some(mode)),
        }
        Ok(self.row16_mode())
    }

    pub fn rpm(&self) -> f64 {
        self.sensor.meter.rpm(self.settings.sensor_timeout)
    }

    pub fn state_report(&self) -> StateReport {
        StateReport {
            working: self.state.working,
            air: self.state.air,
            water: self.state.water,
            motor: self.state.motor,
            pump: self.state.pump,
            sensor: self.sensor.level(),
            wedge_0005: self.state.wedge_0005.get(),
            wedge_0075: self.state.wedge_0075.get(),
            signals: self.signals.clone(),
            operation_mode: match self.operation_mode() {
                OperationMode::Testing => None,
                mode => Some(mode),
            },
            row16_mode: self.row16_mode(),
            speed_rpm: self.rpm(),
            output_driver: self.valves.name().to_string(),
        }
    }

    /// Start, stop or query the machine. `None` only reports.
    pub async fn machine_control(
        &mut self,
        request: Option<bool>,
    ) -> Result<bool, InterfaceError> {
        match request {
            None => {}
            Some(true) => {
                let outcome = self.start_machine().await;
                self.stop_on_machine_halt(outcome).await?;
            }
            Some(false) => self.stop_machine().await?,
        }
        Ok(self.state.working)
    }

    /// Start, stop or query the metal pump. Both directions execute as
    /// ordinary signal cycles in the active operation mode.
    pub async fn pump_control(&mut self, request: Option<bool>) -> Result<bool, InterfaceError> {
        match request {
            None => {}
            Some(true) => {
                let outcome = self.pump_start().await;
                self.stop_on_machine_halt(outcome).await?;
            }
            Some(false) => {
                let outcome = self.pump_stop().await;
                self.stop_on_machine_halt(outcome).await?;
            }
        }
        Ok(self.state.pump)
    }

    /// Direct valve actuation. Does not apply any mode conversion and does
    /// not require the machine to be started. Turning the valves off keeps
    /// the stored combination: the pump model may still need it.
    pub async fn valves_control(
        &mut self,
        request: ValveRequest,
    ) -> Result<Vec<String>, InterfaceError> {
        let outcome = match request {
            ValveRequest::Query => self.valves_query_checked(),
            ValveRequest::On(raw) => {
                let combination = normalize(&raw);
                self.valves_on_checked(&combination)
            }
            ValveRequest::Off => self.valves_off_checked(),
        };
        self.stop_on_machine_halt(outcome).await?;
        Ok(self.signals.clone())
    }

    /// Send one combination to the caster or perforator, dispatching on
    /// the operation mode.
    pub async fn send_signals(
        &mut self,
        raw: &[String],
        timeout: Option<Duration>,
    ) -> Result<Vec<String>, InterfaceError> {
        let outcome = self.send_signals_inner(raw, timeout).await;
        self.stop_on_machine_halt(outcome).await?;
        Ok(self.signals.clone())
    }

    /// Single or double justification. The send order preserves whatever
    /// pump state was active before the sequence.
    pub async fn justification(
        &mut self,
        galley_trip: bool,
        wedge_0005: Option<WedgePosition>,
        wedge_0075: Option<WedgePosition>,
    ) -> Result<(), InterfaceError> {
        let outcome = self.justification_inner(galley_trip, wedge_0005, wedge_0075).await;
        self.stop_on_machine_halt(outcome).await
    }

    async fn justification_inner(
        &mut self,
        galley_trip: bool,
        wedge_0005: Option<WedgePosition>,
        wedge_0075: Option<WedgePosition>,
    ) -> Result<(), InterfaceError> {
        let pump_working = self.state.pump;
        let current_0005 = self.state.wedge_0005;
        let current_0075 = self.state.wedge_0075;
        let new_0005 = wedge_0005.unwrap_or(current_0005);
        let new_0075 = wedge_0075.unwrap_or(current_0075);

        if galley_trip {
            if pump_working {
                self.send_double_justification(new_0005).await?;
                self.send_0075(new_0075).await?;
            } else {
                self.send_double_justification(new_0075).await?;
                self.send_0005(new_0005).await?;
            }
        } else if new_0005 == current_0005 && new_0075 == current_0075 {
            // nothing to adjust
        } else if pump_working {
            self.send_0005(new_0005).await?;
            self.send_0075(new_0075).await?;
        } else {
            self.send_0075(new_0075).await?;
            self.send_0005(new_0005).await?;
        }
        Ok(())
    }

    async fn send_double_justification(
        &mut self,
        row: WedgePosition,
    ) -> Result<(), InterfaceError> {
        self.send_code(&["N", "K", "J", "S", "0075", "0005"], row).await
    }

    async fn send_0005(&mut self, row: WedgePosition) -> Result<(), InterfaceError> {
        self.send_code(&["N", "J", "S", "0005"], row).await
    }

    async fn send_0075(&mut self, row: WedgePosition) -> Result<(), InterfaceError> {
        self.send_code(&["N", "K", "S", "0075"], row).await
    }

    async fn send_code(
        &mut self,
        code: &[&str],
        row: WedgePosition,
    ) -> Result<(), InterfaceError> {
        let mut combination: Vec<String> = code.iter().map(|s| s.to_string()).collect();
        combination.push(row.row_signal());
        self.send_signals_inner(&combination, None).await
    }

    async fn send_signals_inner(
        &mut self,
        raw: &[String],
        timeout: Option<Duration>,
    ) -> Result<(), InterfaceError> {
        if !self.state.working {
            return Err(InterfaceError::NotStarted);
        }
        match self.operation_mode() {
            OperationMode::Casting => self.cast(raw, timeout).await,
            OperationMode::Punching => self.punch(raw).await,
            OperationMode::Testing => self.test(raw).await,
        }
    }

    /// Composition caster: wait for the sensor to go on, open the valves,
    /// wait for it to go off, close them.
    async fn cast(&mut self, raw: &[String], timeout: Option<Duration>) -> Result<(), InterfaceError> {
        if self.startup_mode != Some(OperationMode::Casting) {
            // the machine was not brought up for casting, water and motor
            // cannot be assumed to be running
            return Err(InterfaceError::NotStarted);
        }
        let combination = self.prepare_signals(raw);
        let timeout = timeout.unwrap_or(self.settings.sensor_timeout);
        self.wait_for_sensor(true, timeout).await?;
        self.valves_on_checked(&combination)?;
        self.wait_for_sensor(false, timeout).await?;
        self.valves_off_checked()?;
        Ok(())
    }

    /// Timer-driven ribbon perforator.
    async fn punch(&mut self, raw: &[String]) -> Result<(), InterfaceError> {
        let combination = self.prepare_signals(raw);
        self.valves_on_checked(&combination)?;
        sleep(self.settings.punching_on_time).await;
        self.valves_off_checked()?;
        sleep(self.settings.punching_off_time).await;
        Ok(())
    }

    /// Testing: the previous combination goes down before the new one
    /// comes up.
    async fn test(&mut self, raw: &[String]) -> Result<(), InterfaceError> {
        let combination = self.prepare_signals(raw);
        self.valves_off_checked()?;
        self.valves_on_checked(&combination)?;
        Ok(())
    }

    /// Apply the row 16 conversion for the current addressing mode, then
    /// the O/15 handling for the current operation mode.
    fn prepare_signals(&self, raw: &[String]) -> HashSet<String> {
        let combination = normalize(raw);
        let combination = match self.row16_mode() {
            None => strip_16(&combination),
            Some(Row16Mode::Hmn) => convert_hmn(&combination),
            Some(Row16Mode::Kmn) => convert_kmn(&combination),
            Some(Row16Mode::UnitShift) => convert_unitshift(&combination),
        };
        match self.operation_mode() {
            OperationMode::Casting => strip_o15(&combination),
            OperationMode::Punching => add_missing_o15(&combination),
            OperationMode::Testing => convert_o15(&combination),
        }
    }

    async fn pump_start(&mut self) -> Result<(), InterfaceError> {
        let row = self.state.wedge_0075;
        info!("Starting the pump, 0075 wedge at {}.", row);
        self.send_0075(row).await
    }

    /// Stop the pump if it is working. The stop combination goes out twice
    /// per attempt so the latch reliably disengages; the error LED marks
    /// the procedure and the working LED is restored afterwards.
    async fn pump_stop(&mut self) -> Result<(), InterfaceError> {
        if !self.state.pump {
            return Ok(());
        }
        let pins = self.settings.pins;
        let working_led_was_on = self.gpio.read(pins.working_led)?;
        if working_led_was_on {
            self.gpio.write(pins.working_led, false)?;
        }
        self.gpio.write(pins.error_led, true)?;
        info!("Stopping the pump, 0005 wedge at {}.", self.state.wedge_0005);

        let timeout = self.settings.pump_stop_timeout;
        let row = self.state.wedge_0005;
        let mut combination: Vec<String> =
            ["N", "J", "S", "0005"].iter().map(|s| s.to_string()).collect();
        combination.push(row.row_signal());
        while self.state.pump {
            self.send_signals_inner(&combination, Some(timeout)).await?;
            self.send_signals_inner(&combination, Some(timeout)).await?;
        }

        self.gpio.write(pins.error_led, false)?;
        if working_led_was_on {
            self.gpio.write(pins.working_led, true)?;
        }
        Ok(())
    }

    async fn start_machine(&mut self) -> Result<(), InterfaceError> {
        if self.state.working {
            return Err(InterfaceError::InterfaceBusy);
        }
        self.check_emergency_stop()?;
        self.sensor.meter.clear();
        let mode = self.operation_mode();
        info!("Interface {}: starting the machine for {}.", self.name, mode);
        let outcome = self.bring_up(mode).await;
        if let Err(error) = outcome {
            // a failed start must not leave air, water or motor energized
            self.shut_down_outputs(mode == OperationMode::Casting).await?;
            return Err(error);
        }
        self.gpio.write(self.settings.pins.working_led, true)?;
        self.state.working = true;
        self.startup_mode = Some(mode);
        Ok(())
    }

    async fn bring_up(&mut self, mode: OperationMode) -> Result<(), InterfaceError> {
        self.air_control(true)?;
        if mode == OperationMode::Casting {
            self.water_control(true)?;
            self.motor_control(true).await?;
            self.check_rotation(STARTUP_REVOLUTIONS).await?;
        }
        self.check_emergency_stop()
    }

    async fn stop_machine(&mut self) -> Result<(), InterfaceError> {
        if !self.state.working {
            return Ok(());
        }
        info!("Interface {}: stopping the machine.", self.name);
        // if the machine is physically stopped the pump cannot be cycled
        // off; the teardown still completes and the error propagates last
        let pump_outcome = self.pump_stop().await;
        self.valves.valves_off()?;
        self.signals.clear();
        let casting = self.startup_mode == Some(OperationMode::Casting);
        self.shut_down_outputs(casting).await?;
        self.gpio.write(self.settings.pins.working_led, false)?;
        self.state.working = false;
        self.startup_mode = None;
        pump_outcome
    }

    async fn shut_down_outputs(&mut self, casting: bool) -> Result<(), InterfaceError> {
        if casting {
            self.motor_control(false).await?;
            self.water_control(false)?;
        }
        self.air_control(false)
    }

    /// The machine must complete a few revolutions before casting starts.
    async fn check_rotation(&mut self, revolutions: u32) -> Result<(), InterfaceError> {
        let timeout = self.settings.startup_timeout;
        for _ in 0..revolutions {
            self.wait_for_sensor(true, timeout).await?;
            self.wait_for_sensor(false, timeout).await?;
        }
        Ok(())
    }

    /// Busy-wait until the photocell reaches the desired state. Every
    /// iteration also polls the emergency-stop latch.
    async fn wait_for_sensor(
        &mut self,
        desired: bool,
        timeout: Duration,
    ) -> Result<(), InterfaceError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_emergency_stop()?;
            if self.sensor.level() == desired {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("Sensor timed out waiting for {}.", if desired { "on" } else { "off" });
                return Err(InterfaceError::MachineStopped);
            }
            sleep(SENSOR_POLL_INTERVAL).await;
        }
    }

    fn valves_on_checked(&mut self, combination: &HashSet<String>) -> Result<(), InterfaceError> {
        self.check_emergency_stop()?;
        self.valves.valves_on(combination)?;
        debug!("Valves on: {:?}.", combination);
        self.update_pump_and_wedges(combination);
        self.signals = ordered_signals(combination, &self.signal_order);
        self.check_emergency_stop()
    }

    fn valves_off_checked(&mut self) -> Result<(), InterfaceError> {
        self.check_emergency_stop()?;
        self.valves.valves_off()?;
        self.check_emergency_stop()
    }

    /// A query touches nothing, but still runs inside the guard.
    fn valves_query_checked(&self) -> Result<(), InterfaceError> {
        self.check_emergency_stop()?;
        self.check_emergency_stop()
    }

    /// Derive the pump state and wedge positions from a combination that
    /// was accepted by the valve bank. 0075 (or N+K) starts the pump and
    /// sets the 0075 wedge, 0005 (or N+J) stops it and sets the 0005
    /// wedge; the wedge goes to the smallest row code present, or 15.
    fn update_pump_and_wedges(&mut self, combination: &HashSet<String>) {
        let has = |name: &str| combination.contains(name);
        let pump_start = has("0075") || (has("N") && has("K"));
        let pump_stop = has("0005") || (has("N") && has("J"));
        if pump_start {
            self.state.pump = true;
        } else if pump_stop {
            self.state.pump = false;
        }
        if pump_start {
            self.state.wedge_0075 = smallest_row_code(combination);
        }
        if pump_stop {
            self.state.wedge_0005 = smallest_row_code(combination);
        }
    }

    fn check_emergency_stop(&self) -> Result<(), InterfaceError> {
        if self.gpio.event_detected(self.settings.pins.emergency_stop) {
            warn!("Emergency stop edge detected.");
            return Err(InterfaceError::MachineStopped);
        }
        Ok(())
    }

    /// The safety envelope: a machine-stopped outcome always runs the stop
    /// path before the error reaches the caller.
    async fn stop_on_machine_halt<T>(
        &mut self,
        outcome: Result<T, InterfaceError>,
    ) -> Result<T, InterfaceError> {
        if matches!(&outcome, Err(InterfaceError::MachineStopped)) {
            if let Err(error) = self.stop_machine().await {
                warn!("Stop after machine halt reported: {}.", error);
            }
        }
        outcome
    }

    fn air_control(&mut self, on: bool) -> Result<(), InterfaceError> {
        self.check_emergency_stop()?;
        self.gpio.write(self.settings.pins.air, on)?;
        self.state.air = on;
        self.check_emergency_stop()
    }

    fn water_control(&mut self, on: bool) -> Result<(), InterfaceError> {
        self.check_emergency_stop()?;
        self.gpio.write(self.settings.pins.water, on)?;
        self.state.water = on;
        self.check_emergency_stop()
    }

    /// The motor contactor takes a pulse on its start or stop line.
    async fn motor_control(&mut self, on: bool) -> Result<(), InterfaceError> {
        self.check_emergency_stop()?;
        let pins = self.settings.pins;
        let pin = if on { pins.motor_start } else { pins.motor_stop };
        self.gpio.write(pin, true)?;
        sleep(MOTOR_PULSE).await;
        self.gpio.write(pin, false)?;
        self.state.motor = on;
        if !on {
            self.sensor.meter.clear();
        }
        self.check_emergency_stop()
    }
}

fn smallest_row_code(combination: &HashSet<String>) -> WedgePosition {
    (1..=14u8)
        .find(|row| combination.contains(&row.to_string()))
        .and_then(|row| WedgePosition::try_from(row).ok())
        .unwrap_or(WedgePosition::MAX)
}
