//! Configuration handling for the daemon.
//!
//! The configuration lives in an INI file. `[DEFAULT]` holds daemon-wide
//! options and the fallback values; every other section describes one
//! machine interface and may override any subset of the defaults.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::models::mode::{OperationMode, Row16Mode};

pub const CONFIGURATION_PATH: &str = "/etc/rpi2casterd.conf";

/// Stock values, used when neither the interface section nor `[DEFAULT]`
/// provides a key. These mirror the wiring of the reference controller board.
static DEFAULTS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("listen_address", "0.0.0.0:23017"),
        ("output_driver", "smbus"),
        ("shutdown_gpio", "24"),
        ("shutdown_command", "shutdown -h now"),
        ("reboot_gpio", "23"),
        ("reboot_command", "shutdown -r now"),
        ("startup_timeout", "30"),
        ("sensor_timeout", "5"),
        ("pump_stop_timeout", "120"),
        ("punching_on_time", "0.2"),
        ("punching_off_time", "0.3"),
        ("debounce_milliseconds", "25"),
        ("ready_led_gpio", "18"),
        ("sensor_gpio", "17"),
        ("working_led_gpio", "25"),
        ("error_led_gpio", "26"),
        ("air_gpio", "19"),
        ("water_gpio", "13"),
        ("emergency_stop_gpio", "22"),
        ("motor_start_gpio", "5"),
        ("motor_stop_gpio", "6"),
        ("i2c_bus", "1"),
        ("mcp0_address", "0x20"),
        ("mcp1_address", "0x21"),
        ("valve1", "N,M,L,K,J,I,H,G"),
        ("valve2", "F,S,E,D,0075,C,B,A"),
        ("valve3", "1,2,3,4,5,6,7,8"),
        ("valve4", "9,10,11,12,13,14,0005,O15"),
        ("supported_modes", "casting, punching"),
        ("supported_row16_modes", "HMN, KMN, unit shift"),
        ("default_mode", "casting"),
        ("default_row16_mode", "off"),
    ])
});

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    File(String),
    #[error("missing configuration key: {0}")]
    MissingKey(&'static str),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("unknown output driver: {0}")]
    UnknownDriver(String),
}

/// Which low-level library drives the valve expanders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum OutputDriver {
    #[display(fmt = "smbus")]
    Smbus,
    #[display(fmt = "rppal")]
    Rppal,
}

impl FromStr for OutputDriver {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "smbus" => Ok(Self::Smbus),
            "rppal" => Ok(Self::Rppal),
            other => Err(ConfigError::UnknownDriver(other.to_string())),
        }
    }
}

/// GPIO lines controlled by one interface.
#[derive(Debug, Clone, Copy)]
pub struct ControlPins {
    pub sensor: u8,
    pub emergency_stop: u8,
    pub error_led: u8,
    pub working_led: u8,
    pub air: u8,
    pub water: u8,
    pub motor_start: u8,
    pub motor_stop: u8,
}

/// Immutable per-interface configuration.
#[derive(Debug, Clone)]
pub struct InterfaceSettings {
    pub pins: ControlPins,
    pub i2c_bus: u8,
    pub mcp0_address: u16,
    pub mcp1_address: u16,
    pub valve_layout: [Vec<String>; 4],
    pub startup_timeout: Duration,
    pub sensor_timeout: Duration,
    pub pump_stop_timeout: Duration,
    pub punching_on_time: Duration,
    pub punching_off_time: Duration,
    pub debounce: Duration,
    pub supported_modes: HashSet<OperationMode>,
    pub supported_row16_modes: HashSet<Row16Mode>,
    pub default_mode: OperationMode,
    pub default_row16_mode: Option<Row16Mode>,
    pub output_driver: OutputDriver,
}

impl InterfaceSettings {
    /// Canonical wire order of all valve names: the concatenation of the
    /// four configured tuples.
    pub fn signal_order(&self) -> Vec<String> {
        self.valve_layout.iter().flatten().cloned().collect()
    }
}

/// Daemon-wide options taken from `[DEFAULT]`.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub listen_address: (String, u16),
    pub ready_led_gpio: u8,
    pub shutdown_gpio: u8,
    pub shutdown_command: Vec<String>,
    pub reboot_gpio: u8,
    pub reboot_command: Vec<String>,
    pub debounce: Duration,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub daemon: DaemonSettings,
    pub interfaces: Vec<(String, InterfaceSettings)>,
}

pub fn load(path: &str) -> Result<Configuration, ConfigError> {
    let ini = Ini::load_from_file(path).map_err(|e| ConfigError::File(e.to_string()))?;
    parse_ini(&ini)
}

pub fn load_from_str(content: &str) -> Result<Configuration, ConfigError> {
    let ini = Ini::load_from_str(content).map_err(|e| ConfigError::File(e.to_string()))?;
    parse_ini(&ini)
}

fn parse_ini(ini: &Ini) -> Result<Configuration, ConfigError> {
    let defaults = SectionView { ini, name: None };
    let daemon = parse_daemon_settings(&defaults)?;
    let mut interfaces = Vec::new();
    for (section, _) in ini.iter() {
        let section = match section {
            Some(name) if !name.eq_ignore_ascii_case("default") => name,
            _ => continue,
        };
        let view = SectionView { ini, name: Some(section) };
        let settings = parse_configuration(&view)?;
        interfaces.push((section.trim().to_lowercase(), settings));
    }
    Ok(Configuration { daemon, interfaces })
}

fn parse_daemon_settings(view: &SectionView) -> Result<DaemonSettings, ConfigError> {
    Ok(DaemonSettings {
        listen_address: view.address("listen_address")?,
        ready_led_gpio: view.integer("ready_led_gpio")?,
        shutdown_gpio: view.integer("shutdown_gpio")?,
        shutdown_command: parse_command(view.require("shutdown_command")?),
        reboot_gpio: view.integer("reboot_gpio")?,
        reboot_command: parse_command(view.require("reboot_command")?),
        debounce: Duration::from_millis(view.integer::<u64>("debounce_milliseconds")?),
    })
}

/// Assemble the settings of one interface section, inheriting from
/// `[DEFAULT]` and the stock values.
pub fn parse_configuration(view: &SectionView) -> Result<InterfaceSettings, ConfigError> {
    let pins = ControlPins {
        sensor: view.integer("sensor_gpio")?,
        emergency_stop: view.integer("emergency_stop_gpio")?,
        error_led: view.integer("error_led_gpio")?,
        working_led: view.integer("working_led_gpio")?,
        air: view.integer("air_gpio")?,
        water: view.integer("water_gpio")?,
        motor_start: view.integer("motor_start_gpio")?,
        motor_stop: view.integer("motor_stop_gpio")?,
    };
    let valve_layout = [
        view.valve_tuple("valve1")?,
        view.valve_tuple("valve2")?,
        view.valve_tuple("valve3")?,
        view.valve_tuple("valve4")?,
    ];

    let mut supported_modes = HashSet::new();
    for raw in parse_list(view.require("supported_modes")?) {
        let mode = raw.parse::<OperationMode>().map_err(|_| ConfigError::InvalidValue {
            key: "supported_modes",
            value: raw.clone(),
        })?;
        supported_modes.insert(mode);
    }
    let mut supported_row16_modes = HashSet::new();
    for raw in parse_list(view.require("supported_row16_modes")?) {
        let mode = raw.parse::<Row16Mode>().map_err(|_| ConfigError::InvalidValue {
            key: "supported_row16_modes",
            value: raw.clone(),
        })?;
        supported_row16_modes.insert(mode);
    }

    let default_mode_raw = view.require("default_mode")?;
    let default_mode =
        default_mode_raw.parse::<OperationMode>().map_err(|_| ConfigError::InvalidValue {
            key: "default_mode",
            value: default_mode_raw.to_string(),
        })?;

    let row16_raw = view.require("default_row16_mode")?;
    let default_row16_mode = match parse_boolean(row16_raw) {
        // "off" (or any other falsy value) disables the attachment by default
        Some(false) => None,
        Some(true) => {
            return Err(ConfigError::InvalidValue {
                key: "default_row16_mode",
                value: row16_raw.to_string(),
            })
        }
        None => Some(row16_raw.parse::<Row16Mode>().map_err(|_| ConfigError::InvalidValue {
            key: "default_row16_mode",
            value: row16_raw.to_string(),
        })?),
    };

    Ok(InterfaceSettings {
        pins,
        i2c_bus: view.integer("i2c_bus")?,
        mcp0_address: view.hex_address("mcp0_address")?,
        mcp1_address: view.hex_address("mcp1_address")?,
        valve_layout,
        startup_timeout: view.seconds("startup_timeout")?,
        sensor_timeout: view.seconds("sensor_timeout")?,
        pump_stop_timeout: view.seconds("pump_stop_timeout")?,
        punching_on_time: view.seconds("punching_on_time")?,
        punching_off_time: view.seconds("punching_off_time")?,
        debounce: Duration::from_millis(view.integer::<u64>("debounce_milliseconds")?),
        supported_modes,
        supported_row16_modes,
        default_mode,
        default_row16_mode,
        output_driver: view.require("output_driver")?.parse()?,
    })
}

/// Key lookup for one section: section values shadow `[DEFAULT]`, which
/// shadows the stock values.
pub struct SectionView<'a> {
    ini: &'a Ini,
    name: Option<&'a str>,
}

impl<'a> SectionView<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        if let Some(name) = self.name {
            if let Some(value) = self.ini.section(Some(name)).and_then(|p| p.get(key)) {
                return Some(value);
            }
        }
        if let Some(value) = self.ini.section(Some("DEFAULT")).and_then(|p| p.get(key)) {
            return Some(value);
        }
        if let Some(value) = self.ini.section(None::<String>).and_then(|p| p.get(key)) {
            return Some(value);
        }
        DEFAULTS.get(key).copied()
    }

    fn require(&self, key: &'static str) -> Result<&str, ConfigError> {
        self.get(key).ok_or(ConfigError::MissingKey(key))
    }

    fn integer<T: FromStr>(&self, key: &'static str) -> Result<T, ConfigError> {
        let raw = self.require(key)?;
        parse_integer(raw).ok_or_else(|| ConfigError::InvalidValue { key, value: raw.to_string() })
    }

    fn hex_address(&self, key: &'static str) -> Result<u16, ConfigError> {
        let raw = self.require(key)?;
        parse_hex_address(raw)
            .ok_or_else(|| ConfigError::InvalidValue { key, value: raw.to_string() })
    }

    fn seconds(&self, key: &'static str) -> Result<Duration, ConfigError> {
        let raw = self.require(key)?;
        parse_seconds(raw).ok_or_else(|| ConfigError::InvalidValue { key, value: raw.to_string() })
    }

    fn address(&self, key: &'static str) -> Result<(String, u16), ConfigError> {
        let raw = self.require(key)?;
        address_and_port(raw)
            .ok_or_else(|| ConfigError::InvalidValue { key, value: raw.to_string() })
    }

    fn valve_tuple(&self, key: &'static str) -> Result<Vec<String>, ConfigError> {
        let raw = self.require(key)?;
        let names: Vec<String> = parse_list(raw).iter().map(|s| s.to_uppercase()).collect();
        if names.len() != 8 {
            return Err(ConfigError::InvalidValue { key, value: raw.to_string() });
        }
        Ok(names)
    }
}

/// "host:port" into its two components.
pub fn address_and_port(raw: &str) -> Option<(String, u16)> {
    let (host, port) = raw.trim().rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

/// Truthy/falsy configuration values.
pub fn parse_boolean(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "none" => Some(false),
        _ => None,
    }
}

pub fn parse_integer<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

/// A duration given in (possibly fractional) seconds.
pub fn parse_seconds(raw: &str) -> Option<Duration> {
    let seconds: f64 = raw.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

/// Comma-separated list of trimmed tokens.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

/// A shell command split into argv.
pub fn parse_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// An I²C device address, "0x20" style or plain decimal.
pub fn parse_hex_address(raw: &str) -> Option<u16> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        raw.parse().ok()
    }
}

#[cfg(test)]
mod testing {
    use super::*;

    #[test]
    fn test_primitive_parsers() {
        assert_eq!(address_and_port("0.0.0.0:23017"), Some(("0.0.0.0".to_string(), 23017)));
        assert_eq!(address_and_port("23017"), None);
        assert_eq!(parse_boolean("Yes"), Some(true));
        assert_eq!(parse_boolean("off"), Some(false));
        assert_eq!(parse_boolean("maybe"), None);
        assert_eq!(parse_seconds("0.2"), Some(Duration::from_millis(200)));
        assert_eq!(parse_seconds("-1"), None);
        assert_eq!(parse_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert_eq!(parse_command("shutdown -h now"), vec!["shutdown", "-h", "now"]);
        assert_eq!(parse_hex_address("0x20"), Some(0x20));
        assert_eq!(parse_hex_address("33"), Some(33));
        assert_eq!(parse_integer::<u8>("17"), Some(17));
    }

    #[test]
    fn test_stock_defaults_cover_an_empty_section() {
        let configuration = load_from_str("[caster]\n").expect("Failed to parse configuration.");
        assert_eq!(configuration.interfaces.len(), 1);
        let (name, settings) = &configuration.interfaces[0];
        assert_eq!(name, "caster");
        assert_eq!(settings.pins.sensor, 17);
        assert_eq!(settings.pins.emergency_stop, 22);
        assert_eq!(settings.i2c_bus, 1);
        assert_eq!(settings.mcp0_address, 0x20);
        assert_eq!(settings.mcp1_address, 0x21);
        assert_eq!(settings.sensor_timeout, Duration::from_secs(5));
        assert_eq!(settings.punching_on_time, Duration::from_millis(200));
        assert_eq!(settings.debounce, Duration::from_millis(25));
        assert_eq!(settings.default_mode, OperationMode::Casting);
        assert_eq!(settings.default_row16_mode, None);
        assert_eq!(settings.output_driver, OutputDriver::Smbus);
        assert!(settings.supported_modes.contains(&OperationMode::Casting));
        assert!(settings.supported_row16_modes.contains(&Row16Mode::UnitShift));
        assert_eq!(settings.valve_layout[3][7], "O15");
        assert_eq!(configuration.daemon.listen_address.1, 23017);
        assert_eq!(configuration.daemon.shutdown_command, vec!["shutdown", "-h", "now"]);
    }

    #[test]
    fn test_section_overrides_defaults() {
        let content = "\
[DEFAULT]
sensor_timeout = 10

[perforator]
default_mode = punching
sensor_gpio = 7
output_driver = rppal
";
        let configuration = load_from_str(content).expect("Failed to parse configuration.");
        let (_, settings) = &configuration.interfaces[0];
        assert_eq!(settings.default_mode, OperationMode::Punching);
        assert_eq!(settings.pins.sensor, 7);
        assert_eq!(settings.pins.air, 19);
        assert_eq!(settings.sensor_timeout, Duration::from_secs(10));
        assert_eq!(settings.output_driver, OutputDriver::Rppal);
    }

    #[test]
    fn test_signal_order_concatenates_valve_tuples() {
        let configuration = load_from_str("[caster]\n").unwrap();
        let order = configuration.interfaces[0].1.signal_order();
        assert_eq!(order.len(), 32);
        assert_eq!(order[0], "N");
        assert_eq!(order[8], "F");
        assert_eq!(order[31], "O15");
    }

    #[test]
    fn test_bad_values_are_structured_errors() {
        let err = load_from_str("[caster]\nsensor_gpio = banana\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "sensor_gpio", .. }));

        let err = load_from_str("[caster]\nvalve1 = A,B,C\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "valve1", .. }));

        let err = load_from_str("[caster]\noutput_driver = wiringpi\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDriver(_)));
    }

    #[test]
    fn test_row16_default_parses_mode_names() {
        let configuration =
            load_from_str("[caster]\ndefault_row16_mode = unit shift\n").unwrap();
        assert_eq!(
            configuration.interfaces[0].1.default_row16_mode,
            Some(Row16Mode::UnitShift)
        );
    }
}
