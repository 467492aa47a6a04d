//! Valve bank drivers: two MCP23017-compatible port expanders on the I²C
//! bus, four 8-valve ports in total. Two interchangeable backends exist,
//! selected by the `output_driver` setting; both expose the same behaviour.

use std::collections::HashSet;

use thiserror::Error;

use crate::config::{InterfaceSettings, OutputDriver};

pub mod rppal;
pub mod smbus;

#[cfg(test)]
pub mod mock;

/// MCP23017 register map (IOCON.BANK = 0, sequential addressing).
pub(crate) const IODIRA: u8 = 0x00;
pub(crate) const GPIOA: u8 = 0x12;

#[derive(Error, Debug)]
pub enum ValveBankError {
    #[error("i2c bus error: {0}")]
    Bus(String),
}

/// Sink for signal combinations. The bits a driver asserts always equal
/// the set named in the last successful `valves_on`.
pub trait ValveBank: Send {
    /// Human-readable backend name for diagnostics.
    fn name(&self) -> &str;
    fn valves_on(&mut self, signals: &HashSet<String>) -> Result<(), ValveBankError>;
    fn valves_off(&mut self) -> Result<(), ValveBankError>;
}

pub fn create_valve_bank(
    settings: &InterfaceSettings,
) -> Result<Box<dyn ValveBank>, ValveBankError> {
    match settings.output_driver {
        OutputDriver::Smbus => Ok(Box::new(smbus::SmbusValveBank::new(settings)?)),
        OutputDriver::Rppal => Ok(Box::new(rppal::RppalValveBank::new(settings)?)),
    }
}

/// Compute one output port byte: bit i is set when the i-th valve name of
/// the port's tuple appears in the combination. Names outside the layout
/// are silently ignored.
pub fn port_byte(tuple: &[String], signals: &HashSet<String>) -> u8 {
    tuple
        .iter()
        .enumerate()
        .filter(|(_, name)| signals.contains(*name))
        .fold(0u8, |byte, (i, _)| byte | (1 << i))
}

/// The two port bytes of one expander device: device 0 drives valve
/// tuples 1 and 2, device 1 drives tuples 3 and 4.
pub fn device_bytes(
    layout: &[Vec<String>; 4],
    device: usize,
    signals: &HashSet<String>,
) -> [u8; 2] {
    [port_byte(&layout[device * 2], signals), port_byte(&layout[device * 2 + 1], signals)]
}
