use std::collections::HashSet;

use rppal::i2c::I2c;
use tracing::debug;

use super::{device_bytes, ValveBank, ValveBankError, GPIOA, IODIRA};
use crate::config::InterfaceSettings;

/// Valve bank over the Raspberry Pi peripheral library's I²C master.
/// Observationally identical to the SMBus backend.
pub struct RppalValveBank {
    bus: I2c,
    addresses: [u16; 2],
    layout: [Vec<String>; 4],
}

impl RppalValveBank {
    pub fn new(settings: &InterfaceSettings) -> Result<Self, ValveBankError> {
        let bus = I2c::with_bus(settings.i2c_bus)
            .map_err(|e| ValveBankError::Bus(e.to_string()))?;
        let mut bank = Self {
            bus,
            addresses: [settings.mcp0_address, settings.mcp1_address],
            layout: settings.valve_layout.clone(),
        };
        for index in 0..bank.addresses.len() {
            bank.write_block(index, IODIRA, &[0x00, 0x00])?;
        }
        Ok(bank)
    }

    fn write_block(
        &mut self,
        device: usize,
        register: u8,
        bytes: &[u8],
    ) -> Result<(), ValveBankError> {
        self.bus
            .set_slave_address(self.addresses[device])
            .map_err(|e| ValveBankError::Bus(e.to_string()))?;
        self.bus
            .block_write(register, bytes)
            .map_err(|e| ValveBankError::Bus(e.to_string()))?;
        Ok(())
    }

    fn write_ports(&mut self, signals: &HashSet<String>) -> Result<(), ValveBankError> {
        for index in 0..self.addresses.len() {
            let bytes = device_bytes(&self.layout, index, signals);
            self.write_block(index, GPIOA, &bytes)?;
            debug!("Expander {}: wrote {:02x?}.", index, bytes);
        }
        Ok(())
    }
}

impl ValveBank for RppalValveBank {
    fn name(&self) -> &str {
        "rppal"
    }

    fn valves_on(&mut self, signals: &HashSet<String>) -> Result<(), ValveBankError> {
        self.write_ports(signals)
    }

    fn valves_off(&mut self) -> Result<(), ValveBankError> {
        self.write_ports(&HashSet::new())
    }
}
