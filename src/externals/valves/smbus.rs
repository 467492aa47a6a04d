use std::collections::HashSet;

use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;
use tracing::debug;

use super::{device_bytes, ValveBank, ValveBankError, GPIOA, IODIRA};
use crate::config::InterfaceSettings;

/// Valve bank over the Linux SMBus userspace interface.
pub struct SmbusValveBank {
    devices: [LinuxI2CDevice; 2],
    layout: [Vec<String>; 4],
}

impl SmbusValveBank {
    pub fn new(settings: &InterfaceSettings) -> Result<Self, ValveBankError> {
        let path = format!("/dev/i2c-{}", settings.i2c_bus);
        let mut devices = [
            open_expander(&path, settings.mcp0_address)?,
            open_expander(&path, settings.mcp1_address)?,
        ];
        for device in &mut devices {
            device
                .smbus_write_i2c_block_data(IODIRA, &[0x00, 0x00])
                .map_err(|e| ValveBankError::Bus(e.to_string()))?;
        }
        Ok(Self { devices, layout: settings.valve_layout.clone() })
    }

    fn write_ports(&mut self, signals: &HashSet<String>) -> Result<(), ValveBankError> {
        for index in 0..self.devices.len() {
            let bytes = device_bytes(&self.layout, index, signals);
            // one block transaction covers both ports of the expander
            self.devices[index]
                .smbus_write_i2c_block_data(GPIOA, &bytes)
                .map_err(|e| ValveBankError::Bus(e.to_string()))?;
            debug!("Expander {}: wrote {:02x?}.", index, bytes);
        }
        Ok(())
    }
}

fn open_expander(path: &str, address: u16) -> Result<LinuxI2CDevice, ValveBankError> {
    LinuxI2CDevice::new(path, address).map_err(|e| ValveBankError::Bus(e.to_string()))
}

impl ValveBank for SmbusValveBank {
    fn name(&self) -> &str {
        "smbus"
    }

    fn valves_on(&mut self, signals: &HashSet<String>) -> Result<(), ValveBankError> {
        self.write_ports(signals)
    }

    fn valves_off(&mut self) -> Result<(), ValveBankError> {
        self.write_ports(&HashSet::new())
    }
}
