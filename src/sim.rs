//! In-memory transport double.
//!
//! Records every register, extension and command write, backs EEPROM
//! access with a plain byte array, and reports a configurable per-channel
//! mean as telemetry. Harnesses close the loop by adjusting `mean` between
//! ticks from the state the device has driven.

use std::collections::BTreeMap;

use crate::bus::{Bus, Telemetry};
use crate::profile::DeviceProfile;
use crate::{Error, Result};

pub struct SimBus {
    pub registers: BTreeMap<u8, u8>,
    pub ext: BTreeMap<u8, u8>,
    pub commands: Vec<u64>,
    pub eeprom: Vec<u8>,
    /// Mean sample value reported for each channel.
    pub mean: [f64; 2],
    /// Sample count per telemetry window.
    pub count: u64,
    /// Number of upcoming command writes to reject with a write error.
    pub fail_commands: u32,
}

impl SimBus {
    pub fn new(_profile: &DeviceProfile) -> SimBus {
        SimBus {
            registers: BTreeMap::new(),
            ext: BTreeMap::new(),
            commands: Vec::new(),
            // large enough for page-prefixed addressing
            eeprom: vec![0u8; 0x4000],
            mean: [0.0; 2],
            count: 1024,
            fail_commands: 0,
        }
    }

    pub fn register(&self, addr: u8) -> Option<u8> {
        self.registers.get(&addr).copied()
    }
}

impl Bus for SimBus {
    fn write_register(&mut self, addr: u8, value: u8) -> Result<()> {
        self.registers.insert(addr, value);
        Ok(())
    }

    fn write_ext(&mut self, addr: u8, value: u8) -> Result<()> {
        self.ext.insert(addr, value);
        Ok(())
    }

    fn write_command(&mut self, word: u64) -> Result<()> {
        if self.fail_commands > 0 {
            self.fail_commands -= 1;
            return Err(Error::HardwareWrite);
        }
        self.commands.push(word);
        Ok(())
    }

    fn read_eeprom(&mut self, addr: u16, data: &mut [u8]) -> Result<()> {
        let addr = addr as usize;
        data.copy_from_slice(&self.eeprom[addr..addr + data.len()]);
        Ok(())
    }

    fn write_eeprom(&mut self, addr: u16, data: &[u8]) -> Result<()> {
        let addr = addr as usize;
        self.eeprom[addr..addr + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn poll_telemetry(&mut self) -> Result<Option<Telemetry>> {
        Ok(Some(Telemetry {
            ch_sum: [
                (self.mean[0] * self.count as f64) as u64,
                (self.mean[1] * self.count as f64) as u64,
            ],
            ch_count: [self.count; 2],
        }))
    }
}
