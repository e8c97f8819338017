#![allow(dead_code)]

use bitflags::bitflags;

/// Control register 0 (bandwidth limit, EEPROM write protect).
pub const CTR0_ADDR: u8 = 0x71;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ctr0: u8 {
        const BW20M = 1<<0;
        /// EEPROM write protect released while set.
        const EEWP  = 1<<1;
    }
}

/// Base of the comb correction block; each channel owns a register pair
/// (index latch at `+ index*2`, value at `+ index*2 + 1`), the channel
/// routing switch lives at `+ 6`.
pub const COMB_ADDR: u8 = 0x68;

/// Comb routing switch values used around crosstalk calibration.
pub const COMB_ROUTE_CH0_ONLY: u8 = 0b1101;
pub const COMB_ROUTE_CH1_ONLY: u8 = 0b1110;
pub const COMB_ROUTE_NORMAL: u8 = 0b0011;

/// Per-channel front-end enable registers.
pub const DSO_EN0_ADDR: u8 = 0x76;
pub const DSO_EN1_ADDR: u8 = 0x77;

pub const BM_CH_CH0: u8 = 1<<0;
pub const BM_CH_CH1: u8 = 1<<1;

/// Extension port: calibration relay control.
pub const EXT_CAL_CTRL_ADDR: u8 = 0x03;
/// Extension port: calibration voltage mux select.
pub const EXT_MUX_ADDR: u8 = 0x01;
