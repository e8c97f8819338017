use crate::Result;

/// Accumulated per-channel sample statistics for one measurement window.
///
/// Produced by the transfer engine once per acquisition; a value is consumed
/// by at most one calibration step and never consulted twice.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Telemetry {
    pub ch_sum: [u64; 2],
    pub ch_count: [u64; 2],
}

impl Telemetry {
    pub fn mean(&self, ch: usize) -> f64 {
        if self.ch_count[ch] == 0 {
            return 0.0;
        }
        self.ch_sum[ch] as f64 / self.ch_count[ch] as f64
    }
}

/// Transport primitives the calibration core drives.
///
/// The USB engine behind this trait owns enumeration, firmware upload and
/// bulk-transfer queueing; every method here is fire-and-forget with a status.
pub trait Bus {
    /// Write a FPGA control register.
    fn write_register(&mut self, addr: u8, value: u8) -> Result<()>;
    /// Write a register on the extension port (input mux, relays).
    fn write_ext(&mut self, addr: u8, value: u8) -> Result<()>;
    /// Transmit a command word on the DSO channel.
    fn write_command(&mut self, word: u64) -> Result<()>;
    /// Read a calibration block from nonvolatile memory.
    fn read_eeprom(&mut self, addr: u16, data: &mut [u8]) -> Result<()>;
    /// Write a calibration block to nonvolatile memory.
    fn write_eeprom(&mut self, addr: u16, data: &[u8]) -> Result<()>;
    /// Fetch the measurement accumulated since the last poll, if any.
    fn poll_telemetry(&mut self) -> Result<Option<Telemetry>>;
}
