//! Device session: configuration state, command sequencing and the
//! calibration activity slot.

use std::mem;

use crate::bus::Bus;
use crate::calibration::{AutoTune, Progress, ZeroCalibration};
use crate::channel::{Channel, Coupling};
use crate::command::{self, CommandKind, CommandView, TRANS_CMULTI, TRANS_FMULTI};
use crate::eeprom;
use crate::profile::{Caps, DeviceProfile};
use crate::regs::{self, Ctr0};
use crate::{Error, Result};

/// Trigger configuration mirrored into hardware on change.
#[derive(Debug, Clone)]
pub struct TriggerState {
    /// Horizontal trigger position in samples.
    pub hpos: u64,
    /// Horizontal trigger position as a percentage of the capture.
    pub hrate: u8,
    pub slope: u8,
    /// Packed source: mode nibble high, channel nibble low.
    pub source: u8,
    pub holdoff: u64,
    pub margin: u8,
}

impl Default for TriggerState {
    fn default() -> TriggerState {
        TriggerState {
            hpos: 0,
            hrate: 0,
            slope: 0,
            source: 0,
            holdoff: 0,
            margin: 8,
        }
    }
}

/// What the device is currently busy with. Calibration runs own their
/// progress state; dropping the device mid-run loses it.
#[derive(Debug, Default)]
pub enum Activity {
    #[default]
    Idle,
    Zeroing(ZeroCalibration),
    Tuning(AutoTune),
    Acquiring,
}

pub struct Device<B: Bus> {
    pub(crate) bus: B,
    pub(crate) profile: &'static DeviceProfile,
    pub(crate) channels: [Channel; 2],
    pub(crate) samplerate: u64,
    pub(crate) limit_samples: u64,
    pub(crate) trigger: TriggerState,
    /// Mirrors whether a zero run is active; the encoder substitutes
    /// calibration drive codes and neutral trigger settings while set.
    pub(crate) zero_run: bool,
    abort_requested: bool,
    activity: Activity,
}

impl<B: Bus> Device<B> {
    pub fn new(bus: B, profile: &'static DeviceProfile) -> Device<B> {
        Device {
            bus,
            profile,
            channels: [Channel::new(0, profile), Channel::new(1, profile)],
            samplerate: profile.default_samplerate,
            limit_samples: profile.dso_depth / 2,
            trigger: TriggerState::default(),
            zero_run: false,
            abort_requested: false,
            activity: Activity::Idle,
        }
    }

    /// Bring the session up: load calibration from nonvolatile memory and
    /// initialize the DSO registers. A device with no valid calibration
    /// starts a zero run instead of failing. `fpga_done` tells whether the
    /// FPGA kept its configuration from a previous session.
    pub fn open(&mut self, fpga_done: bool) -> Result<()> {
        let calibrated = match self.load_calibration(fpga_done) {
            Ok(()) => true,
            Err(Error::CalibrationData) => {
                log::warn!("calibration data invalid, starting zero calibration");
                false
            }
            Err(error) => return Err(error),
        };
        if !fpga_done {
            self.init_dso()?;
        }
        if !calibrated {
            self.start_zero_calibration()?;
        }
        Ok(())
    }

    pub fn profile(&self) -> &'static DeviceProfile {
        self.profile
    }

    pub fn channel(&self, index: usize) -> &Channel {
        &self.channels[index]
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    pub fn is_calibrating(&self) -> bool {
        matches!(self.activity, Activity::Zeroing(..) | Activity::Tuning(..))
    }

    pub fn limit_samples(&self) -> u64 {
        self.limit_samples
    }

    /// Direct transport access, for harnesses that need to look behind the
    /// session.
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    fn enabled_channels(&self) -> usize {
        self.channels.iter().filter(|ch| ch.enabled).count()
    }

    pub(crate) fn write_dso(&mut self, kind: CommandKind, target: Option<usize>)
            -> Result<()> {
        let word = {
            let view = CommandView {
                profile: self.profile,
                channels: &self.channels,
                samplerate: self.samplerate,
                trigger: &self.trigger,
                zero_run: self.zero_run,
            };
            command::encode(kind, target, &view)?
        };
        log::trace!("dso {:?} {:?}: {:#018x}", kind, target, word);
        self.bus.write_command(word)
    }

    /// Latch the configured offset code into hardware and send the offset
    /// command.
    pub(crate) fn apply_offset(&mut self, index: usize) -> Result<()> {
        self.channels[index].hw_offset = self.channels[index].offset;
        self.write_dso(CommandKind::Offset, Some(index))
    }

    /// Full DSO register initialization, per-channel settings first.
    pub(crate) fn init_dso(&mut self) -> Result<()> {
        for i in 0..2 {
            self.write_dso(CommandKind::Coupling, Some(i))?;
            self.write_dso(CommandKind::Gain, Some(i))?;
            self.apply_offset(i)?;
        }
        self.write_dso(CommandKind::SampleRate, None)?;
        self.write_dso(CommandKind::TriggerPos, None)?;
        self.write_dso(CommandKind::TriggerHoldoff, None)?;
        self.write_dso(CommandKind::TriggerSlope, None)?;
        self.write_dso(CommandKind::TriggerSource, None)?;
        self.write_dso(CommandKind::TriggerValue, None)?;
        self.write_dso(CommandKind::TriggerMargin, None)
    }

    pub fn set_vdiv(&mut self, index: usize, vdiv: u64) -> Result<()> {
        self.channels[index].vdiv = vdiv;
        self.write_dso(CommandKind::Gain, Some(index))?;
        self.apply_offset(index)
    }

    pub fn set_coupling(&mut self, index: usize, coupling: Coupling) -> Result<()> {
        // ground coupling is presented to the rest of the session as DC
        // with the input shorted
        self.channels[index].coupling = match coupling {
            Coupling::Gnd => Coupling::DC,
            other => other,
        };
        self.write_dso(CommandKind::Coupling, Some(index))
    }

    pub fn set_offset(&mut self, index: usize, offset: u16) -> Result<()> {
        self.channels[index].offset = offset;
        self.apply_offset(index)
    }

    pub fn enable_channel(&mut self, index: usize, enable: bool) -> Result<()> {
        self.channels[index].enabled = enable;
        self.write_dso(CommandKind::ChannelEnable, Some(index))?;
        let (addr, bit) = if index == 0 {
            (regs::DSO_EN0_ADDR, regs::BM_CH_CH0)
        } else {
            (regs::DSO_EN1_ADDR, regs::BM_CH_CH1)
        };
        self.bus.write_register(addr, if enable { bit } else { !bit })?;
        let enabled = self.enabled_channels();
        if enabled != 0 {
            self.write_dso(CommandKind::SampleRate, None)?;
            self.limit_samples = self.profile.dso_depth / enabled as u64;
        }
        Ok(())
    }

    pub fn set_samplerate(&mut self, samplerate: u64) -> Result<()> {
        self.samplerate = samplerate;
        self.write_dso(CommandKind::SampleRate, None)
    }

    pub fn set_limit_samples(&mut self, limit: u64) {
        self.limit_samples = limit;
    }

    /// Horizontal trigger position as a percentage; the sample position
    /// scales with the enabled channel count and capture depth.
    pub fn set_trigger_hrate(&mut self, hrate: u8) -> Result<()> {
        self.trigger.hrate = hrate;
        self.trigger.hpos = (hrate as f64
            * self.enabled_channels() as f64
            * self.limit_samples as f64 / 200.0) as u64;
        self.write_dso(CommandKind::TriggerPos, None)
    }

    pub fn set_trigger_slope(&mut self, slope: u8) -> Result<()> {
        self.trigger.slope = slope;
        self.write_dso(CommandKind::TriggerSlope, None)
    }

    /// Set the trigger mode nibble, keeping the channel nibble.
    pub fn set_trigger_source(&mut self, source: u8) -> Result<()> {
        self.trigger.source = (self.trigger.source & 0xf0) + (source & 0x0f);
        self.write_dso(CommandKind::TriggerSource, None)
    }

    /// Set the trigger channel nibble, keeping the mode nibble.
    pub fn set_trigger_channel(&mut self, channel: u8) -> Result<()> {
        self.trigger.source = (channel << 4) + (self.trigger.source & 0x0f);
        self.write_dso(CommandKind::TriggerSource, None)
    }

    pub fn set_trigger_value(&mut self, index: usize, value: u8) -> Result<()> {
        self.channels[index].trig_value = value;
        self.write_dso(CommandKind::TriggerValue, None)
    }

    pub fn set_trigger_holdoff(&mut self, holdoff: u64) -> Result<()> {
        self.trigger.holdoff = holdoff;
        self.write_dso(CommandKind::TriggerHoldoff, None)
    }

    pub fn set_trigger_margin(&mut self, margin: u8) -> Result<()> {
        self.trigger.margin = margin;
        self.write_dso(CommandKind::TriggerMargin, None)
    }

    /// Replace the gain word for the current range. The stored word keeps
    /// its low byte clear; the user value occupies the upper bytes.
    pub fn set_vgain(&mut self, index: usize, vgain: u64) -> Result<()> {
        let vdiv = self.channels[index].vdiv;
        if let Some(range) = self.channels[index].range_mut(vdiv) {
            range.vgain = vgain << 8;
        }
        self.write_dso(CommandKind::Gain, Some(index))
    }

    pub fn set_comb_comp(&mut self, index: usize, comp: i16) -> Result<()> {
        self.channels[index].comb_comp = comp;
        self.write_dso(CommandKind::Gain, Some(index))?;
        self.apply_offset(index)
    }

    /// Replace the offset trim for the current range with a user-facing
    /// ratio of the trim full scale. DAC devices convert the ratio to a
    /// coarse/fine skew around the factory default; PWM devices store the
    /// count directly.
    pub fn set_preoff(&mut self, index: usize, preoff: u16) -> Result<()> {
        let ch = &mut self.channels[index];
        let vdiv = ch.vdiv;
        let value = if self.profile.caps.contains(Caps::PREOFF) {
            let trans_coarse = if vdiv < 500 {
                (ch.vpos_trans >> 8) as f64 / TRANS_CMULTI
            } else {
                (ch.vpos_trans >> 8) as f64
            };
            let trans_fine = if vdiv < 500 {
                (ch.vpos_trans & 0x00ff) as f64 / 1000.0
            } else {
                (ch.vpos_trans & 0x00ff) as f64 / TRANS_FMULTI
            };
            let voltage_off = (2.0 * preoff as f64 / self.profile.default_pwmmargin as f64
                - 1.0) * vdiv as f64;
            let coarse = (voltage_off / trans_coarse + 0.5).floor() as i32;
            let fine = (-(voltage_off - coarse as f64 * trans_coarse)
                / trans_fine + 0.5).floor() as i32;
            let default = self.profile.default_preoff(index, vdiv);
            let coarse = (default >> 10) as i32 + coarse;
            let fine = (default & 0x03ff) as i32 + fine;
            ((coarse << 10) + fine) as u16
        } else {
            preoff
        };
        if let Some(range) = ch.range_mut(vdiv) {
            range.preoff = value;
        }
        self.apply_offset(index)
    }

    /// Current offset trim mapped back to the user-facing ratio of the
    /// trim full scale.
    pub fn preoff_rate(&self, index: usize) -> u16 {
        let ch = &self.channels[index];
        if !self.profile.caps.contains(Caps::PREOFF) {
            return ch.preoff();
        }
        let vdiv = ch.vdiv;
        let preoff = ch.preoff();
        let default = self.profile.default_preoff(index, vdiv);
        let trans_coarse = if vdiv < 500 {
            (ch.vpos_trans >> 8) as f64 / TRANS_CMULTI
        } else {
            (ch.vpos_trans >> 8) as f64
        };
        let trans_fine = if vdiv < 500 {
            (ch.vpos_trans & 0x00ff) as f64 / 1000.0
        } else {
            (ch.vpos_trans & 0x00ff) as f64 / TRANS_FMULTI
        };
        let skew_coarse = (preoff >> 10) as f64 - (default >> 10) as f64;
        let skew_fine = (preoff & 0x03ff) as f64 - (default & 0x03ff) as f64;
        let rate = (skew_coarse * trans_coarse - skew_fine * trans_fine)
            / vdiv as f64;
        ((rate * 0.5 + 0.5) * self.profile.default_pwmmargin as f64) as u16
    }

    /// Begin a zero-offset calibration run. Offset trims and crosstalk
    /// compensation go back to factory defaults; measured gain words are
    /// kept.
    pub fn start_zero_calibration(&mut self) -> Result<()> {
        for ch in self.channels.iter_mut() {
            ch.reset_defaults(self.profile, true);
        }
        let run = ZeroCalibration::new(self);
        self.zero_run = true;
        self.init_dso()?;
        self.activity = Activity::Zeroing(run);
        log::info!("zero calibration started");
        Ok(())
    }

    /// Begin a gain auto-tune of one channel against the internal
    /// calibration voltages.
    pub fn start_tune(&mut self, index: usize) -> Result<()> {
        self.activity = Activity::Tuning(AutoTune::new(index));
        log::info!("auto tune of channel {} started", index);
        Ok(())
    }

    /// Request an orderly stop of the running calibration; honored on the
    /// next tick, after restoring channel state.
    pub fn abort_calibration(&mut self) {
        self.abort_requested = true;
    }

    pub fn start_acquisition(&mut self) -> Result<()> {
        self.write_dso(CommandKind::Sync, None)?;
        self.activity = Activity::Acquiring;
        Ok(())
    }

    pub fn stop_acquisition(&mut self) {
        if matches!(self.activity, Activity::Acquiring) {
            self.activity = Activity::Idle;
        }
    }

    /// Advance the session by one poll interval. Calibration runs consume
    /// one telemetry window per tick; a tick with no telemetry available
    /// does nothing.
    pub fn tick(&mut self) -> Result<()> {
        if self.abort_requested {
            self.abort_requested = false;
            match mem::take(&mut self.activity) {
                Activity::Zeroing(run) => {
                    log::info!("zero calibration aborted");
                    return run.finish(self);
                }
                Activity::Tuning(run) => {
                    log::info!("auto tune aborted");
                    return run.restore(self);
                }
                other => self.activity = other,
            }
            return Ok(());
        }
        let Some(telemetry) = self.bus.poll_telemetry()? else {
            return Ok(());
        };
        match mem::take(&mut self.activity) {
            Activity::Idle => {}
            Activity::Acquiring => self.activity = Activity::Acquiring,
            Activity::Zeroing(mut run) => {
                match run.step(self, &telemetry) {
                    Ok(Progress::Continue) => self.activity = Activity::Zeroing(run),
                    Ok(Progress::Done) => {
                        log::info!("zero calibration finished");
                    }
                    Err(Error::SaturatedMeasurement) => {
                        // unrecoverable: restore and surface
                        run.finish(self)?;
                        return Err(Error::SaturatedMeasurement);
                    }
                    Err(error) => {
                        // transient write failure: hold position, retry on
                        // the next window
                        self.activity = Activity::Zeroing(run);
                        return Err(error);
                    }
                }
            }
            Activity::Tuning(mut run) => {
                match run.step(self, &telemetry) {
                    Ok(Progress::Continue) => self.activity = Activity::Tuning(run),
                    Ok(Progress::Done) => {
                        log::info!("auto tune finished");
                    }
                    Err(error) => {
                        self.activity = Activity::Tuning(run);
                        return Err(error);
                    }
                }
            }
        }
        Ok(())
    }

    /// Load both channels' calibration from nonvolatile memory. Unless the
    /// FPGA kept its configuration, the comb correction tables are
    /// reprogrammed from the loaded crosstalk figures.
    pub fn load_calibration(&mut self, fpga_done: bool) -> Result<()> {
        for i in 0..2 {
            eeprom::load(&mut self.bus, self.profile, &mut self.channels[i])?;
            if !fpga_done {
                self.program_comb_lut(i)?;
            }
        }
        Ok(())
    }

    /// Persist both channels' calibration, releasing the EEPROM write
    /// protect around each channel's blocks. Discrete-ADC devices also
    /// refresh the comb correction tables from the new crosstalk figures.
    pub fn store_calibration(&mut self) -> Result<()> {
        for i in 0..2 {
            self.bus.write_register(regs::CTR0_ADDR, Ctr0::EEWP.bits())?;
            eeprom::store(&mut self.bus, self.profile, &self.channels[i])?;
            self.bus.write_register(regs::CTR0_ADDR, Ctr0::empty().bits())?;
        }
        if !self.profile.caps.contains(Caps::ADC_MUX) {
            for i in 0..2 {
                self.program_comb_lut(i)?;
            }
        }
        Ok(())
    }

    /// Program one channel's comb correction table: a linear ramp over the
    /// code space whose slope and intercept come from the measured
    /// channel-to-channel crosstalk.
    fn program_comb_lut(&mut self, index: usize) -> Result<()> {
        let top = self.channels[index].comb_diff_top;
        let bom = self.channels[index].comb_diff_bom;
        let slope = (bom - top) / (2.0 * 255.0);
        let base = regs::COMB_ADDR + index as u8 * 2;
        for code in 0..=255u32 {
            self.bus.write_register(base, code as u8)?;
            let value = (code as f64 + code as f64 * slope + top * 0.5 + 0.5) as i32;
            self.bus.write_register(base + 1, value.clamp(0, 255) as u8)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::profile::{RangeDefault, DSCOPE, DSCOPE_U2P20};
    use crate::sim::SimBus;

    fn calibrated_device(profile: &'static DeviceProfile) -> Device<SimBus> {
        let mut bus = SimBus::new(profile);
        for i in 0..2 {
            eeprom::store(&mut bus, profile, &Channel::new(i, profile)).unwrap();
        }
        Device::new(bus, profile)
    }

    #[test]
    fn test_open_blank_eeprom_starts_zeroing() {
        let mut dev = Device::new(SimBus::new(&DSCOPE_U2P20), &DSCOPE_U2P20);
        dev.open(false).unwrap();
        assert!(matches!(dev.activity(), Activity::Zeroing(..)));
        assert!(dev.zero_run);
    }

    #[test]
    fn test_open_calibrated_stays_idle() {
        let mut dev = calibrated_device(&DSCOPE_U2P20);
        dev.open(false).unwrap();
        assert!(matches!(dev.activity(), Activity::Idle));
        assert!(!dev.zero_run);
        // full register init: three commands per channel plus seven
        // device-wide settings
        assert_eq!(dev.bus_mut().commands.len(), 13);
    }

    #[test]
    fn test_store_calibration_guards_write_protect() {
        let mut dev = calibrated_device(&DSCOPE);
        dev.store_calibration().unwrap();
        // protect re-engaged after the last block
        assert_eq!(dev.bus_mut().register(regs::CTR0_ADDR),
                   Some(Ctr0::empty().bits()));
        // discrete-ADC devices also refresh the comb tables
        assert_eq!(dev.bus_mut().register(regs::COMB_ADDR), Some(255));
        assert!(dev.bus_mut().register(regs::COMB_ADDR + 1).is_some());
    }

    #[test]
    fn test_store_calibration_mux_skips_comb_tables() {
        // same layout as the first-generation profile, but claiming a
        // multiplexed ADC
        static MUXED: DeviceProfile = DeviceProfile {
            model: "sim-muxed",
            caps: Caps::ADC_MUX.union(Caps::SEEP),
            bits: 8,
            vdivs: &[10, 20, 50, 100, 200, 500, 1000, 2000],
            max_samplerate: 200_000_000,
            default_samplerate: 100_000_000,
            dso_depth: 2 * 1024 * 1024,
            default_trans: 0x0301,
            default_comb_comp: 0,
            default_pwmmargin: 1024,
            range_defaults: &[
                RangeDefault { key: 1000, vgain: 0x19D300, preoff: 0x40, preoff_comp: 0x40 },
            ],
            eeprom_base: 0x40,
            eeprom_page: 0x20,
        };
        let mut dev = calibrated_device(&MUXED);
        dev.store_calibration().unwrap();
        assert_eq!(dev.bus_mut().register(regs::COMB_ADDR), None);
    }

    #[test]
    fn test_enable_channel_rescales_depth() {
        let mut dev = calibrated_device(&DSCOPE);
        assert_eq!(dev.limit_samples(), DSCOPE.dso_depth / 2);
        dev.enable_channel(1, false).unwrap();
        assert_eq!(dev.limit_samples(), DSCOPE.dso_depth);
        assert_eq!(dev.bus_mut().register(regs::DSO_EN1_ADDR),
                   Some(!regs::BM_CH_CH1));
        dev.enable_channel(1, true).unwrap();
        assert_eq!(dev.limit_samples(), DSCOPE.dso_depth / 2);
    }

    #[test]
    fn test_trigger_source_nibbles_merge() {
        let mut dev = calibrated_device(&DSCOPE);
        dev.set_trigger_source(0x05).unwrap();
        dev.set_trigger_channel(0x01).unwrap();
        assert_eq!(dev.trigger.source, 0x15);
        dev.set_trigger_source(0x02).unwrap();
        assert_eq!(dev.trigger.source, 0x12);
    }

    #[test]
    fn test_trigger_hrate_scales_with_depth() {
        let mut dev = calibrated_device(&DSCOPE);
        dev.set_trigger_hrate(50).unwrap();
        // 50% of a two-channel capture
        assert_eq!(dev.trigger.hpos,
                   (50.0 * 2.0 * (DSCOPE.dso_depth / 2) as f64 / 200.0) as u64);
    }

    #[test]
    fn test_preoff_user_mapping_round_trips() {
        let mut dev = calibrated_device(&DSCOPE_U2P20);
        dev.set_preoff(0, 700).unwrap();
        assert_eq!(dev.preoff_rate(0), 700);
        dev.set_preoff(0, 512).unwrap();
        let rate = dev.preoff_rate(0);
        assert!((rate as i32 - 512).abs() <= 1, "rate {}", rate);
    }

    #[test]
    fn test_coupling_gnd_stored_as_dc() {
        let mut dev = calibrated_device(&DSCOPE);
        dev.set_coupling(0, Coupling::Gnd).unwrap();
        assert_eq!(dev.channel(0).coupling, Coupling::DC);
    }
}
