//! Closed-loop calibration of the analog front end.
//!
//! Both procedures run one step per telemetry tick from the device poll
//! loop. All progress state lives in the run value owned by the device's
//! activity slot; nothing survives a run.

use crate::bus::{Bus, Telemetry};
use crate::channel::Coupling;
use crate::command::{CommandKind, TRANS_CMULTI, TRANS_FMULTI};
use crate::device::Device;
use crate::profile::Caps;
use crate::regs;
use crate::{Error, Result};

/// Ticks between consecutive measurements of one quantity.
const ZERO_INTERVAL: u32 = 10;
/// A measured margin below this is accepted as converged.
const MARGIN_PASS: f64 = 0.3;
/// Transconductance constants are 10-bit.
const MAX_TRANS: u16 = (1 << 10) - 1;

/// Drive code near the bottom of the scale used for span measurements.
const OFFSET_TOP: u16 = 20;

pub(crate) enum Progress {
    Continue,
    Done,
}

fn round_out(margin: f64) -> f64 {
    if margin > 0.0 { margin.ceil() } else { margin.floor() }
}

/// Zero-offset calibration: transconductance fix, per-range mid-code zero,
/// then channel-to-channel crosstalk measurement.
#[derive(Debug)]
pub struct ZeroCalibration {
    /// Range index during the mid-code stage.
    stage: usize,
    pcnt: u32,
    margin: [f64; 2],
    trans_fix_done: bool,
    mid_zero_done: bool,
    vdiv_back: [u64; 2],
}

impl ZeroCalibration {
    pub(crate) fn new<B: Bus>(dev: &Device<B>) -> ZeroCalibration {
        ZeroCalibration {
            stage: 0,
            pcnt: 0,
            margin: [0.0; 2],
            trans_fix_done: false,
            mid_zero_done: false,
            vdiv_back: [dev.channels[0].vdiv, dev.channels[1].vdiv],
        }
    }

    pub(crate) fn step<B: Bus>(&mut self, dev: &mut Device<B>, m: &Telemetry)
            -> Result<Progress> {
        if !self.trans_fix_done && self.stage == 0 {
            self.step_trans_fix(dev, m)?;
            Ok(Progress::Continue)
        } else if !self.mid_zero_done {
            self.step_mid_zero(dev, m)?;
            Ok(Progress::Continue)
        } else {
            self.step_comb(dev, m)
        }
    }

    /// Stage 1: scale the PWM transconductance constant until a known code
    /// span produces the same measured span. Devices with offset DACs have
    /// no PWM path and skip this.
    fn step_trans_fix<B: Bus>(&mut self, dev: &mut Device<B>, m: &Telemetry)
            -> Result<()> {
        if dev.profile.caps.contains(Caps::PREOFF) {
            self.trans_fix_done = true;
            return Ok(());
        }
        let max_code = dev.profile.max_code();
        let offset_bom = max_code - OFFSET_TOP;
        if self.pcnt == 0 {
            for i in 0..2 {
                dev.channels[i].zero_offset = offset_bom;
                dev.write_dso(CommandKind::Offset, Some(i))?;
            }
        }
        if self.pcnt == ZERO_INTERVAL {
            self.margin[0] = m.mean(0);
            self.margin[1] = m.mean(1);
            if self.margin[0] >= max_code as f64 || self.margin[1] >= max_code as f64 {
                return Err(Error::SaturatedMeasurement);
            }
        }
        if self.pcnt == ZERO_INTERVAL + 1 {
            for i in 0..2 {
                dev.channels[i].zero_offset = OFFSET_TOP;
                dev.write_dso(CommandKind::Offset, Some(i))?;
            }
        }
        if self.pcnt == 2 * ZERO_INTERVAL {
            let top = [m.mean(0), m.mean(1)];
            if top[0] <= 0.0 || top[1] <= 0.0 {
                return Err(Error::SaturatedMeasurement);
            }
            // a failed refresh must leave the measured margins unconsumed,
            // so corrections are staged and committed after the write
            let mut margin = [0.0; 2];
            let mut trans = [dev.channels[0].vpos_trans, dev.channels[1].vpos_trans];
            let mut corrected = false;
            for i in 0..2 {
                let excess = self.margin[i] - top[i] - (offset_bom - OFFSET_TOP) as f64;
                if excess.abs() > MARGIN_PASS {
                    margin[i] = round_out(excess);
                    trans[i] = (trans[i] as f64 - margin[i])
                        .min(MAX_TRANS as f64) as u16;
                    corrected = true;
                }
            }
            if corrected {
                let saved = [dev.channels[0].vpos_trans, dev.channels[1].vpos_trans];
                dev.channels[0].vpos_trans = trans[0];
                dev.channels[1].vpos_trans = trans[1];
                if let Err(error) = dev.write_dso(CommandKind::Offset, Some(0)) {
                    dev.channels[0].vpos_trans = saved[0];
                    dev.channels[1].vpos_trans = saved[1];
                    return Err(error);
                }
            }
            self.margin = margin;
            self.trans_fix_done = !corrected;
            log::debug!("trans fix: {:#06x}/{:#06x}, done {}",
                        dev.channels[0].vpos_trans, dev.channels[1].vpos_trans,
                        self.trans_fix_done);
            self.pcnt = 0;
            return Ok(());
        }
        self.pcnt += 1;
        Ok(())
    }

    /// Stage 2: for each supported range in turn, drive mid-code and trim
    /// the stored preoff until the measured mean sits at mid-code.
    fn step_mid_zero<B: Bus>(&mut self, dev: &mut Device<B>, m: &Telemetry)
            -> Result<()> {
        let offset_mid = dev.profile.mid_code();
        if self.pcnt == 0 {
            if self.stage >= dev.channels[0].ranges.len() {
                for i in 0..2 {
                    dev.channels[i].vdiv = self.vdiv_back[i];
                }
                self.mid_zero_done = true;
                return Ok(());
            }
            for i in 0..2 {
                let key = dev.channels[i].ranges[self.stage].key;
                dev.channels[i].vdiv = key;
                dev.write_dso(CommandKind::Gain, Some(i))?;
                dev.channels[i].zero_offset = offset_mid;
                dev.write_dso(CommandKind::Offset, Some(i))?;
                // the offset word depends on the range; restore only after
                // both commands went out
                dev.channels[i].vdiv = self.vdiv_back[i];
            }
        }
        if self.pcnt == ZERO_INTERVAL {
            self.margin[0] = offset_mid as f64 - m.mean(0);
            self.margin[1] = offset_mid as f64 - m.mean(1);
            if self.margin[0].abs() < MARGIN_PASS && self.margin[1].abs() < MARGIN_PASS {
                log::debug!("range {} zeroed", self.stage);
                self.stage += 1;
            } else if dev.profile.caps.contains(Caps::PREOFF) {
                for i in 0..2 {
                    let ch = &mut dev.channels[i];
                    let key = ch.ranges[self.stage].key;
                    let trans_coarse = if key < 500 {
                        (ch.vpos_trans >> 8) as f64 / TRANS_CMULTI
                    } else {
                        (ch.vpos_trans >> 8) as f64
                    };
                    let trans_fine = if key < 500 {
                        (ch.vpos_trans & 0x00ff) as f64 / 1000.0
                    } else {
                        (ch.vpos_trans & 0x00ff) as f64 / TRANS_FMULTI
                    };
                    let voltage_margin = self.margin[i] * key as f64 * 10.0 / 255.0;
                    let last = ch.ranges[self.stage].preoff;
                    let coarse = (voltage_margin / trans_coarse + 0.5).floor() as i32;
                    let fine = (-(voltage_margin - coarse as f64 * trans_coarse)
                        / trans_fine + 0.5).floor() as i32;
                    let coarse = (last >> 10) as i32 + coarse;
                    let fine = (last & 0x03ff) as i32 + fine;
                    ch.ranges[self.stage].preoff = ((coarse << 10) + fine) as u16;
                }
            } else {
                for i in 0..2 {
                    let last = dev.channels[i].ranges[self.stage].preoff;
                    dev.channels[i].ranges[self.stage].preoff =
                        (last as i32 + round_out(self.margin[i]) as i32) as u16;
                }
            }
            self.pcnt = 0;
        } else if !self.mid_zero_done {
            self.pcnt += 1;
        }
        Ok(())
    }

    /// Stage 3: with one channel disabled at a time, measure how much of
    /// the driven channel's excursion leaks into the other. Multiplexed-ADC
    /// front ends have no active implementation of this stage and skip it.
    fn step_comb<B: Bus>(&mut self, dev: &mut Device<B>, m: &Telemetry)
            -> Result<Progress> {
        let end_cnt;
        if dev.profile.caps.contains(Caps::ADC_MUX) {
            end_cnt = 1;
        } else {
            let offset_bom = dev.profile.max_code() - OFFSET_TOP;
            if self.pcnt == 1 {
                dev.bus.write_register(regs::COMB_ADDR + 6, regs::COMB_ROUTE_CH0_ONLY)?;
                dev.bus.write_register(regs::DSO_EN1_ADDR, !regs::BM_CH_CH1)?;
                dev.channels[0].zero_offset = OFFSET_TOP;
                dev.write_dso(CommandKind::Offset, Some(0))?;
            } else if self.pcnt == ZERO_INTERVAL {
                dev.channels[0].comb_diff_top = 2.0 * (m.mean(0) - m.mean(1));
                dev.channels[0].zero_offset = offset_bom;
                dev.write_dso(CommandKind::Offset, Some(0))?;
            } else if self.pcnt == 2 * ZERO_INTERVAL {
                dev.channels[0].comb_diff_bom = 2.0 * (m.mean(0) - m.mean(1));
            }
            if self.pcnt == 2 * ZERO_INTERVAL + 1 {
                dev.bus.write_register(regs::COMB_ADDR + 6, regs::COMB_ROUTE_CH1_ONLY)?;
                dev.bus.write_register(regs::DSO_EN1_ADDR, regs::BM_CH_CH1)?;
                dev.bus.write_register(regs::DSO_EN0_ADDR, !regs::BM_CH_CH0)?;
                dev.channels[1].zero_offset = OFFSET_TOP;
                dev.write_dso(CommandKind::Offset, Some(1))?;
            } else if self.pcnt == 3 * ZERO_INTERVAL {
                dev.channels[1].comb_diff_top = 2.0 * (m.mean(1) - m.mean(0));
                dev.channels[1].zero_offset = offset_bom;
                dev.write_dso(CommandKind::Offset, Some(1))?;
            } else if self.pcnt == 4 * ZERO_INTERVAL {
                dev.channels[1].comb_diff_bom = 2.0 * (m.mean(1) - m.mean(0));
            }
            end_cnt = 4 * ZERO_INTERVAL + 1;
        }

        self.pcnt += 1;
        if self.pcnt == end_cnt {
            self.finish(dev)?;
            return Ok(Progress::Done);
        }
        Ok(Progress::Continue)
    }

    /// Restore channel state and re-initialize the DSO registers. Shared by
    /// normal completion, external abort and saturation failure.
    pub(crate) fn finish<B: Bus>(&self, dev: &mut Device<B>) -> Result<()> {
        for i in 0..2 {
            dev.channels[i].vdiv = self.vdiv_back[i];
        }
        dev.bus.write_register(regs::COMB_ADDR + 6, regs::COMB_ROUTE_NORMAL)?;
        dev.bus.write_register(regs::DSO_EN0_ADDR, regs::BM_CH_CH0)?;
        dev.bus.write_register(regs::DSO_EN1_ADDR, regs::BM_CH_CH1)?;
        dev.zero_run = false;
        dev.init_dso()
    }
}

/// Mux codes routing the calibration voltage steps, one per range.
const TUNE_MUX: [u8; 8] = [0x09, 0x0f, 0x0b, 0x0d, 0x07, 0x05, 0x01, 0x03];
const TUNE_MUX_POGOPIN: [u8; 8] = [0x09, 0x0f, 0x0b, 0x0d, 0x0e, 0x0c, 0x08, 0x0a];

/// Per-range gain and coupling auto-tune of a single channel against the
/// switched calibration voltages.
#[derive(Debug)]
pub struct AutoTune {
    channel: usize,
    /// -1 before activation, then the range index under tune.
    stage: isize,
    pcnt: u32,
    vdiv_back: u64,
    offset_back: u16,
    coupling_back: Coupling,
}

impl AutoTune {
    pub(crate) fn new(channel: usize) -> AutoTune {
        AutoTune {
            channel,
            stage: -1,
            pcnt: 0,
            vdiv_back: 0,
            offset_back: 0,
            coupling_back: Coupling::DC,
        }
    }

    fn mux<B: Bus>(dev: &Device<B>) -> &'static [u8; 8] {
        if dev.profile.caps.contains(Caps::POGOPIN) {
            &TUNE_MUX_POGOPIN
        } else {
            &TUNE_MUX
        }
    }

    /// Route the calibration voltage for `stage` and put the channel in
    /// AC coupling at that range's mid-code.
    fn enter_stage<B: Bus>(&self, dev: &mut Device<B>) -> Result<()> {
        let ch = self.channel;
        let code = Self::mux(dev)[self.stage as usize];
        dev.bus.write_ext(regs::EXT_MUX_ADDR, code)?;
        dev.channels[ch].vdiv = dev.channels[ch].ranges[self.stage as usize].key;
        dev.channels[ch].coupling = Coupling::AC;
        dev.write_dso(CommandKind::Gain, Some(ch))?;
        dev.apply_offset(ch)?;
        dev.write_dso(CommandKind::Coupling, Some(ch))
    }

    pub(crate) fn step<B: Bus>(&mut self, dev: &mut Device<B>, m: &Telemetry)
            -> Result<Progress> {
        let ch = self.channel;
        if self.stage == -1 {
            self.vdiv_back = dev.channels[ch].vdiv;
            self.offset_back = dev.channels[ch].offset;
            self.coupling_back = dev.channels[ch].coupling;
            self.stage = 0;
            dev.bus.write_ext(regs::EXT_CAL_CTRL_ADDR, 0x00)?;
            dev.channels[ch].offset = dev.profile.mid_code();
            self.enter_stage(dev)?;
            return Ok(Progress::Continue);
        }
        if (self.stage as usize) < dev.channels[ch].ranges.len() {
            self.pcnt += 1;
            // evaluations land every interval after stage entry; a failed
            // write leaves the counter past the mark and re-evaluates on
            // the next window
            if self.pcnt >= ZERO_INTERVAL {
                // asymmetric references: the AC check rides at mid-scale,
                // the DC check near the bottom step
                let coupling = dev.channels[ch].coupling;
                let target = if coupling == Coupling::AC { 127.5 } else { 25.5 };
                let margin = target - m.mean(ch);
                log::trace!("tune ch {} stage {} {:?} margin {}",
                            ch, self.stage, coupling, margin);
                if coupling == Coupling::AC && margin.abs() < 0.5 {
                    dev.channels[ch].coupling = Coupling::DC;
                    if let Err(error) = dev.write_dso(CommandKind::Coupling, Some(ch)) {
                        dev.channels[ch].coupling = Coupling::AC;
                        return Err(error);
                    }
                } else if coupling == Coupling::AC {
                    let index = self.stage as usize;
                    let saved = dev.channels[ch].ranges[index].preoff;
                    dev.channels[ch].ranges[index].preoff =
                        (saved as f64 + margin) as u16;
                    if let Err(error) = dev.apply_offset(ch) {
                        dev.channels[ch].ranges[index].preoff = saved;
                        return Err(error);
                    }
                } else if margin.abs() < 0.5 {
                    self.stage += 1;
                    if (self.stage as usize) < dev.channels[ch].ranges.len() {
                        self.enter_stage(dev)?;
                    } else {
                        self.restore(dev)?;
                        return Ok(Progress::Done);
                    }
                } else {
                    let index = self.stage as usize;
                    let saved = dev.channels[ch].ranges[index].vgain;
                    dev.channels[ch].ranges[index].vgain =
                        (saved as f64 - (margin * 1024.0).ceil()) as u64;
                    if let Err(error) = dev.write_dso(CommandKind::Gain, Some(ch)) {
                        dev.channels[ch].ranges[index].vgain = saved;
                        return Err(error);
                    }
                }
                self.pcnt = 0;
            }
        }
        Ok(Progress::Continue)
    }

    /// Route the mux back and restore the channel's original settings.
    pub(crate) fn restore<B: Bus>(&self, dev: &mut Device<B>) -> Result<()> {
        let ch = self.channel;
        let code = Self::mux(dev)[0];
        dev.bus.write_ext(regs::EXT_MUX_ADDR, code)?;
        dev.channels[ch].vdiv = self.vdiv_back;
        dev.channels[ch].offset = self.offset_back;
        dev.channels[ch].coupling = self.coupling_back;
        dev.write_dso(CommandKind::Gain, Some(ch))?;
        dev.apply_offset(ch)?;
        dev.write_dso(CommandKind::Coupling, Some(ch))
    }
}
