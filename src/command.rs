//! Pure mapping from logical channel configuration to hardware command words.

use crate::channel::{Channel, Coupling};
use crate::device::TriggerState;
use crate::profile::{Caps, DeviceProfile};
use crate::{Error, Result};

/// Coarse DAC multiplier for ranges below 500 mV/div.
pub(crate) const TRANS_CMULTI: f64 = 10.0;
/// Fine DAC multiplier for ranges at or above 500 mV/div.
pub(crate) const TRANS_FMULTI: f64 = 100.0;
/// Fixed bias added to the coarse DAC code.
pub(crate) const CONSTANT_BIAS: i64 = 160;
/// Vertical divisions on the display grid.
pub(crate) const DSO_VDIVS: f64 = 10.0;

const CH_BIT: u64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    ChannelEnable,
    Coupling,
    Gain,
    Offset,
    SampleRate,
    TriggerPos,
    TriggerSlope,
    TriggerSource,
    TriggerValue,
    TriggerMargin,
    TriggerHoldoff,
    Sync,
}

/// Read-only snapshot of the device state the encoder consults. Identical
/// views always encode to identical words.
pub(crate) struct CommandView<'a> {
    pub profile: &'a DeviceProfile,
    pub channels: &'a [Channel; 2],
    pub samplerate: u64,
    pub trigger: &'a TriggerState,
    pub zero_run: bool,
}

impl CommandView<'_> {
    pub fn enabled(&self) -> usize {
        self.channels.iter().filter(|ch| ch.enabled).count()
    }
}

/// Offset word for one channel: the raw code in bits 32+, the DAC or PWM
/// drive below. During a zero run the calibration drive code is used in
/// place of the configured one.
pub(crate) fn offset_word(ch: &Channel, view: &CommandView) -> u64 {
    let profile = view.profile;
    let mid = (1u64 << (profile.bits - 1)) as f64;
    let max = ((1u64 << profile.bits) - 1) as f64;
    let raw = if view.zero_run { ch.zero_offset } else { ch.hw_offset } as u64;
    let comb_off = 2.0 / (10f64.powf(24.0 * ch.comb_comp as f64 / 20.0 / 4096.0) - 1.0);
    let comb_compensate = if ch.comb_comp != 0 && view.enabled() == 1 {
        (raw as f64 - mid) / comb_off
    } else {
        0.0
    };
    let preoff = ch.preoff() as u64;
    if profile.caps.contains(Caps::PREOFF) {
        let trans_coarse = (ch.vpos_trans >> 8) as f64;
        let trans_fine = (ch.vpos_trans & 0x00ff) as f64;
        let voltage = (mid - raw as f64) / max * ch.vdiv as f64 * DSO_VDIVS;
        let coarse;
        let fine;
        if ch.vdiv < 500 {
            coarse = (-voltage * TRANS_CMULTI / trans_coarse + 0.5).floor() as i64;
            fine = ((voltage + coarse as f64 * trans_coarse / TRANS_CMULTI)
                    * 1000.0 / trans_fine + 0.5).floor() as i64;
        } else {
            coarse = (-voltage / trans_coarse + 0.5).floor() as i64;
            fine = ((voltage + coarse as f64 * trans_coarse)
                    * TRANS_FMULTI / trans_fine + 0.5).floor() as i64;
        }
        (raw << 32)
            .wrapping_add(((coarse + CONSTANT_BIAS + (preoff >> 10) as i64) as u64) << 16)
            .wrapping_add(fine as u64)
            .wrapping_add(preoff & 0x03ff)
    } else {
        let pwm = ((raw as f64 + comb_compensate) / max * ch.vpos_trans as f64) as u64;
        (raw << 32) + pwm + preoff
    }
}

/// Encode one command word. `target` selects the channel for channel-scoped
/// kinds and is ignored by the rest.
pub(crate) fn encode(kind: CommandKind, target: Option<usize>, view: &CommandView)
        -> Result<u64> {
    let channel = |target: Option<usize>| -> Result<&Channel> {
        Ok(&view.channels[target.ok_or(Error::UnsupportedCommand)?])
    };
    match kind {
        CommandKind::ChannelEnable | CommandKind::Coupling => {
            let ch = channel(target)?;
            let mut cmd: u64;
            match view.enabled() {
                _ if view.zero_run => cmd = 0x0E00,
                2 => cmd = 0x0E00,
                1 => {
                    // the opcode names the active front-end path, which is
                    // this channel when it is the enabled one
                    if (ch.index == 0) == ch.enabled {
                        cmd = 0x1600;
                    } else {
                        cmd = 0x1A00;
                    }
                }
                _ => return Ok(0),
            }
            cmd += (ch.index as u64) << CH_BIT;
            if view.zero_run || ch.coupling == Coupling::DC {
                cmd += 0x100;
            } else if ch.coupling == Coupling::Gnd {
                cmd &= 0xFFFF_FDFF;
            }
            Ok(cmd)
        }
        CommandKind::Gain => {
            let ch = channel(target)?;
            let mut vgain = ch.vgain();
            if ch.comb_comp != 0 && view.enabled() == 1 {
                vgain = vgain.wrapping_add((ch.comb_comp as u64) << 8);
            }
            Ok(0x08u64
                .wrapping_add((ch.index as u64) << CH_BIT)
                .wrapping_add(vgain))
        }
        CommandKind::Offset => {
            let ch = channel(target)?;
            Ok(0x10u64
                .wrapping_add((ch.index as u64) << CH_BIT)
                .wrapping_add(offset_word(ch, view) << 8))
        }
        CommandKind::SampleRate => {
            let divider = if view.zero_run {
                1u32
            } else {
                (view.profile.max_samplerate as f64
                    / view.samplerate as f64
                    / view.enabled() as f64).ceil() as u32
            };
            Ok(0x18 + ((divider as u64) << 8))
        }
        CommandKind::TriggerPos =>
            Ok(0x20u64.wrapping_add(view.trigger.hpos << 8)),
        CommandKind::TriggerSlope =>
            Ok(0x28 + ((view.trigger.slope as u64) << 8)),
        CommandKind::TriggerSource => {
            let source = if view.zero_run { 0 } else { view.trigger.source as u64 };
            Ok(0x30 + (source << 8))
        }
        CommandKind::TriggerValue => {
            let mut cmd = 0x38u64;
            for ch in view.channels.iter() {
                cmd += (ch.trig_value as u64) << (8 * (ch.index as u64 + 1));
            }
            Ok(cmd)
        }
        CommandKind::TriggerMargin =>
            Ok(0x40 + ((view.trigger.margin as u64) << 8)),
        CommandKind::TriggerHoldoff =>
            Ok(0x58u64.wrapping_add(view.trigger.holdoff << 8)),
        CommandKind::Sync =>
            Ok(0xa5a5a500),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::profile::{DSCOPE, DSCOPE_U2P20};

    fn channels(profile: &DeviceProfile) -> [Channel; 2] {
        [Channel::new(0, profile), Channel::new(1, profile)]
    }

    fn view<'a>(profile: &'a DeviceProfile, channels: &'a [Channel; 2],
            trigger: &'a TriggerState, zero_run: bool) -> CommandView<'a> {
        CommandView {
            profile,
            channels,
            samplerate: profile.default_samplerate,
            trigger,
            zero_run,
        }
    }

    #[test]
    fn test_encode_pure() {
        let chs = channels(&DSCOPE_U2P20);
        let trig = TriggerState::default();
        let view = view(&DSCOPE_U2P20, &chs, &trig, false);
        for kind in [CommandKind::Coupling, CommandKind::Gain, CommandKind::Offset,
                     CommandKind::SampleRate, CommandKind::TriggerValue] {
            let first = encode(kind, Some(0), &view).unwrap();
            let second = encode(kind, Some(0), &view).unwrap();
            assert_eq!(first, second, "{:?} not pure", kind);
        }
    }

    #[test]
    fn test_offset_word_dac_boundary_500() {
        // vdiv = 500 must take the >= 500 branch: no CMULTI on the coarse
        // code, FMULTI on the fine code
        let mut chs = channels(&DSCOPE_U2P20);
        chs[0].vpos_trans = 0x0480; // coarse 4, fine 128
        chs[0].vdiv = 500;
        chs[0].hw_offset = 178;
        chs[0].range_mut(500).unwrap().preoff = 0;
        let trig = TriggerState::default();
        let view = view(&DSCOPE_U2P20, &chs, &trig, false);
        // voltage = (128-178)/255*500*10 = -980.392...
        // coarse = floor(980.392/4 + 0.5) = 245, fine = floor(-0.306 + 0.5) = 0
        let expect = (178u64 << 32) + (((245 + 160) as u64) << 16);
        assert_eq!(offset_word(&chs[0], &view), expect);
    }

    #[test]
    fn test_offset_word_dac_below_500() {
        let mut chs = channels(&DSCOPE_U2P20);
        chs[0].vpos_trans = 0x0480;
        chs[0].vdiv = 200;
        chs[0].hw_offset = 178;
        chs[0].range_mut(200).unwrap().preoff = 0;
        let trig = TriggerState::default();
        let view = view(&DSCOPE_U2P20, &chs, &trig, false);
        // voltage = (128-178)/255*200*10 = -392.157...
        // coarse = floor(980.392 + 0.5) = 980
        // fine = floor(-1.2255 + 0.5) = -1, wraps into the low field
        let expect = ((178u64 << 32) + (((980 + 160) as u64) << 16)).wrapping_sub(1);
        assert_eq!(offset_word(&chs[0], &view), expect);
    }

    #[test]
    fn test_offset_word_pwm_mid_code() {
        // at mid-code with zero crosstalk the PWM drive is exactly the
        // mid-scale duty plus the stored trim, no compensation term
        let mut chs = channels(&DSCOPE);
        chs[0].vdiv = 200;
        chs[0].hw_offset = 128;
        let trig = TriggerState::default();
        let v = view(&DSCOPE, &chs, &trig, false);
        let trans = chs[0].vpos_trans as f64;
        let expect = (128u64 << 32)
            + (128.0 / 255.0 * trans) as u64
            + chs[0].preoff() as u64;
        assert_eq!(offset_word(&chs[0], &v), expect);

        // a nonzero comb_comp must not change the word while both channels
        // are enabled
        chs[0].comb_comp = 32;
        let v = view(&DSCOPE, &chs, &trig, false);
        assert_eq!(offset_word(&chs[0], &v), expect);
    }

    #[test]
    fn test_coupling_gnd_aliases_dc_off() {
        let mut chs = channels(&DSCOPE);
        let trig = TriggerState::default();
        chs[0].coupling = Coupling::DC;
        let v = view(&DSCOPE, &chs, &trig, false);
        assert_eq!(encode(CommandKind::Coupling, Some(0), &v).unwrap(), 0x0F00);
        chs[0].coupling = Coupling::AC;
        let v = view(&DSCOPE, &chs, &trig, false);
        assert_eq!(encode(CommandKind::Coupling, Some(0), &v).unwrap(), 0x0E00);
        chs[0].coupling = Coupling::Gnd;
        let v = view(&DSCOPE, &chs, &trig, false);
        assert_eq!(encode(CommandKind::Coupling, Some(0), &v).unwrap(), 0x0C00);
    }

    #[test]
    fn test_coupling_single_channel_opcodes() {
        let mut chs = channels(&DSCOPE);
        chs[1].enabled = false;
        let trig = TriggerState::default();
        let v = view(&DSCOPE, &chs, &trig, false);
        // channel 0 enabled alone
        assert_eq!(encode(CommandKind::Coupling, Some(0), &v).unwrap(),
                   0x1600 + 0x100);
        // the command for the disabled channel 1 names the same path
        assert_eq!(encode(CommandKind::Coupling, Some(1), &v).unwrap(),
                   0x1600 + (1 << 7) + 0x100);
    }

    #[test]
    fn test_samplerate_divider() {
        let chs = channels(&DSCOPE);
        let trig = TriggerState::default();
        let mut v = view(&DSCOPE, &chs, &trig, false);
        v.samplerate = 50_000_000;
        // ceil(200M / 50M / 2) = 2
        assert_eq!(encode(CommandKind::SampleRate, None, &v).unwrap(),
                   0x18 + (2 << 8));
        // forced to 1 during a zero run
        v.zero_run = true;
        assert_eq!(encode(CommandKind::SampleRate, None, &v).unwrap(),
                   0x18 + (1 << 8));
    }

    #[test]
    fn test_trigger_source_gated_by_zero_run() {
        let chs = channels(&DSCOPE);
        let mut trig = TriggerState::default();
        trig.source = 0x21;
        let v = view(&DSCOPE, &chs, &trig, false);
        assert_eq!(encode(CommandKind::TriggerSource, None, &v).unwrap(),
                   0x30 + (0x21 << 8));
        let v = view(&DSCOPE, &chs, &trig, true);
        assert_eq!(encode(CommandKind::TriggerSource, None, &v).unwrap(), 0x30);
    }

    #[test]
    fn test_trigger_value_folds_both_channels() {
        let mut chs = channels(&DSCOPE);
        chs[0].trig_value = 0x40;
        chs[1].trig_value = 0x80;
        let trig = TriggerState::default();
        let v = view(&DSCOPE, &chs, &trig, false);
        assert_eq!(encode(CommandKind::TriggerValue, None, &v).unwrap(),
                   0x38 + (0x40 << 8) + (0x80 << 16));
    }

    #[test]
    fn test_channel_command_without_target() {
        let chs = channels(&DSCOPE);
        let trig = TriggerState::default();
        let v = view(&DSCOPE, &chs, &trig, false);
        assert!(matches!(encode(CommandKind::Offset, None, &v),
                         Err(Error::UnsupportedCommand)));
    }
}
