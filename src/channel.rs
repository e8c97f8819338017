use crate::profile::DeviceProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coupling {
    #[default]
    DC,
    AC,
    /// Ground coupling has no hardware encoding of its own; the encoder
    /// aliases it to DC with the coupling bit cleared.
    Gnd,
}

/// Correction values for one voltage/division setting of one channel.
///
/// Entries exist only for keys the device profile declares supported;
/// the table length equals the profile's supported-range count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeCorrection {
    /// Voltage/division in millivolts.
    pub key: u64,
    /// Gain word, stored pre-shifted (low byte always zero).
    pub vgain: u64,
    /// Offset trim: a raw PWM count on legacy devices, a packed
    /// coarse (high 6 bits) / fine (low 10 bits) DAC skew otherwise.
    pub preoff: u16,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub index: usize,
    pub enabled: bool,
    pub coupling: Coupling,
    /// Current voltage/division in millivolts.
    pub vdiv: u64,
    /// Configured offset code.
    pub offset: u16,
    /// Offset code last latched into hardware.
    pub hw_offset: u16,
    /// Offset code driven during a zero-calibration run.
    pub zero_offset: u16,
    pub comb_diff_top: f64,
    pub comb_diff_bom: f64,
    /// Transconductance pair; coarse constant in the high byte, fine in
    /// the low byte.
    pub vpos_trans: u16,
    /// Crosstalk compensation, nonzero only on shared-ADC front ends.
    pub comb_comp: i16,
    pub trig_value: u8,
    pub ranges: Vec<RangeCorrection>,
}

impl Channel {
    pub fn new(index: usize, profile: &DeviceProfile) -> Channel {
        let mid = profile.mid_code();
        let mut ch = Channel {
            index,
            enabled: true,
            coupling: Coupling::DC,
            vdiv: 1000,
            offset: mid,
            hw_offset: mid,
            zero_offset: mid,
            comb_diff_top: 0.0,
            comb_diff_bom: 0.0,
            vpos_trans: profile.default_trans,
            comb_comp: profile.default_comb_comp,
            trig_value: mid as u8,
            ranges: Vec::new(),
        };
        ch.reset_defaults(profile, false);
        ch
    }

    /// Rebuild the correction table from factory defaults. With
    /// `keep_vgain` the gain words survive; zero calibration resets only
    /// the offset trims.
    pub fn reset_defaults(&mut self, profile: &DeviceProfile, keep_vgain: bool) {
        self.vpos_trans = profile.default_trans;
        self.comb_comp = profile.default_comb_comp;
        let old = std::mem::take(&mut self.ranges);
        self.ranges = profile.vdivs.iter().map(|&key| {
            let default = profile.range_default(key);
            let vgain = if keep_vgain {
                old.iter().find(|r| r.key == key).map(|r| r.vgain)
                    .or(default.map(|d| d.vgain)).unwrap_or(0)
            } else {
                default.map(|d| d.vgain).unwrap_or(0)
            };
            RangeCorrection {
                key,
                vgain,
                preoff: profile.default_preoff(self.index, key),
            }
        }).collect();
    }

    /// Gain word for the current voltage/division, 0 if unsupported.
    pub fn vgain(&self) -> u64 {
        self.ranges.iter()
            .find(|r| r.key == self.vdiv)
            .map(|r| r.vgain)
            .unwrap_or(0)
    }

    /// Offset trim for the current voltage/division, 0 if unsupported.
    pub fn preoff(&self) -> u16 {
        self.ranges.iter()
            .find(|r| r.key == self.vdiv)
            .map(|r| r.preoff)
            .unwrap_or(0)
    }

    pub fn range_mut(&mut self, key: u64) -> Option<&mut RangeCorrection> {
        self.ranges.iter_mut().find(|r| r.key == key)
    }
}
