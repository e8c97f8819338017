//! Static capability descriptors for the supported device models.

use bitflags::bitflags;

bitflags! {
    /// Feature capabilities of a device model, resolved once at open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        /// Offset is driven through an external coarse/fine DAC pair
        /// instead of the legacy PWM generator.
        const PREOFF  = 1<<0;
        /// Serial EEPROM with native 16-bit addressing.
        const SEEP    = 1<<1;
        /// Both analog channels share one multiplexed ADC.
        const ADC_MUX = 1<<2;
        /// Calibration voltages are routed through the pogo-pin mux.
        const POGOPIN = 1<<3;
    }
}

/// Factory correction values for one voltage/division setting.
#[derive(Debug, Clone, Copy)]
pub struct RangeDefault {
    /// Voltage/division in millivolts.
    pub key: u64,
    pub vgain: u64,
    pub preoff: u16,
    /// Channel 1 gets a separately trimmed preoff.
    pub preoff_comp: u16,
}

#[derive(Debug)]
pub struct DeviceProfile {
    pub model: &'static str,
    pub caps: Caps,
    /// Sample width in bits; mid-code is `1 << (bits - 1)`.
    pub bits: u32,
    /// Supported voltage/division values, in millivolts, ascending.
    pub vdivs: &'static [u64],
    pub max_samplerate: u64,
    pub default_samplerate: u64,
    /// Per-channel sample depth of the DSO acquisition memory.
    pub dso_depth: u64,
    /// Default transconductance pair (coarse in the high byte).
    pub default_trans: u16,
    pub default_comb_comp: i16,
    /// Full scale of the preoff trim as presented to the user.
    pub default_pwmmargin: u16,
    pub range_defaults: &'static [RangeDefault],
    /// First calibration block address in EEPROM.
    pub eeprom_base: u16,
    /// Page prefix for devices without native serial-EEPROM addressing.
    pub eeprom_page: u16,
}

impl DeviceProfile {
    pub fn range_default(&self, key: u64) -> Option<&RangeDefault> {
        self.range_defaults.iter().find(|d| d.key == key)
    }

    /// Factory preoff for a channel at a given range; channel 1 uses the
    /// compensated column.
    pub fn default_preoff(&self, index: usize, key: u64) -> u16 {
        match self.range_default(key) {
            Some(d) if index == 1 => d.preoff_comp,
            Some(d) => d.preoff,
            None => 0,
        }
    }

    pub fn mid_code(&self) -> u16 {
        1 << (self.bits - 1)
    }

    pub fn max_code(&self) -> u16 {
        ((1u32 << self.bits) - 1) as u16
    }
}

macro_rules! range_defaults {
    { $( ($key:expr, $vgain:expr, $preoff:expr, $preoff_comp:expr) ),+ $(,)? } => {
        &[ $( RangeDefault {
            key: $key, vgain: $vgain, preoff: $preoff, preoff_comp: $preoff_comp
        } ),+ ]
    };
}

/// First-generation DSCope: PWM offset generator, paged EEPROM, discrete
/// per-channel ADCs.
pub static DSCOPE: DeviceProfile = DeviceProfile {
    model: "DSCope",
    caps: Caps::empty(),
    bits: 8,
    vdivs: &[10, 20, 50, 100, 200, 500, 1000, 2000],
    max_samplerate: 200_000_000,
    default_samplerate: 100_000_000,
    dso_depth: 2 * 1024 * 1024,
    default_trans: 0x0301,
    default_comb_comp: 0,
    default_pwmmargin: 1024,
    range_defaults: range_defaults! {
        (10,   0x1DA800, 0x45, 0x45),
        (20,   0x2A4E00, 0x43, 0x43),
        (50,   0x1CB200, 0x40, 0x40),
        (100,  0x19EB00, 0x41, 0x41),
        (200,  0x2AEF00, 0x42, 0x42),
        (500,  0x1C5C00, 0x40, 0x40),
        (1000, 0x19D300, 0x40, 0x40),
        (2000, 0x2B1700, 0x40, 0x40),
    },
    eeprom_base: 0x40,
    eeprom_page: 0x20,
};

/// DSCope U2P20: coarse/fine offset DACs, serial EEPROM, pogo-pin mux.
pub static DSCOPE_U2P20: DeviceProfile = DeviceProfile {
    model: "DSCope U2P20",
    caps: Caps::PREOFF.union(Caps::SEEP).union(Caps::POGOPIN),
    bits: 8,
    vdivs: &[10, 20, 50, 100, 200, 500, 1000, 2000],
    max_samplerate: 200_000_000,
    default_samplerate: 100_000_000,
    dso_depth: 2 * 1024 * 1024,
    default_trans: 0x9646,
    default_comb_comp: 0,
    default_pwmmargin: 1024,
    range_defaults: range_defaults! {
        (10,   0x16A800, 0x785E, 0x791A),
        (20,   0x1BD400, 0x791A, 0x79D6),
        (50,   0x162400, 0x791A, 0x79D6),
        (100,  0x163000, 0x791A, 0x79D6),
        (200,  0x16AE00, 0x791A, 0x79D6),
        (500,  0x16C400, 0x791A, 0x79D6),
        (1000, 0x16A000, 0x791A, 0x79D6),
        (2000, 0x16CC00, 0x791A, 0x79D6),
    },
    eeprom_base: 0x40,
    eeprom_page: 0x20,
};
