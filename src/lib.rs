mod bus;
mod calibration;
mod channel;
mod command;
mod device;
mod eeprom;
mod profile;
mod regs;
pub mod sim;

#[derive(Debug)]
pub enum Error {
    /// A register or command write was rejected by the transport.
    HardwareWrite,
    /// A calibration block read back with the wrong address echo.
    CalibrationData,
    /// Telemetry mean pegged at a representable extreme; the offset search
    /// cannot proceed.
    SaturatedMeasurement,
    /// A channel-scoped command was encoded without a channel.
    UnsupportedCommand,
    Other(Box<dyn std::error::Error + Sync + Send + 'static>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::HardwareWrite =>
                write!(f, "hardware write failed"),
            Self::CalibrationData =>
                write!(f, "calibration data corrupt"),
            Self::SaturatedMeasurement =>
                write!(f, "measurement saturated"),
            Self::UnsupportedCommand =>
                write!(f, "unsupported command"),
            Self::Other(error) =>
                write!(f, "{}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Other(ref error) => Some(error.as_ref()),
            _ => None
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Other(error.into())
    }
}

pub type Result<T> =
    core::result::Result<T, Error>;

pub use bus::{
    Bus,
    Telemetry,
};

pub use profile::{
    Caps,
    DeviceProfile,
    RangeDefault,
    DSCOPE,
    DSCOPE_U2P20,
};

pub use channel::{
    Channel,
    Coupling,
    RangeCorrection,
};

pub use command::CommandKind;

pub use calibration::{
    AutoTune,
    ZeroCalibration,
};

pub use device::{
    Activity,
    Device,
    TriggerState,
};
