/// Crate-level error taxonomy.
///
/// Component errors convert into [`Error`] with `?`. Nothing here is fatal:
/// sensor errors are absorbed by the sensor, forwarding errors drop the
/// current packet, configuration errors leave the previous value in place.
use core::fmt;

use crate::announcer::AnnounceError;
use crate::config::ConfigError;
use crate::forwarder::ForwardError;
use crate::sensor::SensorError;
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Error {
    SensorTimeout,
    SensorOutOfRange { distance_cm: f32 },
    SensorHardware,
    UnknownSuccessor,
    /// Message did not fit the wire buffer
    Encode,
    TransportFailure(TransportError),
    InvalidConfig(ConfigError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SensorTimeout => fmt::Display::fmt(&SensorError::Timeout, f),
            Error::SensorOutOfRange { distance_cm } => fmt::Display::fmt(
                &SensorError::OutOfRange {
                    distance_cm: *distance_cm,
                },
                f,
            ),
            Error::SensorHardware => fmt::Display::fmt(&SensorError::Hardware, f),
            Error::UnknownSuccessor => fmt::Display::fmt(&ForwardError::UnknownSuccessor, f),
            Error::Encode => f.write_str("message encoding failed"),
            Error::TransportFailure(e) => write!(f, "transport failure: {}", e),
            Error::InvalidConfig(e) => write!(f, "invalid config: {}", e),
        }
    }
}

impl From<SensorError> for Error {
    fn from(e: SensorError) -> Self {
        match e {
            SensorError::Timeout => Error::SensorTimeout,
            SensorError::OutOfRange { distance_cm } => Error::SensorOutOfRange { distance_cm },
            SensorError::Hardware => Error::SensorHardware,
        }
    }
}

impl From<ForwardError> for Error {
    fn from(e: ForwardError) -> Self {
        match e {
            ForwardError::UnknownSuccessor => Error::UnknownSuccessor,
            ForwardError::Encode => Error::Encode,
            ForwardError::Transport(t) => Error::TransportFailure(t),
        }
    }
}

impl From<AnnounceError> for Error {
    fn from(e: AnnounceError) -> Self {
        match e {
            AnnounceError::Encode => Error::Encode,
            AnnounceError::Transport(t) => Error::TransportFailure(t),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::TransportFailure(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::InvalidConfig(e)
    }
}
