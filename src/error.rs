use thiserror::Error;

use crate::device::AccessMode;

/// Errors reported by a camera driver implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid access")]
    InvalidAccess,

    /// The call is not allowed right now, e.g. a command is still in flight.
    #[error("invalid call at this time")]
    InvalidCall,

    #[error("feature '{0}' has a different type")]
    WrongType(String),

    #[error("driver subsystem unavailable")]
    Unavailable,

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("device {0} is not open")]
    NotOpen(String),

    #[error("access mode {requested:?} not available, device allows {available:?}")]
    AccessUnavailable {
        requested: AccessMode,
        available: AccessMode,
    },

    #[error("feature '{name}' cannot be read as {expected}")]
    FeatureType { name: String, expected: &'static str },

    #[error("camera system is unavailable")]
    SystemUnavailable,

    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("failed to spawn thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Routine failures given heterogeneous hardware: absent features,
    /// temporarily unavailable access, close-while-busy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Driver(DriverError::NotFound(_))
                | Error::Driver(DriverError::InvalidCall)
                | Error::Driver(DriverError::WrongType(_))
                | Error::FeatureType { .. }
                | Error::AccessUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_features_are_transient() {
        assert!(Error::Driver(DriverError::NotFound("Gain".into())).is_transient());
        assert!(Error::Driver(DriverError::InvalidCall).is_transient());
        assert!(!Error::SystemUnavailable.is_transient());
        assert!(!Error::Driver(DriverError::Unavailable).is_transient());
    }
}
