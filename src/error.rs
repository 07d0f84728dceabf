use std::num::ParseIntError;
use std::time::SystemTimeError;
use std::{io, net};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Indicates no network interface with an IPv4 address was found.
    #[error("no usable network interface")]
    ErrNoInterface,

    /// Indicates joining the multicast group failed on the chosen interface.
    #[error("error joining multicast group")]
    ErrJoiningMulticastGroup,

    /// Indicates the device has been closed.
    #[error("the device is closed")]
    ErrClosed,

    /// Indicates the device name was requested before the ordinal was locked.
    #[error("device name is not allocated yet")]
    ErrNotRegistered,

    /// Indicates a datagram was too short or misaligned to decode.
    #[error("truncated message")]
    ErrTruncatedMessage,

    /// Indicates a message carried an unknown type tag.
    #[error("unknown type tag")]
    ErrUnknownTypeTag,

    /// Indicates a message path or string argument was not valid UTF-8.
    #[error("invalid string data")]
    ErrInvalidString,

    /// Indicates a map requested more source slots than supported.
    #[error("too many map sources")]
    ErrTooManySources,

    /// Indicates a map was created with no source slots.
    #[error("a map requires at least one source")]
    ErrNoSources,

    /// Indicates a signal name did not resolve to a known signal.
    #[error("unknown signal")]
    ErrUnknownSignal,

    /// Indicates a map id did not resolve to a known map.
    #[error("unknown map")]
    ErrUnknownMap,

    /// Indicates a device name did not resolve to a known device.
    #[error("unknown device")]
    ErrUnknownDevice,

    /// Indicates a signal path was not of the form "/device.N/signal".
    #[error("malformed signal path")]
    ErrMalformedPath,

    /// Indicates an expression failed to parse.
    #[error("expression syntax error")]
    ErrExpressionSyntax,

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<SystemTimeError> for Error {
    fn from(e: SystemTimeError) -> Self {
        Error::Other(e.to_string())
    }
}
