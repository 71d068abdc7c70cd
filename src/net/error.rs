use std::{fmt, io};

use quinn::{ConnectError, ConnectionError, WriteError};

use super::wire::ErrorCode;

/// Transport-level failures. These don't know which peer they belong to;
/// the dendrite attributes them when it turns them into a `MeshError`.
#[derive(Debug)]
pub enum Error {
    ConnectError(ConnectError),
    ConnectionError(ConnectionError),
    Io(io::Error),
    WriteError(WriteError),
    Tls(rustls::Error),
    Certificate(rcgen::RcgenError),
    /// A frame announced a body larger than we accept.
    FrameTooLarge(usize),
    UnsupportedVersion(u8),
    CouldNotDecodeMessage(String),
    CouldNotEncodeMessage(String),
    /// The peer answered a call with a different kind of response.
    UnexpectedResponse,
    /// The peer answered with an explicit error.
    Remote { code: ErrorCode, message: String },
    EndpointClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectError(e) => write!(f, "connect: {e}"),
            Error::ConnectionError(e) => write!(f, "connection: {e}"),
            Error::Io(e) => write!(f, "io: {e}"),
            Error::WriteError(e) => write!(f, "write: {e}"),
            Error::Tls(e) => write!(f, "tls: {e}"),
            Error::Certificate(e) => write!(f, "certificate: {e}"),
            Error::FrameTooLarge(len) => write!(f, "frame of {len} bytes exceeds the limit"),
            Error::UnsupportedVersion(v) => write!(f, "unsupported protocol version {v}"),
            Error::CouldNotDecodeMessage(e) => write!(f, "could not decode message: {e}"),
            Error::CouldNotEncodeMessage(e) => write!(f, "could not encode message: {e}"),
            Error::UnexpectedResponse => write!(f, "unexpected response kind"),
            Error::Remote { code, message } => write!(f, "remote error {code:?}: {message}"),
            Error::EndpointClosed => write!(f, "endpoint closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ConnectError> for Error {
    fn from(error: ConnectError) -> Self {
        Self::ConnectError(error)
    }
}

impl From<ConnectionError> for Error {
    fn from(error: ConnectionError) -> Self {
        Self::ConnectionError(error)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        Self::WriteError(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

impl From<rcgen::RcgenError> for Error {
    fn from(e: rcgen::RcgenError) -> Self {
        Self::Certificate(e)
    }
}
