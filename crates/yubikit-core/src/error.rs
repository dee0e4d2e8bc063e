use thiserror::Error;

use crate::connection::TransportError;
use crate::version::Version;

/// Errors surfaced by the transport and codec layers.
///
/// `61xx` and `6Cxx` status words never show up here; those are recovered
/// transparently by the APDU processor.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying connection broke. Never retried.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The card answered with a status word other than `9000`.
    #[error("card returned SW=0x{sw:04X}")]
    Apdu { sw: u16 },

    /// SELECT failed because the application is missing or disabled.
    #[error("application could not be selected (SW=0x{sw:04X})")]
    ApplicationNotAvailable { sw: u16 },

    /// The card answered with data that violates the protocol.
    #[error("bad response: {0}")]
    BadResponse(&'static str),

    /// A request that cannot be encoded or sent as given.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The operation needs a newer firmware than the connected key runs.
    #[error("{feature} requires a newer firmware than {version}")]
    NotSupported {
        feature: &'static str,
        version: Version,
    },
}

impl Error {
    /// The raw status word, for errors that carry one.
    pub fn status_word(&self) -> Option<u16> {
        match self {
            Error::Apdu { sw } | Error::ApplicationNotAvailable { sw } => Some(*sw),
            _ => None,
        }
    }
}
