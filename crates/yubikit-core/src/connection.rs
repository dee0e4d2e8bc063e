//! The byte-in/byte-out seam between the protocol engines and whatever
//! physical transport (PC/SC, USB HID, NFC) the caller owns.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Failure of the underlying transport. Carries whatever detail the
/// connection implementation can provide; the protocol layers treat it as
/// fatal and never retry.
#[derive(Debug, Error)]
#[error("connection failed: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// One smart-card connection, exclusively owned by a session for the
/// session's lifetime.
///
/// Implementations deliver a single command APDU and return the raw
/// response including the trailing status word. Commands that wait for a
/// touch or PIN entry rely on the connection to block; no timeout is
/// applied at this layer. Connections are not thread-safe.
pub trait SmartCardConnection {
    /// Transmit one command APDU and return the raw response bytes,
    /// status word included.
    fn send_and_receive(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Whether the transport can carry extended-length APDUs.
    fn supports_extended_length(&self) -> bool {
        false
    }
}

impl<C: SmartCardConnection + ?Sized> SmartCardConnection for &mut C {
    fn send_and_receive(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        (**self).send_and_receive(apdu)
    }

    fn supports_extended_length(&self) -> bool {
        (**self).supports_extended_length()
    }
}

/// Caller-owned cooperative cancellation flag.
///
/// Blocking operations that span several APDUs check the flag at each APDU
/// boundary and abort with an operation-denied error when it is set.
/// Partial side effects already committed on the authenticator are not
/// rolled back.
#[derive(Debug, Default)]
pub struct CommandState {
    cancelled: AtomicBool,
}

impl CommandState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation at the next APDU boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
