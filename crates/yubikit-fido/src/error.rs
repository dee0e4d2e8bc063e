use thiserror::Error;

/// CTAP2 status byte returned in the first byte of every response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CtapStatus {
    InvalidCommand,
    InvalidParameter,
    InvalidLength,
    InvalidSeq,
    Timeout,
    ChannelBusy,
    LockRequired,
    InvalidChannel,
    CborUnexpectedType,
    InvalidCbor,
    MissingParameter,
    LimitExceeded,
    UnsupportedExtension,
    FingerprintDatabaseFull,
    LargeBlobStorageFull,
    CredentialExcluded,
    Processing,
    InvalidCredential,
    UserActionPending,
    OperationPending,
    NoOperations,
    UnsupportedAlgorithm,
    OperationDenied,
    KeyStoreFull,
    UnsupportedOption,
    InvalidOption,
    KeepaliveCancel,
    NoCredentials,
    UserActionTimeout,
    NotAllowed,
    PinInvalid,
    PinBlocked,
    PinAuthInvalid,
    PinAuthBlocked,
    PinNotSet,
    PinRequired,
    PinPolicyViolation,
    PinTokenExpired,
    RequestTooLarge,
    ActionTimeout,
    UpRequired,
    UvBlocked,
    IntegrityFailure,
    InvalidSubcommand,
    UvInvalid,
    UnauthorizedPermission,
    Other(u8),
}

impl CtapStatus {
    pub fn from_byte(byte: u8) -> Self {
        use CtapStatus::*;
        match byte {
            0x01 => InvalidCommand,
            0x02 => InvalidParameter,
            0x03 => InvalidLength,
            0x04 => InvalidSeq,
            0x05 => Timeout,
            0x06 => ChannelBusy,
            0x0A => LockRequired,
            0x0B => InvalidChannel,
            0x11 => CborUnexpectedType,
            0x12 => InvalidCbor,
            0x14 => MissingParameter,
            0x15 => LimitExceeded,
            0x16 => UnsupportedExtension,
            0x17 => FingerprintDatabaseFull,
            0x18 => LargeBlobStorageFull,
            0x19 => CredentialExcluded,
            0x21 => Processing,
            0x22 => InvalidCredential,
            0x23 => UserActionPending,
            0x24 => OperationPending,
            0x25 => NoOperations,
            0x26 => UnsupportedAlgorithm,
            0x27 => OperationDenied,
            0x28 => KeyStoreFull,
            0x2B => UnsupportedOption,
            0x2C => InvalidOption,
            0x2D => KeepaliveCancel,
            0x2E => NoCredentials,
            0x2F => UserActionTimeout,
            0x30 => NotAllowed,
            0x31 => PinInvalid,
            0x32 => PinBlocked,
            0x33 => PinAuthInvalid,
            0x34 => PinAuthBlocked,
            0x35 => PinNotSet,
            0x36 => PinRequired,
            0x37 => PinPolicyViolation,
            0x38 => PinTokenExpired,
            0x39 => RequestTooLarge,
            0x3A => ActionTimeout,
            0x3B => UpRequired,
            0x3C => UvBlocked,
            0x3D => IntegrityFailure,
            0x3E => InvalidSubcommand,
            0x3F => UvInvalid,
            0x40 => UnauthorizedPermission,
            other => Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        use CtapStatus::*;
        match self {
            InvalidCommand => 0x01,
            InvalidParameter => 0x02,
            InvalidLength => 0x03,
            InvalidSeq => 0x04,
            Timeout => 0x05,
            ChannelBusy => 0x06,
            LockRequired => 0x0A,
            InvalidChannel => 0x0B,
            CborUnexpectedType => 0x11,
            InvalidCbor => 0x12,
            MissingParameter => 0x14,
            LimitExceeded => 0x15,
            UnsupportedExtension => 0x16,
            FingerprintDatabaseFull => 0x17,
            LargeBlobStorageFull => 0x18,
            CredentialExcluded => 0x19,
            Processing => 0x21,
            InvalidCredential => 0x22,
            UserActionPending => 0x23,
            OperationPending => 0x24,
            NoOperations => 0x25,
            UnsupportedAlgorithm => 0x26,
            OperationDenied => 0x27,
            KeyStoreFull => 0x28,
            UnsupportedOption => 0x2B,
            InvalidOption => 0x2C,
            KeepaliveCancel => 0x2D,
            NoCredentials => 0x2E,
            UserActionTimeout => 0x2F,
            NotAllowed => 0x30,
            PinInvalid => 0x31,
            PinBlocked => 0x32,
            PinAuthInvalid => 0x33,
            PinAuthBlocked => 0x34,
            PinNotSet => 0x35,
            PinRequired => 0x36,
            PinPolicyViolation => 0x37,
            PinTokenExpired => 0x38,
            RequestTooLarge => 0x39,
            ActionTimeout => 0x3A,
            UpRequired => 0x3B,
            UvBlocked => 0x3C,
            IntegrityFailure => 0x3D,
            InvalidSubcommand => 0x3E,
            UvInvalid => 0x3F,
            UnauthorizedPermission => 0x40,
            Other(byte) => byte,
        }
    }
}

/// Errors surfaced by the CTAP sessions.
#[derive(Debug, Error)]
pub enum FidoError {
    #[error(transparent)]
    Core(#[from] yubikit_core::Error),

    /// The authenticator answered with a non-zero CTAP2 status byte.
    #[error("authenticator returned CTAP status {0:?}")]
    Ctap(CtapStatus),

    /// The connected key only speaks CTAP1/U2F.
    #[error("the key does not support CTAP2")]
    Ctap2NotSupported,
}

impl FidoError {
    pub fn ctap_status(&self) -> Option<CtapStatus> {
        match self {
            FidoError::Ctap(status) => Some(*status),
            _ => None,
        }
    }
}
