//! PIV slots, key algorithms, policies, and management key types.

use yubikit_core::{Error, Version};

/// A PIV key slot, identified by its single-byte reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Slot(u8);

impl Slot {
    /// 9A, used to authenticate the card holder.
    pub const AUTHENTICATION: Slot = Slot(0x9A);
    /// 9C, used for digital signatures.
    pub const SIGNATURE: Slot = Slot(0x9C);
    /// 9D, used for encryption to the card holder.
    pub const KEY_MANAGEMENT: Slot = Slot(0x9D);
    /// 9E, used to authenticate the card itself; no PIN prompt.
    pub const CARD_AUTH: Slot = Slot(0x9E);
    /// F9, signs attestation statements for generated keys.
    pub const ATTESTATION: Slot = Slot(0xF9);

    /// One of the twenty retired key-management slots, 1-based.
    pub fn retired(number: u8) -> Option<Slot> {
        (1..=20).contains(&number).then(|| Slot(0x81 + number))
    }

    pub fn from_byte(byte: u8) -> Option<Slot> {
        match byte {
            0x9A | 0x9C | 0x9D | 0x9E | 0xF9 | 0x82..=0x95 => Some(Slot(byte)),
            _ => None,
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// The data object holding this slot's certificate.
    pub fn certificate_object(self) -> u32 {
        match self.0 {
            0x9A => crate::ObjectId::AUTHENTICATION,
            0x9C => crate::ObjectId::SIGNATURE,
            0x9D => crate::ObjectId::KEY_MANAGEMENT,
            0x9E => crate::ObjectId::CARD_AUTH,
            0xF9 => crate::ObjectId::ATTESTATION,
            retired => crate::ObjectId::RETIRED_BASE + (retired - 0x82) as u32,
        }
    }
}

/// Asymmetric key algorithms, by their PIV algorithm reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyType {
    Rsa1024 = 0x06,
    Rsa2048 = 0x07,
    Rsa3072 = 0x05,
    Rsa4096 = 0x16,
    EccP256 = 0x11,
    EccP384 = 0x14,
    X25519 = 0xE0,
    Ed25519 = 0xE1,
}

impl KeyType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x06 => Some(Self::Rsa1024),
            0x07 => Some(Self::Rsa2048),
            0x05 => Some(Self::Rsa3072),
            0x16 => Some(Self::Rsa4096),
            0x11 => Some(Self::EccP256),
            0x14 => Some(Self::EccP384),
            0xE0 => Some(Self::X25519),
            0xE1 => Some(Self::Ed25519),
            _ => None,
        }
    }

    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn is_rsa(self) -> bool {
        matches!(
            self,
            Self::Rsa1024 | Self::Rsa2048 | Self::Rsa3072 | Self::Rsa4096
        )
    }

    /// Size in bytes of a raw signature input / RSA modulus, or of one
    /// EC coordinate.
    pub fn byte_len(self) -> usize {
        match self {
            Self::Rsa1024 => 128,
            Self::Rsa2048 => 256,
            Self::Rsa3072 => 384,
            Self::Rsa4096 => 512,
            Self::EccP256 | Self::X25519 | Self::Ed25519 => 32,
            Self::EccP384 => 48,
        }
    }

    /// The firmware that introduced this algorithm.
    pub(crate) fn required_version(self) -> (u8, u8, u8) {
        match self {
            Self::Rsa3072 | Self::Rsa4096 | Self::X25519 | Self::Ed25519 => (5, 7, 0),
            _ => (0, 0, 0),
        }
    }

    pub(crate) fn check_version(self, version: Version) -> Result<(), Error> {
        let (major, minor, micro) = self.required_version();
        version.require("this key algorithm", major, minor, micro)
    }
}

/// When the PIN must be presented for a private-key operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum PinPolicy {
    #[default]
    Default = 0x00,
    Never = 0x01,
    Once = 0x02,
    Always = 0x03,
    MatchOnce = 0x04,
    MatchAlways = 0x05,
}

impl PinPolicy {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Default),
            0x01 => Some(Self::Never),
            0x02 => Some(Self::Once),
            0x03 => Some(Self::Always),
            0x04 => Some(Self::MatchOnce),
            0x05 => Some(Self::MatchAlways),
            _ => None,
        }
    }
}

/// When a touch is required for a private-key operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum TouchPolicy {
    #[default]
    Default = 0x00,
    Never = 0x01,
    Always = 0x02,
    Cached = 0x03,
}

impl TouchPolicy {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Default),
            0x01 => Some(Self::Never),
            0x02 => Some(Self::Always),
            0x03 => Some(Self::Cached),
            _ => None,
        }
    }
}

/// Cipher used for management-key mutual authentication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagementKeyType {
    Tdes = 0x03,
    Aes128 = 0x08,
    Aes192 = 0x0A,
    Aes256 = 0x0C,
}

impl ManagementKeyType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x03 => Some(Self::Tdes),
            0x08 => Some(Self::Aes128),
            0x0A => Some(Self::Aes192),
            0x0C => Some(Self::Aes256),
            _ => None,
        }
    }

    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn key_len(self) -> usize {
        match self {
            Self::Tdes | Self::Aes192 => 24,
            Self::Aes128 => 16,
            Self::Aes256 => 32,
        }
    }

    /// Cipher block size, which is also the challenge length.
    pub fn challenge_len(self) -> usize {
        match self {
            Self::Tdes => 8,
            _ => 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_bytes() {
        assert_eq!(Slot::AUTHENTICATION.value(), 0x9A);
        assert_eq!(Slot::retired(1).unwrap().value(), 0x82);
        assert_eq!(Slot::retired(20).unwrap().value(), 0x95);
        assert!(Slot::retired(0).is_none());
        assert!(Slot::retired(21).is_none());
        assert!(Slot::from_byte(0x9B).is_none());
    }

    #[test]
    fn certificate_objects() {
        assert_eq!(Slot::AUTHENTICATION.certificate_object(), 0x5F_C1_05);
        assert_eq!(Slot::SIGNATURE.certificate_object(), 0x5F_C1_0A);
        assert_eq!(Slot::retired(1).unwrap().certificate_object(), 0x5F_C1_0D);
        assert_eq!(Slot::retired(20).unwrap().certificate_object(), 0x5F_C1_20);
    }

    #[test]
    fn key_type_round_trip() {
        for key_type in [
            KeyType::Rsa1024,
            KeyType::Rsa2048,
            KeyType::Rsa3072,
            KeyType::Rsa4096,
            KeyType::EccP256,
            KeyType::EccP384,
            KeyType::X25519,
            KeyType::Ed25519,
        ] {
            assert_eq!(KeyType::from_byte(key_type.value()), Some(key_type));
        }
        assert!(KeyType::from_byte(0x42).is_none());
    }

    #[test]
    fn new_algorithms_are_gated() {
        assert!(KeyType::Rsa4096
            .check_version(Version::new(5, 4, 3))
            .is_err());
        assert!(KeyType::Rsa4096
            .check_version(Version::new(5, 7, 0))
            .is_ok());
        assert!(KeyType::Rsa2048
            .check_version(Version::new(4, 3, 0))
            .is_ok());
    }

    #[test]
    fn management_key_lengths() {
        assert_eq!(ManagementKeyType::Tdes.key_len(), 24);
        assert_eq!(ManagementKeyType::Tdes.challenge_len(), 8);
        assert_eq!(ManagementKeyType::Aes256.key_len(), 32);
        assert_eq!(ManagementKeyType::Aes256.challenge_len(), 16);
    }
}
