//! Firmware version triple, as reported by the application SELECT or
//! version probe.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub micro: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, micro: u8) -> Self {
        Self {
            major,
            minor,
            micro,
        }
    }

    /// Parse from the raw three-byte form used on the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [major, minor, micro, ..] => Ok(Self::new(*major, *minor, *micro)),
            _ => Err(Error::BadResponse("version shorter than three bytes")),
        }
    }

    pub fn is_at_least(&self, major: u8, minor: u8, micro: u8) -> bool {
        *self >= Version::new(major, minor, micro)
    }

    /// Error out when the connected firmware predates `major.minor.micro`.
    pub fn require(&self, feature: &'static str, major: u8, minor: u8, micro: u8) -> Result<()> {
        if self.is_at_least(major, minor, micro) {
            Ok(())
        } else {
            Err(Error::NotSupported {
                feature,
                version: *self,
            })
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '.');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or(Error::InvalidArgument("malformed version string"))
        };
        Ok(Self::new(next()?, next()?, next()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        assert!(Version::new(5, 7, 0) > Version::new(5, 4, 3));
        assert!(Version::new(5, 4, 3).is_at_least(5, 4, 3));
        assert!(!Version::new(4, 3, 7).is_at_least(5, 0, 0));
    }

    #[test]
    fn parse_forms() {
        assert_eq!(
            Version::from_bytes(&[5, 4, 3]).unwrap(),
            "5.4.3".parse().unwrap()
        );
        assert!(Version::from_bytes(&[5]).is_err());
        assert!("5.4".parse::<Version>().is_err());
    }

    #[test]
    fn require_names_feature() {
        let version = Version::new(5, 2, 4);
        assert!(version.require("RSA-3072 keys", 5, 7, 0).is_err());
        assert!(version.require("metadata", 5, 3, 0).is_err());
        assert!(version.require("attestation", 4, 3, 0).is_ok());
    }
}
