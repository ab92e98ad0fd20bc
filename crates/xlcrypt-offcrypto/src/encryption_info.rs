use log::debug;

use crate::agile::AgileEncryptionInfo;
use crate::error::{OffcryptoError, Result};
use crate::reader::Reader;
use crate::standard::StandardEncryptionInfo;

const FLAG_RESERVED: u32 = 0x03;
const FLAG_CRYPTO_API: u32 = 0x04;
const FLAG_EXTERNAL: u32 = 0x10;
const FLAG_AES: u32 = 0x20;
pub(crate) const AGILE_FLAGS: u32 = 0x40;

/// The 8-byte `EncryptionVersionInfo` prefix of the `EncryptionInfo` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionVersion {
    pub major: u16,
    pub minor: u16,
    pub flags: u32,
}

impl EncryptionVersion {
    pub(crate) fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..2].copy_from_slice(&self.major.to_le_bytes());
        out[2..4].copy_from_slice(&self.minor.to_le_bytes());
        out[4..].copy_from_slice(&self.flags.to_le_bytes());
        out
    }
}

/// A fully parsed `EncryptionInfo` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionInfo {
    Standard {
        version: EncryptionVersion,
        info: StandardEncryptionInfo,
    },
    Agile {
        version: EncryptionVersion,
        info: AgileEncryptionInfo,
    },
}

impl EncryptionInfo {
    pub fn version(&self) -> EncryptionVersion {
        match self {
            EncryptionInfo::Standard { version, .. } | EncryptionInfo::Agile { version, .. } => {
                *version
            }
        }
    }

    pub fn is_agile(&self) -> bool {
        matches!(self, EncryptionInfo::Agile { .. })
    }
}

/// Parse an MS-OFFCRYPTO `EncryptionInfo` stream.
///
/// Version 4.4 is agile and must carry flags `0x40`. Everything else must be a standard
/// descriptor (version 2.2, 3.2 or 4.2) with `fCryptoAPI` and `fAES` set and `fExternal` clear.
pub fn parse_encryption_info(bytes: &[u8]) -> Result<EncryptionInfo> {
    let mut r = Reader::new(bytes);
    let major = r.read_u16_le("EncryptionVersionInfo.major")?;
    let minor = r.read_u16_le("EncryptionVersionInfo.minor")?;
    let flags = r.read_u32_le("EncryptionVersionInfo.flags")?;
    let version = EncryptionVersion {
        major,
        minor,
        flags,
    };

    if (major, minor) == (4, 4) {
        if flags != AGILE_FLAGS {
            return Err(OffcryptoError::BadHeader {
                reason: "agile EncryptionInfo flags must be 0x40",
            });
        }
        debug!("EncryptionInfo is agile (4.4)");
        let info = AgileEncryptionInfo::parse_xml(r.remaining())?;
        return Ok(EncryptionInfo::Agile { version, info });
    }

    if minor != 2 || !(2..=4).contains(&major) {
        return Err(OffcryptoError::UnsupportedVersion { major, minor });
    }
    validate_standard_flags(flags)?;
    debug!("EncryptionInfo is standard ({major}.{minor})");
    let info = StandardEncryptionInfo::parse(r.remaining())?;
    Ok(EncryptionInfo::Standard { version, info })
}

pub(crate) fn validate_standard_flags(flags: u32) -> Result<()> {
    if flags & FLAG_RESERVED != 0 {
        return Err(OffcryptoError::BadHeader {
            reason: "reserved EncryptionInfo flag bits are set",
        });
    }
    if flags & FLAG_CRYPTO_API == 0 || flags & FLAG_EXTERNAL != 0 {
        return Err(OffcryptoError::ExtensibleEncryption);
    }
    if flags & FLAG_AES == 0 {
        return Err(OffcryptoError::NotOoxml);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(major: u16, minor: u16, flags: u32) -> Vec<u8> {
        EncryptionVersion {
            major,
            minor,
            flags,
        }
        .to_bytes()
        .to_vec()
    }

    #[test]
    fn agile_requires_exact_flags() {
        let err = parse_encryption_info(&prefix(4, 4, 0x24)).unwrap_err();
        assert!(err.to_string().contains("bad header"), "{err}");
    }

    #[test]
    fn standard_versions_are_limited() {
        for (major, minor) in [(1, 2), (5, 2), (3, 3), (4, 3)] {
            assert!(matches!(
                parse_encryption_info(&prefix(major, minor, 0x24)),
                Err(OffcryptoError::UnsupportedVersion { .. })
            ));
        }
    }

    #[test]
    fn standard_flag_rules() {
        assert!(matches!(
            validate_standard_flags(0x25),
            Err(OffcryptoError::BadHeader { .. })
        ));
        assert!(matches!(
            validate_standard_flags(0x20),
            Err(OffcryptoError::ExtensibleEncryption)
        ));
        assert!(matches!(
            validate_standard_flags(0x34),
            Err(OffcryptoError::ExtensibleEncryption)
        ));
        let err = validate_standard_flags(0x04).unwrap_err();
        assert_eq!(err.to_string(), "not an OOXML document");
        assert!(validate_standard_flags(0x24).is_ok());
    }

    #[test]
    fn truncated_prefix_is_reported() {
        assert!(matches!(
            parse_encryption_info(&[4, 0, 4]),
            Err(OffcryptoError::Truncated { .. })
        ));
    }
}
