//! The fixed 512-byte compound file header.

use crate::error::{CfbError, Result};
use crate::sector::SectorId;

pub const HEADER_SIZE: usize = 512;
pub const SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
/// Streams smaller than this live in the mini-stream.
pub const MINI_STREAM_CUTOFF: u32 = 4096;
/// MSAT entries stored inline in the header.
pub const INLINE_MSAT_LEN: usize = 109;

const BYTE_ORDER_MARK: u16 = 0xFFFE;
const MINOR_VERSION: u16 = 0x003E;

/// Parsed compound file header.
///
/// `num_msat_sectors` is the number of sectors holding the SAT, i.e. the number of valid MSAT
/// entries (inline plus extra).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub clsid: [u8; 16],
    pub minor_version: u16,
    pub major_version: u16,
    pub sector_size_power: u16,
    pub short_sector_size_power: u16,
    pub num_directory_sectors: u32,
    pub num_msat_sectors: u32,
    pub directory_start: SectorId,
    pub transaction_signature: u32,
    pub threshold: u32,
    pub short_table_start: SectorId,
    pub num_short_sectors: u32,
    pub extra_msat_start: SectorId,
    pub num_extra_msat_sectors: u32,
    pub msat: [SectorId; INLINE_MSAT_LEN],
}

impl Header {
    pub(crate) fn new(sector_size_power: u16, short_sector_size_power: u16) -> Result<Self> {
        let header = Header {
            clsid: [0; 16],
            minor_version: MINOR_VERSION,
            major_version: if sector_size_power == 12 { 4 } else { 3 },
            sector_size_power,
            short_sector_size_power,
            num_directory_sectors: 0,
            num_msat_sectors: 0,
            directory_start: SectorId::EndOfChain,
            transaction_signature: 0,
            threshold: MINI_STREAM_CUTOFF,
            short_table_start: SectorId::EndOfChain,
            num_short_sectors: 0,
            extra_msat_start: SectorId::EndOfChain,
            num_extra_msat_sectors: 0,
            msat: [SectorId::Free; INLINE_MSAT_LEN],
        };
        header.validate()?;
        Ok(header)
    }

    /// Parses and validates the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(invalid("truncated header"));
        }
        if bytes[..SIGNATURE.len()] != SIGNATURE {
            return Err(invalid("missing compound file signature"));
        }
        if u16_at(bytes, 28) != BYTE_ORDER_MARK {
            return Err(invalid("unexpected byte order mark"));
        }

        let mut clsid = [0u8; 16];
        clsid.copy_from_slice(&bytes[8..24]);
        let mut msat = [SectorId::Free; INLINE_MSAT_LEN];
        for (slot, raw) in msat.iter_mut().zip(bytes[76..HEADER_SIZE].chunks_exact(4)) {
            *slot = SectorId::read_le(raw);
        }

        let header = Header {
            clsid,
            minor_version: u16_at(bytes, 24),
            major_version: u16_at(bytes, 26),
            sector_size_power: u16_at(bytes, 30),
            short_sector_size_power: u16_at(bytes, 32),
            num_directory_sectors: u32_at(bytes, 40),
            num_msat_sectors: u32_at(bytes, 44),
            directory_start: SectorId::read_le(&bytes[48..52]),
            transaction_signature: u32_at(bytes, 52),
            threshold: u32_at(bytes, 56),
            short_table_start: SectorId::read_le(&bytes[60..64]),
            num_short_sectors: u32_at(bytes, 64),
            extra_msat_start: SectorId::read_le(&bytes[68..72]),
            num_extra_msat_sectors: u32_at(bytes, 72),
            msat,
        };
        header.validate()?;
        Ok(header)
    }

    /// Checks the layout invariants every container must satisfy before any table is read.
    pub fn validate(&self) -> Result<()> {
        if self.threshold != MINI_STREAM_CUTOFF {
            return Err(invalid("mini stream cutoff must be 4096"));
        }
        if self.sector_size_power <= 6 || self.sector_size_power >= 31 {
            return Err(invalid("sector size out of range"));
        }
        if self.short_sector_size_power > self.sector_size_power {
            return Err(invalid("short sector size exceeds sector size"));
        }

        let per_extra_sector = (self.sector_size() / 4 - 1) as u64;
        let extra = u64::from(self.num_extra_msat_sectors);
        let limit = if extra == 0 {
            INLINE_MSAT_LEN as u64
        } else {
            extra
                .saturating_mul(per_extra_sector)
                .saturating_add(INLINE_MSAT_LEN as u64)
        };
        if u64::from(self.num_msat_sectors) > limit {
            return Err(invalid("MSAT sector count inconsistent with extra MSAT sectors"));
        }
        Ok(())
    }

    pub fn sector_size(&self) -> usize {
        1usize << self.sector_size_power
    }

    pub fn short_sector_size(&self) -> usize {
        1usize << self.short_sector_size_power
    }

    /// Number of sector ids that fit in one sector.
    pub fn entries_per_sector(&self) -> usize {
        self.sector_size() / 4
    }

    /// Byte offset of sector 0.
    ///
    /// The header occupies a whole sector when sectors are larger than the header itself.
    pub fn data_start(&self) -> usize {
        HEADER_SIZE.max(self.sector_size())
    }

    pub fn sector_offset(&self, id: u32) -> Option<usize> {
        (id as usize)
            .checked_mul(self.sector_size())?
            .checked_add(self.data_start())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..8].copy_from_slice(&SIGNATURE);
        out[8..24].copy_from_slice(&self.clsid);
        out[24..26].copy_from_slice(&self.minor_version.to_le_bytes());
        out[26..28].copy_from_slice(&self.major_version.to_le_bytes());
        out[28..30].copy_from_slice(&BYTE_ORDER_MARK.to_le_bytes());
        out[30..32].copy_from_slice(&self.sector_size_power.to_le_bytes());
        out[32..34].copy_from_slice(&self.short_sector_size_power.to_le_bytes());
        out[40..44].copy_from_slice(&self.num_directory_sectors.to_le_bytes());
        out[44..48].copy_from_slice(&self.num_msat_sectors.to_le_bytes());
        out[48..52].copy_from_slice(&self.directory_start.to_le_bytes());
        out[52..56].copy_from_slice(&self.transaction_signature.to_le_bytes());
        out[56..60].copy_from_slice(&self.threshold.to_le_bytes());
        out[60..64].copy_from_slice(&self.short_table_start.to_le_bytes());
        out[64..68].copy_from_slice(&self.num_short_sectors.to_le_bytes());
        out[68..72].copy_from_slice(&self.extra_msat_start.to_le_bytes());
        out[72..76].copy_from_slice(&self.num_extra_msat_sectors.to_le_bytes());
        for (slot, id) in out[76..].chunks_exact_mut(4).zip(&self.msat) {
            slot.copy_from_slice(&id.to_le_bytes());
        }
        out
    }
}

fn invalid(reason: &'static str) -> CfbError {
    CfbError::InvalidHeader { reason }
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_header_bytes() -> [u8; HEADER_SIZE] {
        Header::new(9, 6).expect("header").to_bytes()
    }

    #[test]
    fn new_header_reparses_identically() {
        let header = Header::new(9, 6).expect("header");
        let parsed = Header::parse(&header.to_bytes()).expect("parse");
        assert_eq!(parsed, header);
        assert_eq!(parsed.major_version, 3);
        assert_eq!(parsed.sector_size(), 512);
        assert_eq!(parsed.short_sector_size(), 64);
        assert_eq!(parsed.data_start(), 512);
    }

    #[test]
    fn large_sectors_start_after_a_full_header_sector() {
        let header = Header::new(12, 6).expect("header");
        assert_eq!(header.major_version, 4);
        assert_eq!(header.data_start(), 4096);
        assert_eq!(header.sector_offset(2), Some(3 * 4096));
    }

    #[test]
    fn rejects_small_sector_power() {
        let mut bytes = default_header_bytes();
        bytes[30..32].copy_from_slice(&5u16.to_le_bytes());
        let err = Header::parse(&bytes).expect_err("power 5 must fail");
        assert!(err.to_string().contains("bad ole"), "{err}");
    }

    #[test]
    fn rejects_oversized_sector_power() {
        let mut bytes = default_header_bytes();
        bytes[30..32].copy_from_slice(&31u16.to_le_bytes());
        assert!(Header::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_short_sectors_larger_than_sectors() {
        let mut bytes = default_header_bytes();
        bytes[32..34].copy_from_slice(&10u16.to_le_bytes());
        assert!(matches!(
            Header::parse(&bytes),
            Err(CfbError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn rejects_other_cutoffs() {
        let mut bytes = default_header_bytes();
        bytes[56..60].copy_from_slice(&4097u32.to_le_bytes());
        assert!(matches!(
            Header::parse(&bytes),
            Err(CfbError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn msat_count_must_fit_inline_without_extra_sectors() {
        let mut bytes = default_header_bytes();
        bytes[44..48].copy_from_slice(&110u32.to_le_bytes());
        assert!(Header::parse(&bytes).is_err());

        // One extra MSAT sector of 512 bytes holds 127 more entries.
        bytes[72..76].copy_from_slice(&1u32.to_le_bytes());
        assert!(Header::parse(&bytes).is_ok());
        bytes[44..48].copy_from_slice(&(109u32 + 128).to_le_bytes());
        assert!(Header::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_missing_signature_and_truncation() {
        let mut bytes = default_header_bytes();
        bytes[0] = b'P';
        assert!(Header::parse(&bytes).is_err());
        assert!(Header::parse(&default_header_bytes()[..100]).is_err());
    }
}
