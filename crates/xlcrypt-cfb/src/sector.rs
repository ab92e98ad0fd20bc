//! Sector identifiers as stored in the allocation tables.

use std::fmt;

/// One slot of the SAT or SSAT, or the first sector of a chain.
///
/// On disk these are little-endian `i32` values: non-negative values index a sector and
/// negative values are sentinels. Unknown negative values decode as [`SectorId::EndOfChain`]
/// so that traversal stops on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectorId {
    Sector(u32),
    /// `-1`: unallocated.
    Free,
    /// `-2`: last sector of a chain.
    EndOfChain,
    /// `-3`: sector holding part of the SAT.
    SatSector,
    /// `-4`: sector holding part of the extra MSAT chain.
    MsatSector,
}

impl SectorId {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            -1 => SectorId::Free,
            -3 => SectorId::SatSector,
            -4 => SectorId::MsatSector,
            r if r >= 0 => SectorId::Sector(r as u32),
            _ => SectorId::EndOfChain,
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            SectorId::Sector(id) => id as i32,
            SectorId::Free => -1,
            SectorId::EndOfChain => -2,
            SectorId::SatSector => -3,
            SectorId::MsatSector => -4,
        }
    }

    /// Builds a regular sector id from a table index, if it fits the on-disk range.
    pub fn from_index(index: usize) -> Option<Self> {
        i32::try_from(index).ok().map(|v| SectorId::Sector(v as u32))
    }

    pub fn index(self) -> Option<usize> {
        match self {
            SectorId::Sector(id) => Some(id as usize),
            _ => None,
        }
    }

    pub fn is_sector(self) -> bool {
        matches!(self, SectorId::Sector(_))
    }

    pub(crate) fn read_le(bytes: &[u8]) -> Self {
        Self::from_raw(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn to_le_bytes(self) -> [u8; 4] {
        self.to_raw().to_le_bytes()
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectorId::Sector(id) => write!(f, "{id}"),
            SectorId::Free => f.write_str("FREE"),
            SectorId::EndOfChain => f.write_str("END"),
            SectorId::SatSector => f.write_str("SAT"),
            SectorId::MsatSector => f.write_str("MSAT"),
        }
    }
}

pub(crate) fn decode_table(bytes: &[u8]) -> impl Iterator<Item = SectorId> + '_ {
    bytes.chunks_exact(4).map(SectorId::read_le)
}

/// Writes `ids` into `out`; slots beyond `ids.len()` are left untouched.
pub(crate) fn encode_table(ids: &[SectorId], out: &mut [u8]) {
    for (slot, id) in out.chunks_exact_mut(4).zip(ids) {
        slot.copy_from_slice(&id.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_map_to_their_raw_values() {
        assert_eq!(SectorId::from_raw(-1), SectorId::Free);
        assert_eq!(SectorId::from_raw(-2), SectorId::EndOfChain);
        assert_eq!(SectorId::from_raw(-3), SectorId::SatSector);
        assert_eq!(SectorId::from_raw(-4), SectorId::MsatSector);
        assert_eq!(SectorId::from_raw(7), SectorId::Sector(7));
        assert_eq!(SectorId::MsatSector.to_raw(), -4);
        assert_eq!(SectorId::Sector(7).to_raw(), 7);
    }

    #[test]
    fn unknown_negative_values_terminate_chains() {
        assert_eq!(SectorId::from_raw(-5), SectorId::EndOfChain);
        assert_eq!(SectorId::from_raw(i32::MIN), SectorId::EndOfChain);
    }

    #[test]
    fn table_encoding_is_little_endian() {
        let mut out = [0u8; 12];
        encode_table(&[SectorId::Sector(1), SectorId::Free, SectorId::EndOfChain], &mut out);
        assert_eq!(out, [1, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE, 0xFF, 0xFF, 0xFF]);
        let decoded: Vec<_> = decode_table(&out).collect();
        assert_eq!(
            decoded,
            vec![SectorId::Sector(1), SectorId::Free, SectorId::EndOfChain]
        );
    }

    #[test]
    fn from_index_rejects_values_outside_i32() {
        assert_eq!(SectorId::from_index(3), Some(SectorId::Sector(3)));
        assert_eq!(SectorId::from_index(i32::MAX as usize + 1), None);
    }
}
