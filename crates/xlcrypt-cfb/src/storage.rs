//! Sector storage: the MSAT, SAT and SSAT over a flat byte buffer.
//!
//! Chains are linked lists threaded through the allocation tables. Every traversal carries a
//! step budget so that a cyclic table is reported as [`CfbError::CorruptChain`] instead of
//! looping forever.

use std::borrow::Cow;

use log::debug;

use crate::error::{CfbError, Result};
use crate::header::{Header, HEADER_SIZE, INLINE_MSAT_LEN};
use crate::sector::{self, SectorId};

/// Location and length of the mini-stream, which is owned by the root directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiniStream {
    pub start: SectorId,
    pub size: u64,
}

impl Default for MiniStream {
    fn default() -> Self {
        Self {
            start: SectorId::EndOfChain,
            size: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SectorStorage {
    header: Header,
    data: Vec<u8>,
    /// Sectors holding the SAT, in table order.
    msat: Vec<u32>,
    /// Sectors holding MSAT entries beyond the 109 inline ones.
    extra_msat: Vec<u32>,
    sat: Vec<SectorId>,
    ssat: Vec<SectorId>,
}

impl SectorStorage {
    /// Opens an existing container, materializing the MSAT, SAT and SSAT.
    pub fn open(data: Vec<u8>) -> Result<Self> {
        let header = Header::parse(&data)?;
        let mut storage = SectorStorage {
            header,
            data,
            msat: Vec::new(),
            extra_msat: Vec::new(),
            sat: Vec::new(),
            ssat: Vec::new(),
        };
        storage.load_msat()?;
        storage.load_sat()?;
        storage.load_ssat()?;
        debug!(
            "opened compound file: {} SAT sectors, {} SAT entries, {} SSAT entries",
            storage.msat.len(),
            storage.sat.len(),
            storage.ssat.len()
        );
        Ok(storage)
    }

    /// Starts an empty container with no allocated sectors.
    pub fn create(sector_size_power: u16, short_sector_size_power: u16) -> Result<Self> {
        let header = Header::new(sector_size_power, short_sector_size_power)?;
        let data = vec![0u8; header.data_start()];
        let mut storage = SectorStorage {
            header,
            data,
            msat: Vec::new(),
            extra_msat: Vec::new(),
            sat: Vec::new(),
            ssat: Vec::new(),
        };
        storage.flush()?;
        Ok(storage)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn sat(&self) -> &[SectorId] {
        &self.sat
    }

    pub fn ssat(&self) -> &[SectorId] {
        &self.ssat
    }

    pub fn msat(&self) -> &[u32] {
        &self.msat
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of sector slots backed by the buffer, counting a trailing partial sector.
    pub fn sector_count(&self) -> usize {
        self.data
            .len()
            .saturating_sub(self.header.data_start())
            .div_ceil(self.header.sector_size())
    }

    fn step_budget(&self) -> usize {
        self.sat.len().max(self.sector_count()) + 1
    }

    fn load_msat(&mut self) -> Result<()> {
        let count = self.header.num_msat_sectors as usize;
        let mut msat = Vec::with_capacity(count.min(self.sector_count()));
        let mut listed = vec![false; self.sector_count()];
        for &id in self.header.msat.iter().take(count.min(INLINE_MSAT_LEN)) {
            msat.push(self.claim_sat_sector(&mut listed, id)?);
        }

        let per_sector = self.header.entries_per_sector() - 1;
        let budget = self.step_budget();
        let mut extra = Vec::new();
        let mut next = self.header.extra_msat_start;
        while msat.len() < count {
            let SectorId::Sector(id) = next else {
                return Err(self.corrupt("MSAT", self.header.extra_msat_start));
            };
            if extra.len() >= budget {
                return Err(self.corrupt("MSAT", self.header.extra_msat_start));
            }
            let bytes = self.sector(id)?;
            for entry in sector::decode_table(&bytes[..per_sector * 4]) {
                if msat.len() == count {
                    break;
                }
                msat.push(self.claim_sat_sector(&mut listed, entry)?);
            }
            next = SectorId::read_le(&bytes[per_sector * 4..]);
            extra.push(id);
        }

        self.msat = msat;
        self.extra_msat = extra;
        Ok(())
    }

    /// Each SAT sector may be listed once, and must lie inside the buffer.
    fn claim_sat_sector(&self, listed: &mut [bool], entry: SectorId) -> Result<u32> {
        let SectorId::Sector(id) = entry else {
            return Err(bad_msat_entry());
        };
        match listed.get_mut(id as usize) {
            Some(seen) if !*seen => {
                *seen = true;
                Ok(id)
            }
            Some(_) => Err(CfbError::InvalidHeader {
                reason: "MSAT lists a sector more than once",
            }),
            None => Err(CfbError::SectorOutOfBounds {
                id,
                len: self.data.len(),
            }),
        }
    }

    fn load_sat(&mut self) -> Result<()> {
        let mut sat = Vec::new();
        for &id in &self.msat {
            sat.extend(sector::decode_table(&self.sector(id)?));
        }
        self.sat = sat;
        Ok(())
    }

    fn load_ssat(&mut self) -> Result<()> {
        let mut ssat = Vec::new();
        for id in self.follow_sat(self.header.short_table_start, "SSAT")? {
            ssat.extend(sector::decode_table(&self.sector(id)?));
        }
        self.ssat = ssat;
        Ok(())
    }

    /// Returns the bytes of sector `id`, zero-padding a sector cut short by the end of the buffer.
    fn sector(&self, id: u32) -> Result<Cow<'_, [u8]>> {
        let size = self.header.sector_size();
        let out_of_bounds = || CfbError::SectorOutOfBounds {
            id,
            len: self.data.len(),
        };
        let start = self.header.sector_offset(id).ok_or_else(out_of_bounds)?;
        if start >= self.data.len() {
            return Err(out_of_bounds());
        }
        let end = start.saturating_add(size);
        if end <= self.data.len() {
            return Ok(Cow::Borrowed(&self.data[start..end]));
        }
        debug!("sector {id} is truncated; padding with zeros");
        let mut padded = self.data[start..].to_vec();
        padded.resize(size, 0);
        Ok(Cow::Owned(padded))
    }

    /// Grows the buffer so that sector `id` is fully backed and returns its offset.
    fn ensure_sector(&mut self, id: u32) -> Result<usize> {
        let offset = self
            .header
            .sector_offset(id)
            .ok_or(CfbError::TooManySectors)?;
        let end = offset
            .checked_add(self.header.sector_size())
            .ok_or(CfbError::TooManySectors)?;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        Ok(offset)
    }

    fn corrupt(&self, table: &'static str, start: SectorId) -> CfbError {
        CfbError::CorruptChain {
            table,
            start: start.to_raw(),
        }
    }

    /// Sector ids of the SAT chain starting at `start`.
    pub fn chain(&self, start: SectorId) -> Result<Vec<u32>> {
        self.follow_sat(start, "SAT")
    }

    fn follow_sat(&self, start: SectorId, table: &'static str) -> Result<Vec<u32>> {
        follow(&self.sat, start, self.step_budget())
            .ok_or_else(|| self.corrupt(table, start))
    }

    fn follow_ssat(&self, start: SectorId) -> Result<Vec<u32>> {
        follow(&self.ssat, start, self.ssat.len() + 1).ok_or_else(|| self.corrupt("SSAT", start))
    }

    /// Reads the full-sector chain starting at `start`.
    ///
    /// The result is a whole number of sectors; callers truncate to the stream size.
    pub fn read(&self, start: SectorId) -> Result<Vec<u8>> {
        let chain = self.follow_sat(start, "SAT")?;
        let sector_size = self.header.sector_size();
        let mut out =
            Vec::with_capacity(chain.len().saturating_mul(sector_size).min(self.data.len()));
        for id in chain {
            out.extend_from_slice(&self.sector(id)?);
        }
        Ok(out)
    }

    /// Reads the short-sector chain starting at `start` out of the mini-stream.
    pub fn read_short(&self, start: SectorId, mini: MiniStream) -> Result<Vec<u8>> {
        let short_size = self.header.short_sector_size();
        let chain = self.follow_ssat(start)?;
        let mini_chain = self.follow_sat(mini.start, "mini-stream")?;
        let mut out =
            Vec::with_capacity(chain.len().saturating_mul(short_size).min(self.data.len()));
        for k in chain {
            let offset = self.short_sector_offset(&mini_chain, k)?;
            out.extend_from_slice(&self.data[offset..offset + short_size]);
        }
        Ok(out)
    }

    /// Translates short sector `k` into an absolute buffer offset via the mini-stream chain.
    fn short_sector_offset(&self, mini_chain: &[u32], k: u32) -> Result<usize> {
        let sector_size = self.header.sector_size();
        let short_size = self.header.short_sector_size();
        let position = (k as usize)
            .checked_mul(short_size)
            .ok_or(CfbError::TooManySectors)?;
        let sector = *mini_chain
            .get(position / sector_size)
            .ok_or(CfbError::CorruptChain {
                table: "mini-stream",
                start: k as i32,
            })?;
        let offset = self
            .header
            .sector_offset(sector)
            .and_then(|base| base.checked_add(position % sector_size))
            .ok_or(CfbError::TooManySectors)?;
        match offset.checked_add(short_size) {
            Some(end) if end <= self.data.len() => Ok(offset),
            _ => Err(CfbError::SectorOutOfBounds {
                id: sector,
                len: self.data.len(),
            }),
        }
    }

    /// Writes `bytes` across the chain starting at `start`, one sector per link.
    pub fn write(&mut self, bytes: &[u8], start: SectorId) -> Result<()> {
        let sector_size = self.header.sector_size();
        let chain = self.follow_sat(start, "SAT")?;
        let available = chain.len().saturating_mul(sector_size);
        if available < bytes.len() {
            return Err(CfbError::ChainTooShort {
                start: start.to_raw(),
                needed: bytes.len(),
                available,
            });
        }
        for (id, chunk) in chain.into_iter().zip(bytes.chunks(sector_size)) {
            let offset = self.ensure_sector(id)?;
            let slot = &mut self.data[offset..offset + sector_size];
            slot[..chunk.len()].copy_from_slice(chunk);
            slot[chunk.len()..].fill(0);
        }
        Ok(())
    }

    /// Writes `bytes` across the short-sector chain starting at `start`.
    pub fn write_short(&mut self, bytes: &[u8], start: SectorId, mini: MiniStream) -> Result<()> {
        let short_size = self.header.short_sector_size();
        let chain = self.follow_ssat(start)?;
        let available = chain.len().saturating_mul(short_size);
        if available < bytes.len() {
            return Err(CfbError::ChainTooShort {
                start: start.to_raw(),
                needed: bytes.len(),
                available,
            });
        }
        let mini_chain = self.follow_sat(mini.start, "mini-stream")?;
        for &id in &mini_chain {
            self.ensure_sector(id)?;
        }
        for (k, chunk) in chain.into_iter().zip(bytes.chunks(short_size)) {
            let offset = self.short_sector_offset(&mini_chain, k)?;
            let slot = &mut self.data[offset..offset + short_size];
            slot[..chunk.len()].copy_from_slice(chunk);
            slot[chunk.len()..].fill(0);
        }
        Ok(())
    }

    /// Allocates a chain of `count` sectors and returns its first id.
    ///
    /// First-fit over free SAT entries; the SAT grows when there are not enough. The chosen
    /// sectors need not be contiguous.
    pub fn allocate_sectors(&mut self, count: usize) -> Result<SectorId> {
        let start = self.allocate_chain(count)?;
        self.flush()?;
        Ok(start)
    }

    fn allocate_chain(&mut self, count: usize) -> Result<SectorId> {
        if count == 0 {
            return Ok(SectorId::EndOfChain);
        }
        let mut free = free_slots(&self.sat, count);
        while free.len() < count {
            self.grow_sat()?;
            free = free_slots(&self.sat, count);
        }
        link(&mut self.sat, &free)?;
        for &index in &free {
            let id = sector_number(index)?;
            self.ensure_sector(id)?;
        }
        debug!("allocated {count} sectors starting at {}", free[0]);
        SectorId::from_index(free[0]).ok_or(CfbError::TooManySectors)
    }

    /// Adds one sector's worth of SAT entries and backs them with a new SAT sector.
    fn grow_sat(&mut self) -> Result<()> {
        let per_sector = self.header.entries_per_sector();
        let len = self.sat.len().div_ceil(per_sector) * per_sector + per_sector;
        self.sat.resize(len, SectorId::Free);

        let SectorId::Sector(id) = self.allocate_chain(1)? else {
            return Err(CfbError::TooManySectors);
        };
        self.sat[id as usize] = SectorId::SatSector;
        self.register_sat_sector(id)?;
        debug!("grew SAT to {len} entries, backed by sector {id}");
        Ok(())
    }

    fn register_sat_sector(&mut self, id: u32) -> Result<()> {
        let index = self.msat.len();
        self.msat.push(id);
        if index < INLINE_MSAT_LEN {
            self.header.msat[index] = SectorId::Sector(id);
        } else {
            let per_extra = self.header.entries_per_sector() - 1;
            if (index - INLINE_MSAT_LEN) / per_extra >= self.extra_msat.len() {
                let SectorId::Sector(extra) = self.allocate_chain(1)? else {
                    return Err(CfbError::TooManySectors);
                };
                self.sat[extra as usize] = SectorId::MsatSector;
                if self.extra_msat.is_empty() {
                    self.header.extra_msat_start = SectorId::Sector(extra);
                }
                self.extra_msat.push(extra);
                self.header.num_extra_msat_sectors =
                    u32::try_from(self.extra_msat.len()).map_err(|_| CfbError::TooManySectors)?;
                debug!("added extra MSAT sector {extra}");
            }
        }
        self.header.num_msat_sectors =
            u32::try_from(self.msat.len()).map_err(|_| CfbError::TooManySectors)?;
        Ok(())
    }

    /// Allocates `count` short sectors, extending the SSAT and the mini-stream as needed.
    ///
    /// `mini` is updated in place when the mini-stream grows; the caller stores it back into the
    /// root entry.
    pub fn allocate_short_sectors(
        &mut self,
        count: usize,
        mini: &mut MiniStream,
    ) -> Result<SectorId> {
        if count == 0 {
            return Ok(SectorId::EndOfChain);
        }
        let mut free = free_slots(&self.ssat, count);
        while free.len() < count {
            self.grow_ssat()?;
            free = free_slots(&self.ssat, count);
        }
        link(&mut self.ssat, &free)?;
        let highest = free.iter().copied().max().unwrap_or_default();
        self.extend_mini_stream(mini, highest + 1)?;
        self.flush()?;
        debug!("allocated {count} short sectors starting at {}", free[0]);
        SectorId::from_index(free[0]).ok_or(CfbError::TooManySectors)
    }

    fn grow_ssat(&mut self) -> Result<()> {
        let per_sector = self.header.entries_per_sector();
        let backing = self.allocate_chain(1)?;
        self.header.short_table_start =
            self.append_to_chain(self.header.short_table_start, backing, "SSAT")?;
        self.header.num_short_sectors = self.header.num_short_sectors.saturating_add(1);
        let len = self.ssat.len().div_ceil(per_sector) * per_sector + per_sector;
        self.ssat.resize(len, SectorId::Free);
        debug!("grew SSAT to {len} entries");
        Ok(())
    }

    /// Ensures the mini-stream spans at least `short_sectors` short sectors.
    fn extend_mini_stream(&mut self, mini: &mut MiniStream, short_sectors: usize) -> Result<()> {
        let needed_bytes = short_sectors
            .checked_mul(self.header.short_sector_size())
            .ok_or(CfbError::TooManySectors)?;
        let needed = needed_bytes.div_ceil(self.header.sector_size());
        let have = self.follow_sat(mini.start, "mini-stream")?.len();
        if have < needed {
            let tail = self.allocate_chain(needed - have)?;
            mini.start = self.append_to_chain(mini.start, tail, "mini-stream")?;
        }
        mini.size = mini.size.max(needed_bytes as u64);
        Ok(())
    }

    /// Links `tail` after the last sector of the chain at `start` and returns the chain start.
    fn append_to_chain(
        &mut self,
        start: SectorId,
        tail: SectorId,
        table: &'static str,
    ) -> Result<SectorId> {
        match self.follow_sat(start, table)?.last() {
            Some(&last) => {
                self.sat[last as usize] = tail;
                Ok(start)
            }
            None => Ok(tail),
        }
    }

    /// Appends `count` freshly allocated sectors to the chain at `start`.
    pub fn extend_chain(&mut self, start: SectorId, count: usize) -> Result<SectorId> {
        let tail = self.allocate_chain(count)?;
        let start = self.append_to_chain(start, tail, "SAT")?;
        self.flush()?;
        Ok(start)
    }

    /// Serializes the header, SAT, extra MSAT sectors and SSAT back into the buffer.
    pub fn flush(&mut self) -> Result<()> {
        let sector_size = self.header.sector_size();
        let per_sector = self.header.entries_per_sector();

        for n in 0..self.msat.len() {
            let offset = self.ensure_sector(self.msat[n])?;
            let begin = (n * per_sector).min(self.sat.len());
            let end = (begin + per_sector).min(self.sat.len());
            let slot = &mut self.data[offset..offset + sector_size];
            slot.fill(0xFF);
            sector::encode_table(&self.sat[begin..end], slot);
        }

        let per_extra = per_sector - 1;
        for n in 0..self.extra_msat.len() {
            let offset = self.ensure_sector(self.extra_msat[n])?;
            let next = self
                .extra_msat
                .get(n + 1)
                .map_or(SectorId::EndOfChain, |&id| SectorId::Sector(id));
            let begin = (INLINE_MSAT_LEN + n * per_extra).min(self.msat.len());
            let end = (begin + per_extra).min(self.msat.len());
            let slot = &mut self.data[offset..offset + sector_size];
            slot.fill(0xFF);
            for (raw, &sat_sector) in slot.chunks_exact_mut(4).zip(&self.msat[begin..end]) {
                raw.copy_from_slice(&SectorId::Sector(sat_sector).to_le_bytes());
            }
            slot[per_extra * 4..].copy_from_slice(&next.to_le_bytes());
        }

        let ssat_chain = self.follow_sat(self.header.short_table_start, "SSAT")?;
        for (n, id) in ssat_chain.into_iter().enumerate() {
            let offset = self.ensure_sector(id)?;
            let begin = (n * per_sector).min(self.ssat.len());
            let end = (begin + per_sector).min(self.ssat.len());
            let slot = &mut self.data[offset..offset + sector_size];
            slot.fill(0xFF);
            sector::encode_table(&self.ssat[begin..end], slot);
        }

        let header = self.header.to_bytes();
        self.data[..HEADER_SIZE].copy_from_slice(&header);
        Ok(())
    }
}

/// Follows `table` from `start`; `None` when the chain leaves the table or exceeds `budget` links.
fn follow(table: &[SectorId], start: SectorId, budget: usize) -> Option<Vec<u32>> {
    let mut ids = Vec::new();
    let mut current = start;
    while let SectorId::Sector(id) = current {
        if ids.len() >= budget {
            return None;
        }
        ids.push(id);
        current = *table.get(id as usize)?;
    }
    Some(ids)
}

fn free_slots(table: &[SectorId], count: usize) -> Vec<usize> {
    table
        .iter()
        .enumerate()
        .filter(|(_, id)| **id == SectorId::Free)
        .map(|(index, _)| index)
        .take(count)
        .collect()
}

/// Chains the slots in order, terminating the last one.
fn link(table: &mut [SectorId], slots: &[usize]) -> Result<()> {
    for pair in slots.windows(2) {
        table[pair[0]] = SectorId::from_index(pair[1]).ok_or(CfbError::TooManySectors)?;
    }
    if let Some(&last) = slots.last() {
        table[last] = SectorId::EndOfChain;
    }
    Ok(())
}

fn sector_number(index: usize) -> Result<u32> {
    match SectorId::from_index(index) {
        Some(SectorId::Sector(id)) => Ok(id),
        _ => Err(CfbError::TooManySectors),
    }
}

fn bad_msat_entry() -> CfbError {
    CfbError::InvalidHeader {
        reason: "MSAT entry does not name a sector",
    }
}
