//! The directory catalog: 128-byte entries stored across the directory sector chain.
//!
//! Entries live in an arena (`Vec<DirectoryEntry>`) addressed by [`EntryId`]. The on-disk
//! sibling links form a binary search tree per storage; lookups go through an ordered index
//! keyed by the case-folded path instead of walking those links.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use log::debug;

use crate::error::{CfbError, Result};
use crate::sector::SectorId;
use crate::storage::{MiniStream, SectorStorage};

pub const ENTRY_SIZE: usize = 128;
pub const ROOT_ENTRY_NAME: &str = "Root Entry";

const NO_STREAM: u32 = 0xFFFF_FFFF;
const MAX_NAME_UNITS: usize = 31;

/// Index of an entry in the directory array.
pub type EntryId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Empty,
    UserStorage,
    UserStream,
    LockBytes,
    Property,
    RootStorage,
}

impl EntryType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => EntryType::Empty,
            1 => EntryType::UserStorage,
            2 => EntryType::UserStream,
            3 => EntryType::LockBytes,
            4 => EntryType::Property,
            5 => EntryType::RootStorage,
            _ => return None,
        })
    }

    pub fn to_raw(self) -> u8 {
        match self {
            EntryType::Empty => 0,
            EntryType::UserStorage => 1,
            EntryType::UserStream => 2,
            EntryType::LockBytes => 3,
            EntryType::Property => 4,
            EntryType::RootStorage => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeColor {
    Red,
    Black,
}

/// One directory record.
///
/// `left`/`right` are the on-disk "previous"/"next" sibling links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub entry_type: EntryType,
    pub color: NodeColor,
    pub left: Option<EntryId>,
    pub right: Option<EntryId>,
    pub child: Option<EntryId>,
    pub clsid: [u8; 16],
    pub state_bits: u32,
    pub created: u64,
    pub modified: u64,
    pub start: SectorId,
    pub size: u64,
}

impl DirectoryEntry {
    pub fn new(name: impl Into<String>, entry_type: EntryType) -> Self {
        Self {
            name: name.into(),
            entry_type,
            color: NodeColor::Black,
            left: None,
            right: None,
            child: None,
            clsid: [0; 16],
            state_bits: 0,
            created: 0,
            modified: 0,
            start: SectorId::EndOfChain,
            size: 0,
        }
    }

    pub fn empty() -> Self {
        Self::new(String::new(), EntryType::Empty)
    }

    pub fn is_stream(&self) -> bool {
        self.entry_type == EntryType::UserStream
    }

    pub fn is_storage(&self) -> bool {
        matches!(
            self.entry_type,
            EntryType::UserStorage | EntryType::RootStorage
        )
    }

    /// Decodes the 128-byte record `bytes`; `major_version` 3 ignores the upper half of the size.
    pub fn parse(id: EntryId, bytes: &[u8], major_version: u16) -> Result<Self> {
        let invalid = |reason| CfbError::InvalidDirectoryEntry { id, reason };
        if bytes.len() < ENTRY_SIZE {
            return Err(invalid("truncated entry"));
        }
        let entry_type = EntryType::from_raw(bytes[66]).ok_or_else(|| invalid("unknown entry type"))?;
        if entry_type == EntryType::Empty {
            return Ok(Self::empty());
        }

        let name_len = usize::from(u16::from_le_bytes([bytes[64], bytes[65]]));
        if name_len > 64 || name_len % 2 != 0 {
            return Err(invalid("name length out of range"));
        }
        let units: Vec<u16> = bytes[..name_len]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|unit| *unit != 0)
            .collect();
        let name = String::from_utf16_lossy(&units);

        let mut size = u64_at(bytes, 120);
        if major_version < 4 {
            size &= 0xFFFF_FFFF;
        }
        let mut clsid = [0u8; 16];
        clsid.copy_from_slice(&bytes[80..96]);

        Ok(Self {
            name,
            entry_type,
            color: if bytes[67] == 0 {
                NodeColor::Red
            } else {
                NodeColor::Black
            },
            left: link_at(bytes, 68),
            right: link_at(bytes, 72),
            child: link_at(bytes, 76),
            clsid,
            state_bits: u32_at(bytes, 96),
            created: u64_at(bytes, 100),
            modified: u64_at(bytes, 108),
            start: SectorId::read_le(&bytes[116..120]),
            size,
        })
    }

    /// Encodes the record into `out`, which must be at least [`ENTRY_SIZE`] bytes.
    pub fn encode(&self, out: &mut [u8]) {
        let out = &mut out[..ENTRY_SIZE];
        out.fill(0);
        let empty = self.entry_type == EntryType::Empty;
        if !empty {
            let units: Vec<u16> = self.name.encode_utf16().take(MAX_NAME_UNITS).collect();
            for (slot, unit) in out[..64].chunks_exact_mut(2).zip(&units) {
                slot.copy_from_slice(&unit.to_le_bytes());
            }
            let name_len = ((units.len() + 1) * 2) as u16;
            out[64..66].copy_from_slice(&name_len.to_le_bytes());
        }
        out[66] = self.entry_type.to_raw();
        out[67] = match self.color {
            NodeColor::Red => 0,
            NodeColor::Black => 1,
        };
        out[68..72].copy_from_slice(&self.left.unwrap_or(NO_STREAM).to_le_bytes());
        out[72..76].copy_from_slice(&self.right.unwrap_or(NO_STREAM).to_le_bytes());
        out[76..80].copy_from_slice(&self.child.unwrap_or(NO_STREAM).to_le_bytes());
        if empty {
            return;
        }
        out[80..96].copy_from_slice(&self.clsid);
        out[96..100].copy_from_slice(&self.state_bits.to_le_bytes());
        out[100..108].copy_from_slice(&self.created.to_le_bytes());
        out[108..116].copy_from_slice(&self.modified.to_le_bytes());
        out[116..120].copy_from_slice(&self.start.to_le_bytes());
        out[120..128].copy_from_slice(&self.size.to_le_bytes());
    }
}

#[derive(Debug, Clone)]
struct PathRecord {
    path: String,
    id: EntryId,
}

#[derive(Debug, Clone, Default)]
pub struct Directory {
    entries: Vec<DirectoryEntry>,
    /// Case-folded path -> entry.
    index: BTreeMap<String, PathRecord>,
}

impl Directory {
    /// Reads every entry from the directory chain and indexes the reachable ones.
    pub fn load(storage: &SectorStorage) -> Result<Self> {
        let header = storage.header();
        let bytes = storage.read(header.directory_start)?;
        let mut entries = Vec::with_capacity(bytes.len() / ENTRY_SIZE);
        for (id, raw) in (0..).zip(bytes.chunks_exact(ENTRY_SIZE)) {
            entries.push(DirectoryEntry::parse(id, raw, header.major_version)?);
        }
        match entries.first() {
            Some(root) if root.entry_type == EntryType::RootStorage => {}
            _ => {
                return Err(CfbError::InvalidDirectoryEntry {
                    id: 0,
                    reason: "first entry is not the root storage",
                })
            }
        }

        let mut directory = Directory {
            entries,
            index: BTreeMap::new(),
        };
        directory.rebuild_index()?;
        debug!(
            "loaded directory: {} slots, {} reachable entries",
            directory.entries.len(),
            directory.index.len()
        );
        Ok(directory)
    }

    /// Walks the storage trees from the root, recording the path of every reachable entry.
    fn rebuild_index(&mut self) -> Result<()> {
        let mut index = BTreeMap::new();
        let mut visited = vec![false; self.entries.len()];
        visited[0] = true;
        index.insert(
            fold_path(&[]),
            PathRecord {
                path: "/".to_string(),
                id: 0,
            },
        );

        let mut storages = vec![(0u32, Vec::<String>::new())];
        while let Some((storage_id, storage_path)) = storages.pop() {
            let mut pending: Vec<EntryId> = self.entries[storage_id as usize]
                .child
                .into_iter()
                .collect();
            while let Some(id) = pending.pop() {
                let entry = self.linked_entry(id)?;
                if std::mem::replace(&mut visited[id as usize], true) {
                    return Err(CfbError::InvalidDirectoryEntry {
                        id,
                        reason: "entry is linked more than once",
                    });
                }
                pending.extend(entry.left.into_iter().chain(entry.right));

                let mut path = storage_path.clone();
                path.push(entry.name.clone());
                let record = PathRecord {
                    path: display_path(&path),
                    id,
                };
                if index.insert(fold_path(&path), record).is_some() {
                    return Err(CfbError::InvalidDirectoryEntry {
                        id,
                        reason: "duplicate name within a storage",
                    });
                }
                if entry.is_storage() {
                    storages.push((id, path));
                }
            }
        }

        self.index = index;
        Ok(())
    }

    fn linked_entry(&self, id: EntryId) -> Result<&DirectoryEntry> {
        match self.entries.get(id as usize) {
            Some(entry) if entry.entry_type != EntryType::Empty => Ok(entry),
            Some(_) => Err(CfbError::InvalidDirectoryEntry {
                id,
                reason: "link points at an empty entry",
            }),
            None => Err(CfbError::InvalidDirectoryEntry {
                id,
                reason: "link out of range",
            }),
        }
    }

    /// Adds an entry at `path` and writes the directory back to `storage`.
    ///
    /// The first entry of an empty directory must be the root storage. Later entries are
    /// linked into their parent's sibling tree.
    pub fn insert_entry(
        &mut self,
        storage: &mut SectorStorage,
        path: &str,
        entry_type: EntryType,
    ) -> Result<EntryId> {
        if self.entries.is_empty() {
            if entry_type != EntryType::RootStorage {
                return Err(CfbError::InvalidDirectoryEntry {
                    id: 0,
                    reason: "first entry must be the root storage",
                });
            }
            self.entries
                .push(DirectoryEntry::new(ROOT_ENTRY_NAME, EntryType::RootStorage));
            self.index.insert(
                fold_path(&[]),
                PathRecord {
                    path: "/".to_string(),
                    id: 0,
                },
            );
            self.write_directory_tree(storage)?;
            return Ok(0);
        }
        if matches!(entry_type, EntryType::RootStorage | EntryType::Empty) {
            return Err(CfbError::InvalidName {
                name: path.to_string(),
                reason: "only streams and storages can be inserted",
            });
        }

        let components = split_path(path);
        let Some((name, parent_components)) = components.split_last() else {
            return Err(CfbError::AlreadyExists {
                path: "/".to_string(),
            });
        };
        validate_name(name)?;
        let parent = self.find_entry(&display_path(parent_components))?;
        if !self.entries[parent as usize].is_storage() {
            return Err(CfbError::NotAStorage {
                path: display_path(parent_components),
            });
        }
        let key = fold_path(&components);
        if self.index.contains_key(&key) {
            return Err(CfbError::AlreadyExists {
                path: display_path(&components),
            });
        }

        let entry = DirectoryEntry::new(name.as_str(), entry_type);
        let id = match self
            .entries
            .iter()
            .position(|e| e.entry_type == EntryType::Empty)
        {
            Some(slot) => {
                self.entries[slot] = entry;
                slot
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        let id = EntryId::try_from(id).map_err(|_| CfbError::TooManySectors)?;
        self.link_child(parent, id)?;
        self.index.insert(
            key,
            PathRecord {
                path: display_path(&components),
                id,
            },
        );
        debug!("inserted directory entry {id} at {}", display_path(&components));
        self.write_directory_tree(storage)?;
        Ok(id)
    }

    /// Attaches `id` to the red-black sibling tree under `parent`, descending right when the
    /// new name sorts after the node and left otherwise, then rebalances.
    fn link_child(&mut self, parent: EntryId, id: EntryId) -> Result<()> {
        let mut tree = SiblingTree {
            parents: vec![None; self.entries.len()],
            entries: &mut self.entries,
            storage: parent as usize,
        };
        tree.insert(id)
    }

    /// Resolves a `/`-separated path, ignoring ASCII and Unicode case.
    pub fn find_entry(&self, path: &str) -> Result<EntryId> {
        let components = split_path(path);
        self.index
            .get(&fold_path(&components))
            .map(|record| record.id)
            .ok_or_else(|| CfbError::NotFound {
                path: display_path(&components),
            })
    }

    pub fn contains_entry(&self, path: &str) -> bool {
        self.find_entry(path).is_ok()
    }

    pub fn entry(&self, id: EntryId) -> Option<&DirectoryEntry> {
        self.entries.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reachable entries with their paths, ordered by folded path.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DirectoryEntry)> + '_ {
        self.index
            .values()
            .map(|record| (record.path.as_str(), &self.entries[record.id as usize]))
    }

    /// The mini-stream is the root entry's data.
    pub fn mini_stream(&self) -> MiniStream {
        self.entries
            .first()
            .map(|root| MiniStream {
                start: root.start,
                size: root.size,
            })
            .unwrap_or_default()
    }

    pub fn set_mini_stream(&mut self, mini: MiniStream) {
        if let Some(root) = self.entries.first_mut() {
            root.start = mini.start;
            root.size = mini.size;
        }
    }

    pub fn set_stream(&mut self, id: EntryId, start: SectorId, size: u64) {
        if let Some(entry) = self.entries.get_mut(id as usize) {
            entry.start = start;
            entry.size = size;
        }
    }

    /// Serializes the whole entry array into the directory chain, extending it first if needed.
    pub fn write_directory_tree(&self, storage: &mut SectorStorage) -> Result<()> {
        let sector_size = storage.header().sector_size();
        let needed = (self.entries.len().max(1) * ENTRY_SIZE).div_ceil(sector_size);
        let mut start = storage.header().directory_start;
        let have = storage.chain(start)?.len();
        if have < needed {
            start = storage.extend_chain(start, needed - have)?;
            storage.header_mut().directory_start = start;
            debug!("directory chain extended to {needed} sectors");
        }
        let sectors = have.max(needed);

        let mut bytes = vec![0u8; sectors * sector_size];
        let empty = DirectoryEntry::empty();
        for (n, slot) in bytes.chunks_exact_mut(ENTRY_SIZE).enumerate() {
            self.entries.get(n).unwrap_or(&empty).encode(slot);
        }
        if storage.header().major_version >= 4 {
            storage.header_mut().num_directory_sectors =
                u32::try_from(sectors).map_err(|_| CfbError::TooManySectors)?;
        }
        storage.write(&bytes, start)?;
        storage.flush()
    }
}

/// One storage's sibling tree. Parent links are not stored on disk, so they are recorded
/// while descending and kept current through rotations.
struct SiblingTree<'a> {
    entries: &'a mut [DirectoryEntry],
    storage: usize,
    parents: Vec<Option<EntryId>>,
}

impl SiblingTree<'_> {
    fn node(&mut self, id: EntryId) -> &mut DirectoryEntry {
        &mut self.entries[id as usize]
    }

    fn color(&self, id: Option<EntryId>) -> NodeColor {
        id.map_or(NodeColor::Black, |id| self.entries[id as usize].color)
    }

    fn parent(&self, id: EntryId) -> Option<EntryId> {
        self.parents[id as usize]
    }

    fn insert(&mut self, id: EntryId) -> Result<()> {
        let Some(mut node) = self.entries[self.storage].child else {
            self.entries[self.storage].child = Some(id);
            self.node(id).color = NodeColor::Black;
            return Ok(());
        };
        for _ in 0..self.entries.len() {
            let goes_right = compare_names(
                &self.entries[id as usize].name,
                &self.entries[node as usize].name,
            ) == Ordering::Greater;
            let parent = &mut self.entries[node as usize];
            let slot = if goes_right {
                &mut parent.right
            } else {
                &mut parent.left
            };
            match *slot {
                Some(next) => {
                    self.parents[next as usize] = Some(node);
                    node = next;
                }
                None => {
                    *slot = Some(id);
                    self.parents[id as usize] = Some(node);
                    self.insert_fixup(id);
                    return Ok(());
                }
            }
        }
        Err(CfbError::InvalidDirectoryEntry {
            id: self.storage as EntryId,
            reason: "sibling tree is cyclic",
        })
    }

    fn insert_fixup(&mut self, mut x: EntryId) {
        self.node(x).color = NodeColor::Red;
        while let Some(p) = self.parent(x) {
            if self.entries[p as usize].color != NodeColor::Red {
                break;
            }
            let Some(g) = self.parent(p) else {
                break;
            };
            let parent_is_left = self.entries[g as usize].left == Some(p);
            let uncle = if parent_is_left {
                self.entries[g as usize].right
            } else {
                self.entries[g as usize].left
            };

            if let (Some(u), NodeColor::Red) = (uncle, self.color(uncle)) {
                self.node(p).color = NodeColor::Black;
                self.node(u).color = NodeColor::Black;
                self.node(g).color = NodeColor::Red;
                x = g;
                continue;
            }

            let (mut x2, mut p2) = (x, p);
            if parent_is_left && self.entries[p as usize].right == Some(x) {
                self.rotate_left(p);
                (x2, p2) = (p, x);
            } else if !parent_is_left && self.entries[p as usize].left == Some(x) {
                self.rotate_right(p);
                (x2, p2) = (p, x);
            }
            self.node(p2).color = NodeColor::Black;
            self.node(g).color = NodeColor::Red;
            if parent_is_left {
                self.rotate_right(g);
            } else {
                self.rotate_left(g);
            }
            x = x2;
        }
        if let Some(root) = self.entries[self.storage].child {
            self.node(root).color = NodeColor::Black;
        }
    }

    /// Points whatever linked to `old` (its parent, or the storage) at `new`.
    fn replace_link(&mut self, parent: Option<EntryId>, old: EntryId, new: EntryId) {
        match parent {
            None => self.entries[self.storage].child = Some(new),
            Some(p) => {
                let p = self.node(p);
                if p.left == Some(old) {
                    p.left = Some(new);
                } else {
                    p.right = Some(new);
                }
            }
        }
        self.parents[new as usize] = parent;
    }

    fn rotate_left(&mut self, x: EntryId) {
        let Some(y) = self.entries[x as usize].right else {
            return;
        };
        let inner = self.entries[y as usize].left;
        self.node(x).right = inner;
        if let Some(inner) = inner {
            self.parents[inner as usize] = Some(x);
        }
        let parent = self.parent(x);
        self.replace_link(parent, x, y);
        self.node(y).left = Some(x);
        self.parents[x as usize] = Some(y);
    }

    fn rotate_right(&mut self, y: EntryId) {
        let Some(x) = self.entries[y as usize].left else {
            return;
        };
        let inner = self.entries[x as usize].right;
        self.node(y).left = inner;
        if let Some(inner) = inner {
            self.parents[inner as usize] = Some(y);
        }
        let parent = self.parent(y);
        self.replace_link(parent, y, x);
        self.node(x).right = Some(y);
        self.parents[y as usize] = Some(x);
    }
}

/// Orders sibling names the way compound files do: shorter names first, then by uppercase.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    let a_len = a.encode_utf16().count();
    let b_len = b.encode_utf16().count();
    a_len
        .cmp(&b_len)
        .then_with(|| a.to_uppercase().cmp(&b.to_uppercase()))
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| CfbError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.encode_utf16().count() > MAX_NAME_UNITS {
        return Err(invalid("name exceeds 31 UTF-16 code units"));
    }
    if name.contains(['/', '\\', ':', '!']) {
        return Err(invalid("name contains a reserved character"));
    }
    Ok(())
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn display_path(components: &[String]) -> String {
    format!("/{}", components.join("/"))
}

fn fold_path(components: &[String]) -> String {
    display_path(components).to_uppercase()
}

fn link_at(bytes: &[u8], offset: usize) -> Option<EntryId> {
    match u32_at(bytes, offset) {
        NO_STREAM => None,
        id => Some(id),
    }
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (SectorStorage, Directory) {
        let mut storage = SectorStorage::create(9, 6).expect("storage");
        let start = storage.allocate_sectors(1).expect("directory sector");
        storage.header_mut().directory_start = start;
        let mut directory = Directory::default();
        directory
            .insert_entry(&mut storage, "/", EntryType::RootStorage)
            .expect("root");
        (storage, directory)
    }

    #[test]
    fn entry_record_reencodes_identically() {
        let mut entry = DirectoryEntry::new("EncryptionInfo", EntryType::UserStream);
        entry.left = Some(3);
        entry.start = SectorId::Sector(9);
        entry.size = 0x1234;
        entry.modified = 77;

        let mut raw = [0u8; ENTRY_SIZE];
        entry.encode(&mut raw);
        assert_eq!(u16::from_le_bytes([raw[64], raw[65]]), 30);
        assert_eq!(&raw[76..80], &[0xFF; 4]);
        assert_eq!(DirectoryEntry::parse(1, &raw, 4).expect("parse"), entry);
    }

    #[test]
    fn version_three_ignores_high_size_bits() {
        let mut entry = DirectoryEntry::new("s", EntryType::UserStream);
        entry.size = 0xDEAD_0000_0010;
        let mut raw = [0u8; ENTRY_SIZE];
        entry.encode(&mut raw);
        assert_eq!(DirectoryEntry::parse(1, &raw, 3).expect("parse").size, 0x10);
    }

    #[test]
    fn names_order_by_length_then_uppercase() {
        assert_eq!(compare_names("b", "AA"), Ordering::Less);
        assert_eq!(compare_names("abc", "ABD"), Ordering::Less);
        assert_eq!(compare_names("Data", "DATA"), Ordering::Equal);
    }

    #[test]
    fn inserted_entries_form_a_search_tree() {
        let (mut storage, mut directory) = fresh();
        let m = directory
            .insert_entry(&mut storage, "/MM", EntryType::UserStream)
            .expect("MM");
        let a = directory
            .insert_entry(&mut storage, "/A", EntryType::UserStream)
            .expect("A");
        let z = directory
            .insert_entry(&mut storage, "/ZZZ", EntryType::UserStream)
            .expect("ZZZ");

        assert_eq!(directory.entry(0).and_then(|root| root.child), Some(m));
        let mid = directory.entry(m).expect("entry");
        assert_eq!(mid.left, Some(a));
        assert_eq!(mid.right, Some(z));
    }

    /// Checks ordering and red-black shape below `id`, returning (black height, depth).
    fn check_subtree(directory: &Directory, id: Option<EntryId>) -> (usize, usize) {
        let Some(id) = id else {
            return (1, 0);
        };
        let node = directory.entry(id).expect("entry");
        for child in [node.left, node.right].into_iter().flatten() {
            let child = directory.entry(child).expect("child");
            assert!(
                !(node.color == NodeColor::Red && child.color == NodeColor::Red),
                "red {} has red child {}",
                node.name,
                child.name
            );
        }
        if let Some(left) = node.left {
            let left = directory.entry(left).expect("left");
            assert_eq!(compare_names(&left.name, &node.name), Ordering::Less);
        }
        if let Some(right) = node.right {
            let right = directory.entry(right).expect("right");
            assert_eq!(compare_names(&right.name, &node.name), Ordering::Greater);
        }
        let (left_black, left_depth) = check_subtree(directory, node.left);
        let (right_black, right_depth) = check_subtree(directory, node.right);
        assert_eq!(left_black, right_black, "unequal black height under {}", node.name);
        let own = usize::from(node.color == NodeColor::Black);
        (left_black + own, 1 + left_depth.max(right_depth))
    }

    #[test]
    fn sorted_inserts_stay_balanced() {
        let (mut storage, mut directory) = fresh();
        for n in 0..20 {
            directory
                .insert_entry(&mut storage, &format!("/S{n:02}"), EntryType::UserStream)
                .expect("insert");
        }
        let root = directory.entry(0).and_then(|root| root.child);
        let root_color = root.and_then(|id| directory.entry(id)).map(|e| e.color);
        assert_eq!(root_color, Some(NodeColor::Black));

        let (_, depth) = check_subtree(&directory, root);
        // 2 * log2(21) bounds a red-black tree of 20 nodes.
        assert!(depth <= 8, "depth {depth}");

        let reloaded = Directory::load(&storage).expect("load");
        assert!(reloaded.contains_entry("/S00"));
        assert!(reloaded.contains_entry("/s19"));
    }

    #[test]
    fn lookup_is_case_insensitive_and_reports_missing_paths() {
        let (mut storage, mut directory) = fresh();
        let id = directory
            .insert_entry(&mut storage, "/EncryptedPackage", EntryType::UserStream)
            .expect("insert");
        assert_eq!(directory.find_entry("encryptedpackage").expect("find"), id);
        assert!(directory.contains_entry("/ENCRYPTEDPACKAGE"));

        let err = directory.find_entry("/Missing").expect_err("missing");
        assert!(err.to_string().contains("not found"), "{err}");
    }

    #[test]
    fn duplicates_and_bad_names_are_rejected() {
        let (mut storage, mut directory) = fresh();
        directory
            .insert_entry(&mut storage, "/Stream", EntryType::UserStream)
            .expect("insert");
        assert!(matches!(
            directory.insert_entry(&mut storage, "/STREAM", EntryType::UserStream),
            Err(CfbError::AlreadyExists { .. })
        ));
        assert!(matches!(
            directory.insert_entry(&mut storage, &"x".repeat(32), EntryType::UserStream),
            Err(CfbError::InvalidName { .. })
        ));
        assert!(matches!(
            directory.insert_entry(&mut storage, "/Stream/Child", EntryType::UserStream),
            Err(CfbError::NotAStorage { .. })
        ));
    }

    #[test]
    fn directory_chain_grows_and_reloads() {
        let (mut storage, mut directory) = fresh();
        for n in 0..10 {
            directory
                .insert_entry(&mut storage, &format!("/S{n}"), EntryType::UserStream)
                .expect("insert");
        }
        // Eleven entries need three 512-byte sectors.
        let chain = storage.chain(storage.header().directory_start).expect("chain");
        assert_eq!(chain.len(), 3);

        let reloaded = Directory::load(&storage).expect("load");
        assert_eq!(reloaded.iter().count(), 11);
        assert!(reloaded.contains_entry("/s7"));
    }

    #[test]
    fn cyclic_sibling_links_are_rejected() {
        let (mut storage, mut directory) = fresh();
        let a = directory
            .insert_entry(&mut storage, "/A", EntryType::UserStream)
            .expect("A");
        directory.entries[a as usize].left = Some(a);
        directory.write_directory_tree(&mut storage).expect("write");
        assert!(matches!(
            Directory::load(&storage),
            Err(CfbError::InvalidDirectoryEntry { .. })
        ));
    }
}
