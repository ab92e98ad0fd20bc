use log::debug;

use crate::directory::{Directory, DirectoryEntry, EntryId, EntryType};
use crate::error::{CfbError, Result};
use crate::header::{Header, MINI_STREAM_CUTOFF};
use crate::sector::SectorId;
use crate::storage::SectorStorage;

/// Layout parameters for a new container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    pub sector_size_power: u16,
    pub short_sector_size_power: u16,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            sector_size_power: 9,
            short_sector_size_power: 6,
        }
    }
}

/// An in-memory compound file: sector storage plus its directory.
///
/// Every mutating call writes the tables and directory back, so [`CompoundDocument::as_bytes`]
/// is always a complete container image.
#[derive(Debug, Clone)]
pub struct CompoundDocument {
    storage: SectorStorage,
    directory: Directory,
}

impl CompoundDocument {
    pub fn create() -> Result<Self> {
        Self::create_with(CreateOptions::default())
    }

    pub fn create_with(options: CreateOptions) -> Result<Self> {
        let mut storage =
            SectorStorage::create(options.sector_size_power, options.short_sector_size_power)?;
        let directory_start = storage.allocate_sectors(1)?;
        storage.header_mut().directory_start = directory_start;
        let mut directory = Directory::default();
        directory.insert_entry(&mut storage, "/", EntryType::RootStorage)?;
        Ok(Self { storage, directory })
    }

    pub fn open(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let storage = SectorStorage::open(bytes.into())?;
        let directory = Directory::load(&storage)?;
        Ok(Self { storage, directory })
    }

    /// Reads the full contents of the stream at `path`.
    pub fn open_read_stream(&self, path: &str) -> Result<Vec<u8>> {
        let id = self.directory.find_entry(path)?;
        let entry = self.entry(id)?;
        if !entry.is_stream() {
            return Err(CfbError::NotAStream {
                path: path.to_string(),
            });
        }
        if entry.size == 0 {
            return Ok(Vec::new());
        }

        let mut bytes = if entry.size < u64::from(MINI_STREAM_CUTOFF) {
            self.storage
                .read_short(entry.start, self.directory.mini_stream())?
        } else {
            self.storage.read(entry.start)?
        };
        match usize::try_from(entry.size) {
            Ok(size) if size <= bytes.len() => {
                bytes.truncate(size);
                Ok(bytes)
            }
            _ => Err(CfbError::StreamTruncated {
                path: path.to_string(),
                expected: entry.size,
                actual: bytes.len(),
            }),
        }
    }

    /// Creates or replaces the stream at `path`.
    ///
    /// Streams below the mini-stream cutoff go to short sectors. A replaced stream's old chain
    /// is not reclaimed.
    pub fn write_stream(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        let header = self.storage.header();
        let major = header.major_version;
        let sector_size = header.sector_size();
        let short_sector_size = header.short_sector_size();
        if major < 4 && u32::try_from(bytes.len()).is_err() {
            return Err(CfbError::StreamTooLarge {
                len: bytes.len(),
                major,
            });
        }

        let id = match self.directory.find_entry(path) {
            Ok(id) => {
                if !self.entry(id)?.is_stream() {
                    return Err(CfbError::NotAStream {
                        path: path.to_string(),
                    });
                }
                id
            }
            Err(CfbError::NotFound { .. }) => {
                self.directory
                    .insert_entry(&mut self.storage, path, EntryType::UserStream)?
            }
            Err(err) => return Err(err),
        };

        let start = if bytes.is_empty() {
            SectorId::EndOfChain
        } else if bytes.len() < MINI_STREAM_CUTOFF as usize {
            let mut mini = self.directory.mini_stream();
            let start = self
                .storage
                .allocate_short_sectors(bytes.len().div_ceil(short_sector_size), &mut mini)?;
            self.directory.set_mini_stream(mini);
            self.storage.write_short(bytes, start, mini)?;
            start
        } else {
            let start = self
                .storage
                .allocate_sectors(bytes.len().div_ceil(sector_size))?;
            self.storage.write(bytes, start)?;
            start
        };

        self.directory.set_stream(id, start, bytes.len() as u64);
        self.directory.write_directory_tree(&mut self.storage)?;
        debug!("wrote {} bytes to {path} starting at {start}", bytes.len());
        Ok(())
    }

    pub fn create_storage(&mut self, path: &str) -> Result<EntryId> {
        self.directory
            .insert_entry(&mut self.storage, path, EntryType::UserStorage)
    }

    pub fn find_entry(&self, path: &str) -> Result<&DirectoryEntry> {
        let id = self.directory.find_entry(path)?;
        self.entry(id)
    }

    pub fn contains_entry(&self, path: &str) -> bool {
        self.directory.contains_entry(path)
    }

    /// Every reachable storage and stream with its path.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &DirectoryEntry)> + '_ {
        self.directory.iter()
    }

    pub fn header(&self) -> &Header {
        self.storage.header()
    }

    pub fn storage(&self) -> &SectorStorage {
        &self.storage
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_bytes()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.storage.into_bytes()
    }

    fn entry(&self, id: EntryId) -> Result<&DirectoryEntry> {
        self.directory
            .entry(id)
            .ok_or(CfbError::InvalidDirectoryEntry {
                id,
                reason: "index refers to a missing entry",
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_document_has_only_the_root() {
        let doc = CompoundDocument::create().expect("create");
        let entries: Vec<_> = doc.entries().map(|(path, e)| (path.to_string(), e.entry_type)).collect();
        assert_eq!(entries, vec![("/".to_string(), EntryType::RootStorage)]);
        assert_eq!(doc.find_entry("/").expect("root").name, "Root Entry");
    }

    #[test]
    fn streams_survive_reopen() {
        let mut doc = CompoundDocument::create().expect("create");
        doc.write_stream("/small", b"tiny payload").expect("small");
        let large: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
        doc.write_stream("/large", &large).expect("large");
        doc.write_stream("/empty", &[]).expect("empty");

        let reopened = CompoundDocument::open(doc.into_bytes()).expect("open");
        assert_eq!(reopened.open_read_stream("/small").expect("small"), b"tiny payload");
        assert_eq!(reopened.open_read_stream("/large").expect("large"), large);
        assert!(reopened.open_read_stream("/empty").expect("empty").is_empty());
    }

    #[test]
    fn rewriting_a_stream_replaces_its_contents() {
        let mut doc = CompoundDocument::create().expect("create");
        doc.write_stream("Data", &[1u8; 5000]).expect("first");
        doc.write_stream("Data", b"short now").expect("second");
        assert_eq!(doc.open_read_stream("/Data").expect("read"), b"short now");
        assert_eq!(doc.find_entry("data").expect("entry").size, 9);
    }

    #[test]
    fn nested_storages_hold_streams() {
        let mut doc = CompoundDocument::create().expect("create");
        doc.create_storage("/Storage").expect("storage");
        doc.write_stream("/Storage/Inner", b"nested").expect("write");

        let reopened = CompoundDocument::open(doc.as_bytes()).expect("open");
        assert_eq!(reopened.open_read_stream("/storage/inner").expect("read"), b"nested");
        assert!(matches!(
            reopened.open_read_stream("/Storage"),
            Err(CfbError::NotAStream { .. })
        ));
        assert!(matches!(
            reopened.open_read_stream("/Nope"),
            Err(CfbError::NotFound { .. })
        ));
    }

    #[test]
    fn large_sector_documents_round_trip() {
        let options = CreateOptions {
            sector_size_power: 12,
            short_sector_size_power: 6,
        };
        let mut doc = CompoundDocument::create_with(options).expect("create");
        doc.write_stream("/a", &[7u8; 100]).expect("a");
        doc.write_stream("/b", &[9u8; 9000]).expect("b");
        assert_eq!(doc.header().major_version, 4);

        let reopened = CompoundDocument::open(doc.into_bytes()).expect("open");
        assert_eq!(reopened.open_read_stream("/a").expect("a"), vec![7u8; 100]);
        assert_eq!(reopened.open_read_stream("/b").expect("b"), vec![9u8; 9000]);
    }
}
