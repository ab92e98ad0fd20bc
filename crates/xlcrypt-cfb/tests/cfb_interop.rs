//! Containers written by the `cfb` crate must be readable by this engine.

use std::io::{Cursor, Write as _};

use xlcrypt_cfb::{CompoundDocument, EntryType};

fn build(version: Option<cfb::Version>, streams: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let cursor = Cursor::new(Vec::new());
    let mut ole = match version {
        Some(version) => cfb::CompoundFile::create_with_version(version, cursor),
        None => cfb::CompoundFile::create(cursor),
    }
    .expect("create cfb");
    ole.create_storage("/Nested").expect("create storage");
    for (path, bytes) in streams {
        let mut stream = ole.create_stream(path).expect("create stream");
        stream.write_all(bytes).expect("write stream");
    }
    ole.flush().expect("flush");
    ole.into_inner().into_inner()
}

fn fixture_streams() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("/EncryptionInfo", vec![4, 0, 4, 0, 0x40, 0, 0, 0]),
        (
            "/EncryptedPackage",
            (0..20_000u32).map(|i| (i % 199) as u8).collect(),
        ),
        ("/Nested/Small", b"mini stream data".to_vec()),
        ("/Nested/Boundary", vec![0xA5; 4096]),
    ]
}

fn assert_readable(bytes: Vec<u8>) {
    let doc = CompoundDocument::open(bytes).expect("open cfb output");
    for (path, expected) in fixture_streams() {
        assert_eq!(
            doc.open_read_stream(path).expect(path),
            expected,
            "stream {path}"
        );
    }
    assert_eq!(
        doc.find_entry("/Nested").expect("storage").entry_type,
        EntryType::UserStorage
    );
    assert!(doc.contains_entry("/encryptioninfo"));
}

#[test]
fn reads_version_four_containers() {
    let bytes = build(None, &fixture_streams());
    assert_readable(bytes);
}

#[test]
fn reads_version_three_containers() {
    let bytes = build(Some(cfb::Version::V3), &fixture_streams());
    let doc = CompoundDocument::open(bytes.clone()).expect("open");
    assert_eq!(doc.header().major_version, 3);
    assert_eq!(doc.header().sector_size(), 512);
    assert_readable(bytes);
}
