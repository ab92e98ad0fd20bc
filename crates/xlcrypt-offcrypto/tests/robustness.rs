//! Malformed input must produce errors, never panics or runaway allocations.

use proptest::prelude::*;

use xlcrypt_cfb::CompoundDocument;
use xlcrypt_offcrypto::{
    decrypt_xlsx, encrypt_xlsx, parse_encrypted_package, parse_encryption_info, read,
    EncryptOptions, EncryptionScheme, HashAlgorithm, ENCRYPTED_PACKAGE_STREAM,
    ENCRYPTION_INFO_STREAM,
};

fn agile_prefix() -> Vec<u8> {
    vec![4, 0, 4, 0, 0x40, 0, 0, 0]
}

fn standard_prefix() -> Vec<u8> {
    vec![3, 0, 2, 0, 0x24, 0, 0, 0]
}

fn container_with(info: &[u8], package: &[u8]) -> Vec<u8> {
    let mut doc = CompoundDocument::create().expect("create");
    doc.write_stream(ENCRYPTION_INFO_STREAM, info).expect("info");
    doc.write_stream(ENCRYPTED_PACKAGE_STREAM, package).expect("package");
    doc.into_bytes()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 0,
        .. ProptestConfig::default()
    })]

    #[test]
    fn encryption_info_parser_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = parse_encryption_info(&bytes);
    }

    #[test]
    fn standard_body_parser_never_panics(body in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut bytes = standard_prefix();
        bytes.extend_from_slice(&body);
        let _ = parse_encryption_info(&bytes);
    }

    #[test]
    fn agile_xml_parser_never_panics(body in "\\PC{0,256}") {
        let mut bytes = agile_prefix();
        bytes.extend_from_slice(body.as_bytes());
        let _ = parse_encryption_info(&bytes);
    }

    #[test]
    fn read_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..2048)) {
        let _ = read(&bytes, "password");
        let _ = parse_encrypted_package(&bytes);
    }

    #[test]
    fn corrupted_containers_are_errors_not_panics(
        offset in 0usize..4096,
        value in any::<u8>(),
    ) {
        let mut bytes = container_with(&standard_prefix(), &[0u8; 64]);
        let offset = offset % bytes.len();
        bytes[offset] = value;
        let _ = decrypt_xlsx(&bytes, "password");
    }

    #[test]
    fn huge_declared_package_sizes_are_rejected(declared in 1_000u64.., tail in 0usize..64) {
        let mut package = declared.to_le_bytes().to_vec();
        package.extend(std::iter::repeat(0u8).take(tail));
        let options = EncryptOptions {
            scheme: EncryptionScheme::Agile,
            key_bits: 128,
            hash_algorithm: HashAlgorithm::Sha1,
            spin_count: 1,
        };
        let encrypted = encrypt_xlsx(b"PK\x03\x04", "pw", &options).expect("encrypt");
        let doc = CompoundDocument::open(encrypted).expect("open");
        let info = doc.open_read_stream(ENCRYPTION_INFO_STREAM).expect("info");
        let bytes = container_with(&info, &package);
        prop_assert!(decrypt_xlsx(&bytes, "pw").is_err());
    }
}
