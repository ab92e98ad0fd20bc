use xlcrypt_cfb::{is_compound_file, CfbError, CompoundDocument, CreateOptions};

fn valid_container() -> Vec<u8> {
    let mut doc = CompoundDocument::create().expect("create");
    doc.write_stream("/Stream", b"payload").expect("write");
    doc.into_bytes()
}

fn open_err(bytes: Vec<u8>) -> CfbError {
    CompoundDocument::open(bytes).expect_err("open must fail")
}

#[test]
fn sector_power_below_minimum_is_rejected() {
    let mut bytes = valid_container();
    bytes[30..32].copy_from_slice(&5u16.to_le_bytes());
    let err = open_err(bytes);
    assert!(err.to_string().contains("bad ole"), "{err}");
}

#[test]
fn non_standard_cutoff_is_rejected() {
    let mut bytes = valid_container();
    bytes[56..60].copy_from_slice(&2048u32.to_le_bytes());
    assert!(matches!(open_err(bytes), CfbError::InvalidHeader { .. }));
}

#[test]
fn inconsistent_msat_count_is_rejected() {
    let mut bytes = valid_container();
    bytes[44..48].copy_from_slice(&200u32.to_le_bytes());
    assert!(matches!(open_err(bytes), CfbError::InvalidHeader { .. }));
}

#[test]
fn create_validates_options_like_open() {
    let options = CreateOptions {
        sector_size_power: 6,
        short_sector_size_power: 6,
    };
    assert!(matches!(
        CompoundDocument::create_with(options),
        Err(CfbError::InvalidHeader { .. })
    ));
}

#[test]
fn cyclic_sat_is_reported_not_followed_forever() {
    let doc = CompoundDocument::create().expect("create");
    let mut bytes = doc.into_bytes();
    // Sector 0 holds the SAT and sector 1 the directory; point sector 1 at itself.
    let sat = 512;
    bytes[sat + 4..sat + 8].copy_from_slice(&1u32.to_le_bytes());
    let err = open_err(bytes);
    assert!(err.to_string().contains("corrupt chain"), "{err}");
}

#[test]
fn signature_detection() {
    assert!(is_compound_file(&valid_container()));
    assert!(!is_compound_file(b"PK\x03\x04"));
    assert!(matches!(
        open_err(b"not a compound file".to_vec()),
        CfbError::InvalidHeader { .. }
    ));
}
