//! Password-protected OOXML packages (MS-OFFCRYPTO) stored in a compound file.
//!
//! This crate supports:
//! - Parsing `EncryptionInfo` for ECMA-376 Standard (binary) and Agile (XML) encryption
//! - Deriving the package key from a password, with verifier and `dataIntegrity` checks
//! - Decrypting `EncryptedPackage` back to the raw ZIP bytes
//! - Encrypting a ZIP package into a fresh compound file
//!
//! Only password key encryptors are supported.

mod agile;
mod crypto;
mod encryption_info;
mod error;
mod options;
mod package;
mod reader;
mod standard;

use log::debug;
use xlcrypt_cfb::CompoundDocument;

pub use agile::{
    AgileCipherParams, AgileDataIntegrity, AgileEncryptionInfo, AgilePasswordKeyEncryptor,
    ENCRYPTION_NS, PASSWORD_KEY_ENCRYPTOR_NS,
};
pub use crypto::{HashAlgorithm, AES_BLOCK_SIZE};
pub use encryption_info::{parse_encryption_info, EncryptionInfo, EncryptionVersion};
pub use error::{OffcryptoError, Result};
pub use options::{DecryptOptions, EncryptOptions, EncryptionScheme, DEFAULT_MAX_SPIN_COUNT};
pub use package::{parse_encrypted_package, SEGMENT_LEN};
pub use standard::{
    StandardEncryptionHeader, StandardEncryptionInfo, StandardEncryptionVerifier, AES_PROVIDER,
    CALG_AES_128, CALG_AES_192, CALG_AES_256, CALG_SHA1,
};

pub const ENCRYPTION_INFO_STREAM: &str = "/EncryptionInfo";
pub const ENCRYPTED_PACKAGE_STREAM: &str = "/EncryptedPackage";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Decrypts an encrypted OOXML compound file with default [`DecryptOptions`].
pub fn decrypt_xlsx(container: &[u8], password: &str) -> Result<Vec<u8>> {
    decrypt_xlsx_with_options(container, password, &DecryptOptions::default())
}

pub fn decrypt_xlsx_with_options(
    container: &[u8],
    password: &str,
    options: &DecryptOptions,
) -> Result<Vec<u8>> {
    if container.is_empty() {
        return Err(OffcryptoError::EmptyFile);
    }
    let doc = CompoundDocument::open(container)?;
    let info_bytes = doc.open_read_stream(ENCRYPTION_INFO_STREAM)?;
    let info = parse_encryption_info(&info_bytes)?;
    let package = doc.open_read_stream(ENCRYPTED_PACKAGE_STREAM)?;
    decrypt_package(&info, &package, password, options)
}

/// Decrypts a raw `EncryptedPackage` stream using an already parsed descriptor.
pub fn decrypt_package(
    info: &EncryptionInfo,
    encrypted_package: &[u8],
    password: &str,
    options: &DecryptOptions,
) -> Result<Vec<u8>> {
    match info {
        EncryptionInfo::Standard { info, .. } => {
            let key = info.derive_key(password)?;
            if options.verify_password {
                info.verify_key(&key)?;
            }
            debug!("decrypting standard package ({} key bits)", info.header.key_bits);
            package::decrypt_standard(&key, encrypted_package)
        }
        EncryptionInfo::Agile { info, .. } => {
            let key = info.derive_secret_key(password, options)?;
            if options.verify_integrity {
                info.verify_integrity(&key, encrypted_package)?;
            }
            debug!(
                "decrypting agile package ({} key bits, {})",
                info.key_data.key_bits,
                info.key_data.hash_algorithm.as_offcrypto_name()
            );
            package::decrypt_agile(info, &key, encrypted_package)
        }
    }
}

/// Loads package bytes from either an encrypted compound file or a plain ZIP.
pub fn read(source: &[u8], password: &str) -> Result<Vec<u8>> {
    read_with_options(source, password, &DecryptOptions::default())
}

pub fn read_with_options(
    source: &[u8],
    password: &str,
    options: &DecryptOptions,
) -> Result<Vec<u8>> {
    if source.is_empty() {
        return Err(OffcryptoError::EmptyFile);
    }
    if xlcrypt_cfb::is_compound_file(source) {
        debug!("source is a compound file; decrypting");
        return decrypt_xlsx_with_options(source, password, options);
    }
    if source.starts_with(ZIP_MAGIC) {
        debug!("source is a plain ZIP package");
        return Ok(source.to_vec());
    }
    Err(OffcryptoError::UnrecognizedFormat)
}

/// Encrypts a ZIP package into a new compound file holding `EncryptionInfo` and
/// `EncryptedPackage`.
pub fn encrypt_xlsx(plaintext: &[u8], password: &str, options: &EncryptOptions) -> Result<Vec<u8>> {
    let (info_bytes, package_bytes) = match options.scheme {
        EncryptionScheme::Standard => {
            let (info, key) = standard::new_descriptor(password, options.key_bits)?;
            let package = package::encrypt_standard(&key, plaintext)?;
            (info.to_bytes(standard::writer_version()), package)
        }
        EncryptionScheme::Agile => {
            let (mut info, key) = agile::new_descriptor(password, options)?;
            let package = package::encrypt_agile(&info, &key, plaintext)?;
            info.seal_integrity(&key, &package)?;
            (info.to_bytes()?, package)
        }
    };

    let mut doc = CompoundDocument::create()?;
    doc.write_stream(ENCRYPTION_INFO_STREAM, &info_bytes)?;
    doc.write_stream(ENCRYPTED_PACKAGE_STREAM, &package_bytes)?;
    debug!(
        "wrote {:?} encrypted package ({} plaintext bytes)",
        options.scheme,
        plaintext.len()
    );
    Ok(doc.into_bytes())
}

/// Returns true if `bytes` is a compound file holding both encryption streams.
pub fn is_encrypted_ooxml(bytes: &[u8]) -> bool {
    if !xlcrypt_cfb::is_compound_file(bytes) {
        return false;
    }
    let Ok(doc) = CompoundDocument::open(bytes) else {
        return false;
    };
    doc.contains_entry(ENCRYPTION_INFO_STREAM) && doc.contains_entry(ENCRYPTED_PACKAGE_STREAM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_dispatches_on_signature() {
        assert!(matches!(read(&[], "pw"), Err(OffcryptoError::EmptyFile)));
        assert_eq!(read(b"PK\x03\x04rest", "pw").unwrap(), b"PK\x03\x04rest");
        assert!(matches!(
            read(b"not a package", "pw"),
            Err(OffcryptoError::UnrecognizedFormat)
        ));
    }

    #[test]
    fn empty_container_is_reported() {
        let err = decrypt_xlsx(&[], "pw").unwrap_err();
        assert_eq!(err.to_string(), "empty file");
    }

    #[test]
    fn plain_container_is_not_encrypted() {
        let mut doc = CompoundDocument::create().unwrap();
        doc.write_stream("/Workbook", b"data").unwrap();
        let bytes = doc.into_bytes();
        assert!(!is_encrypted_ooxml(&bytes));

        let err = decrypt_xlsx(&bytes, "pw").unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");
    }
}
