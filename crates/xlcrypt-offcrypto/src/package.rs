//! `EncryptedPackage` stream: 8-byte plaintext size prefix followed by AES ciphertext.

use log::debug;

use crate::agile::AgileEncryptionInfo;
use crate::crypto::{
    aes_cbc_decrypt_in_place, aes_cbc_encrypt_in_place, aes_ecb_decrypt_in_place,
    aes_ecb_encrypt_in_place, derive_iv, AES_BLOCK_SIZE,
};
use crate::error::{OffcryptoError, Result};
use crate::reader::Reader;

/// Plaintext bytes per agile segment (each segment has its own IV).
pub const SEGMENT_LEN: usize = 4096;
const SIZE_PREFIX_LEN: usize = 8;

/// Splits an `EncryptedPackage` stream into its declared plaintext size and ciphertext.
pub fn parse_encrypted_package(bytes: &[u8]) -> Result<(u64, &[u8])> {
    let mut r = Reader::new(bytes);
    let declared = r.read_u64_le("EncryptedPackage.size")?;
    Ok((declared, r.remaining()))
}

/// Returns the block-aligned ciphertext covering `declared` plaintext bytes, ignoring any
/// trailing sector padding.
fn covering_ciphertext(declared: u64, ciphertext: &[u8]) -> Result<(&[u8], usize)> {
    let too_short = OffcryptoError::PackageTooShort {
        declared,
        available: ciphertext.len(),
    };
    let needed = declared
        .checked_add(AES_BLOCK_SIZE as u64 - 1)
        .map(|v| v / AES_BLOCK_SIZE as u64 * AES_BLOCK_SIZE as u64);
    match needed {
        Some(needed) if needed <= ciphertext.len() as u64 => {
            if (ciphertext.len() as u64) > needed {
                debug!(
                    "ignoring {} bytes past the declared package size",
                    ciphertext.len() as u64 - needed
                );
            }
            Ok((&ciphertext[..needed as usize], declared as usize))
        }
        _ => Err(too_short),
    }
}

/// Standard scheme: one key, AES-ECB over each 4096-byte segment.
pub(crate) fn decrypt_standard(key: &[u8], stream: &[u8]) -> Result<Vec<u8>> {
    let (declared, ciphertext) = parse_encrypted_package(stream)?;
    let (ciphertext, plain_len) = covering_ciphertext(declared, ciphertext)?;

    let mut out = ciphertext.to_vec();
    for segment in out.chunks_mut(SEGMENT_LEN) {
        aes_ecb_decrypt_in_place(key, segment)?;
    }
    out.truncate(plain_len);
    Ok(out)
}

/// Agile scheme: AES-CBC per 4096-byte segment, IV = `Hash(keyData.salt || LE32(segment))`.
pub(crate) fn decrypt_agile(
    info: &AgileEncryptionInfo,
    key: &[u8],
    stream: &[u8],
) -> Result<Vec<u8>> {
    let (declared, ciphertext) = parse_encrypted_package(stream)?;
    let (ciphertext, plain_len) = covering_ciphertext(declared, ciphertext)?;

    let mut out = ciphertext.to_vec();
    for (index, segment) in out.chunks_mut(SEGMENT_LEN).enumerate() {
        let iv = segment_iv(info, index)?;
        aes_cbc_decrypt_in_place(key, &iv, segment)?;
    }
    out.truncate(plain_len);
    Ok(out)
}

pub(crate) fn encrypt_standard(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut out = size_prefix(plaintext);
    let start = out.len();
    out.extend_from_slice(plaintext);
    out.resize(start + padded_len(plaintext.len()), 0);
    for segment in out[start..].chunks_mut(SEGMENT_LEN) {
        aes_ecb_encrypt_in_place(key, segment)?;
    }
    Ok(out)
}

pub(crate) fn encrypt_agile(
    info: &AgileEncryptionInfo,
    key: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let mut out = size_prefix(plaintext);
    for (index, chunk) in plaintext.chunks(SEGMENT_LEN).enumerate() {
        let iv = segment_iv(info, index)?;
        let mut segment = chunk.to_vec();
        segment.resize(padded_len(chunk.len()), 0);
        aes_cbc_encrypt_in_place(key, &iv, &mut segment)?;
        out.extend_from_slice(&segment);
    }
    Ok(out)
}

fn segment_iv(info: &AgileEncryptionInfo, index: usize) -> Result<Vec<u8>> {
    let index = u32::try_from(index)
        .map_err(|_| OffcryptoError::invalid_info("EncryptedPackage has too many segments"))?;
    let key_data = &info.key_data;
    Ok(derive_iv(
        key_data.hash_algorithm,
        &key_data.salt,
        &index.to_le_bytes(),
        key_data.block_size as usize,
    ))
}

fn size_prefix(plaintext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SIZE_PREFIX_LEN + padded_len(plaintext.len()));
    out.extend_from_slice(&(plaintext.len() as u64).to_le_bytes());
    out
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agile::new_descriptor;
    use crate::options::EncryptOptions;

    const KEY: [u8; 16] = [7; 16];

    fn plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn standard_segments_round_trip() {
        for len in [0, 1, 16, 4095, 4096, 10_000] {
            let plain = plaintext(len);
            let stream = encrypt_standard(&KEY, &plain).unwrap();
            assert_eq!(stream.len(), 8 + padded_len(len));
            assert_eq!(decrypt_standard(&KEY, &stream).unwrap(), plain);
        }
    }

    #[test]
    fn agile_segments_use_distinct_ivs() {
        let options = EncryptOptions {
            spin_count: 1,
            ..EncryptOptions::default()
        };
        let (info, key) = new_descriptor("pw", &options).unwrap();
        let plain = vec![0xAB; SEGMENT_LEN * 2];
        let stream = encrypt_agile(&info, &key, &plain).unwrap();
        let body = &stream[8..];
        assert_ne!(&body[..16], &body[SEGMENT_LEN..SEGMENT_LEN + 16]);
        assert_eq!(decrypt_agile(&info, &key, &stream).unwrap(), plain);
    }

    #[test]
    fn segment_ivs_follow_key_data_not_the_key_encryptor() {
        let options = EncryptOptions {
            spin_count: 1,
            ..EncryptOptions::default()
        };
        let (info, key) = new_descriptor("pw", &options).unwrap();
        let plain = plaintext(SEGMENT_LEN + 10);
        let stream = encrypt_agile(&info, &key, &plain).unwrap();

        let mut skewed = info.clone();
        skewed.key_encryptor.params.salt = vec![0x5A; 16];
        skewed.key_encryptor.params.hash_algorithm = crate::crypto::HashAlgorithm::Sha1;
        assert_eq!(segment_iv(&skewed, 1).unwrap(), segment_iv(&info, 1).unwrap());
        assert_eq!(
            segment_iv(&info, 1).unwrap(),
            derive_iv(
                info.key_data.hash_algorithm,
                &info.key_data.salt,
                &1u32.to_le_bytes(),
                info.key_data.block_size as usize,
            )
        );
        assert_eq!(decrypt_agile(&skewed, &key, &stream).unwrap(), plain);

        let mut moved = info.clone();
        moved.key_data.salt[0] ^= 0xFF;
        assert_ne!(decrypt_agile(&moved, &key, &stream).unwrap(), plain);
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let plain = plaintext(100);
        let mut stream = encrypt_standard(&KEY, &plain).unwrap();
        stream.extend_from_slice(&[0xEE; 400]);
        assert_eq!(decrypt_standard(&KEY, &stream).unwrap(), plain);
    }

    #[test]
    fn short_ciphertext_is_rejected() {
        let mut stream = encrypt_standard(&KEY, &plaintext(100)).unwrap();
        stream.truncate(8 + 96);
        assert!(matches!(
            decrypt_standard(&KEY, &stream),
            Err(OffcryptoError::PackageTooShort {
                declared: 100,
                available: 96
            })
        ));

        let mut huge = u64::MAX.to_le_bytes().to_vec();
        huge.extend_from_slice(&[0; 32]);
        assert!(matches!(
            decrypt_standard(&KEY, &huge),
            Err(OffcryptoError::PackageTooShort { .. })
        ));
    }

    #[test]
    fn missing_size_prefix_is_truncation() {
        assert!(matches!(
            parse_encrypted_package(&[1, 2, 3]),
            Err(OffcryptoError::Truncated { .. })
        ));
    }
}
