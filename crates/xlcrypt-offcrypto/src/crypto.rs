//! Hash, HMAC and AES helpers shared by the standard and agile schemes.

use cipher::block_padding::NoPadding;
use cipher::generic_array::GenericArray;
use cipher::{
    BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit,
    KeyIvInit,
};
use aes::{Aes128, Aes192, Aes256};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Digest;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{OffcryptoError, Result};

pub const AES_BLOCK_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Parses a descriptor `hashAlgorithm` value, ignoring case and `-`/`_` separators.
    pub fn parse_offcrypto_name(name: &str) -> Result<Self> {
        let normalized: String = name
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_'))
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "SHA1" => Ok(HashAlgorithm::Sha1),
            "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA384" => Ok(HashAlgorithm::Sha384),
            "SHA512" => Ok(HashAlgorithm::Sha512),
            _ => Err(OffcryptoError::UnsupportedHashAlgorithm(name.to_string())),
        }
    }

    pub fn as_offcrypto_name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha384 => "SHA384",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        self.digest_parts(&[data])
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest_parts(self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }

        match self {
            HashAlgorithm::Sha1 => run::<sha1::Sha1>(parts),
            HashAlgorithm::Sha256 => run::<sha2::Sha256>(parts),
            HashAlgorithm::Sha384 => run::<sha2::Sha384>(parts),
            HashAlgorithm::Sha512 => run::<sha2::Sha512>(parts),
        }
    }

    pub fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        fn run<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
            let mut mac = <M as Mac>::new_from_slice(key)
                .map_err(|_| OffcryptoError::InvalidKeyLength { len: key.len() })?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }

        match self {
            HashAlgorithm::Sha1 => run::<Hmac<sha1::Sha1>>(key, data),
            HashAlgorithm::Sha256 => run::<Hmac<sha2::Sha256>>(key, data),
            HashAlgorithm::Sha384 => run::<Hmac<sha2::Sha384>>(key, data),
            HashAlgorithm::Sha512 => run::<Hmac<sha2::Sha512>>(key, data),
        }
    }
}

pub(crate) fn password_utf16le(password: &str) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(password.len() * 2));
    for unit in password.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// `H0 = Hash(salt || password)`, then `H = Hash(LE32(i) || H)` for `i in 0..spin_count`.
pub(crate) fn iterated_hash(
    hash: HashAlgorithm,
    salt: &[u8],
    password_utf16le: &[u8],
    spin_count: u32,
) -> Zeroizing<Vec<u8>> {
    let mut h = Zeroizing::new(hash.digest_parts(&[salt, password_utf16le]));
    for i in 0..spin_count {
        *h = hash.digest_parts(&[&i.to_le_bytes()[..], h.as_slice()]);
    }
    h
}

/// Truncates `bytes` to `len`, or pads it with `pad` bytes.
pub(crate) fn fit_to_length(bytes: &[u8], len: usize, pad: u8) -> Vec<u8> {
    let mut out = bytes[..bytes.len().min(len)].to_vec();
    out.resize(len, pad);
    out
}

/// Agile block key derivation: `Hash(H || block_key)` fitted to `key_bytes` with `0x36` padding.
pub(crate) fn derive_block_key(
    hash: HashAlgorithm,
    h: &[u8],
    block_key: &[u8],
    key_bytes: usize,
) -> Zeroizing<Vec<u8>> {
    let digest = Zeroizing::new(hash.digest_parts(&[h, block_key]));
    Zeroizing::new(fit_to_length(&digest, key_bytes, 0x36))
}

/// `Hash(salt || block_key)` fitted to `block_size`.
pub(crate) fn derive_iv(
    hash: HashAlgorithm,
    salt: &[u8],
    block_key: &[u8],
    block_size: usize,
) -> Vec<u8> {
    fit_to_length(&hash.digest_parts(&[salt, block_key]), block_size, 0x36)
}

pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}

pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    OsRng.fill_bytes(&mut out);
    out
}

pub(crate) fn aes_ecb_decrypt_in_place(key: &[u8], buf: &mut [u8]) -> Result<()> {
    if buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(OffcryptoError::InvalidCiphertextLength { len: buf.len() });
    }

    fn decrypt_with<C>(key: &[u8], buf: &mut [u8]) -> Result<()>
    where
        C: BlockDecrypt + KeyInit,
    {
        let cipher = C::new_from_slice(key)
            .map_err(|_| OffcryptoError::InvalidKeyLength { len: key.len() })?;
        for block in buf.chunks_mut(AES_BLOCK_SIZE) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    match key.len() {
        16 => decrypt_with::<Aes128>(key, buf),
        24 => decrypt_with::<Aes192>(key, buf),
        32 => decrypt_with::<Aes256>(key, buf),
        _ => Err(OffcryptoError::InvalidKeyLength { len: key.len() }),
    }
}

pub(crate) fn aes_ecb_encrypt_in_place(key: &[u8], buf: &mut [u8]) -> Result<()> {
    if buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(OffcryptoError::InvalidCiphertextLength { len: buf.len() });
    }

    fn encrypt_with<C>(key: &[u8], buf: &mut [u8]) -> Result<()>
    where
        C: BlockEncrypt + KeyInit,
    {
        let cipher = C::new_from_slice(key)
            .map_err(|_| OffcryptoError::InvalidKeyLength { len: key.len() })?;
        for block in buf.chunks_mut(AES_BLOCK_SIZE) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    match key.len() {
        16 => encrypt_with::<Aes128>(key, buf),
        24 => encrypt_with::<Aes192>(key, buf),
        32 => encrypt_with::<Aes256>(key, buf),
        _ => Err(OffcryptoError::InvalidKeyLength { len: key.len() }),
    }
}

fn check_cbc_args(key: &[u8], iv: &[u8], buf: &[u8]) -> Result<()> {
    if buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(OffcryptoError::InvalidCiphertextLength { len: buf.len() });
    }
    if iv.len() != AES_BLOCK_SIZE {
        return Err(OffcryptoError::InvalidIvLength { len: iv.len() });
    }
    if !matches!(key.len(), 16 | 24 | 32) {
        return Err(OffcryptoError::InvalidKeyLength { len: key.len() });
    }
    Ok(())
}

pub(crate) fn aes_cbc_decrypt_in_place(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    check_cbc_args(key, iv, buf)?;

    fn decrypt_with<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()>
    where
        C: BlockCipher + BlockDecryptMut + KeyInit,
    {
        let len = buf.len();
        cbc::Decryptor::<C>::new_from_slices(key, iv)
            .map_err(|_| OffcryptoError::InvalidKeyLength { len: key.len() })?
            .decrypt_padded_mut::<NoPadding>(buf)
            .map_err(|_| OffcryptoError::InvalidCiphertextLength { len })?;
        Ok(())
    }

    match key.len() {
        16 => decrypt_with::<Aes128>(key, iv, buf),
        24 => decrypt_with::<Aes192>(key, iv, buf),
        _ => decrypt_with::<Aes256>(key, iv, buf),
    }
}

pub(crate) fn aes_cbc_encrypt_in_place(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    check_cbc_args(key, iv, buf)?;

    fn encrypt_with<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()>
    where
        C: BlockCipher + BlockEncryptMut + KeyInit,
    {
        let len = buf.len();
        cbc::Encryptor::<C>::new_from_slices(key, iv)
            .map_err(|_| OffcryptoError::InvalidKeyLength { len: key.len() })?
            .encrypt_padded_mut::<NoPadding>(buf, len)
            .map_err(|_| OffcryptoError::InvalidCiphertextLength { len })?;
        Ok(())
    }

    match key.len() {
        16 => encrypt_with::<Aes128>(key, iv, buf),
        24 => encrypt_with::<Aes192>(key, iv, buf),
        _ => encrypt_with::<Aes256>(key, iv, buf),
    }
}

/// Decrypts a copy of `ciphertext` with AES-CBC and no padding removal.
pub(crate) fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(ciphertext.to_vec());
    aes_cbc_decrypt_in_place(key, iv, &mut buf)?;
    Ok(buf)
}

/// Zero-pads `plaintext` to a whole number of blocks and encrypts it with AES-CBC.
pub(crate) fn aes_cbc_encrypt_padded(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut buf = plaintext.to_vec();
    buf.resize(plaintext.len().div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE, 0);
    aes_cbc_encrypt_in_place(key, iv, &mut buf)?;
    Ok(buf)
}
