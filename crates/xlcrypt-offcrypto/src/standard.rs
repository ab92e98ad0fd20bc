//! ECMA-376 Standard (CryptoAPI, AES) encryption: binary descriptor and SHA-1 key derivation.

use log::warn;
use zeroize::Zeroizing;

use crate::crypto::{
    aes_ecb_decrypt_in_place, aes_ecb_encrypt_in_place, ct_eq, iterated_hash, password_utf16le,
    random_bytes, HashAlgorithm,
};
use crate::encryption_info::EncryptionVersion;
use crate::error::{OffcryptoError, Result};
use crate::reader::Reader;

pub const CALG_AES_128: u32 = 0x0000_660E;
pub const CALG_AES_192: u32 = 0x0000_660F;
pub const CALG_AES_256: u32 = 0x0000_6610;
pub const CALG_SHA1: u32 = 0x0000_8004;
pub const PROV_RSA_AES: u32 = 0x0000_0018;

pub const AES_PROVIDER: &str = "Microsoft Enhanced RSA and AES Cryptographic Provider";
pub const AES_PROVIDER_PROTOTYPE: &str =
    "Microsoft Enhanced RSA and AES Cryptographic Provider (Prototype)";

const ITER_COUNT: u32 = 50_000;
const SHA1_LEN: usize = 20;
const VERIFIER_LEN: usize = 16;
const VERIFIER_HASH_LEN: usize = 32;
const WRITER_FLAGS: u32 = 0x24;

/// Parsed Standard (CryptoAPI) `EncryptionHeader`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionHeader {
    pub flags: u32,
    pub size_extra: u32,
    pub alg_id: u32,
    pub alg_id_hash: u32,
    pub key_bits: u32,
    pub provider_type: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub csp_name: String,
}

/// Parsed Standard (CryptoAPI) `EncryptionVerifier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionVerifier {
    pub salt: Vec<u8>,
    pub encrypted_verifier: [u8; VERIFIER_LEN],
    pub verifier_hash_size: u32,
    pub encrypted_verifier_hash: [u8; VERIFIER_HASH_LEN],
}

/// Parsed Standard (CryptoAPI) `EncryptionInfo` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEncryptionInfo {
    pub header: StandardEncryptionHeader,
    pub verifier: StandardEncryptionVerifier,
}

impl StandardEncryptionHeader {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let flags = r.read_u32_le("EncryptionHeader.flags")?;
        let size_extra = r.read_u32_le("EncryptionHeader.sizeExtra")?;
        let alg_id = r.read_u32_le("EncryptionHeader.algID")?;
        let alg_id_hash = r.read_u32_le("EncryptionHeader.algIDHash")?;
        let key_bits = r.read_u32_le("EncryptionHeader.keySize")?;
        let provider_type = r.read_u32_le("EncryptionHeader.providerType")?;
        let reserved1 = r.read_u32_le("EncryptionHeader.reserved1")?;
        let reserved2 = r.read_u32_le("EncryptionHeader.reserved2")?;

        if !matches!(alg_id, 0 | CALG_AES_128 | CALG_AES_192 | CALG_AES_256) {
            return Err(OffcryptoError::InvalidCipherAlgorithm(alg_id));
        }
        if !matches!(alg_id_hash, 0 | CALG_SHA1) {
            return Err(OffcryptoError::InvalidHashAlgorithm(alg_id_hash));
        }
        if !matches!(key_bits, 128 | 192 | 256) {
            return Err(OffcryptoError::InvalidKeySize { bits: key_bits });
        }
        if !matches!(provider_type, 0 | PROV_RSA_AES) {
            return Err(OffcryptoError::InvalidProviderType(provider_type));
        }
        if reserved1 != 0 || reserved2 != 0 {
            return Err(OffcryptoError::InvalidHeader);
        }

        let csp_name = decode_csp_name(r.remaining())?;
        if csp_name != AES_PROVIDER && csp_name != AES_PROVIDER_PROTOTYPE {
            return Err(OffcryptoError::InvalidProvider(csp_name));
        }

        Ok(Self {
            flags,
            size_extra,
            alg_id,
            alg_id_hash,
            key_bits,
            provider_type,
            reserved1,
            reserved2,
            csp_name,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + (self.csp_name.len() + 1) * 2);
        for field in [
            self.flags,
            self.size_extra,
            self.alg_id,
            self.alg_id_hash,
            self.key_bits,
            self.provider_type,
            self.reserved1,
            self.reserved2,
        ] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for unit in self.csp_name.encode_utf16().chain([0]) {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }
}

impl StandardEncryptionVerifier {
    fn parse(r: &mut Reader<'_>) -> Result<Self> {
        let salt_size = r.read_u32_le("EncryptionVerifier.saltSize")? as usize;
        let salt = r.take(salt_size, "EncryptionVerifier.salt")?.to_vec();
        let mut encrypted_verifier = [0u8; VERIFIER_LEN];
        encrypted_verifier
            .copy_from_slice(r.take(VERIFIER_LEN, "EncryptionVerifier.encryptedVerifier")?);
        let verifier_hash_size = r.read_u32_le("EncryptionVerifier.verifierHashSize")?;
        let mut encrypted_verifier_hash = [0u8; VERIFIER_HASH_LEN];
        encrypted_verifier_hash.copy_from_slice(
            r.take(VERIFIER_HASH_LEN, "EncryptionVerifier.encryptedVerifierHash")?,
        );
        Ok(Self {
            salt,
            encrypted_verifier,
            verifier_hash_size,
            encrypted_verifier_hash,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.salt.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.encrypted_verifier);
        out.extend_from_slice(&self.verifier_hash_size.to_le_bytes());
        out.extend_from_slice(&self.encrypted_verifier_hash);
    }
}

impl StandardEncryptionInfo {
    /// Parses the descriptor body that follows the 8-byte version prefix.
    pub(crate) fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let header_len = r.read_u32_le("EncryptionInfo.headerSize")? as usize;
        let header = StandardEncryptionHeader::parse(r.take(header_len, "EncryptionHeader")?)?;
        let verifier = StandardEncryptionVerifier::parse(&mut r)?;
        if !r.remaining().is_empty() {
            warn!(
                "ignoring {} trailing bytes after standard EncryptionInfo",
                r.remaining().len()
            );
        }
        Ok(Self { header, verifier })
    }

    /// Serializes the whole `EncryptionInfo` stream, version prefix included.
    pub(crate) fn to_bytes(&self, version: EncryptionVersion) -> Vec<u8> {
        let header = self.header.to_bytes();
        let mut out = Vec::with_capacity(12 + header.len() + 72);
        out.extend_from_slice(&version.to_bytes());
        out.extend_from_slice(&(header.len() as u32).to_le_bytes());
        out.extend_from_slice(&header);
        self.verifier.write(&mut out);
        out
    }

    pub fn key_bytes(&self) -> usize {
        self.header.key_bits as usize / 8
    }

    /// Password to AES key: SHA-1 iterated over `salt || password`, then the `0x36`/`0x5C`
    /// expansion truncated to the key size.
    pub fn derive_key(&self, password: &str) -> Result<Zeroizing<Vec<u8>>> {
        let key_len = self.key_bytes();
        let sha1 = HashAlgorithm::Sha1;
        let hfinal = final_hash(&self.verifier.salt, password);

        let mut buf1 = Zeroizing::new([0x36u8; 64]);
        let mut buf2 = Zeroizing::new([0x5cu8; 64]);
        for i in 0..SHA1_LEN {
            buf1[i] ^= hfinal[i];
            buf2[i] ^= hfinal[i];
        }
        let mut out = Zeroizing::new(sha1.digest(&buf1[..]));
        out.extend_from_slice(&sha1.digest(&buf2[..]));

        if key_len > out.len() {
            return Err(OffcryptoError::InvalidKeySize {
                bits: self.header.key_bits,
            });
        }
        out.truncate(key_len);
        Ok(out)
    }

    /// Checks `sha1(verifier) == verifier_hash[..20]` after decrypting both with `key`.
    pub fn verify_key(&self, key: &[u8]) -> Result<()> {
        let mut verifier = Zeroizing::new(self.verifier.encrypted_verifier);
        aes_ecb_decrypt_in_place(key, &mut verifier[..])?;
        let expected = HashAlgorithm::Sha1.digest(&verifier[..]);

        let mut verifier_hash = Zeroizing::new(self.verifier.encrypted_verifier_hash);
        aes_ecb_decrypt_in_place(key, &mut verifier_hash[..])?;

        if ct_eq(&expected, &verifier_hash[..SHA1_LEN]) {
            Ok(())
        } else {
            Err(OffcryptoError::InvalidPassword)
        }
    }
}

/// `Hfinal = SHA1(H || LE32(0))`, with `H` the password hash iterated 50 000 times.
fn final_hash(salt: &[u8], password: &str) -> Zeroizing<Vec<u8>> {
    let sha1 = HashAlgorithm::Sha1;
    let password = password_utf16le(password);
    let h = iterated_hash(sha1, salt, &password, ITER_COUNT);
    Zeroizing::new(sha1.digest_parts(&[h.as_slice(), &0u32.to_le_bytes()[..]]))
}

/// Builds a standard descriptor for a fresh random salt and verifier; returns it with the key.
pub(crate) fn new_descriptor(
    password: &str,
    key_bits: u32,
) -> Result<(StandardEncryptionInfo, Zeroizing<Vec<u8>>)> {
    let alg_id = match key_bits {
        128 => CALG_AES_128,
        192 => CALG_AES_192,
        256 => CALG_AES_256,
        other => return Err(OffcryptoError::InvalidKeySize { bits: other }),
    };
    let mut info = StandardEncryptionInfo {
        header: StandardEncryptionHeader {
            flags: WRITER_FLAGS,
            size_extra: 0,
            alg_id,
            alg_id_hash: CALG_SHA1,
            key_bits,
            provider_type: PROV_RSA_AES,
            reserved1: 0,
            reserved2: 0,
            csp_name: AES_PROVIDER.to_string(),
        },
        verifier: StandardEncryptionVerifier {
            salt: random_bytes(16),
            encrypted_verifier: [0; VERIFIER_LEN],
            verifier_hash_size: SHA1_LEN as u32,
            encrypted_verifier_hash: [0; VERIFIER_HASH_LEN],
        },
    };
    let key = info.derive_key(password)?;

    let verifier = Zeroizing::new(random_bytes(VERIFIER_LEN));
    let mut encrypted_verifier = [0u8; VERIFIER_LEN];
    encrypted_verifier.copy_from_slice(&verifier);
    aes_ecb_encrypt_in_place(&key, &mut encrypted_verifier)?;

    let mut encrypted_verifier_hash = [0u8; VERIFIER_HASH_LEN];
    encrypted_verifier_hash[..SHA1_LEN].copy_from_slice(&HashAlgorithm::Sha1.digest(&verifier));
    aes_ecb_encrypt_in_place(&key, &mut encrypted_verifier_hash)?;

    info.verifier.encrypted_verifier = encrypted_verifier;
    info.verifier.encrypted_verifier_hash = encrypted_verifier_hash;
    Ok((info, key))
}

pub(crate) fn writer_version() -> EncryptionVersion {
    EncryptionVersion {
        major: 3,
        minor: 2,
        flags: WRITER_FLAGS,
    }
}

fn decode_csp_name(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(OffcryptoError::Truncated {
            context: "EncryptionHeader.cspName",
        });
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16(&units)
        .map_err(|_| OffcryptoError::InvalidProvider(String::from_utf16_lossy(&units)))
}
