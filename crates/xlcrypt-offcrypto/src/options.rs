use crate::crypto::HashAlgorithm;

/// Upper bound on `spinCount` accepted from an agile descriptor.
pub const DEFAULT_MAX_SPIN_COUNT: u32 = 10_000_000;

/// Controls for [`crate::decrypt_xlsx_with_options`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptOptions {
    /// Check the descriptor's password verifier before decrypting. When disabled, a wrong
    /// password produces garbage plaintext instead of [`crate::OffcryptoError::InvalidPassword`].
    pub verify_password: bool,
    /// Check the agile `dataIntegrity` HMAC over the `EncryptedPackage` stream.
    pub verify_integrity: bool,
    pub max_spin_count: u32,
}

impl Default for DecryptOptions {
    fn default() -> Self {
        Self {
            verify_password: true,
            verify_integrity: true,
            max_spin_count: DEFAULT_MAX_SPIN_COUNT,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EncryptionScheme {
    Agile,
    Standard,
}

#[derive(Debug, Clone)]
pub struct EncryptOptions {
    pub scheme: EncryptionScheme,
    pub key_bits: u32,
    /// Agile only; standard encryption always uses SHA-1.
    pub hash_algorithm: HashAlgorithm,
    /// Agile only; standard encryption uses a fixed 50 000 rounds.
    pub spin_count: u32,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            scheme: EncryptionScheme::Agile,
            key_bits: 256,
            hash_algorithm: HashAlgorithm::Sha512,
            spin_count: 100_000,
        }
    }
}

impl EncryptOptions {
    pub(crate) fn key_bytes(&self) -> crate::Result<usize> {
        match self.key_bits {
            128 | 192 | 256 => Ok(self.key_bits as usize / 8),
            other => Err(crate::OffcryptoError::InvalidOptions(format!(
                "key_bits must be 128, 192 or 256 (got {other})"
            ))),
        }
    }
}
