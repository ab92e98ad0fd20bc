use thiserror::Error;
use xlcrypt_cfb::CfbError;

#[derive(Debug, Error)]
pub enum OffcryptoError {
    #[error("empty file")]
    EmptyFile,
    #[error("unrecognized format: neither a compound file nor a ZIP package")]
    UnrecognizedFormat,
    #[error(transparent)]
    Container(#[from] CfbError),
    #[error("truncated data while reading {context}")]
    Truncated { context: &'static str },
    /// Agile framing with flags other than `0x40`.
    #[error("bad header: {reason}")]
    BadHeader { reason: &'static str },
    #[error("unsupported encryption version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("extensible encryption is not supported")]
    ExtensibleEncryption,
    /// The standard descriptor does not declare AES.
    #[error("not an OOXML document")]
    NotOoxml,
    #[error("invalid cipher algorithm {0:#x}")]
    InvalidCipherAlgorithm(u32),
    #[error("invalid hash algorithm {0:#x}")]
    InvalidHashAlgorithm(u32),
    #[error("invalid provider type {0:#x}")]
    InvalidProviderType(u32),
    #[error("invalid header: reserved fields must be zero")]
    InvalidHeader,
    #[error("invalid cryptographic provider `{0}`")]
    InvalidProvider(String),
    #[error("invalid key size: {bits} bits")]
    InvalidKeySize { bits: u32 },
    #[error("other encryption key types not supported")]
    UnsupportedKeyEncryptor,
    #[error("no password key in keyEncryptors")]
    NoPasswordKey,
    #[error("invalid EncryptionInfo: {context}")]
    InvalidEncryptionInfo { context: String },
    #[error("unsupported hash algorithm `{0}`")]
    UnsupportedHashAlgorithm(String),
    #[error("unsupported cipher algorithm `{0}`")]
    UnsupportedCipherAlgorithm(String),
    #[error("unsupported cipher chaining `{0}`")]
    UnsupportedCipherChaining(String),
    #[error("spinCount {spin_count} exceeds the configured maximum {max}")]
    SpinCountTooLarge { spin_count: u32, max: u32 },
    #[error("ciphertext length {len} is not a multiple of the AES block size")]
    InvalidCiphertextLength { len: usize },
    #[error("invalid AES key length {len}")]
    InvalidKeyLength { len: usize },
    #[error("invalid AES IV length {len}")]
    InvalidIvLength { len: usize },
    #[error("EncryptedPackage declares {declared} bytes but only {available} are present")]
    PackageTooShort { declared: u64, available: usize },
    #[error("invalid password")]
    InvalidPassword,
    #[error("integrity check failed")]
    IntegrityCheckFailed,
    #[error("invalid encryption options: {0}")]
    InvalidOptions(String),
    #[error("XML error: {0}")]
    Xml(String),
}

impl OffcryptoError {
    pub(crate) fn invalid_info(context: impl Into<String>) -> Self {
        OffcryptoError::InvalidEncryptionInfo {
            context: context.into(),
        }
    }
}

pub type Result<T, E = OffcryptoError> = std::result::Result<T, E>;
