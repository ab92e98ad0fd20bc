//! ECMA-376 Agile encryption: the XML descriptor, password key derivation and `dataIntegrity`.
//!
//! The password key encryptor stores three AES-CBC encrypted fields. Each is decrypted with a
//! key derived from the same iterated password hash and a distinct 8-byte block key:
//! - `encryptedVerifierHashInput`
//! - `encryptedVerifierHashValue`
//! - `encryptedKeyValue` (the package secret key)
//!
//! Digests stored encrypted are padded to the AES block size, so only the digest prefix of a
//! decrypted value is compared.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use log::{debug, warn};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event as XmlEvent};
use quick_xml::{Reader as XmlReader, Writer as XmlWriter};
use zeroize::Zeroizing;

use crate::crypto::{
    aes_cbc_decrypt, aes_cbc_encrypt_padded, ct_eq, derive_block_key, derive_iv, fit_to_length,
    iterated_hash, password_utf16le, random_bytes, HashAlgorithm, AES_BLOCK_SIZE,
};
use crate::encryption_info::{EncryptionVersion, AGILE_FLAGS};
use crate::error::{OffcryptoError, Result};
use crate::options::{DecryptOptions, EncryptOptions};

pub const ENCRYPTION_NS: &str = "http://schemas.microsoft.com/office/2006/encryption";
pub const PASSWORD_KEY_ENCRYPTOR_NS: &str =
    "http://schemas.microsoft.com/office/2006/keyEncryptor/password";

pub(crate) const VERIFIER_HASH_INPUT_BLOCK: [u8; 8] = [0xFE, 0xA7, 0xD2, 0x76, 0x3B, 0x4B, 0x9E, 0x79];
pub(crate) const VERIFIER_HASH_VALUE_BLOCK: [u8; 8] = [0xD7, 0xAA, 0x0F, 0x6D, 0x30, 0x61, 0x34, 0x4E];
pub(crate) const KEY_VALUE_BLOCK: [u8; 8] = [0x14, 0x6E, 0x0B, 0xE7, 0xAB, 0xAC, 0xD0, 0xD6];
pub(crate) const HMAC_KEY_BLOCK: [u8; 8] = [0x5F, 0xB2, 0xAD, 0x01, 0x0C, 0xB9, 0xE1, 0xF6];
pub(crate) const HMAC_VALUE_BLOCK: [u8; 8] = [0xA0, 0x67, 0x7F, 0x02, 0xB2, 0x2C, 0x84, 0x33];

const CIPHER_AES: &str = "AES";
const CHAINING_CBC: &str = "ChainingModeCBC";
const SALT_LEN: usize = 16;
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Cipher parameters shared by `<keyData>` and the password `<encryptedKey>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgileCipherParams {
    pub salt_size: u32,
    pub block_size: u32,
    pub key_bits: u32,
    pub hash_size: u32,
    pub cipher_algorithm: String,
    pub cipher_chaining: String,
    pub hash_algorithm: HashAlgorithm,
    pub salt: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgileDataIntegrity {
    pub encrypted_hmac_key: Vec<u8>,
    pub encrypted_hmac_value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgilePasswordKeyEncryptor {
    pub params: AgileCipherParams,
    pub spin_count: u32,
    pub encrypted_verifier_hash_input: Vec<u8>,
    pub encrypted_verifier_hash_value: Vec<u8>,
    pub encrypted_key_value: Vec<u8>,
}

/// Parsed agile `<encryption>` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgileEncryptionInfo {
    pub key_data: AgileCipherParams,
    /// Absent in some producers' output; integrity is then not checked.
    pub data_integrity: Option<AgileDataIntegrity>,
    pub key_encryptor: AgilePasswordKeyEncryptor,
}

impl AgileCipherParams {
    fn parse(attrs: &Attributes) -> Result<Self> {
        let params = Self {
            salt_size: attrs.u32("saltSize")?,
            block_size: attrs.u32("blockSize")?,
            key_bits: attrs.u32("keyBits")?,
            hash_size: attrs.u32("hashSize")?,
            cipher_algorithm: attrs.required("cipherAlgorithm")?.to_string(),
            cipher_chaining: attrs.required("cipherChaining")?.to_string(),
            hash_algorithm: HashAlgorithm::parse_offcrypto_name(attrs.required("hashAlgorithm")?)?,
            salt: attrs.base64("saltValue")?,
        };
        params.validate(attrs.element)?;
        Ok(params)
    }

    fn validate(&self, element: &str) -> Result<()> {
        if self.cipher_algorithm != CIPHER_AES {
            return Err(OffcryptoError::UnsupportedCipherAlgorithm(
                self.cipher_algorithm.clone(),
            ));
        }
        if self.cipher_chaining != CHAINING_CBC {
            return Err(OffcryptoError::UnsupportedCipherChaining(
                self.cipher_chaining.clone(),
            ));
        }
        if self.block_size as usize != AES_BLOCK_SIZE {
            return Err(OffcryptoError::invalid_info(format!(
                "{element}.blockSize must be 16 (got {})",
                self.block_size
            )));
        }
        if !matches!(self.key_bits, 128 | 192 | 256) {
            return Err(OffcryptoError::InvalidKeySize {
                bits: self.key_bits,
            });
        }
        if self.salt.len() != self.salt_size as usize {
            warn!(
                "{element}.saltSize is {} but saltValue has {} bytes",
                self.salt_size,
                self.salt.len()
            );
        }
        if self.hash_size as usize != self.hash_algorithm.digest_len() {
            warn!(
                "{element}.hashSize is {} but {} digests are {} bytes",
                self.hash_size,
                self.hash_algorithm.as_offcrypto_name(),
                self.hash_algorithm.digest_len()
            );
        }
        Ok(())
    }

    fn key_bytes(&self) -> usize {
        self.key_bits as usize / 8
    }

    fn fresh(options: &EncryptOptions) -> Result<Self> {
        let key_bytes = options.key_bytes()?;
        Ok(Self {
            salt_size: SALT_LEN as u32,
            block_size: AES_BLOCK_SIZE as u32,
            key_bits: (key_bytes * 8) as u32,
            hash_size: options.hash_algorithm.digest_len() as u32,
            cipher_algorithm: CIPHER_AES.to_string(),
            cipher_chaining: CHAINING_CBC.to_string(),
            hash_algorithm: options.hash_algorithm,
            salt: random_bytes(SALT_LEN),
        })
    }

    fn push_attributes(&self, elem: &mut BytesStart<'_>) {
        let salt_size = self.salt_size.to_string();
        let block_size = self.block_size.to_string();
        let key_bits = self.key_bits.to_string();
        let hash_size = self.hash_size.to_string();
        let salt = STANDARD.encode(&self.salt);
        elem.push_attribute(("saltSize", salt_size.as_str()));
        elem.push_attribute(("blockSize", block_size.as_str()));
        elem.push_attribute(("keyBits", key_bits.as_str()));
        elem.push_attribute(("hashSize", hash_size.as_str()));
        elem.push_attribute(("cipherAlgorithm", self.cipher_algorithm.as_str()));
        elem.push_attribute(("cipherChaining", self.cipher_chaining.as_str()));
        elem.push_attribute(("hashAlgorithm", self.hash_algorithm.as_offcrypto_name()));
        elem.push_attribute(("saltValue", salt.as_str()));
    }

    /// IV for the password encryptor's own fields: the salt fitted to the block size.
    fn salt_iv(&self) -> Vec<u8> {
        fit_to_length(&self.salt, self.block_size as usize, 0x36)
    }
}

impl AgileEncryptionInfo {
    /// Parses the XML that follows the 8-byte version prefix.
    pub(crate) fn parse_xml(xml_bytes: &[u8]) -> Result<Self> {
        let xml_bytes = xml_bytes.strip_prefix(UTF8_BOM).unwrap_or(xml_bytes);
        let end = xml_bytes
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |idx| idx + 1);
        let xml = std::str::from_utf8(&xml_bytes[..end])
            .map_err(|_| OffcryptoError::invalid_info("agile EncryptionInfo XML is not valid UTF-8"))?;

        let mut reader = XmlReader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut ns_stack: Vec<NamespaceFrame> = Vec::new();
        let mut elements: Vec<Vec<u8>> = Vec::new();
        let mut state = ParseState::default();

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|err| OffcryptoError::Xml(err.to_string()))?;
            match event {
                XmlEvent::Start(e) => {
                    push_namespace_frame(&mut ns_stack, &e)?;
                    state.element(&ns_stack, elements.last().map(Vec::as_slice), &e)?;
                    elements.push(e.local_name().as_ref().to_vec());
                }
                XmlEvent::Empty(e) => {
                    push_namespace_frame(&mut ns_stack, &e)?;
                    state.element(&ns_stack, elements.last().map(Vec::as_slice), &e)?;
                    ns_stack.pop();
                }
                XmlEvent::End(_) => {
                    ns_stack.pop();
                    elements.pop();
                }
                XmlEvent::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        state.finish()
    }

    /// Serializes the whole `EncryptionInfo` stream, version prefix included.
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let version = EncryptionVersion {
            major: 4,
            minor: 4,
            flags: AGILE_FLAGS,
        };
        let mut out = version.to_bytes().to_vec();
        out.extend_from_slice(&self.to_xml()?);
        Ok(out)
    }

    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let mut writer = XmlWriter::new(Vec::new());
        writer
            .write_event(XmlEvent::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))
            .map_err(xml_error)?;

        let mut root = BytesStart::new("encryption");
        root.push_attribute(("xmlns", ENCRYPTION_NS));
        root.push_attribute(("xmlns:p", PASSWORD_KEY_ENCRYPTOR_NS));
        writer.write_event(XmlEvent::Start(root)).map_err(xml_error)?;

        let mut key_data = BytesStart::new("keyData");
        self.key_data.push_attributes(&mut key_data);
        writer.write_event(XmlEvent::Empty(key_data)).map_err(xml_error)?;

        if let Some(integrity) = &self.data_integrity {
            let hmac_key = STANDARD.encode(&integrity.encrypted_hmac_key);
            let hmac_value = STANDARD.encode(&integrity.encrypted_hmac_value);
            let mut elem = BytesStart::new("dataIntegrity");
            elem.push_attribute(("encryptedHmacKey", hmac_key.as_str()));
            elem.push_attribute(("encryptedHmacValue", hmac_value.as_str()));
            writer.write_event(XmlEvent::Empty(elem)).map_err(xml_error)?;
        }

        writer
            .write_event(XmlEvent::Start(BytesStart::new("keyEncryptors")))
            .map_err(xml_error)?;
        let mut encryptor = BytesStart::new("keyEncryptor");
        encryptor.push_attribute(("uri", PASSWORD_KEY_ENCRYPTOR_NS));
        writer.write_event(XmlEvent::Start(encryptor)).map_err(xml_error)?;

        let ke = &self.key_encryptor;
        let spin_count = ke.spin_count.to_string();
        let verifier_input = STANDARD.encode(&ke.encrypted_verifier_hash_input);
        let verifier_value = STANDARD.encode(&ke.encrypted_verifier_hash_value);
        let key_value = STANDARD.encode(&ke.encrypted_key_value);
        let mut encrypted_key = BytesStart::new("p:encryptedKey");
        encrypted_key.push_attribute(("spinCount", spin_count.as_str()));
        ke.params.push_attributes(&mut encrypted_key);
        encrypted_key.push_attribute(("encryptedVerifierHashInput", verifier_input.as_str()));
        encrypted_key.push_attribute(("encryptedVerifierHashValue", verifier_value.as_str()));
        encrypted_key.push_attribute(("encryptedKeyValue", key_value.as_str()));
        writer.write_event(XmlEvent::Empty(encrypted_key)).map_err(xml_error)?;

        for name in ["keyEncryptor", "keyEncryptors", "encryption"] {
            writer
                .write_event(XmlEvent::End(BytesEnd::new(name)))
                .map_err(xml_error)?;
        }
        Ok(writer.into_inner())
    }

    /// Password to package secret key.
    ///
    /// The iterated hash runs once and feeds all three block keys. With
    /// `options.verify_password` off the verifier fields are not consulted, so a wrong password
    /// yields a wrong key rather than [`OffcryptoError::InvalidPassword`].
    pub fn derive_secret_key(
        &self,
        password: &str,
        options: &DecryptOptions,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let ke = &self.key_encryptor;
        if ke.spin_count > options.max_spin_count {
            return Err(OffcryptoError::SpinCountTooLarge {
                spin_count: ke.spin_count,
                max: options.max_spin_count,
            });
        }

        let hash = ke.params.hash_algorithm;
        let key_bytes = ke.params.key_bytes();
        let iv = ke.params.salt_iv();
        let password = password_utf16le(password);
        let h = iterated_hash(hash, &ke.params.salt, &password, ke.spin_count);

        if options.verify_password {
            let key = derive_block_key(hash, &h, &VERIFIER_HASH_INPUT_BLOCK, key_bytes);
            let verifier_input = aes_cbc_decrypt(&key, &iv, &ke.encrypted_verifier_hash_input)?;
            let input_len = ke.params.salt.len().min(verifier_input.len());
            let expected = hash.digest(&verifier_input[..input_len]);

            let key = derive_block_key(hash, &h, &VERIFIER_HASH_VALUE_BLOCK, key_bytes);
            let verifier_value = aes_cbc_decrypt(&key, &iv, &ke.encrypted_verifier_hash_value)?;
            let matches = verifier_value
                .get(..expected.len())
                .is_some_and(|stored| ct_eq(&expected, stored));
            if !matches {
                return Err(OffcryptoError::InvalidPassword);
            }
        }

        let key = derive_block_key(hash, &h, &KEY_VALUE_BLOCK, key_bytes);
        let mut secret = aes_cbc_decrypt(&key, &iv, &ke.encrypted_key_value)?;
        let secret_len = self.key_data.key_bytes();
        if secret.len() < secret_len {
            return Err(OffcryptoError::invalid_info("decrypted keyValue is truncated"));
        }
        secret.truncate(secret_len);
        Ok(secret)
    }

    /// Checks the `dataIntegrity` HMAC over the raw `EncryptedPackage` stream (size prefix
    /// included).
    pub fn verify_integrity(&self, secret_key: &[u8], encrypted_package: &[u8]) -> Result<()> {
        let Some(integrity) = &self.data_integrity else {
            debug!("agile descriptor has no dataIntegrity element; skipping HMAC check");
            return Ok(());
        };

        let hash = self.key_data.hash_algorithm;
        let digest_len = hash.digest_len();
        let block_size = self.key_data.block_size as usize;

        let iv = derive_iv(hash, &self.key_data.salt, &HMAC_KEY_BLOCK, block_size);
        let hmac_key = aes_cbc_decrypt(secret_key, &iv, &integrity.encrypted_hmac_key)?;
        let iv = derive_iv(hash, &self.key_data.salt, &HMAC_VALUE_BLOCK, block_size);
        let hmac_value = aes_cbc_decrypt(secret_key, &iv, &integrity.encrypted_hmac_value)?;

        let (Some(hmac_key), Some(expected)) =
            (hmac_key.get(..digest_len), hmac_value.get(..digest_len))
        else {
            return Err(OffcryptoError::IntegrityCheckFailed);
        };
        let computed = hash.hmac(hmac_key, encrypted_package)?;
        if ct_eq(&computed, expected) {
            Ok(())
        } else {
            Err(OffcryptoError::IntegrityCheckFailed)
        }
    }

    /// Computes and stores `dataIntegrity` for a finished `EncryptedPackage` stream.
    pub(crate) fn seal_integrity(&mut self, secret_key: &[u8], encrypted_package: &[u8]) -> Result<()> {
        let hash = self.key_data.hash_algorithm;
        let block_size = self.key_data.block_size as usize;
        let hmac_key = Zeroizing::new(random_bytes(hash.digest_len()));
        let hmac_value = hash.hmac(&hmac_key, encrypted_package)?;

        let iv = derive_iv(hash, &self.key_data.salt, &HMAC_KEY_BLOCK, block_size);
        let encrypted_hmac_key = aes_cbc_encrypt_padded(secret_key, &iv, &hmac_key)?;
        let iv = derive_iv(hash, &self.key_data.salt, &HMAC_VALUE_BLOCK, block_size);
        let encrypted_hmac_value = aes_cbc_encrypt_padded(secret_key, &iv, &hmac_value)?;

        self.data_integrity = Some(AgileDataIntegrity {
            encrypted_hmac_key,
            encrypted_hmac_value,
        });
        Ok(())
    }
}

/// Builds a descriptor for a fresh random secret key wrapped under `password`.
///
/// `dataIntegrity` is left empty until [`AgileEncryptionInfo::seal_integrity`] sees the package.
pub(crate) fn new_descriptor(
    password: &str,
    options: &EncryptOptions,
) -> Result<(AgileEncryptionInfo, Zeroizing<Vec<u8>>)> {
    let key_data = AgileCipherParams::fresh(options)?;
    let params = AgileCipherParams::fresh(options)?;
    let hash = params.hash_algorithm;
    let key_bytes = params.key_bytes();
    let iv = params.salt_iv();

    let secret_key = Zeroizing::new(random_bytes(key_data.key_bytes()));
    let verifier_input = Zeroizing::new(random_bytes(SALT_LEN));
    let verifier_value = hash.digest(&verifier_input);

    let password = password_utf16le(password);
    let h = iterated_hash(hash, &params.salt, &password, options.spin_count);
    let encrypt_field = |block_key: &[u8; 8], plaintext: &[u8]| -> Result<Vec<u8>> {
        let key = derive_block_key(hash, &h, block_key, key_bytes);
        aes_cbc_encrypt_padded(&key, &iv, plaintext)
    };

    let key_encryptor = AgilePasswordKeyEncryptor {
        encrypted_verifier_hash_input: encrypt_field(&VERIFIER_HASH_INPUT_BLOCK, &verifier_input[..])?,
        encrypted_verifier_hash_value: encrypt_field(&VERIFIER_HASH_VALUE_BLOCK, &verifier_value[..])?,
        encrypted_key_value: encrypt_field(&KEY_VALUE_BLOCK, &secret_key[..])?,
        spin_count: options.spin_count,
        params,
    };

    Ok((
        AgileEncryptionInfo {
            key_data,
            data_integrity: None,
            key_encryptor,
        },
        secret_key,
    ))
}

/// Accumulates descriptor elements while the XML is streamed.
#[derive(Default)]
struct ParseState {
    key_data: Option<AgileCipherParams>,
    data_integrity: Option<AgileDataIntegrity>,
    key_encryptors: usize,
    key_encryptor: Option<AgilePasswordKeyEncryptor>,
}

impl ParseState {
    fn element(
        &mut self,
        ns_stack: &[NamespaceFrame],
        parent: Option<&[u8]>,
        e: &BytesStart<'_>,
    ) -> Result<()> {
        let local = e.local_name();
        if parent == Some(b"keyEncryptor".as_slice()) {
            return self.key_encryptor_child(ns_stack, e);
        }

        match local.as_ref() {
            b"keyData" => {
                if self.key_data.is_some() {
                    return Err(OffcryptoError::invalid_info("multiple <keyData> elements"));
                }
                let attrs = Attributes::collect("keyData", e)?;
                self.key_data = Some(AgileCipherParams::parse(&attrs)?);
            }
            b"dataIntegrity" => {
                if self.data_integrity.is_some() {
                    return Err(OffcryptoError::invalid_info("multiple <dataIntegrity> elements"));
                }
                let attrs = Attributes::collect("dataIntegrity", e)?;
                self.data_integrity = Some(AgileDataIntegrity {
                    encrypted_hmac_key: attrs.base64("encryptedHmacKey")?,
                    encrypted_hmac_value: attrs.base64("encryptedHmacValue")?,
                });
            }
            b"keyEncryptor" => {
                self.key_encryptors += 1;
                if self.key_encryptors > 1 {
                    return Err(OffcryptoError::invalid_info("multiple <keyEncryptor> elements"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn key_encryptor_child(&mut self, ns_stack: &[NamespaceFrame], e: &BytesStart<'_>) -> Result<()> {
        let name = e.name();
        let ns_uri = resolve_namespace_uri(ns_stack, element_prefix(name.as_ref()));
        let is_password_key = local_name(name.as_ref()) == b"encryptedKey"
            && ns_uri == Some(PASSWORD_KEY_ENCRYPTOR_NS.as_bytes());
        if !is_password_key {
            return Err(OffcryptoError::UnsupportedKeyEncryptor);
        }
        if self.key_encryptor.is_some() {
            return Err(OffcryptoError::invalid_info("multiple password <encryptedKey> elements"));
        }

        let attrs = Attributes::collect("encryptedKey", e)?;
        self.key_encryptor = Some(AgilePasswordKeyEncryptor {
            params: AgileCipherParams::parse(&attrs)?,
            spin_count: attrs.u32("spinCount")?,
            encrypted_verifier_hash_input: attrs.base64("encryptedVerifierHashInput")?,
            encrypted_verifier_hash_value: attrs.base64("encryptedVerifierHashValue")?,
            encrypted_key_value: attrs.base64("encryptedKeyValue")?,
        });
        Ok(())
    }

    fn finish(self) -> Result<AgileEncryptionInfo> {
        let key_data = self
            .key_data
            .ok_or_else(|| OffcryptoError::invalid_info("missing <keyData> element"))?;
        let key_encryptor = self.key_encryptor.ok_or(OffcryptoError::NoPasswordKey)?;
        Ok(AgileEncryptionInfo {
            key_data,
            data_integrity: self.data_integrity,
            key_encryptor,
        })
    }
}

/// Attributes of one element, keyed by local name.
struct Attributes {
    element: &'static str,
    values: Vec<(Vec<u8>, String)>,
}

impl Attributes {
    fn collect(element: &'static str, e: &BytesStart<'_>) -> Result<Self> {
        let mut values = Vec::new();
        for attr in e.attributes().with_checks(false) {
            let attr = attr.map_err(|err| OffcryptoError::Xml(err.to_string()))?;
            let value = std::str::from_utf8(attr.value.as_ref()).map_err(|_| {
                OffcryptoError::invalid_info(format!("{element} has a non UTF-8 attribute value"))
            })?;
            values.push((local_name(attr.key.as_ref()).to_vec(), value.to_string()));
        }
        Ok(Self { element, values })
    }

    fn required(&self, name: &str) -> Result<&str> {
        self.values
            .iter()
            .find(|(key, _)| key.as_slice() == name.as_bytes())
            .map(|(_, value)| value.as_str())
            .ok_or_else(|| OffcryptoError::invalid_info(format!("missing {}.{name}", self.element)))
    }

    fn u32(&self, name: &str) -> Result<u32> {
        let value = self.required(name)?;
        value.trim().parse::<u32>().map_err(|_| {
            OffcryptoError::invalid_info(format!("invalid {}.{name} `{value}`", self.element))
        })
    }

    fn base64(&self, name: &str) -> Result<Vec<u8>> {
        let value = self.required(name)?;
        decode_b64_attr(value).ok_or_else(|| {
            OffcryptoError::invalid_info(format!("invalid base64 in {}.{name}", self.element))
        })
    }
}

/// Producers may pretty-print long base64 values or omit `=` padding.
fn decode_b64_attr(value: &str) -> Option<Vec<u8>> {
    let cleaned: Vec<u8> = value
        .bytes()
        .filter(|b| !matches!(b, b'\r' | b'\n' | b'\t' | b' '))
        .collect();
    STANDARD
        .decode(&cleaned)
        .or_else(|_| STANDARD_NO_PAD.decode(&cleaned))
        .ok()
}

struct NamespaceFrame {
    decls: Vec<(Vec<u8>, Vec<u8>)>,
}

fn push_namespace_frame(stack: &mut Vec<NamespaceFrame>, elem: &BytesStart<'_>) -> Result<()> {
    let mut frame = NamespaceFrame { decls: Vec::new() };
    for attr in elem.attributes().with_checks(false) {
        let attr = attr.map_err(|err| OffcryptoError::Xml(err.to_string()))?;
        let key = attr.key.as_ref();
        if key == b"xmlns" {
            frame.decls.push((Vec::new(), attr.value.to_vec()));
        } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
            frame.decls.push((prefix.to_vec(), attr.value.to_vec()));
        }
    }
    stack.push(frame);
    Ok(())
}

fn resolve_namespace_uri<'a>(stack: &'a [NamespaceFrame], prefix: &[u8]) -> Option<&'a [u8]> {
    stack
        .iter()
        .rev()
        .flat_map(|frame| frame.decls.iter())
        .find(|(p, _)| p.as_slice() == prefix)
        .map(|(_, uri)| uri.as_slice())
}

fn element_prefix(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|b| *b == b':')
        .map(|idx| &name[..idx])
        .unwrap_or(&[])
}

fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|b| *b == b':')
        .map(|idx| &name[idx + 1..])
        .unwrap_or(name)
}

fn xml_error(err: impl std::fmt::Display) -> OffcryptoError {
    OffcryptoError::Xml(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> EncryptOptions {
        EncryptOptions {
            spin_count: 10,
            ..EncryptOptions::default()
        }
    }

    fn xml(body: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<encryption xmlns="{ENCRYPTION_NS}" xmlns:p="{PASSWORD_KEY_ENCRYPTOR_NS}">
  <keyData saltSize="16" blockSize="16" keyBits="128" hashSize="20" cipherAlgorithm="AES"
    cipherChaining="ChainingModeCBC" hashAlgorithm="SHA1" saltValue="AAECAwQFBgcICQoLDA0ODw=="/>
  {body}
</encryption>"#
        )
        .into_bytes()
    }

    const PASSWORD_KEY: &str = r#"<keyEncryptors><keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
  <p:encryptedKey spinCount="100000" saltSize="16" blockSize="16" keyBits="128" hashSize="20"
    cipherAlgorithm="AES" cipherChaining="ChainingModeCBC" hashAlgorithm="SHA-1"
    saltValue="AAECAwQFBgcICQoLDA0ODw"
    encryptedVerifierHashInput="AAECAwQFBgcICQoLDA0ODw=="
    encryptedVerifierHashValue="AAECAwQF
      BgcICQoLDA0ODw=="
    encryptedKeyValue="AAECAwQFBgcICQoLDA0ODw=="/>
</keyEncryptor></keyEncryptors>"#;

    #[test]
    fn parses_minimal_descriptor_without_integrity() {
        let info = AgileEncryptionInfo::parse_xml(&xml(PASSWORD_KEY)).unwrap();
        assert_eq!(info.key_data.key_bits, 128);
        assert_eq!(info.key_data.salt, (0u8..16).collect::<Vec<_>>());
        assert!(info.data_integrity.is_none());
        let ke = &info.key_encryptor;
        assert_eq!(ke.spin_count, 100_000);
        assert_eq!(ke.params.hash_algorithm, HashAlgorithm::Sha1);
        assert_eq!(ke.encrypted_verifier_hash_value.len(), 16);
    }

    #[test]
    fn tolerates_bom_and_trailing_nuls() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(&xml(PASSWORD_KEY));
        bytes.extend_from_slice(&[0, 0, 0]);
        assert!(AgileEncryptionInfo::parse_xml(&bytes).is_ok());
    }

    #[test]
    fn missing_password_key_is_reported() {
        let err = AgileEncryptionInfo::parse_xml(&xml("<keyEncryptors/>")).unwrap_err();
        assert!(matches!(err, OffcryptoError::NoPasswordKey));
    }

    #[test]
    fn certificate_key_encryptor_is_unsupported() {
        let body = r#"<keyEncryptors xmlns:c="http://schemas.microsoft.com/office/2006/keyEncryptor/certificate">
<keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/certificate">
<c:encryptedKey X509Certificate="AA==" certVerifier="AA==" encryptedKeyValue="AA=="/>
</keyEncryptor></keyEncryptors>"#;
        let err = AgileEncryptionInfo::parse_xml(&xml(body)).unwrap_err();
        assert_eq!(err.to_string(), "other encryption key types not supported");
    }

    #[test]
    fn cipher_parameters_are_validated() {
        let cases = [
            ("ChainingModeCBC", "ChainingModeCFB", "unsupported cipher chaining"),
            (r#"cipherAlgorithm="AES""#, r#"cipherAlgorithm="DES""#, "unsupported cipher algorithm"),
            ("SHA-1", "MD5", "unsupported hash algorithm"),
            (r#"keyBits="128" hashSize"#, r#"keyBits="100" hashSize"#, "invalid key size"),
            ("spinCount=\"100000\"", "", "missing encryptedKey.spinCount"),
        ];
        for (from, to, message) in cases {
            let body = PASSWORD_KEY.replacen(from, to, 1);
            let err = AgileEncryptionInfo::parse_xml(&xml(&body)).unwrap_err();
            assert!(err.to_string().contains(message), "{message}: {err}");
        }
    }

    #[test]
    fn fresh_descriptor_survives_xml_and_derives_the_same_key() {
        let (mut info, secret) = new_descriptor("pässwörd", &options()).unwrap();
        assert_eq!(secret.len(), 32);
        info.seal_integrity(&secret, b"package bytes").unwrap();

        let bytes = info.to_bytes().unwrap();
        assert_eq!(&bytes[..8], &[4, 0, 4, 0, 0x40, 0, 0, 0]);
        let parsed = AgileEncryptionInfo::parse_xml(&bytes[8..]).unwrap();
        assert_eq!(parsed, info);

        let derived = parsed
            .derive_secret_key("pässwörd", &DecryptOptions::default())
            .unwrap();
        assert_eq!(&derived[..], &secret[..]);
        parsed.verify_integrity(&derived, b"package bytes").unwrap();
        assert!(matches!(
            parsed.verify_integrity(&derived, b"package bytez"),
            Err(OffcryptoError::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn wrong_password_and_spin_limit() {
        let (info, _) = new_descriptor("right", &options()).unwrap();
        assert!(matches!(
            info.derive_secret_key("wrong", &DecryptOptions::default()),
            Err(OffcryptoError::InvalidPassword)
        ));

        let unchecked = DecryptOptions {
            verify_password: false,
            ..DecryptOptions::default()
        };
        assert!(info.derive_secret_key("wrong", &unchecked).is_ok());

        let strict = DecryptOptions {
            max_spin_count: 5,
            ..DecryptOptions::default()
        };
        assert!(matches!(
            info.derive_secret_key("right", &strict),
            Err(OffcryptoError::SpinCountTooLarge { spin_count: 10, max: 5 })
        ));
    }

    #[test]
    fn missing_integrity_is_not_checked() {
        let (info, secret) = new_descriptor("pw", &options()).unwrap();
        assert!(info.verify_integrity(&secret, b"anything").is_ok());
    }
}
