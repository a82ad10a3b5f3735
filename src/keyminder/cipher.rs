//! # Cipher Manager
//!
//! Derives keys from passwords and seals/opens the serialized document.
//!
//! ## Suites
//!
//! A [`CipherSuite`] pairs an AEAD with a key derivation function:
//!
//! | Name                          | AEAD               | KDF              | Key bits |
//! |-------------------------------|--------------------|------------------|----------|
//! | `AES-256-GCM/Argon2id`        | AES-256-GCM        | Argon2id, salted | 256      |
//! | `ChaCha20-Poly1305/Argon2id`  | ChaCha20-Poly1305  | Argon2id, salted | 256      |
//! | `AES-128-GCM/Argon2id`        | AES-128-GCM        | Argon2id, salted | 128      |
//! | `AES-256-GCM/SHA-256`         | AES-256-GCM        | SHA-256, no salt | 256      |
//!
//! The last one exists to open files written by older releases; it can be
//! migrated away from with [`CipherManager::set_cipher`] but never chosen.
//!
//! ## Degraded Mode
//!
//! When the configured provider tops out below 256-bit keys
//! (`max_key_bits` in [`EngineConfig`]) new passwords use AES-128 and the
//! 256-bit suites cannot be selected. Files using them still open. The
//! capability query [`CipherManager::strength`] reports the reduced strength.
//!
//! ## Key Material
//!
//! Keys and the remembered password live in [`SecretBytes`], which is wiped
//! on drop. [`CipherManager::destroy`] and [`CipherManager::disable`] wipe
//! them eagerly.

use crate::config::EngineConfig;
use crate::error::{KeyMinderError, Result};
use crate::prompt::PasswordPrompt;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const DEFAULT_CIPHER: &str = "AES-256-GCM/Argon2id";
pub const DEGRADED_CIPHER: &str = "AES-128-GCM/Argon2id";
pub const LEGACY_CIPHER: &str = "AES-256-GCM/SHA-256";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const VERIFIER_MARKER: &[u8] = b"keyminder-password-check";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AeadKind {
    Aes256Gcm,
    Aes128Gcm,
    ChaCha20Poly1305,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KdfKind {
    Argon2id,
    Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub name: &'static str,
    pub key_bits: u16,
    aead: AeadKind,
    kdf: KdfKind,
    /// Only readable; never offered for new writes.
    pub legacy: bool,
}

impl CipherSuite {
    fn key_len(&self) -> usize {
        usize::from(self.key_bits / 8)
    }

    fn salted(&self) -> bool {
        self.kdf == KdfKind::Argon2id
    }
}

pub const SUITES: &[CipherSuite] = &[
    CipherSuite {
        name: DEFAULT_CIPHER,
        key_bits: 256,
        aead: AeadKind::Aes256Gcm,
        kdf: KdfKind::Argon2id,
        legacy: false,
    },
    CipherSuite {
        name: "ChaCha20-Poly1305/Argon2id",
        key_bits: 256,
        aead: AeadKind::ChaCha20Poly1305,
        kdf: KdfKind::Argon2id,
        legacy: false,
    },
    CipherSuite {
        name: DEGRADED_CIPHER,
        key_bits: 128,
        aead: AeadKind::Aes128Gcm,
        kdf: KdfKind::Argon2id,
        legacy: false,
    },
    CipherSuite {
        name: LEGACY_CIPHER,
        key_bits: 256,
        aead: AeadKind::Aes256Gcm,
        kdf: KdfKind::Sha256,
        legacy: true,
    },
];

pub fn find_suite(name: &str) -> Option<&'static CipherSuite> {
    SUITES.iter().find(|s| s.name.eq_ignore_ascii_case(name))
}

/// Suites selectable for new writes under the given key length limit.
pub fn available_suites(max_key_bits: u16) -> impl Iterator<Item = &'static CipherSuite> {
    SUITES
        .iter()
        .filter(move |s| !s.legacy && s.key_bits <= max_key_bits)
}

/// Argon2id cost parameters. Stored in the file header so a file keeps
/// opening when the configured defaults change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Largest cost a file header may ask for; anything above is corrupt.
    pub const MAX: KdfParams = KdfParams {
        memory_kib: 1024 * 1024,
        iterations: 64,
        parallelism: 16,
    };

    pub fn within_limits(&self) -> bool {
        self.memory_kib <= Self::MAX.memory_kib
            && self.iterations <= Self::MAX.iterations
            && self.parallelism <= Self::MAX.parallelism
    }

    /// Minimal cost, for tests only.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Byte buffer that is overwritten with zeros when dropped.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for SecretBytes {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {}])", self.0.len())
    }
}

/// Everything needed besides the password to open a payload. Written in
/// plain text next to the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionHeader {
    pub cipher: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfParams>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub salt: String,
    pub nonce: String,
}

#[derive(Debug, Clone)]
pub struct Sealed {
    pub header: EncryptionHeader,
    pub ciphertext: Vec<u8>,
}

/// What the capability query reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherStrength {
    pub key_bits: u16,
    pub degraded: bool,
}

struct ActiveKey {
    suite: &'static CipherSuite,
    params: KdfParams,
    salt: Vec<u8>,
    key: SecretBytes,
    password: SecretBytes,
    verifier: (Vec<u8>, Vec<u8>),
}

impl ActiveKey {
    fn derive(
        suite: &'static CipherSuite,
        params: KdfParams,
        salt: Vec<u8>,
        password: SecretBytes,
    ) -> Result<Self> {
        let key = derive_key(suite, password.expose(), &salt, &params)?;
        let nonce = random_bytes(NONCE_LEN);
        let marker = seal(suite, &key, &nonce, VERIFIER_MARKER)?;
        Ok(Self {
            suite,
            params,
            salt,
            key,
            password,
            verifier: (nonce, marker),
        })
    }

    fn wipe(&mut self) {
        self.key.zeroize();
        self.password.zeroize();
        self.salt.zeroize();
    }
}

impl Drop for ActiveKey {
    fn drop(&mut self) {
        self.wipe();
    }
}

enum CipherState {
    Unencrypted,
    Encrypted(ActiveKey),
}

/// Per-document encryption state: `Unencrypted` or `Encrypted(suite)`.
pub struct CipherManager {
    state: CipherState,
    default_params: KdfParams,
    max_key_bits: u16,
}

impl Default for CipherManager {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl fmt::Debug for CipherManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherManager")
            .field("cipher", &self.cipher_name())
            .field("max_key_bits", &self.max_key_bits)
            .finish()
    }
}

impl CipherManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            state: CipherState::Unencrypted,
            default_params: config.kdf,
            max_key_bits: config.max_key_bits,
        }
    }

    /// Unlocks a sealed payload, returning a manager holding the derived key
    /// together with the plaintext.
    ///
    /// A payload that fails authentication is reported as a wrong password;
    /// an unreadable header, an unknown cipher or a key derivation cost above
    /// [`KdfParams::MAX`] is reported as corrupt.
    pub fn open_sealed(
        config: &EngineConfig,
        header: &EncryptionHeader,
        ciphertext: &[u8],
        password: &str,
    ) -> Result<(Self, Vec<u8>)> {
        let suite = find_suite(&header.cipher).ok_or_else(|| {
            KeyMinderError::corrupt(format!("unknown cipher '{}'", header.cipher))
        })?;
        let salt = decode_b64(&header.salt, "salt")?;
        let nonce = decode_b64(&header.nonce, "nonce")?;
        if nonce.len() != NONCE_LEN {
            return Err(KeyMinderError::corrupt("nonce has the wrong length"));
        }
        let params = match (suite.salted(), header.kdf) {
            (true, Some(params)) => params,
            (true, None) => return Err(KeyMinderError::corrupt("missing key derivation parameters")),
            (false, _) => KdfParams::default(),
        };
        if !params.within_limits() {
            return Err(KeyMinderError::corrupt(
                "key derivation parameters exceed the allowed cost",
            ));
        }

        let active = ActiveKey::derive(suite, params, salt, SecretBytes::from(password))?;
        let plaintext = unseal(suite, &active.key, &nonce, ciphertext)
            .ok_or_else(KeyMinderError::wrong_password)?;
        debug!(cipher = suite.name, "payload unlocked");

        let mut manager = Self::new(config);
        manager.state = CipherState::Encrypted(active);
        Ok((manager, plaintext))
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.state, CipherState::Encrypted(_))
    }

    pub fn cipher_name(&self) -> Option<&'static str> {
        match &self.state {
            CipherState::Encrypted(active) => Some(active.suite.name),
            CipherState::Unencrypted => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.max_key_bits < 256
    }

    /// Strength of the active suite, or of the best one available when
    /// encryption is off.
    pub fn strength(&self) -> CipherStrength {
        let key_bits = match &self.state {
            CipherState::Encrypted(active) => active.suite.key_bits,
            CipherState::Unencrypted => available_suites(self.max_key_bits)
                .map(|s| s.key_bits)
                .max()
                .unwrap_or(0),
        };
        CipherStrength {
            key_bits,
            degraded: self.is_degraded(),
        }
    }

    fn default_suite(&self) -> Result<&'static CipherSuite> {
        let name = if self.is_degraded() {
            DEGRADED_CIPHER
        } else {
            DEFAULT_CIPHER
        };
        find_suite(name)
            .filter(|s| s.key_bits <= self.max_key_bits)
            .ok_or_else(|| {
                KeyMinderError::InvalidOperation(format!(
                    "no cipher fits a {}-bit key limit",
                    self.max_key_bits
                ))
            })
    }

    /// Turns encryption on with a freshly salted key.
    pub fn set_password(&mut self, password: &str) -> Result<()> {
        if self.is_encrypted() {
            return Err(KeyMinderError::InvalidOperation(
                "a password is already set; change it instead".to_string(),
            ));
        }
        if password.is_empty() {
            return Err(KeyMinderError::InvalidOperation(
                "the password must not be empty".to_string(),
            ));
        }
        let suite = self.default_suite()?;
        self.state = CipherState::Encrypted(self.fresh_key(suite, SecretBytes::from(password))?);
        info!(cipher = suite.name, "encryption enabled");
        Ok(())
    }

    /// Replaces the password after verifying the current one.
    pub fn change_password(&mut self, current: &str, new: &str) -> Result<()> {
        let CipherState::Encrypted(active) = &self.state else {
            return Err(KeyMinderError::InvalidOperation(
                "the document is not encrypted".to_string(),
            ));
        };
        if !self.check_password(current) {
            return Err(KeyMinderError::wrong_password());
        }
        if new.is_empty() {
            return Err(KeyMinderError::InvalidOperation(
                "the password must not be empty".to_string(),
            ));
        }
        let suite = if active.suite.legacy {
            self.default_suite()?
        } else {
            active.suite
        };
        self.state = CipherState::Encrypted(self.fresh_key(suite, SecretBytes::from(new))?);
        info!(cipher = suite.name, "password changed");
        Ok(())
    }

    /// Interactive password change: asks for the current password (when one
    /// is set) and twice for the new one.
    ///
    /// Returns `Ok(false)` when the two entries differ; the manager is left
    /// untouched then. Cancelling yields a `UserCancelled` storage error.
    pub fn change_password_interactive(
        &mut self,
        prompt: &mut dyn PasswordPrompt,
        hint: Option<&str>,
    ) -> Result<bool> {
        let current = if self.is_encrypted() {
            let current = prompt
                .ask("Current password", hint)?
                .ok_or_else(KeyMinderError::cancelled)?;
            if !self.check_password(&current) {
                return Err(KeyMinderError::wrong_password());
            }
            Some(current)
        } else {
            None
        };

        let first = prompt
            .ask("New password", None)?
            .ok_or_else(KeyMinderError::cancelled)?;
        let second = prompt
            .ask("Confirm new password", None)?
            .ok_or_else(KeyMinderError::cancelled)?;
        if first.as_str() != second.as_str() {
            debug!("password confirmation mismatch");
            return Ok(false);
        }

        match current {
            Some(current) => self.change_password(&current, &first)?,
            None => self.set_password(&first)?,
        }
        Ok(true)
    }

    /// True only for the password behind the active key.
    pub fn check_password(&self, candidate: &str) -> bool {
        let CipherState::Encrypted(active) = &self.state else {
            return false;
        };
        let Ok(key) = derive_key(active.suite, candidate.as_bytes(), &active.salt, &active.params)
        else {
            return false;
        };
        let (nonce, marker) = &active.verifier;
        unseal(active.suite, &key, nonce, marker).is_some()
    }

    /// Switches to another suite for the next save, re-deriving the key from
    /// the remembered password with a new salt.
    pub fn set_cipher(&mut self, name: &str) -> Result<()> {
        let suite = find_suite(name).ok_or_else(|| KeyMinderError::UnknownCipher(name.to_string()))?;
        if suite.legacy {
            return Err(KeyMinderError::InvalidOperation(format!(
                "{} can only be read",
                suite.name
            )));
        }
        if suite.key_bits > self.max_key_bits {
            return Err(KeyMinderError::InvalidOperation(format!(
                "{} needs {}-bit keys, the provider offers {}",
                suite.name, suite.key_bits, self.max_key_bits
            )));
        }
        let CipherState::Encrypted(active) = &self.state else {
            return Err(KeyMinderError::InvalidOperation(
                "set a password before choosing a cipher".to_string(),
            ));
        };
        let password = active.password.clone();
        self.state = CipherState::Encrypted(self.fresh_key(suite, password)?);
        info!(cipher = suite.name, "cipher changed");
        Ok(())
    }

    /// Drops encryption. The key material is wiped first.
    pub fn disable(&mut self) {
        if let CipherState::Encrypted(mut active) =
            std::mem::replace(&mut self.state, CipherState::Unencrypted)
        {
            active.wipe();
            info!("encryption disabled");
        }
    }

    /// Wipes all key material. Safe to call any number of times.
    pub fn destroy(&mut self) {
        if let CipherState::Encrypted(mut active) =
            std::mem::replace(&mut self.state, CipherState::Unencrypted)
        {
            active.wipe();
            debug!("key material destroyed");
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed> {
        let CipherState::Encrypted(active) = &self.state else {
            return Err(KeyMinderError::InvalidOperation(
                "the document is not encrypted".to_string(),
            ));
        };
        let nonce = random_bytes(NONCE_LEN);
        let ciphertext = seal(active.suite, &active.key, &nonce, plaintext)?;
        Ok(Sealed {
            header: EncryptionHeader {
                cipher: active.suite.name.to_string(),
                kdf: active.suite.salted().then_some(active.params),
                salt: BASE64.encode(&active.salt),
                nonce: BASE64.encode(&nonce),
            },
            ciphertext,
        })
    }

    /// Decrypts a payload sealed under the active key.
    pub fn decrypt(&self, header: &EncryptionHeader, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let CipherState::Encrypted(active) = &self.state else {
            return Err(KeyMinderError::InvalidOperation(
                "the document is not encrypted".to_string(),
            ));
        };
        let nonce = decode_b64(&header.nonce, "nonce")?;
        if nonce.len() != NONCE_LEN {
            return Err(KeyMinderError::corrupt("nonce has the wrong length"));
        }
        unseal(active.suite, &active.key, &nonce, ciphertext)
            .ok_or_else(KeyMinderError::wrong_password)
    }

    fn fresh_key(&self, suite: &'static CipherSuite, password: SecretBytes) -> Result<ActiveKey> {
        let salt = if suite.salted() {
            random_bytes(SALT_LEN)
        } else {
            Vec::new()
        };
        ActiveKey::derive(suite, self.default_params, salt, password)
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn decode_b64(value: &str, what: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| KeyMinderError::corrupt(format!("invalid {what} encoding: {e}")))
}

fn derive_key(
    suite: &CipherSuite,
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<SecretBytes> {
    match suite.kdf {
        KdfKind::Argon2id => {
            let argon_params = Params::new(
                params.memory_kib,
                params.iterations,
                params.parallelism,
                Some(suite.key_len()),
            )
            .map_err(|e| KeyMinderError::corrupt(format!("invalid Argon2 params: {e}")))?;
            let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
            let mut key = SecretBytes::new(vec![0u8; suite.key_len()]);
            argon2
                .hash_password_into(password, salt, &mut key.0)
                .map_err(|e| KeyMinderError::corrupt(format!("Argon2id failed: {e}")))?;
            Ok(key)
        }
        KdfKind::Sha256 => {
            let digest = Sha256::digest(password);
            Ok(SecretBytes::new(digest[..suite.key_len()].to_vec()))
        }
    }
}

fn nonce_array(nonce: &[u8]) -> Option<[u8; NONCE_LEN]> {
    nonce.try_into().ok()
}

fn seal(suite: &CipherSuite, key: &SecretBytes, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = nonce_array(nonce).ok_or_else(|| KeyMinderError::corrupt("bad nonce"))?;
    let key = key.expose();
    let sealed = match suite.aead {
        AeadKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|e| KeyMinderError::InvalidOperation(format!("bad key: {e}")))?
            .encrypt(&aes_gcm::Nonce::from(nonce), plaintext),
        AeadKind::Aes128Gcm => Aes128Gcm::new_from_slice(key)
            .map_err(|e| KeyMinderError::InvalidOperation(format!("bad key: {e}")))?
            .encrypt(&aes_gcm::Nonce::from(nonce), plaintext),
        AeadKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| KeyMinderError::InvalidOperation(format!("bad key: {e}")))?
            .encrypt(&chacha20poly1305::Nonce::from(nonce), plaintext),
    };
    sealed.map_err(|e| KeyMinderError::InvalidOperation(format!("encryption failed: {e}")))
}

/// `None` when the ciphertext does not authenticate under `key`.
fn unseal(suite: &CipherSuite, key: &SecretBytes, nonce: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let nonce = nonce_array(nonce)?;
    let key = key.expose();
    match suite.aead {
        AeadKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .ok()?
            .decrypt(&aes_gcm::Nonce::from(nonce), ciphertext)
            .ok(),
        AeadKind::Aes128Gcm => Aes128Gcm::new_from_slice(key)
            .ok()?
            .decrypt(&aes_gcm::Nonce::from(nonce), ciphertext)
            .ok(),
        AeadKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
            .ok()?
            .decrypt(&chacha20poly1305::Nonce::from(nonce), ciphertext)
            .ok(),
    }
}
