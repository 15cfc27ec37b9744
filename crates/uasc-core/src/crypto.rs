//! Cryptographic building blocks for secure channels.
//!
//! Provides three things:
//!   1. Security policies: URI ↔ enum, and the symmetric suite each implies
//!   2. Derived keys: P_SHA256 key derivation, HMAC-SHA256 signatures,
//!      AES-CBC encryption of whole blocks (padding is the chunker's job)
//!   3. The [`AsymmetricCrypto`] trait through which RSA operations for OPN
//!      chunks are supplied by the caller
//!
//! All symmetric key material derives ZeroizeOnDrop. There is no unsafe code
//! in this module.

use aes::{Aes128, Aes256};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

// ── Security mode ─────────────────────────────────────────────────────────────

/// How symmetric chunks are protected once the channel is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MessageSecurityMode {
    None,
    Sign,
    SignAndEncrypt,
}

impl MessageSecurityMode {
    pub fn signs(self) -> bool {
        !matches!(self, MessageSecurityMode::None)
    }

    pub fn encrypts(self) -> bool {
        matches!(self, MessageSecurityMode::SignAndEncrypt)
    }
}

// ── Security policy ───────────────────────────────────────────────────────────

/// Named bundle of algorithms, identified on the wire by its URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityPolicy {
    None,
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
    Aes128Sha256RsaOaep,
    Aes256Sha256RsaPss,
}

const POLICY_URI_PREFIX: &str = "http://opcfoundation.org/UA/SecurityPolicy#";

impl SecurityPolicy {
    pub const ALL: [SecurityPolicy; 6] = [
        SecurityPolicy::None,
        SecurityPolicy::Basic128Rsa15,
        SecurityPolicy::Basic256,
        SecurityPolicy::Basic256Sha256,
        SecurityPolicy::Aes128Sha256RsaOaep,
        SecurityPolicy::Aes256Sha256RsaPss,
    ];

    fn short_name(self) -> &'static str {
        match self {
            SecurityPolicy::None => "None",
            SecurityPolicy::Basic128Rsa15 => "Basic128Rsa15",
            SecurityPolicy::Basic256 => "Basic256",
            SecurityPolicy::Basic256Sha256 => "Basic256Sha256",
            SecurityPolicy::Aes128Sha256RsaOaep => "Aes128_Sha256_RsaOaep",
            SecurityPolicy::Aes256Sha256RsaPss => "Aes256_Sha256_RsaPss",
        }
    }

    pub fn uri(self) -> String {
        format!("{POLICY_URI_PREFIX}{}", self.short_name())
    }

    pub fn from_uri(uri: &str) -> Result<Self, CryptoError> {
        uri.strip_prefix(POLICY_URI_PREFIX)
            .and_then(|name| Self::ALL.into_iter().find(|p| p.short_name() == name))
            .ok_or_else(|| CryptoError::UnknownPolicy(uri.to_string()))
    }

    /// SHA-1 based policies, deprecated by OPC-UA 1.04 and not implemented here.
    pub fn is_deprecated(self) -> bool {
        matches!(self, SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256)
    }

    /// Symmetric algorithm parameters; `None` for the None policy.
    pub fn symmetric_suite(self) -> Result<Option<SymmetricSuite>, CryptoError> {
        match self {
            SecurityPolicy::None => Ok(None),
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256 => {
                Err(CryptoError::DeprecatedPolicy(self.uri()))
            }
            SecurityPolicy::Basic256Sha256 | SecurityPolicy::Aes256Sha256RsaPss => {
                Ok(Some(SymmetricSuite {
                    signing_key_length: 32,
                    encrypting_key_length: 32,
                }))
            }
            SecurityPolicy::Aes128Sha256RsaOaep => Ok(Some(SymmetricSuite {
                signing_key_length: 32,
                encrypting_key_length: 16,
            })),
        }
    }

    /// Length of the nonces exchanged in OPN.
    pub fn nonce_length(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic128Rsa15 => 16,
            _ => 32,
        }
    }

    /// Derive one direction's keys: `P_SHA256(secret, seed)` split into
    /// signing key, encrypting key and IV.
    pub fn derive_keys(self, secret: &[u8], seed: &[u8]) -> Result<DerivedKeys, CryptoError> {
        let suite = self
            .symmetric_suite()?
            .ok_or(CryptoError::NoSymmetricSuite)?;
        let total = suite.signing_key_length + suite.encrypting_key_length + AES_BLOCK_SIZE;
        let mut material = p_sha256(secret, seed, total)?;
        let (signing, rest) = material.split_at(suite.signing_key_length);
        let (encrypting, iv) = rest.split_at(suite.encrypting_key_length);
        let keys = DerivedKeys::new(suite, signing.to_vec(), encrypting.to_vec(), iv.to_vec());
        material.zeroize();
        keys
    }
}

impl std::fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Symmetric parameters of a non-deprecated policy. Signatures are
/// HMAC-SHA256 and encryption is AES-CBC for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymmetricSuite {
    pub signing_key_length: usize,
    pub encrypting_key_length: usize,
}

pub const AES_BLOCK_SIZE: usize = 16;
pub const HMAC_SHA256_LENGTH: usize = 32;

// ── Key derivation ────────────────────────────────────────────────────────────

/// TLS-style P_SHA256 pseudo-random function (RFC 5246 §5).
///
///   A(0) = seed, A(i) = HMAC(secret, A(i-1))
///   output = HMAC(secret, A(1) || seed) || HMAC(secret, A(2) || seed) || …
pub fn p_sha256(secret: &[u8], seed: &[u8], length: usize) -> Result<Vec<u8>, CryptoError> {
    let new_mac = || {
        <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| CryptoError::InvalidKeyLength {
            expected: HMAC_SHA256_LENGTH,
            got: secret.len(),
        })
    };

    let mut out = Vec::with_capacity(length + HMAC_SHA256_LENGTH);
    let mut a = seed.to_vec();
    while out.len() < length {
        let mut mac = new_mac()?;
        mac.update(&a);
        a = mac.finalize().into_bytes().to_vec();

        let mut mac = new_mac()?;
        mac.update(&a);
        mac.update(seed);
        out.extend_from_slice(&mac.finalize().into_bytes());
    }
    out.truncate(length);
    Ok(out)
}

/// Generate a cryptographically random nonce for OPN.
pub fn generate_nonce(length: usize) -> Vec<u8> {
    let mut nonce = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

// ── Derived keys ──────────────────────────────────────────────────────────────

/// Key set securing one direction of one security token.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    #[zeroize(skip)]
    suite: SymmetricSuite,
    signing_key: Vec<u8>,
    encrypting_key: Vec<u8>,
    iv: Vec<u8>,
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeys")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

impl DerivedKeys {
    pub fn new(
        suite: SymmetricSuite,
        signing_key: Vec<u8>,
        encrypting_key: Vec<u8>,
        iv: Vec<u8>,
    ) -> Result<Self, CryptoError> {
        for (expected, got) in [
            (suite.signing_key_length, signing_key.len()),
            (suite.encrypting_key_length, encrypting_key.len()),
            (AES_BLOCK_SIZE, iv.len()),
        ] {
            if expected != got {
                return Err(CryptoError::InvalidKeyLength { expected, got });
            }
        }
        if !matches!(suite.encrypting_key_length, 16 | 32) {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                got: suite.encrypting_key_length,
            });
        }
        Ok(Self {
            suite,
            signing_key,
            encrypting_key,
            iv,
        })
    }

    pub fn suite(&self) -> SymmetricSuite {
        self.suite
    }

    pub fn signature_length(&self) -> usize {
        HMAC_SHA256_LENGTH
    }

    pub fn block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn mac(&self) -> Result<HmacSha256, CryptoError> {
        <HmacSha256 as Mac>::new_from_slice(&self.signing_key).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: self.suite.signing_key_length,
                got: self.signing_key.len(),
            }
        })
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Constant-time comparison of `signature` against HMAC(data).
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let mut mac = self.mac()?;
        mac.update(data);
        mac.verify_slice(signature)
            .map_err(|_| CryptoError::SignatureMismatch)
    }

    /// AES-CBC over whole blocks. `plain` must already be padded.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.check_aligned(plain.len())?;
        let mut buf = plain.to_vec();
        let len = buf.len();
        match self.encrypting_key.len() {
            16 => cbc::Encryptor::<Aes128>::new_from_slices(&self.encrypting_key, &self.iv)
                .map_err(|_| self.key_error())?
                .encrypt_padded_mut::<NoPadding>(&mut buf, len)
                .map(|_| ())
                .map_err(|_| CryptoError::NotBlockAligned(len))?,
            _ => cbc::Encryptor::<Aes256>::new_from_slices(&self.encrypting_key, &self.iv)
                .map_err(|_| self.key_error())?
                .encrypt_padded_mut::<NoPadding>(&mut buf, len)
                .map(|_| ())
                .map_err(|_| CryptoError::NotBlockAligned(len))?,
        }
        Ok(buf)
    }

    pub fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.check_aligned(cipher.len())?;
        let mut buf = cipher.to_vec();
        let len = buf.len();
        match self.encrypting_key.len() {
            16 => cbc::Decryptor::<Aes128>::new_from_slices(&self.encrypting_key, &self.iv)
                .map_err(|_| self.key_error())?
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map(|_| ())
                .map_err(|_| CryptoError::NotBlockAligned(len))?,
            _ => cbc::Decryptor::<Aes256>::new_from_slices(&self.encrypting_key, &self.iv)
                .map_err(|_| self.key_error())?
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map(|_| ())
                .map_err(|_| CryptoError::NotBlockAligned(len))?,
        }
        Ok(buf)
    }

    fn check_aligned(&self, len: usize) -> Result<(), CryptoError> {
        if len % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::NotBlockAligned(len));
        }
        Ok(())
    }

    fn key_error(&self) -> CryptoError {
        CryptoError::InvalidKeyLength {
            expected: self.suite.encrypting_key_length,
            got: self.encrypting_key.len(),
        }
    }
}

/// Both directions of a channel's keys for one token.
///
/// `local` secures what we send, `remote` verifies what we receive. The
/// client's `local` equals the server's `remote` and vice versa.
#[derive(Debug)]
pub struct ChannelKeys {
    pub local: DerivedKeys,
    pub remote: DerivedKeys,
}

impl ChannelKeys {
    pub fn derive(
        policy: SecurityPolicy,
        local_nonce: &[u8],
        remote_nonce: &[u8],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            local: policy.derive_keys(remote_nonce, local_nonce)?,
            remote: policy.derive_keys(local_nonce, remote_nonce)?,
        })
    }
}

// ── Asymmetric operations ─────────────────────────────────────────────────────

/// RSA operations used for OPN chunks, supplied by the caller.
///
/// The sending side uses `sign` with its own private key and `encrypt` with
/// the receiver's public key; encryption may grow each plain block
/// (`cipher_block_size > plain_block_size`). The receiving side uses
/// `decrypt` with its private key and `verify` with the certificate carried
/// in the asymmetric security header.
pub trait AsymmetricCrypto: Send + Sync {
    /// Size in bytes of signatures made with our private key.
    fn signature_length(&self) -> usize;

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Plaintext bytes consumed per encryption block for the remote key.
    fn plain_block_size(&self) -> usize;

    /// Ciphertext bytes produced per encryption block for the remote key.
    fn cipher_block_size(&self) -> usize;

    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Plain block size of our own key pair, which decides whether received
    /// padding carries the extra size byte.
    fn local_plain_block_size(&self) -> usize {
        self.plain_block_size()
    }

    /// Public key size in bytes of the key inside `certificate`.
    fn certificate_key_length(&self, certificate: &[u8]) -> Result<usize, CryptoError>;

    fn verify(&self, certificate: &[u8], data: &[u8], signature: &[u8])
        -> Result<(), CryptoError>;
}

/// RSA modulus sizes an OPN signature may have.
pub const RSA_SIGNATURE_LENGTHS: [usize; 4] = [128, 256, 384, 512];

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("unknown security policy URI: {0}")]
    UnknownPolicy(String),

    #[error("security policy {0} is deprecated and not supported")]
    DeprecatedPolicy(String),

    #[error("security policy None has no symmetric algorithms")]
    NoSymmetricSuite,

    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("{0} bytes is not a whole number of cipher blocks")]
    NotBlockAligned(usize),

    #[error("signature does not match")]
    SignatureMismatch,

    #[error("no private key available to decrypt")]
    MissingPrivateKey,

    #[error("unsupported RSA signature length {0}")]
    UnsupportedSignatureLength(usize),

    #[error("{operation} produced {got} bytes, expected {expected}")]
    UnexpectedOutputLength {
        operation: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{0} is not configured for this chunk layout")]
    NotConfigured(&'static str),

    #[error("asymmetric operation failed: {0}")]
    Asymmetric(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
