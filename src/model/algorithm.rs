//! Portable algorithm descriptors
//!
//! An [`AlgorithmDescriptor`] is what callers hand to the subtle API: a
//! WebCrypto algorithm name plus a dictionary of parameters. It carries no
//! token vocabulary; the mechanism mapper turns it into a
//! [`Mechanism`](crate::model::Mechanism).

use std::fmt;

use thiserror::Error;

use crate::model::{CryptoKey, MechanismType};

/// DER encoding of the Ed25519 curve OID (1.3.101.112) used as `CKA_EC_PARAMS`
pub const ED25519_EC_PARAMS: &[u8] = &[0x06, 0x03, 0x2B, 0x65, 0x70];

/// Algorithm families understood without a vendor definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmName {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    AesGcm,
    AesCbc,
    Hmac,
    RsaOaep,
    RsaPss,
    RsassaPkcs1v15,
    Ecdsa,
    Ecdh,
    Ed25519,
    Hkdf,
    Pbkdf2,
}

impl AlgorithmName {
    pub const ALL: [AlgorithmName; 15] = [
        AlgorithmName::Sha1,
        AlgorithmName::Sha256,
        AlgorithmName::Sha384,
        AlgorithmName::Sha512,
        AlgorithmName::AesGcm,
        AlgorithmName::AesCbc,
        AlgorithmName::Hmac,
        AlgorithmName::RsaOaep,
        AlgorithmName::RsaPss,
        AlgorithmName::RsassaPkcs1v15,
        AlgorithmName::Ecdsa,
        AlgorithmName::Ecdh,
        AlgorithmName::Ed25519,
        AlgorithmName::Hkdf,
        AlgorithmName::Pbkdf2,
    ];

    /// Canonical WebCrypto spelling
    pub fn as_str(self) -> &'static str {
        match self {
            AlgorithmName::Sha1 => "SHA-1",
            AlgorithmName::Sha256 => "SHA-256",
            AlgorithmName::Sha384 => "SHA-384",
            AlgorithmName::Sha512 => "SHA-512",
            AlgorithmName::AesGcm => "AES-GCM",
            AlgorithmName::AesCbc => "AES-CBC",
            AlgorithmName::Hmac => "HMAC",
            AlgorithmName::RsaOaep => "RSA-OAEP",
            AlgorithmName::RsaPss => "RSA-PSS",
            AlgorithmName::RsassaPkcs1v15 => "RSASSA-PKCS1-v1_5",
            AlgorithmName::Ecdsa => "ECDSA",
            AlgorithmName::Ecdh => "ECDH",
            AlgorithmName::Ed25519 => "Ed25519",
            AlgorithmName::Hkdf => "HKDF",
            AlgorithmName::Pbkdf2 => "PBKDF2",
        }
    }

    /// Case-insensitive lookup
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(name.trim()))
    }

    pub fn as_hash(self) -> Option<HashAlgorithm> {
        match self {
            AlgorithmName::Sha1 => Some(HashAlgorithm::Sha1),
            AlgorithmName::Sha256 => Some(HashAlgorithm::Sha256),
            AlgorithmName::Sha384 => Some(HashAlgorithm::Sha384),
            AlgorithmName::Sha512 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for AlgorithmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_name(name: &str) -> Result<Self, AlgorithmError> {
        AlgorithmName::parse(name)
            .and_then(AlgorithmName::as_hash)
            .ok_or_else(|| AlgorithmError::UnsupportedHash {
                hash: name.to_string(),
            })
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha384 => "SHA-384",
            HashAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// Digest output size in bytes
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Block size in bits; the default HMAC key length
    pub fn block_bits(self) -> u32 {
        match self {
            HashAlgorithm::Sha1 | HashAlgorithm::Sha256 => 512,
            HashAlgorithm::Sha384 | HashAlgorithm::Sha512 => 1024,
        }
    }

    pub fn digest_mechanism(self) -> MechanismType {
        match self {
            HashAlgorithm::Sha1 => MechanismType::SHA_1,
            HashAlgorithm::Sha256 => MechanismType::SHA256,
            HashAlgorithm::Sha384 => MechanismType::SHA384,
            HashAlgorithm::Sha512 => MechanismType::SHA512,
        }
    }

    pub fn from_digest_mechanism(mechanism: MechanismType) -> Option<Self> {
        match mechanism {
            MechanismType::SHA_1 => Some(HashAlgorithm::Sha1),
            MechanismType::SHA256 => Some(HashAlgorithm::Sha256),
            MechanismType::SHA384 => Some(HashAlgorithm::Sha384),
            MechanismType::SHA512 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Elliptic curves usable with ECDSA and ECDH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedCurve {
    P256,
    P384,
}

impl NamedCurve {
    const P256_PARAMS: &'static [u8] = &[0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];
    const P384_PARAMS: &'static [u8] = &[0x06, 0x05, 0x2B, 0x81, 0x04, 0x00, 0x22];

    pub fn from_name(name: &str) -> Result<Self, AlgorithmError> {
        match name.trim().to_ascii_uppercase().as_str() {
            "P-256" => Ok(NamedCurve::P256),
            "P-384" => Ok(NamedCurve::P384),
            _ => Err(AlgorithmError::UnsupportedCurve {
                curve: name.to_string(),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NamedCurve::P256 => "P-256",
            NamedCurve::P384 => "P-384",
        }
    }

    /// DER-encoded curve OID, as stored in `CKA_EC_PARAMS`
    pub fn ec_params(self) -> &'static [u8] {
        match self {
            NamedCurve::P256 => Self::P256_PARAMS,
            NamedCurve::P384 => Self::P384_PARAMS,
        }
    }

    pub fn from_ec_params(params: &[u8]) -> Option<Self> {
        if params == Self::P256_PARAMS {
            Some(NamedCurve::P256)
        } else if params == Self::P384_PARAMS {
            Some(NamedCurve::P384)
        } else {
            None
        }
    }

    /// Size of a field element in bytes
    pub fn field_len(self) -> usize {
        match self {
            NamedCurve::P256 => 32,
            NamedCurve::P384 => 48,
        }
    }
}

impl fmt::Display for NamedCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameter dictionary of an algorithm descriptor
///
/// Mirrors the WebCrypto algorithm dictionaries: each algorithm reads only
/// the members it needs and ignores the rest.
#[derive(Debug, Clone, Default)]
pub struct AlgorithmParams {
    pub hash: Option<String>,
    pub named_curve: Option<String>,
    /// Key length in bits (AES, HMAC) or derived length
    pub length: Option<u32>,
    pub iv: Option<Vec<u8>>,
    pub additional_data: Option<Vec<u8>>,
    pub tag_length: Option<u32>,
    pub label: Option<Vec<u8>>,
    /// MGF1 hash for RSA-OAEP; defaults to the key hash
    pub mgf_hash: Option<String>,
    pub salt_length: Option<u32>,
    pub salt: Option<Vec<u8>>,
    pub info: Option<Vec<u8>>,
    pub iterations: Option<u32>,
    pub modulus_length: Option<u32>,
    pub public_exponent: Option<Vec<u8>>,
    /// Peer public key for ECDH
    pub public: Option<CryptoKey>,
    /// Opaque parameter block for vendor mechanisms
    pub vendor: Option<Vec<u8>>,
}

/// Caller-supplied algorithm: name plus parameters
#[derive(Debug, Clone)]
pub struct AlgorithmDescriptor {
    pub name: String,
    pub params: AlgorithmParams,
}

impl AlgorithmDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: AlgorithmParams::default(),
        }
    }

    /// Built-in algorithm family for this name, if any
    pub fn known_name(&self) -> Option<AlgorithmName> {
        AlgorithmName::parse(&self.name)
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.params.hash = Some(hash.into());
        self
    }

    pub fn with_named_curve(mut self, curve: impl Into<String>) -> Self {
        self.params.named_curve = Some(curve.into());
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.params.length = Some(length);
        self
    }

    pub fn with_iv(mut self, iv: impl Into<Vec<u8>>) -> Self {
        self.params.iv = Some(iv.into());
        self
    }

    pub fn with_additional_data(mut self, aad: impl Into<Vec<u8>>) -> Self {
        self.params.additional_data = Some(aad.into());
        self
    }

    pub fn with_tag_length(mut self, bits: u32) -> Self {
        self.params.tag_length = Some(bits);
        self
    }

    pub fn with_label(mut self, label: impl Into<Vec<u8>>) -> Self {
        self.params.label = Some(label.into());
        self
    }

    pub fn with_mgf_hash(mut self, hash: impl Into<String>) -> Self {
        self.params.mgf_hash = Some(hash.into());
        self
    }

    pub fn with_salt_length(mut self, salt_length: u32) -> Self {
        self.params.salt_length = Some(salt_length);
        self
    }

    pub fn with_salt(mut self, salt: impl Into<Vec<u8>>) -> Self {
        self.params.salt = Some(salt.into());
        self
    }

    pub fn with_info(mut self, info: impl Into<Vec<u8>>) -> Self {
        self.params.info = Some(info.into());
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.params.iterations = Some(iterations);
        self
    }

    pub fn with_modulus_length(mut self, bits: u32) -> Self {
        self.params.modulus_length = Some(bits);
        self
    }

    pub fn with_public_exponent(mut self, exponent: impl Into<Vec<u8>>) -> Self {
        self.params.public_exponent = Some(exponent.into());
        self
    }

    pub fn with_public(mut self, public: CryptoKey) -> Self {
        self.params.public = Some(public);
        self
    }

    pub fn with_vendor_params(mut self, params: impl Into<Vec<u8>>) -> Self {
        self.params.vendor = Some(params.into());
        self
    }
}

impl From<&str> for AlgorithmDescriptor {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Errors that can occur when interpreting algorithm names
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlgorithmError {
    #[error("Algorithm not supported: {algorithm}")]
    Unsupported { algorithm: String },

    #[error("Hash algorithm not supported: {hash}")]
    UnsupportedHash { hash: String },

    #[error("Named curve not supported: {curve}")]
    UnsupportedCurve { curve: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_name_case_insensitive() {
        assert_eq!(AlgorithmName::parse("aes-gcm"), Some(AlgorithmName::AesGcm));
        assert_eq!(AlgorithmName::parse("ED25519"), Some(AlgorithmName::Ed25519));
        assert_eq!(
            AlgorithmName::parse("rsassa-pkcs1-V1_5"),
            Some(AlgorithmName::RsassaPkcs1v15)
        );
        assert_eq!(AlgorithmName::parse("ROT13"), None);
    }

    #[test]
    fn test_hash_from_name() {
        assert_eq!(HashAlgorithm::from_name("sha-384").unwrap(), HashAlgorithm::Sha384);
        assert!(matches!(
            HashAlgorithm::from_name("AES-GCM").unwrap_err(),
            AlgorithmError::UnsupportedHash { .. }
        ));
    }

    #[test]
    fn test_hash_mechanism_round_trip() {
        for hash in [
            HashAlgorithm::Sha1,
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha384,
            HashAlgorithm::Sha512,
        ] {
            assert_eq!(
                HashAlgorithm::from_digest_mechanism(hash.digest_mechanism()),
                Some(hash)
            );
        }
    }

    #[test]
    fn test_curve_params_round_trip() {
        for curve in [NamedCurve::P256, NamedCurve::P384] {
            assert_eq!(NamedCurve::from_ec_params(curve.ec_params()), Some(curve));
            assert_eq!(NamedCurve::from_name(curve.name()).unwrap(), curve);
        }
        assert_eq!(NamedCurve::from_ec_params(ED25519_EC_PARAMS), None);
        assert!(NamedCurve::from_name("P-521").is_err());
    }

    #[test]
    fn test_descriptor_builder() {
        let alg = AlgorithmDescriptor::new("AES-GCM")
            .with_iv(vec![0u8; 12])
            .with_tag_length(96);
        assert_eq!(alg.known_name(), Some(AlgorithmName::AesGcm));
        assert_eq!(alg.params.iv.as_deref(), Some(&[0u8; 12][..]));
        assert_eq!(alg.params.tag_length, Some(96));
        assert!(alg.params.hash.is_none());
    }

    #[test]
    fn test_algorithm_error_display() {
        let err = AlgorithmError::Unsupported {
            algorithm: "Unknown".to_string(),
        };
        assert!(err.to_string().contains("not supported"));
    }
}
