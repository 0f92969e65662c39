//! Algorithm descriptor to token mechanism translation
//!
//! Everything here is pure: it looks at the descriptor, the key metadata and
//! the registry, never at the session.

use std::fmt;

use crate::error::{CryptoError, P11Result};
use crate::logic::encoding::MaterialShape;
use crate::logic::registry::MechanismRegistry;
use crate::logic::templates::bit_length;
use crate::model::{
    AesMode, AlgorithmDescriptor, AlgorithmName, AsymmetricKeyAlgorithm, CryptoKey, EcScheme,
    HashAlgorithm, KdfName, KeyClass, KeyKind, KeyUsage, Mechanism, MechanismParams,
    MechanismType, MgfType, NamedCurve, RsaScheme, SecretKeyAlgorithm,
};

const GCM_TAG_LENGTHS: [u32; 7] = [32, 64, 96, 104, 112, 120, 128];
const DEFAULT_GCM_TAG_LENGTH: u32 = 128;
const AES_CBC_IV_LEN: usize = 16;
const MIN_RSA_MODULUS_BITS: u32 = 1024;
const DEFAULT_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// What a mechanism is resolved for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Digest,
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    GenerateKey,
    Derive,
    Wrap,
    Unwrap,
}

impl Purpose {
    /// Usage the key must carry for this purpose
    pub fn required_usage(self) -> Option<KeyUsage> {
        match self {
            Purpose::Encrypt => Some(KeyUsage::Encrypt),
            Purpose::Decrypt => Some(KeyUsage::Decrypt),
            Purpose::Sign => Some(KeyUsage::Sign),
            Purpose::Verify => Some(KeyUsage::Verify),
            Purpose::Wrap => Some(KeyUsage::WrapKey),
            Purpose::Unwrap => Some(KeyUsage::UnwrapKey),
            Purpose::Digest | Purpose::GenerateKey | Purpose::Derive => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Purpose::Digest => "digest",
            Purpose::Encrypt => "encrypt",
            Purpose::Decrypt => "decrypt",
            Purpose::Sign => "sign",
            Purpose::Verify => "verify",
            Purpose::GenerateKey => "generateKey",
            Purpose::Derive => "derive",
            Purpose::Wrap => "wrapKey",
            Purpose::Unwrap => "unwrapKey",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn unsupported(algorithm: impl Into<String>) -> CryptoError {
    CryptoError::UnsupportedAlgorithm {
        algorithm: algorithm.into(),
    }
}

fn parameter(reason: impl Into<String>) -> CryptoError {
    CryptoError::MechanismParameter {
        reason: reason.into(),
    }
}

fn import_mismatch(format: &str, reason: impl Into<String>) -> CryptoError {
    CryptoError::ImportFormat {
        format: format.to_string(),
        reason: reason.into(),
    }
}

/// Translates algorithm descriptors into mechanisms
#[derive(Debug, Clone, Default)]
pub struct MechanismMapper {
    registry: MechanismRegistry,
}

impl MechanismMapper {
    pub fn new(registry: MechanismRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &MechanismRegistry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut MechanismRegistry {
        &mut self.registry
    }

    /// Resolve the mechanism for `purpose`
    ///
    /// `key` is the key the operation runs with; it decides the hash of
    /// HMAC and RSA mechanisms and the curve of ECDSA.
    ///
    /// # Errors
    ///
    /// - `UnsupportedAlgorithm` for unknown names or names that do not
    ///   support `purpose`
    /// - `KeyAlgorithmMismatch` when `key` belongs to another algorithm
    /// - `MechanismParameter` for missing or malformed parameters
    pub fn resolve(
        &self,
        purpose: Purpose,
        algorithm: &AlgorithmDescriptor,
        key: Option<&CryptoKey>,
    ) -> P11Result<Mechanism> {
        let Some(name) = algorithm.known_name() else {
            return self.resolve_vendor(algorithm);
        };

        match (name, purpose) {
            (_, Purpose::GenerateKey) => self.resolve_generation(name),
            (AlgorithmName::Sha1, Purpose::Digest)
            | (AlgorithmName::Sha256, Purpose::Digest)
            | (AlgorithmName::Sha384, Purpose::Digest)
            | (AlgorithmName::Sha512, Purpose::Digest) => {
                let hash = name.as_hash().ok_or_else(|| unsupported(name.as_str()))?;
                Ok(Mechanism::new(hash.digest_mechanism()))
            }
            (
                AlgorithmName::AesGcm,
                Purpose::Encrypt | Purpose::Decrypt | Purpose::Wrap | Purpose::Unwrap,
            ) => {
                expect_key(key, name)?;
                gcm_mechanism(algorithm)
            }
            (
                AlgorithmName::AesCbc,
                Purpose::Encrypt | Purpose::Decrypt | Purpose::Wrap | Purpose::Unwrap,
            ) => {
                expect_key(key, name)?;
                let iv = algorithm
                    .params
                    .iv
                    .as_ref()
                    .ok_or_else(|| parameter("AES-CBC requires an iv"))?;
                if iv.len() != AES_CBC_IV_LEN {
                    return Err(parameter(format!(
                        "AES-CBC iv must be {} bytes, got {}",
                        AES_CBC_IV_LEN,
                        iv.len()
                    ))
                    .into());
                }
                Ok(Mechanism::with_params(
                    MechanismType::AES_CBC_PAD,
                    MechanismParams::Iv(iv.clone()),
                ))
            }
            (
                AlgorithmName::RsaOaep,
                Purpose::Encrypt | Purpose::Decrypt | Purpose::Wrap | Purpose::Unwrap,
            ) => {
                let key = expect_key(key, name)?;
                let hash = key_hash(key)?;
                let mgf_hash = match &algorithm.params.mgf_hash {
                    Some(mgf_hash) => HashAlgorithm::from_name(mgf_hash)?,
                    None => hash,
                };
                Ok(Mechanism::with_params(
                    MechanismType::RSA_PKCS_OAEP,
                    MechanismParams::Oaep {
                        hash: hash.digest_mechanism(),
                        mgf: MgfType::for_hash(mgf_hash),
                        label: algorithm.params.label.clone().unwrap_or_default(),
                    },
                ))
            }
            (AlgorithmName::RsaPss, Purpose::Sign | Purpose::Verify) => {
                let key = expect_key(key, name)?;
                let hash = key_hash(key)?;
                let salt_length = algorithm
                    .params
                    .salt_length
                    .ok_or_else(|| parameter("RSA-PSS requires a salt length"))?;
                let mechanism_type = match hash {
                    HashAlgorithm::Sha1 => MechanismType::SHA1_RSA_PKCS_PSS,
                    HashAlgorithm::Sha256 => MechanismType::SHA256_RSA_PKCS_PSS,
                    HashAlgorithm::Sha384 => MechanismType::SHA384_RSA_PKCS_PSS,
                    HashAlgorithm::Sha512 => MechanismType::SHA512_RSA_PKCS_PSS,
                };
                Ok(Mechanism::with_params(
                    mechanism_type,
                    MechanismParams::Pss {
                        hash: hash.digest_mechanism(),
                        mgf: MgfType::for_hash(hash),
                        salt_length,
                    },
                ))
            }
            (AlgorithmName::RsassaPkcs1v15, Purpose::Sign | Purpose::Verify) => {
                let key = expect_key(key, name)?;
                Ok(Mechanism::new(match key_hash(key)? {
                    HashAlgorithm::Sha1 => MechanismType::SHA1_RSA_PKCS,
                    HashAlgorithm::Sha256 => MechanismType::SHA256_RSA_PKCS,
                    HashAlgorithm::Sha384 => MechanismType::SHA384_RSA_PKCS,
                    HashAlgorithm::Sha512 => MechanismType::SHA512_RSA_PKCS,
                }))
            }
            (AlgorithmName::Ecdsa, Purpose::Sign | Purpose::Verify) => {
                let key = expect_key(key, name)?;
                let curve = key
                    .kind()
                    .curve()
                    .ok_or_else(|| parameter("ECDSA requires a key with a named curve"))?;
                let hash = required_hash(algorithm)?;
                let mechanism_type = match hash {
                    HashAlgorithm::Sha1 => MechanismType::ECDSA_SHA1,
                    HashAlgorithm::Sha256 => MechanismType::ECDSA_SHA256,
                    HashAlgorithm::Sha384 => MechanismType::ECDSA_SHA384,
                    HashAlgorithm::Sha512 => MechanismType::ECDSA_SHA512,
                };
                Ok(Mechanism::with_params(
                    mechanism_type,
                    MechanismParams::Ecdsa { curve },
                ))
            }
            (AlgorithmName::Ed25519, Purpose::Sign | Purpose::Verify) => {
                expect_key(key, name)?;
                Ok(Mechanism::new(MechanismType::EDDSA))
            }
            (AlgorithmName::Hmac, Purpose::Sign | Purpose::Verify) => {
                let key = expect_key(key, name)?;
                Ok(Mechanism::new(match key_hash(key)? {
                    HashAlgorithm::Sha1 => MechanismType::SHA_1_HMAC,
                    HashAlgorithm::Sha256 => MechanismType::SHA256_HMAC,
                    HashAlgorithm::Sha384 => MechanismType::SHA384_HMAC,
                    HashAlgorithm::Sha512 => MechanismType::SHA512_HMAC,
                }))
            }
            (AlgorithmName::Ecdh, Purpose::Derive) => {
                let key = expect_key(key, name)?;
                let curve = key
                    .kind()
                    .curve()
                    .ok_or_else(|| parameter("ECDH requires a key with a named curve"))?;
                let peer = algorithm
                    .params
                    .public
                    .as_ref()
                    .ok_or_else(|| parameter("ECDH requires the peer public key"))?;
                if peer.class() != KeyClass::Public || peer.algorithm_name() != AlgorithmName::Ecdh
                {
                    return Err(CryptoError::KeyAlgorithmMismatch {
                        key: format!("{} {}", peer.class().as_str(), peer.algorithm_name()),
                        algorithm: "ECDH public key".to_string(),
                    }
                    .into());
                }
                if peer.kind().curve() != Some(curve) {
                    return Err(parameter(format!(
                        "peer public key is not on curve {}",
                        curve
                    ))
                    .into());
                }
                let public_data = peer
                    .public_point()
                    .ok_or_else(|| parameter("peer public key carries no EC point"))?;
                Ok(Mechanism::with_params(
                    MechanismType::ECDH1_DERIVE,
                    MechanismParams::Ecdh {
                        public_data: public_data.to_vec(),
                    },
                ))
            }
            (AlgorithmName::Hkdf, Purpose::Derive) => {
                expect_key(key, name)?;
                let hash = required_hash(algorithm)?;
                Ok(Mechanism::with_params(
                    MechanismType::HKDF_DERIVE,
                    MechanismParams::Hkdf {
                        prf: hash.digest_mechanism(),
                        salt: algorithm.params.salt.clone().unwrap_or_default(),
                        info: algorithm.params.info.clone().unwrap_or_default(),
                    },
                ))
            }
            (AlgorithmName::Pbkdf2, Purpose::Derive) => {
                expect_key(key, name)?;
                let hash = required_hash(algorithm)?;
                let salt = algorithm
                    .params
                    .salt
                    .clone()
                    .ok_or_else(|| parameter("PBKDF2 requires a salt"))?;
                let iterations = match algorithm.params.iterations {
                    Some(iterations) if iterations > 0 => iterations,
                    _ => return Err(parameter("PBKDF2 requires a positive iteration count").into()),
                };
                Ok(Mechanism::with_params(
                    MechanismType::PKCS5_PBKD2,
                    MechanismParams::Pbkdf2 {
                        prf: hash.digest_mechanism(),
                        salt,
                        iterations,
                    },
                ))
            }
            (name, purpose) => Err(unsupported(format!("{} for {}", name, purpose)).into()),
        }
    }

    fn resolve_vendor(&self, algorithm: &AlgorithmDescriptor) -> P11Result<Mechanism> {
        let mechanism_type = self
            .registry
            .get(&algorithm.name)
            .ok_or_else(|| unsupported(algorithm.name.as_str()))?;
        let params = match &algorithm.params.vendor {
            Some(bytes) => MechanismParams::Vendor(bytes.clone()),
            None => MechanismParams::None,
        };
        Ok(Mechanism::with_params(mechanism_type, params))
    }

    fn resolve_generation(&self, name: AlgorithmName) -> P11Result<Mechanism> {
        let mechanism_type = match name {
            AlgorithmName::AesGcm | AlgorithmName::AesCbc => MechanismType::AES_KEY_GEN,
            AlgorithmName::Hmac => MechanismType::GENERIC_SECRET_KEY_GEN,
            AlgorithmName::RsaOaep | AlgorithmName::RsaPss | AlgorithmName::RsassaPkcs1v15 => {
                MechanismType::RSA_PKCS_KEY_PAIR_GEN
            }
            AlgorithmName::Ecdsa | AlgorithmName::Ecdh => MechanismType::EC_KEY_PAIR_GEN,
            AlgorithmName::Ed25519 => MechanismType::EC_EDWARDS_KEY_PAIR_GEN,
            other => {
                return Err(unsupported(format!("{} for {}", other, Purpose::GenerateKey)).into())
            }
        };
        Ok(Mechanism::new(mechanism_type))
    }

    /// Validated metadata of a secret key to generate or derive
    pub fn secret_algorithm(&self, algorithm: &AlgorithmDescriptor) -> P11Result<SecretKeyAlgorithm> {
        let name = algorithm
            .known_name()
            .ok_or_else(|| unsupported(algorithm.name.as_str()))?;
        match name {
            AlgorithmName::AesGcm | AlgorithmName::AesCbc => {
                let length = algorithm
                    .params
                    .length
                    .ok_or_else(|| parameter("AES keys require a length"))?;
                if !matches!(length, 128 | 192 | 256) {
                    return Err(parameter(format!("AES key length {} is not 128, 192 or 256", length)).into());
                }
                Ok(SecretKeyAlgorithm::Aes {
                    mode: aes_mode(name),
                    length,
                })
            }
            AlgorithmName::Hmac => {
                let hash = required_hash(algorithm)?;
                let length = algorithm.params.length.unwrap_or_else(|| hash.block_bits());
                if length == 0 || length % 8 != 0 {
                    return Err(parameter(format!(
                        "HMAC key length {} is not a positive multiple of 8",
                        length
                    ))
                    .into());
                }
                Ok(SecretKeyAlgorithm::Hmac { hash, length })
            }
            AlgorithmName::Hkdf => Ok(SecretKeyAlgorithm::Kdf(KdfName::Hkdf)),
            AlgorithmName::Pbkdf2 => Ok(SecretKeyAlgorithm::Kdf(KdfName::Pbkdf2)),
            other => Err(unsupported(format!("{} secret key", other)).into()),
        }
    }

    /// Validated metadata of a key pair to generate
    pub fn asymmetric_algorithm(
        &self,
        algorithm: &AlgorithmDescriptor,
    ) -> P11Result<AsymmetricKeyAlgorithm> {
        let name = algorithm
            .known_name()
            .ok_or_else(|| unsupported(algorithm.name.as_str()))?;
        match name {
            AlgorithmName::RsaOaep | AlgorithmName::RsaPss | AlgorithmName::RsassaPkcs1v15 => {
                let modulus_length = algorithm
                    .params
                    .modulus_length
                    .ok_or_else(|| parameter("RSA keys require a modulus length"))?;
                if modulus_length < MIN_RSA_MODULUS_BITS || modulus_length % 8 != 0 {
                    return Err(parameter(format!(
                        "RSA modulus length {} must be at least {} and a multiple of 8",
                        modulus_length, MIN_RSA_MODULUS_BITS
                    ))
                    .into());
                }
                let public_exponent = match &algorithm.params.public_exponent {
                    Some(exponent) if exponent.iter().any(|byte| *byte != 0) => exponent.clone(),
                    Some(_) => return Err(parameter("RSA public exponent is zero").into()),
                    None => DEFAULT_PUBLIC_EXPONENT.to_vec(),
                };
                Ok(AsymmetricKeyAlgorithm::Rsa {
                    scheme: rsa_scheme(name),
                    modulus_length,
                    public_exponent,
                    hash: required_hash(algorithm)?,
                })
            }
            AlgorithmName::Ecdsa | AlgorithmName::Ecdh => Ok(AsymmetricKeyAlgorithm::Ec {
                scheme: ec_scheme(name),
                curve: required_curve(algorithm)?,
            }),
            AlgorithmName::Ed25519 => Ok(AsymmetricKeyAlgorithm::Ed25519),
            other => Err(unsupported(format!("{} key pair", other)).into()),
        }
    }

    /// Metadata for imported material, checked against the descriptor
    pub fn imported_kind(
        &self,
        algorithm: &AlgorithmDescriptor,
        class: KeyClass,
        shape: &MaterialShape,
        format: &str,
    ) -> P11Result<KeyKind> {
        let name = algorithm
            .known_name()
            .ok_or_else(|| unsupported(algorithm.name.as_str()))?;

        if class == KeyClass::Secret {
            let MaterialShape::Secret { len } = shape else {
                return Err(import_mismatch(format, "expected secret key material").into());
            };
            let bits = bit_length(*len as u64).ok_or_else(|| {
                import_mismatch(format, format!("secret of {} bytes", len))
            })?;
            let secret = match name {
                AlgorithmName::AesGcm | AlgorithmName::AesCbc => {
                    if !matches!(bits, 128 | 192 | 256) {
                        return Err(import_mismatch(
                            format,
                            format!("AES key of {} bits", bits),
                        )
                        .into());
                    }
                    if algorithm.params.length.is_some_and(|length| length != bits) {
                        return Err(import_mismatch(format, "AES key length does not match").into());
                    }
                    SecretKeyAlgorithm::Aes {
                        mode: aes_mode(name),
                        length: bits,
                    }
                }
                AlgorithmName::Hmac => {
                    if bits == 0 {
                        return Err(import_mismatch(format, "empty HMAC key").into());
                    }
                    if algorithm.params.length.is_some_and(|length| length != bits) {
                        return Err(import_mismatch(format, "HMAC key length does not match").into());
                    }
                    SecretKeyAlgorithm::Hmac {
                        hash: required_hash(algorithm)?,
                        length: bits,
                    }
                }
                AlgorithmName::Hkdf => SecretKeyAlgorithm::Kdf(KdfName::Hkdf),
                AlgorithmName::Pbkdf2 => SecretKeyAlgorithm::Kdf(KdfName::Pbkdf2),
                other => {
                    return Err(import_mismatch(format, format!("{} keys are not secret keys", other)).into())
                }
            };
            return Ok(KeyKind::Secret(secret));
        }

        let asymmetric = match (name, shape) {
            (
                AlgorithmName::RsaOaep | AlgorithmName::RsaPss | AlgorithmName::RsassaPkcs1v15,
                MaterialShape::Rsa {
                    modulus_bits,
                    public_exponent,
                },
            ) => AsymmetricKeyAlgorithm::Rsa {
                scheme: rsa_scheme(name),
                modulus_length: *modulus_bits,
                public_exponent: public_exponent.clone(),
                hash: required_hash(algorithm)?,
            },
            (AlgorithmName::Ecdsa | AlgorithmName::Ecdh, MaterialShape::Ec { curve }) => {
                if let Some(requested) = &algorithm.params.named_curve {
                    if NamedCurve::from_name(requested)? != *curve {
                        return Err(import_mismatch(
                            format,
                            format!("key is on {}, not {}", curve, requested),
                        )
                        .into());
                    }
                }
                AsymmetricKeyAlgorithm::Ec {
                    scheme: ec_scheme(name),
                    curve: *curve,
                }
            }
            (AlgorithmName::Ed25519, MaterialShape::Ed25519) => AsymmetricKeyAlgorithm::Ed25519,
            (
                AlgorithmName::RsaOaep
                | AlgorithmName::RsaPss
                | AlgorithmName::RsassaPkcs1v15
                | AlgorithmName::Ecdsa
                | AlgorithmName::Ecdh
                | AlgorithmName::Ed25519,
                _,
            ) => {
                return Err(import_mismatch(
                    format,
                    format!("key material does not belong to {}", name),
                )
                .into())
            }
            (other, _) => {
                return Err(import_mismatch(format, format!("{} keys are not asymmetric", other)).into())
            }
        };
        Ok(match class {
            KeyClass::Public => KeyKind::Public(asymmetric),
            _ => KeyKind::Private(asymmetric),
        })
    }

    /// Metadata for a key unwrapped inside the token
    ///
    /// The material is never seen before the token creates the object, so
    /// sizes are left at zero and read back from the new object afterwards.
    /// Only the name, class and hash end up in the unwrap template.
    pub fn unwrap_kind(&self, algorithm: &AlgorithmDescriptor, class: KeyClass) -> P11Result<KeyKind> {
        let name = algorithm
            .known_name()
            .ok_or_else(|| unsupported(algorithm.name.as_str()))?;
        let format = match class {
            KeyClass::Secret => "raw",
            _ => "pkcs8",
        };
        let kind = match (class, name) {
            (KeyClass::Secret, AlgorithmName::AesGcm | AlgorithmName::AesCbc) => {
                KeyKind::Secret(SecretKeyAlgorithm::Aes {
                    mode: aes_mode(name),
                    length: 0,
                })
            }
            (KeyClass::Secret, AlgorithmName::Hmac) => KeyKind::Secret(SecretKeyAlgorithm::Hmac {
                hash: required_hash(algorithm)?,
                length: 0,
            }),
            (KeyClass::Secret, AlgorithmName::Hkdf) => KeyKind::Secret(SecretKeyAlgorithm::Kdf(KdfName::Hkdf)),
            (KeyClass::Secret, AlgorithmName::Pbkdf2) => {
                KeyKind::Secret(SecretKeyAlgorithm::Kdf(KdfName::Pbkdf2))
            }
            (
                KeyClass::Private,
                AlgorithmName::RsaOaep | AlgorithmName::RsaPss | AlgorithmName::RsassaPkcs1v15,
            ) => KeyKind::Private(AsymmetricKeyAlgorithm::Rsa {
                scheme: rsa_scheme(name),
                modulus_length: 0,
                public_exponent: Vec::new(),
                hash: required_hash(algorithm)?,
            }),
            (KeyClass::Private, AlgorithmName::Ecdsa | AlgorithmName::Ecdh) => {
                let curve = match &algorithm.params.named_curve {
                    Some(curve) => NamedCurve::from_name(curve)?,
                    None => NamedCurve::P256,
                };
                KeyKind::Private(AsymmetricKeyAlgorithm::Ec {
                    scheme: ec_scheme(name),
                    curve,
                })
            }
            (KeyClass::Private, AlgorithmName::Ed25519) => {
                KeyKind::Private(AsymmetricKeyAlgorithm::Ed25519)
            }
            (_, other) => {
                return Err(import_mismatch(
                    format,
                    format!("{} keys cannot be unwrapped as {}", other, class.as_str()),
                )
                .into())
            }
        };
        Ok(kind)
    }

    /// Curve requested by an EC descriptor
    pub fn named_curve(&self, algorithm: &AlgorithmDescriptor) -> P11Result<NamedCurve> {
        required_curve(algorithm)
    }
}

fn aes_mode(name: AlgorithmName) -> AesMode {
    match name {
        AlgorithmName::AesCbc => AesMode::Cbc,
        _ => AesMode::Gcm,
    }
}

fn rsa_scheme(name: AlgorithmName) -> RsaScheme {
    match name {
        AlgorithmName::RsaPss => RsaScheme::Pss,
        AlgorithmName::RsassaPkcs1v15 => RsaScheme::Pkcs1v15,
        _ => RsaScheme::Oaep,
    }
}

fn ec_scheme(name: AlgorithmName) -> EcScheme {
    match name {
        AlgorithmName::Ecdh => EcScheme::Ecdh,
        _ => EcScheme::Ecdsa,
    }
}

fn expect_key(key: Option<&CryptoKey>, name: AlgorithmName) -> P11Result<&CryptoKey> {
    let key = key.ok_or_else(|| CryptoError::KeyAlgorithmMismatch {
        key: "none".to_string(),
        algorithm: name.to_string(),
    })?;
    if key.algorithm_name() != name {
        return Err(CryptoError::KeyAlgorithmMismatch {
            key: key.algorithm_name().to_string(),
            algorithm: name.to_string(),
        }
        .into());
    }
    Ok(key)
}

fn key_hash(key: &CryptoKey) -> P11Result<HashAlgorithm> {
    key.kind()
        .hash()
        .ok_or_else(|| parameter(format!("{} key carries no hash", key.algorithm_name())).into())
}

fn required_hash(algorithm: &AlgorithmDescriptor) -> P11Result<HashAlgorithm> {
    let hash = algorithm
        .params
        .hash
        .as_deref()
        .ok_or_else(|| parameter(format!("{} requires a hash", algorithm.name)))?;
    Ok(HashAlgorithm::from_name(hash)?)
}

fn required_curve(algorithm: &AlgorithmDescriptor) -> P11Result<NamedCurve> {
    let curve = algorithm
        .params
        .named_curve
        .as_deref()
        .ok_or_else(|| parameter(format!("{} requires a named curve", algorithm.name)))?;
    Ok(NamedCurve::from_name(curve)?)
}

fn gcm_mechanism(algorithm: &AlgorithmDescriptor) -> P11Result<Mechanism> {
    let iv = algorithm
        .params
        .iv
        .as_ref()
        .ok_or_else(|| parameter("AES-GCM requires an iv"))?;
    if iv.is_empty() || iv.len() > 256 {
        return Err(parameter(format!("AES-GCM iv of {} bytes", iv.len())).into());
    }
    let tag_bits = algorithm
        .params
        .tag_length
        .unwrap_or(DEFAULT_GCM_TAG_LENGTH);
    if !GCM_TAG_LENGTHS.contains(&tag_bits) {
        return Err(parameter(format!("AES-GCM tag length {} bits", tag_bits)).into());
    }
    Ok(Mechanism::with_params(
        MechanismType::AES_GCM,
        MechanismParams::Gcm {
            iv: iv.clone(),
            additional_data: algorithm.params.additional_data.clone().unwrap_or_default(),
            tag_bits,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::P11Error;
    use crate::model::{KeyOrigin, KeyUsages, StorageScope};
    use crate::ports::{ObjectHandle, SessionHandle};

    fn key(kind: KeyKind) -> CryptoKey {
        let usages = kind.permitted_usages();
        CryptoKey::new(
            ObjectHandle(1),
            KeyOrigin::new(1, SessionHandle(1)),
            kind,
            usages,
            false,
            StorageScope::Session,
            None,
            None,
        )
    }

    fn aes_gcm_key() -> CryptoKey {
        key(KeyKind::Secret(SecretKeyAlgorithm::Aes {
            mode: AesMode::Gcm,
            length: 256,
        }))
    }

    fn rsa_key(scheme: RsaScheme, private: bool) -> CryptoKey {
        let alg = AsymmetricKeyAlgorithm::Rsa {
            scheme,
            modulus_length: 2048,
            public_exponent: vec![1, 0, 1],
            hash: HashAlgorithm::Sha384,
        };
        key(if private {
            KeyKind::Private(alg)
        } else {
            KeyKind::Public(alg)
        })
    }

    fn ec_key(scheme: EcScheme, curve: NamedCurve, private: bool) -> CryptoKey {
        let alg = AsymmetricKeyAlgorithm::Ec { scheme, curve };
        key(if private {
            KeyKind::Private(alg)
        } else {
            KeyKind::Public(alg)
        })
    }

    fn mapper() -> MechanismMapper {
        MechanismMapper::default()
    }

    #[test]
    fn test_digest_mechanisms() {
        let mapper = mapper();
        for (name, expected) in [
            ("SHA-1", MechanismType::SHA_1),
            ("sha-256", MechanismType::SHA256),
            ("SHA-384", MechanismType::SHA384),
            ("SHA-512", MechanismType::SHA512),
        ] {
            let mechanism = mapper
                .resolve(Purpose::Digest, &AlgorithmDescriptor::new(name), None)
                .unwrap();
            assert_eq!(mechanism, Mechanism::new(expected));
        }
    }

    #[test]
    fn test_unknown_algorithm() {
        let err = mapper()
            .resolve(Purpose::Digest, &AlgorithmDescriptor::new("MD5"), None)
            .unwrap_err();
        assert!(matches!(
            err,
            P11Error::Crypto(CryptoError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_digest_with_cipher_name_unsupported() {
        let err = mapper()
            .resolve(Purpose::Digest, &AlgorithmDescriptor::new("AES-GCM"), None)
            .unwrap_err();
        assert!(matches!(
            err,
            P11Error::Crypto(CryptoError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_gcm_defaults_and_validation() {
        let mapper = mapper();
        let key = aes_gcm_key();
        let alg = AlgorithmDescriptor::new("AES-GCM").with_iv(vec![1u8; 12]);
        let mechanism = mapper.resolve(Purpose::Encrypt, &alg, Some(&key)).unwrap();
        assert_eq!(mechanism.mechanism_type, MechanismType::AES_GCM);
        assert_eq!(
            mechanism.params,
            MechanismParams::Gcm {
                iv: vec![1u8; 12],
                additional_data: vec![],
                tag_bits: 128,
            }
        );

        let bad_tag = alg.clone().with_tag_length(100);
        assert!(matches!(
            mapper.resolve(Purpose::Encrypt, &bad_tag, Some(&key)),
            Err(P11Error::Crypto(CryptoError::MechanismParameter { .. }))
        ));

        let no_iv = AlgorithmDescriptor::new("AES-GCM");
        assert!(mapper.resolve(Purpose::Decrypt, &no_iv, Some(&key)).is_err());
    }

    #[test]
    fn test_cbc_iv_length() {
        let key = key(KeyKind::Secret(SecretKeyAlgorithm::Aes {
            mode: AesMode::Cbc,
            length: 128,
        }));
        let short = AlgorithmDescriptor::new("AES-CBC").with_iv(vec![0u8; 8]);
        assert!(matches!(
            mapper().resolve(Purpose::Encrypt, &short, Some(&key)),
            Err(P11Error::Crypto(CryptoError::MechanismParameter { .. }))
        ));

        let ok = AlgorithmDescriptor::new("AES-CBC").with_iv(vec![0u8; 16]);
        let mechanism = mapper().resolve(Purpose::Encrypt, &ok, Some(&key)).unwrap();
        assert_eq!(mechanism.mechanism_type, MechanismType::AES_CBC_PAD);
    }

    #[test]
    fn test_key_algorithm_mismatch() {
        let alg = AlgorithmDescriptor::new("AES-CBC").with_iv(vec![0u8; 16]);
        let err = mapper()
            .resolve(Purpose::Encrypt, &alg, Some(&aes_gcm_key()))
            .unwrap_err();
        assert!(matches!(
            err,
            P11Error::Crypto(CryptoError::KeyAlgorithmMismatch { .. })
        ));
    }

    #[test]
    fn test_oaep_hash_and_mgf_resolved_independently() {
        let key = rsa_key(RsaScheme::Oaep, false);
        let alg = AlgorithmDescriptor::new("RSA-OAEP")
            .with_mgf_hash("SHA-1")
            .with_label(b"ctx".to_vec());
        let mechanism = mapper().resolve(Purpose::Encrypt, &alg, Some(&key)).unwrap();
        assert_eq!(
            mechanism.params,
            MechanismParams::Oaep {
                hash: MechanismType::SHA384,
                mgf: MgfType::MGF1_SHA1,
                label: b"ctx".to_vec(),
            }
        );

        let default_mgf = mapper()
            .resolve(Purpose::Encrypt, &AlgorithmDescriptor::new("RSA-OAEP"), Some(&key))
            .unwrap();
        assert!(matches!(
            default_mgf.params,
            MechanismParams::Oaep { mgf: MgfType::MGF1_SHA384, .. }
        ));
    }

    #[test]
    fn test_pss_requires_salt_length() {
        let key = rsa_key(RsaScheme::Pss, true);
        assert!(mapper()
            .resolve(Purpose::Sign, &AlgorithmDescriptor::new("RSA-PSS"), Some(&key))
            .is_err());

        let alg = AlgorithmDescriptor::new("RSA-PSS").with_salt_length(48);
        let mechanism = mapper().resolve(Purpose::Sign, &alg, Some(&key)).unwrap();
        assert_eq!(mechanism.mechanism_type, MechanismType::SHA384_RSA_PKCS_PSS);
    }

    #[test]
    fn test_ecdsa_curve_from_key_hash_from_params() {
        let key = ec_key(EcScheme::Ecdsa, NamedCurve::P384, true);
        let alg = AlgorithmDescriptor::new("ECDSA").with_hash("SHA-256");
        let mechanism = mapper().resolve(Purpose::Sign, &alg, Some(&key)).unwrap();
        assert_eq!(
            mechanism,
            Mechanism::with_params(
                MechanismType::ECDSA_SHA256,
                MechanismParams::Ecdsa {
                    curve: NamedCurve::P384
                }
            )
        );

        assert!(mapper()
            .resolve(Purpose::Sign, &AlgorithmDescriptor::new("ECDSA"), Some(&key))
            .is_err());
    }

    #[test]
    fn test_ecdh_peer_checks() {
        let private = ec_key(EcScheme::Ecdh, NamedCurve::P256, true);
        let peer = ec_key(EcScheme::Ecdh, NamedCurve::P256, false).with_public_point(vec![4; 65]);
        let alg = AlgorithmDescriptor::new("ECDH").with_public(peer);
        let mechanism = mapper().resolve(Purpose::Derive, &alg, Some(&private)).unwrap();
        assert_eq!(
            mechanism.params,
            MechanismParams::Ecdh {
                public_data: vec![4; 65]
            }
        );

        let other_curve =
            ec_key(EcScheme::Ecdh, NamedCurve::P384, false).with_public_point(vec![4; 97]);
        let alg = AlgorithmDescriptor::new("ECDH").with_public(other_curve);
        assert!(matches!(
            mapper().resolve(Purpose::Derive, &alg, Some(&private)),
            Err(P11Error::Crypto(CryptoError::MechanismParameter { .. }))
        ));
    }

    #[test]
    fn test_pbkdf2_iterations_positive() {
        let base = key(KeyKind::Secret(SecretKeyAlgorithm::Kdf(KdfName::Pbkdf2)));
        let alg = AlgorithmDescriptor::new("PBKDF2")
            .with_hash("SHA-256")
            .with_salt(b"salt".to_vec())
            .with_iterations(0);
        assert!(mapper().resolve(Purpose::Derive, &alg, Some(&base)).is_err());

        let alg = alg.with_iterations(1000);
        let mechanism = mapper().resolve(Purpose::Derive, &alg, Some(&base)).unwrap();
        assert_eq!(mechanism.mechanism_type, MechanismType::PKCS5_PBKD2);
    }

    #[test]
    fn test_generation_mechanisms() {
        let mapper = mapper();
        for (name, expected) in [
            ("AES-GCM", MechanismType::AES_KEY_GEN),
            ("HMAC", MechanismType::GENERIC_SECRET_KEY_GEN),
            ("RSA-PSS", MechanismType::RSA_PKCS_KEY_PAIR_GEN),
            ("ECDH", MechanismType::EC_KEY_PAIR_GEN),
            ("Ed25519", MechanismType::EC_EDWARDS_KEY_PAIR_GEN),
        ] {
            let mechanism = mapper
                .resolve(Purpose::GenerateKey, &AlgorithmDescriptor::new(name), None)
                .unwrap();
            assert_eq!(mechanism.mechanism_type, expected);
        }
        assert!(mapper
            .resolve(Purpose::GenerateKey, &AlgorithmDescriptor::new("SHA-256"), None)
            .is_err());
    }

    #[test]
    fn test_vendor_mechanism_resolution() {
        let mut registry = MechanismRegistry::new();
        registry.register(&crate::logic::registry::VendorDefinition::new([(
            "CKM_VENDOR_SIGN",
            MechanismType(0x8000_4000),
        )]));
        let mapper = MechanismMapper::new(registry);
        let alg = AlgorithmDescriptor::new("CKM_VENDOR_SIGN").with_vendor_params(vec![9, 9]);
        let mechanism = mapper.resolve(Purpose::Sign, &alg, None).unwrap();
        assert_eq!(
            mechanism,
            Mechanism::with_params(MechanismType(0x8000_4000), MechanismParams::Vendor(vec![9, 9]))
        );
    }

    #[test]
    fn test_secret_algorithm_validation() {
        let mapper = mapper();
        assert!(mapper
            .secret_algorithm(&AlgorithmDescriptor::new("AES-GCM").with_length(100))
            .is_err());
        assert_eq!(
            mapper
                .secret_algorithm(&AlgorithmDescriptor::new("HMAC").with_hash("SHA-512"))
                .unwrap(),
            SecretKeyAlgorithm::Hmac {
                hash: HashAlgorithm::Sha512,
                length: 1024
            }
        );
        assert!(mapper
            .secret_algorithm(&AlgorithmDescriptor::new("HMAC"))
            .is_err());
    }

    #[test]
    fn test_asymmetric_algorithm_validation() {
        let mapper = mapper();
        let small = AlgorithmDescriptor::new("RSA-OAEP")
            .with_modulus_length(512)
            .with_hash("SHA-256");
        assert!(mapper.asymmetric_algorithm(&small).is_err());

        let ok = AlgorithmDescriptor::new("RSA-OAEP")
            .with_modulus_length(2048)
            .with_hash("SHA-256");
        assert!(matches!(
            mapper.asymmetric_algorithm(&ok).unwrap(),
            AsymmetricKeyAlgorithm::Rsa { ref public_exponent, .. } if public_exponent == &[1, 0, 1]
        ));

        let p521 = AlgorithmDescriptor::new("ECDSA").with_named_curve("P-521");
        assert!(matches!(
            mapper.asymmetric_algorithm(&p521),
            Err(P11Error::Crypto(CryptoError::MechanismParameter { .. }))
        ));
    }

    #[test]
    fn test_oversized_secret_rejected() {
        // 2^32 + 8 bits would wrap to an 8-bit key
        let err = mapper()
            .imported_kind(
                &AlgorithmDescriptor::new("HMAC").with_hash("SHA-256"),
                KeyClass::Secret,
                &MaterialShape::Secret {
                    len: (1 << 29) + 1,
                },
                "raw",
            )
            .unwrap_err();
        assert!(matches!(
            err,
            P11Error::Crypto(CryptoError::ImportFormat { .. })
        ));
    }

    #[test]
    fn test_imported_kind_checks_curve() {
        let alg = AlgorithmDescriptor::new("ECDSA").with_named_curve("P-384");
        let err = mapper()
            .imported_kind(
                &alg,
                KeyClass::Public,
                &MaterialShape::Ec {
                    curve: NamedCurve::P256,
                },
                "spki",
            )
            .unwrap_err();
        assert!(matches!(
            err,
            P11Error::Crypto(CryptoError::ImportFormat { .. })
        ));

        let kind = mapper()
            .imported_kind(
                &AlgorithmDescriptor::new("AES-CBC"),
                KeyClass::Secret,
                &MaterialShape::Secret { len: 24 },
                "raw",
            )
            .unwrap();
        assert_eq!(
            kind,
            KeyKind::Secret(SecretKeyAlgorithm::Aes {
                mode: AesMode::Cbc,
                length: 192
            })
        );
        let usages: KeyUsages = kind.permitted_usages();
        assert!(usages.contains(KeyUsage::Encrypt));
    }

    #[test]
    fn test_unwrap_kind() {
        let kind = mapper()
            .unwrap_kind(&AlgorithmDescriptor::new("HMAC").with_hash("SHA-512"), KeyClass::Secret)
            .unwrap();
        assert_eq!(kind.hash(), Some(HashAlgorithm::Sha512));

        let kind = mapper()
            .unwrap_kind(&AlgorithmDescriptor::new("Ed25519"), KeyClass::Private)
            .unwrap();
        assert_eq!(kind, KeyKind::Private(AsymmetricKeyAlgorithm::Ed25519));

        assert!(mapper()
            .unwrap_kind(&AlgorithmDescriptor::new("Ed25519"), KeyClass::Secret)
            .is_err());
        assert!(mapper()
            .unwrap_kind(&AlgorithmDescriptor::new("RSA-PSS"), KeyClass::Private)
            .is_err());
    }
}
