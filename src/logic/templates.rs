//! CryptoKey metadata to attribute templates and back

use tracing::debug;

use crate::error::{CryptoError, P11Result};
use crate::logic::encoding::{curve_from_params, ec_point_from_attribute};
use crate::model::{
    AesMode, AlgorithmName, AsymmetricKeyAlgorithm, CryptoKey, EcScheme, HashAlgorithm, KdfName,
    KeyClass, KeyKind, KeyOrigin, KeyUsage, KeyUsages, NamedCurve, RsaScheme,
    SecretKeyAlgorithm, StorageScope, ED25519_EC_PARAMS,
};
use crate::ports::{Attribute, AttributeList, AttributeType, KeyType, ObjectHandle};

const DEFAULT_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// Attributes read to rebuild a CryptoKey from a handle
pub const METADATA_ATTRIBUTES: &[AttributeType] = &[
    AttributeType::CLASS,
    AttributeType::KEY_TYPE,
    AttributeType::TOKEN,
    AttributeType::EXTRACTABLE,
    AttributeType::ENCRYPT,
    AttributeType::DECRYPT,
    AttributeType::SIGN,
    AttributeType::VERIFY,
    AttributeType::DERIVE,
    AttributeType::WRAP,
    AttributeType::UNWRAP,
    AttributeType::LABEL,
    AttributeType::ID,
    AttributeType::VALUE_LEN,
    AttributeType::MODULUS_BITS,
    AttributeType::MODULUS,
    AttributeType::PUBLIC_EXPONENT,
    AttributeType::EC_PARAMS,
    AttributeType::EC_POINT,
    AttributeType::KEY_ALGORITHM,
];

/// Token key type for a kind of key
pub fn key_type(kind: &KeyKind) -> KeyType {
    match kind {
        KeyKind::Secret(SecretKeyAlgorithm::Aes { .. }) => KeyType::AES,
        KeyKind::Secret(SecretKeyAlgorithm::Hmac { .. }) => KeyType::GENERIC_SECRET,
        KeyKind::Secret(SecretKeyAlgorithm::Kdf(KdfName::Hkdf)) => KeyType::HKDF,
        KeyKind::Secret(SecretKeyAlgorithm::Kdf(KdfName::Pbkdf2)) => KeyType::GENERIC_SECRET,
        KeyKind::Public(alg) | KeyKind::Private(alg) => match alg {
            AsymmetricKeyAlgorithm::Rsa { .. } => KeyType::RSA,
            AsymmetricKeyAlgorithm::Ec { .. } => KeyType::EC,
            AsymmetricKeyAlgorithm::Ed25519 => KeyType::EC_EDWARDS,
        },
    }
}

/// Value of the algorithm attribute: the WebCrypto name, plus the hash when
/// the key is bound to one
pub fn algorithm_tag(kind: &KeyKind) -> String {
    match kind.hash() {
        Some(hash) => format!("{}/{}", kind.algorithm_name(), hash),
        None => kind.algorithm_name().to_string(),
    }
}

fn parse_algorithm_tag(tag: &[u8]) -> Option<(AlgorithmName, Option<HashAlgorithm>)> {
    let tag = std::str::from_utf8(tag).ok()?;
    match tag.split_once('/') {
        Some((name, hash)) => Some((
            AlgorithmName::parse(name)?,
            Some(HashAlgorithm::from_name(hash).ok()?),
        )),
        None => Some((AlgorithmName::parse(tag)?, None)),
    }
}

fn usage_flags(class: KeyClass, usages: KeyUsages) -> Vec<Attribute> {
    let derive = usages.contains(KeyUsage::DeriveKey) || usages.contains(KeyUsage::DeriveBits);
    match class {
        KeyClass::Secret => vec![
            Attribute::Encrypt(usages.contains(KeyUsage::Encrypt)),
            Attribute::Decrypt(usages.contains(KeyUsage::Decrypt)),
            Attribute::Sign(usages.contains(KeyUsage::Sign)),
            Attribute::Verify(usages.contains(KeyUsage::Verify)),
            Attribute::Wrap(usages.contains(KeyUsage::WrapKey)),
            Attribute::Unwrap(usages.contains(KeyUsage::UnwrapKey)),
            Attribute::Derive(derive),
        ],
        KeyClass::Public => vec![
            Attribute::Encrypt(usages.contains(KeyUsage::Encrypt)),
            Attribute::Verify(usages.contains(KeyUsage::Verify)),
            Attribute::Wrap(usages.contains(KeyUsage::WrapKey)),
            Attribute::Derive(derive),
        ],
        KeyClass::Private => vec![
            Attribute::Decrypt(usages.contains(KeyUsage::Decrypt)),
            Attribute::Sign(usages.contains(KeyUsage::Sign)),
            Attribute::Unwrap(usages.contains(KeyUsage::UnwrapKey)),
            Attribute::Derive(derive),
        ],
    }
}

/// Metadata of a key about to be created on the token
#[derive(Debug, Clone)]
pub struct KeySpec {
    pub kind: KeyKind,
    pub usages: KeyUsages,
    pub extractable: bool,
    pub scope: StorageScope,
    pub label: Option<String>,
    pub id: Option<Vec<u8>>,
}

impl KeySpec {
    /// Session-scoped key with the given metadata
    pub fn new(kind: KeyKind, usages: KeyUsages, extractable: bool) -> Self {
        Self {
            kind,
            usages,
            extractable,
            scope: StorageScope::Session,
            label: None,
            id: None,
        }
    }

    /// Attributes shared by every way of creating the key
    pub fn template(&self) -> Vec<Attribute> {
        let class = self.kind.class();
        let mut template = vec![
            Attribute::Class(class.object_class()),
            Attribute::KeyType(key_type(&self.kind)),
            Attribute::Token(self.scope.is_persistent()),
            Attribute::Private(class != KeyClass::Public),
            Attribute::Extractable(self.extractable),
        ];
        if class != KeyClass::Public {
            template.push(Attribute::Sensitive(!self.extractable));
        }
        template.extend(usage_flags(class, self.usages));
        template.push(Attribute::Vendor(
            AttributeType::KEY_ALGORITHM,
            algorithm_tag(&self.kind).into_bytes(),
        ));
        if let Some(label) = &self.label {
            template.push(Attribute::Label(label.as_bytes().to_vec()));
        }
        if let Some(id) = &self.id {
            template.push(Attribute::Id(id.clone()));
        }
        template
    }

    /// Template for `C_GenerateKey`, `C_GenerateKeyPair` and `C_DeriveKey`,
    /// with the sizing attributes the token needs to create fresh material
    pub fn generation_template(&self) -> Vec<Attribute> {
        let mut template = self.template();
        match &self.kind {
            KeyKind::Secret(SecretKeyAlgorithm::Aes { length, .. })
            | KeyKind::Secret(SecretKeyAlgorithm::Hmac { length, .. }) => {
                template.push(Attribute::ValueLen(u64::from(*length / 8)));
            }
            KeyKind::Public(AsymmetricKeyAlgorithm::Rsa {
                modulus_length,
                public_exponent,
                ..
            }) => {
                template.push(Attribute::ModulusBits(u64::from(*modulus_length)));
                template.push(Attribute::PublicExponent(public_exponent.clone()));
            }
            KeyKind::Public(AsymmetricKeyAlgorithm::Ec { curve, .. }) => {
                template.push(Attribute::EcParams(curve.ec_params().to_vec()));
            }
            KeyKind::Public(AsymmetricKeyAlgorithm::Ed25519) => {
                template.push(Attribute::EcParams(ED25519_EC_PARAMS.to_vec()));
            }
            _ => {}
        }
        template
    }

    pub fn into_key(self, handle: ObjectHandle, origin: KeyOrigin) -> CryptoKey {
        CryptoKey::new(
            handle,
            origin,
            self.kind,
            self.usages,
            self.extractable,
            self.scope,
            self.label,
            self.id,
        )
    }
}

/// Check requested usages against what the kind of key allows
///
/// Secret and private keys must be usable for something.
pub fn validate_usages(kind: &KeyKind, usages: KeyUsages) -> P11Result<()> {
    let foreign = usages.difference(kind.permitted_usages());
    if !foreign.is_empty() {
        return Err(CryptoError::InvalidKeyUsage {
            usage: format!("{} on a {} {} key", foreign, kind.class().as_str(), kind.algorithm_name()),
        }
        .into());
    }
    if usages.is_empty() && kind.class() != KeyClass::Public {
        return Err(CryptoError::InvalidKeyUsage {
            usage: format!("no usages for a {} {} key", kind.class().as_str(), kind.algorithm_name()),
        }
        .into());
    }
    Ok(())
}

/// Template of a transient, extractable generic secret of `len` bytes
pub fn transient_secret_template(len: usize) -> Vec<Attribute> {
    vec![
        Attribute::Class(KeyClass::Secret.object_class()),
        Attribute::KeyType(KeyType::GENERIC_SECRET),
        Attribute::Token(false),
        Attribute::Private(true),
        Attribute::Sensitive(false),
        Attribute::Extractable(true),
        Attribute::ValueLen(len as u64),
    ]
}

fn inferred_kind(class: KeyClass, attributes: &[Attribute]) -> Option<KeyKind> {
    let key_type = attributes.key_type()?;
    let flag = |kind: AttributeType| attributes.flag(kind).unwrap_or(false);
    let signs = flag(AttributeType::SIGN) || flag(AttributeType::VERIFY);
    let value_bits = attributes
        .ulong(AttributeType::VALUE_LEN)
        .and_then(bit_length);

    let secret = match key_type {
        KeyType::AES => Some(SecretKeyAlgorithm::Aes {
            mode: AesMode::Gcm,
            length: value_bits?,
        }),
        KeyType::HKDF => Some(SecretKeyAlgorithm::Kdf(KdfName::Hkdf)),
        KeyType::GENERIC_SECRET if signs => Some(SecretKeyAlgorithm::Hmac {
            hash: HashAlgorithm::Sha256,
            length: value_bits?,
        }),
        KeyType::GENERIC_SECRET => Some(SecretKeyAlgorithm::Kdf(KdfName::Pbkdf2)),
        _ => None,
    };
    if class == KeyClass::Secret {
        return secret.map(KeyKind::Secret);
    }

    let asymmetric = match key_type {
        KeyType::RSA => AsymmetricKeyAlgorithm::Rsa {
            scheme: if signs {
                RsaScheme::Pkcs1v15
            } else {
                RsaScheme::Oaep
            },
            modulus_length: rsa_modulus_bits(attributes)?,
            public_exponent: rsa_public_exponent(attributes),
            hash: HashAlgorithm::Sha256,
        },
        KeyType::EC => AsymmetricKeyAlgorithm::Ec {
            scheme: if signs { EcScheme::Ecdsa } else { EcScheme::Ecdh },
            curve: ec_curve(attributes)?,
        },
        KeyType::EC_EDWARDS => AsymmetricKeyAlgorithm::Ed25519,
        _ => return None,
    };
    Some(match class {
        KeyClass::Public => KeyKind::Public(asymmetric),
        _ => KeyKind::Private(asymmetric),
    })
}

/// Bits in `len` bytes, if that fits a key length
pub(crate) fn bit_length(len: u64) -> Option<u32> {
    len.checked_mul(8).and_then(|bits| u32::try_from(bits).ok())
}

fn rsa_modulus_bits(attributes: &[Attribute]) -> Option<u32> {
    match attributes.ulong(AttributeType::MODULUS_BITS) {
        Some(bits) => u32::try_from(bits).ok(),
        None => attributes.bytes(AttributeType::MODULUS).and_then(|modulus| {
            let leading = modulus.iter().take_while(|byte| **byte == 0).count();
            bit_length((modulus.len() - leading) as u64)
        }),
    }
}

fn rsa_public_exponent(attributes: &[Attribute]) -> Vec<u8> {
    attributes
        .bytes(AttributeType::PUBLIC_EXPONENT)
        .map(<[u8]>::to_vec)
        .unwrap_or_else(|| DEFAULT_PUBLIC_EXPONENT.to_vec())
}

fn ec_curve(attributes: &[Attribute]) -> Option<NamedCurve> {
    curve_from_params(attributes.bytes(AttributeType::EC_PARAMS)?).ok()
}

fn tagged_kind(
    class: KeyClass,
    name: AlgorithmName,
    hash: Option<HashAlgorithm>,
    attributes: &[Attribute],
) -> Option<KeyKind> {
    let value_bits = attributes
        .ulong(AttributeType::VALUE_LEN)
        .and_then(bit_length);
    let asymmetric = match name {
        AlgorithmName::AesGcm | AlgorithmName::AesCbc => {
            return Some(KeyKind::Secret(SecretKeyAlgorithm::Aes {
                mode: if name == AlgorithmName::AesCbc {
                    AesMode::Cbc
                } else {
                    AesMode::Gcm
                },
                length: value_bits?,
            }))
        }
        AlgorithmName::Hmac => {
            return Some(KeyKind::Secret(SecretKeyAlgorithm::Hmac {
                hash: hash?,
                length: value_bits?,
            }))
        }
        AlgorithmName::Hkdf => return Some(KeyKind::Secret(SecretKeyAlgorithm::Kdf(KdfName::Hkdf))),
        AlgorithmName::Pbkdf2 => {
            return Some(KeyKind::Secret(SecretKeyAlgorithm::Kdf(KdfName::Pbkdf2)))
        }
        AlgorithmName::RsaOaep | AlgorithmName::RsaPss | AlgorithmName::RsassaPkcs1v15 => {
            AsymmetricKeyAlgorithm::Rsa {
                scheme: match name {
                    AlgorithmName::RsaPss => RsaScheme::Pss,
                    AlgorithmName::RsassaPkcs1v15 => RsaScheme::Pkcs1v15,
                    _ => RsaScheme::Oaep,
                },
                modulus_length: rsa_modulus_bits(attributes)?,
                public_exponent: rsa_public_exponent(attributes),
                hash: hash?,
            }
        }
        AlgorithmName::Ecdsa | AlgorithmName::Ecdh => AsymmetricKeyAlgorithm::Ec {
            scheme: if name == AlgorithmName::Ecdh {
                EcScheme::Ecdh
            } else {
                EcScheme::Ecdsa
            },
            curve: ec_curve(attributes)?,
        },
        AlgorithmName::Ed25519 => AsymmetricKeyAlgorithm::Ed25519,
        AlgorithmName::Sha1
        | AlgorithmName::Sha256
        | AlgorithmName::Sha384
        | AlgorithmName::Sha512 => return None,
    };
    match class {
        KeyClass::Public => Some(KeyKind::Public(asymmetric)),
        KeyClass::Private => Some(KeyKind::Private(asymmetric)),
        KeyClass::Secret => None,
    }
}

fn usages_from_flags(attributes: &[Attribute]) -> KeyUsages {
    let flag = |kind: AttributeType| attributes.flag(kind).unwrap_or(false);
    let mut usages = KeyUsages::empty();
    for (attribute, usage) in [
        (AttributeType::ENCRYPT, KeyUsage::Encrypt),
        (AttributeType::DECRYPT, KeyUsage::Decrypt),
        (AttributeType::SIGN, KeyUsage::Sign),
        (AttributeType::VERIFY, KeyUsage::Verify),
        (AttributeType::WRAP, KeyUsage::WrapKey),
        (AttributeType::UNWRAP, KeyUsage::UnwrapKey),
    ] {
        if flag(attribute) {
            usages.insert(usage);
        }
    }
    if flag(AttributeType::DERIVE) {
        usages.insert(KeyUsage::DeriveKey);
        usages.insert(KeyUsage::DeriveBits);
    }
    usages
}

/// Rebuild a CryptoKey from the attributes of a key object
///
/// Uses the algorithm attribute when the object carries one and falls back
/// to inferring the algorithm from the key type.
pub fn key_from_attributes(
    handle: ObjectHandle,
    origin: KeyOrigin,
    attributes: &[Attribute],
) -> P11Result<CryptoKey> {
    let unusable = |reason: &str| CryptoError::KeyAlgorithmMismatch {
        key: format!("{:?}", handle),
        algorithm: reason.to_string(),
    };
    let class = attributes
        .object_class()
        .and_then(KeyClass::from_object_class)
        .ok_or_else(|| unusable("object is not a key"))?;

    let tagged = attributes
        .bytes(AttributeType::KEY_ALGORITHM)
        .and_then(parse_algorithm_tag)
        .and_then(|(name, hash)| tagged_kind(class, name, hash, attributes));
    let kind = match tagged {
        Some(kind) => kind,
        None => {
            debug!("Key {:?} has no algorithm attribute, inferring from key type", handle);
            inferred_kind(class, attributes).ok_or_else(|| unusable("unsupported key type"))?
        }
    };

    let usages = usages_from_flags(attributes).intersection(kind.permitted_usages());
    let scope = if attributes.flag(AttributeType::TOKEN).unwrap_or(false) {
        StorageScope::Token
    } else {
        StorageScope::Session
    };
    let label = attributes
        .bytes(AttributeType::LABEL)
        .map(|label| String::from_utf8_lossy(label).into_owned());
    let id = attributes.bytes(AttributeType::ID).map(<[u8]>::to_vec);
    let extractable = attributes.flag(AttributeType::EXTRACTABLE).unwrap_or(false);
    let public_point = match class {
        KeyClass::Public => attributes
            .bytes(AttributeType::EC_POINT)
            .map(ec_point_from_attribute),
        _ => None,
    };

    let key = CryptoKey::new(handle, origin, kind, usages, extractable, scope, label, id);
    Ok(match public_point {
        Some(point) => key.with_public_point(point),
        None => key,
    })
}
