//! CryptoKey: an opaque handle to token-held key material plus its metadata

use std::fmt;

use crate::model::{AlgorithmName, HashAlgorithm, KeyUsage, KeyUsages, NamedCurve};
use crate::ports::{ObjectClass, ObjectHandle, SessionHandle};

/// Class of a key object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyClass {
    Secret,
    Public,
    Private,
}

impl KeyClass {
    pub fn object_class(self) -> ObjectClass {
        match self {
            KeyClass::Secret => ObjectClass::SECRET_KEY,
            KeyClass::Public => ObjectClass::PUBLIC_KEY,
            KeyClass::Private => ObjectClass::PRIVATE_KEY,
        }
    }

    pub fn from_object_class(class: ObjectClass) -> Option<Self> {
        match class {
            ObjectClass::SECRET_KEY => Some(KeyClass::Secret),
            ObjectClass::PUBLIC_KEY => Some(KeyClass::Public),
            ObjectClass::PRIVATE_KEY => Some(KeyClass::Private),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyClass::Secret => "secret",
            KeyClass::Public => "public",
            KeyClass::Private => "private",
        }
    }
}

/// Where a key object lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScope {
    /// Destroyed when the owning session closes
    Session,
    /// Kept in token storage across sessions
    Token,
}

impl StorageScope {
    pub fn is_persistent(self) -> bool {
        matches!(self, StorageScope::Token)
    }
}

/// External key encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFormat {
    /// Secret value, EC uncompressed point or raw Ed25519 public key
    Raw,
    /// DER SubjectPublicKeyInfo
    Spki,
    /// DER PKCS#8 PrivateKeyInfo
    Pkcs8,
}

impl KeyFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyFormat::Raw => "raw",
            KeyFormat::Spki => "spki",
            KeyFormat::Pkcs8 => "pkcs8",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AesMode {
    Gcm,
    Cbc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KdfName {
    Hkdf,
    Pbkdf2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RsaScheme {
    Oaep,
    Pss,
    Pkcs1v15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcScheme {
    Ecdsa,
    Ecdh,
}

/// Algorithm of a secret key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SecretKeyAlgorithm {
    Aes { mode: AesMode, length: u32 },
    Hmac { hash: HashAlgorithm, length: u32 },
    Kdf(KdfName),
}

/// Algorithm of an asymmetric key, shared by both halves of a pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AsymmetricKeyAlgorithm {
    Rsa {
        scheme: RsaScheme,
        modulus_length: u32,
        public_exponent: Vec<u8>,
        hash: HashAlgorithm,
    },
    Ec {
        scheme: EcScheme,
        curve: NamedCurve,
    },
    Ed25519,
}

impl AsymmetricKeyAlgorithm {
    pub fn name(&self) -> AlgorithmName {
        match self {
            AsymmetricKeyAlgorithm::Rsa { scheme, .. } => match scheme {
                RsaScheme::Oaep => AlgorithmName::RsaOaep,
                RsaScheme::Pss => AlgorithmName::RsaPss,
                RsaScheme::Pkcs1v15 => AlgorithmName::RsassaPkcs1v15,
            },
            AsymmetricKeyAlgorithm::Ec { scheme, .. } => match scheme {
                EcScheme::Ecdsa => AlgorithmName::Ecdsa,
                EcScheme::Ecdh => AlgorithmName::Ecdh,
            },
            AsymmetricKeyAlgorithm::Ed25519 => AlgorithmName::Ed25519,
        }
    }

    fn public_usages(&self) -> KeyUsages {
        match self {
            AsymmetricKeyAlgorithm::Rsa {
                scheme: RsaScheme::Oaep,
                ..
            } => KeyUsages::from([KeyUsage::Encrypt, KeyUsage::WrapKey]),
            AsymmetricKeyAlgorithm::Ec {
                scheme: EcScheme::Ecdh,
                ..
            } => KeyUsages::empty(),
            _ => KeyUsages::from([KeyUsage::Verify]),
        }
    }

    fn private_usages(&self) -> KeyUsages {
        match self {
            AsymmetricKeyAlgorithm::Rsa {
                scheme: RsaScheme::Oaep,
                ..
            } => KeyUsages::from([KeyUsage::Decrypt, KeyUsage::UnwrapKey]),
            AsymmetricKeyAlgorithm::Ec {
                scheme: EcScheme::Ecdh,
                ..
            } => KeyUsages::from([KeyUsage::DeriveKey, KeyUsage::DeriveBits]),
            _ => KeyUsages::from([KeyUsage::Sign]),
        }
    }
}

/// Tagged key metadata keyed by class and algorithm family
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Secret(SecretKeyAlgorithm),
    Public(AsymmetricKeyAlgorithm),
    Private(AsymmetricKeyAlgorithm),
}

impl KeyKind {
    pub fn class(&self) -> KeyClass {
        match self {
            KeyKind::Secret(_) => KeyClass::Secret,
            KeyKind::Public(_) => KeyClass::Public,
            KeyKind::Private(_) => KeyClass::Private,
        }
    }

    pub fn algorithm_name(&self) -> AlgorithmName {
        match self {
            KeyKind::Secret(SecretKeyAlgorithm::Aes { mode, .. }) => match mode {
                AesMode::Gcm => AlgorithmName::AesGcm,
                AesMode::Cbc => AlgorithmName::AesCbc,
            },
            KeyKind::Secret(SecretKeyAlgorithm::Hmac { .. }) => AlgorithmName::Hmac,
            KeyKind::Secret(SecretKeyAlgorithm::Kdf(KdfName::Hkdf)) => AlgorithmName::Hkdf,
            KeyKind::Secret(SecretKeyAlgorithm::Kdf(KdfName::Pbkdf2)) => AlgorithmName::Pbkdf2,
            KeyKind::Public(alg) | KeyKind::Private(alg) => alg.name(),
        }
    }

    /// Usages this kind of key can ever carry
    pub fn permitted_usages(&self) -> KeyUsages {
        match self {
            KeyKind::Secret(SecretKeyAlgorithm::Aes { .. }) => KeyUsages::from([
                KeyUsage::Encrypt,
                KeyUsage::Decrypt,
                KeyUsage::WrapKey,
                KeyUsage::UnwrapKey,
            ]),
            KeyKind::Secret(SecretKeyAlgorithm::Hmac { .. }) => {
                KeyUsages::from([KeyUsage::Sign, KeyUsage::Verify])
            }
            KeyKind::Secret(SecretKeyAlgorithm::Kdf(_)) => {
                KeyUsages::from([KeyUsage::DeriveKey, KeyUsage::DeriveBits])
            }
            KeyKind::Public(alg) => alg.public_usages(),
            KeyKind::Private(alg) => alg.private_usages(),
        }
    }

    pub fn asymmetric(&self) -> Option<&AsymmetricKeyAlgorithm> {
        match self {
            KeyKind::Public(alg) | KeyKind::Private(alg) => Some(alg),
            KeyKind::Secret(_) => None,
        }
    }

    /// Curve of an EC key
    pub fn curve(&self) -> Option<NamedCurve> {
        match self.asymmetric()? {
            AsymmetricKeyAlgorithm::Ec { curve, .. } => Some(*curve),
            _ => None,
        }
    }

    /// Hash bound to the key (HMAC, RSA)
    pub fn hash(&self) -> Option<HashAlgorithm> {
        match self {
            KeyKind::Secret(SecretKeyAlgorithm::Hmac { hash, .. }) => Some(*hash),
            KeyKind::Public(AsymmetricKeyAlgorithm::Rsa { hash, .. })
            | KeyKind::Private(AsymmetricKeyAlgorithm::Rsa { hash, .. }) => Some(*hash),
            _ => None,
        }
    }

    /// Whether using or creating this key requires a logged-in session
    pub fn requires_login(&self) -> bool {
        !matches!(self, KeyKind::Public(_))
    }
}

/// Session manager and session a key handle was obtained through
///
/// Object handles are only meaningful inside the module instance that
/// issued them, so a key is usable only through the manager named here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyOrigin {
    pub manager: u64,
    pub session: SessionHandle,
}

impl KeyOrigin {
    pub fn new(manager: u64, session: SessionHandle) -> Self {
        Self { manager, session }
    }
}

/// Handle to a key object held by the token
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoKey {
    handle: ObjectHandle,
    origin: KeyOrigin,
    kind: KeyKind,
    usages: KeyUsages,
    extractable: bool,
    scope: StorageScope,
    label: Option<String>,
    id: Option<Vec<u8>>,
    public_point: Option<Vec<u8>>,
}

impl CryptoKey {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handle: ObjectHandle,
        origin: KeyOrigin,
        kind: KeyKind,
        usages: KeyUsages,
        extractable: bool,
        scope: StorageScope,
        label: Option<String>,
        id: Option<Vec<u8>>,
    ) -> Self {
        Self {
            handle,
            origin,
            kind,
            usages,
            extractable,
            scope,
            label,
            id,
            public_point: None,
        }
    }

    /// Attach the uncompressed public point of an EC or Ed25519 public key
    pub(crate) fn with_public_point(mut self, point: Vec<u8>) -> Self {
        self.public_point = Some(point);
        self
    }

    pub(crate) fn with_identity(mut self, label: Option<String>, id: Option<Vec<u8>>) -> Self {
        self.label = label;
        self.id = id;
        self
    }

    pub(crate) fn with_handle(mut self, handle: ObjectHandle, scope: StorageScope) -> Self {
        self.handle = handle;
        self.scope = scope;
        self
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    /// Session the key was obtained through
    pub fn session(&self) -> SessionHandle {
        self.origin.session
    }

    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }

    pub fn kind(&self) -> &KeyKind {
        &self.kind
    }

    pub fn class(&self) -> KeyClass {
        self.kind.class()
    }

    pub fn algorithm_name(&self) -> AlgorithmName {
        self.kind.algorithm_name()
    }

    pub fn usages(&self) -> KeyUsages {
        self.usages
    }

    pub fn extractable(&self) -> bool {
        self.extractable
    }

    pub fn scope(&self) -> StorageScope {
        self.scope
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn id(&self) -> Option<&[u8]> {
        self.id.as_deref()
    }

    /// Public point of an EC or Ed25519 public key, without DER wrapping
    pub fn public_point(&self) -> Option<&[u8]> {
        self.public_point.as_deref()
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoKey")
            .field("handle", &self.handle)
            .field("origin", &self.origin)
            .field("kind", &self.kind)
            .field("usages", &self.usages)
            .field("extractable", &self.extractable)
            .field("scope", &self.scope)
            .field("label", &self.label)
            .finish()
    }
}

/// Linked public/private pair produced by key generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoKeyPair {
    pub public_key: CryptoKey,
    pub private_key: CryptoKey,
}

/// Result of `generate_key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratedKey {
    Secret(CryptoKey),
    Pair(CryptoKeyPair),
}

impl GeneratedKey {
    pub fn into_secret(self) -> Option<CryptoKey> {
        match self {
            GeneratedKey::Secret(key) => Some(key),
            GeneratedKey::Pair(_) => None,
        }
    }

    pub fn into_pair(self) -> Option<CryptoKeyPair> {
        match self {
            GeneratedKey::Pair(pair) => Some(pair),
            GeneratedKey::Secret(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa(scheme: RsaScheme) -> AsymmetricKeyAlgorithm {
        AsymmetricKeyAlgorithm::Rsa {
            scheme,
            modulus_length: 2048,
            public_exponent: vec![1, 0, 1],
            hash: HashAlgorithm::Sha256,
        }
    }

    #[test]
    fn test_permitted_usages_by_kind() {
        let aes = KeyKind::Secret(SecretKeyAlgorithm::Aes {
            mode: AesMode::Gcm,
            length: 256,
        });
        assert!(aes.permitted_usages().contains(KeyUsage::WrapKey));
        assert!(!aes.permitted_usages().contains(KeyUsage::Sign));

        let oaep_public = KeyKind::Public(rsa(RsaScheme::Oaep));
        assert_eq!(
            oaep_public.permitted_usages(),
            KeyUsages::from([KeyUsage::Encrypt, KeyUsage::WrapKey])
        );

        let ecdh_public = KeyKind::Public(AsymmetricKeyAlgorithm::Ec {
            scheme: EcScheme::Ecdh,
            curve: NamedCurve::P256,
        });
        assert!(ecdh_public.permitted_usages().is_empty());

        let pss_private = KeyKind::Private(rsa(RsaScheme::Pss));
        assert_eq!(
            pss_private.permitted_usages(),
            KeyUsages::from([KeyUsage::Sign])
        );
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(
            KeyKind::Private(rsa(RsaScheme::Pkcs1v15)).algorithm_name(),
            AlgorithmName::RsassaPkcs1v15
        );
        assert_eq!(
            KeyKind::Secret(SecretKeyAlgorithm::Kdf(KdfName::Pbkdf2)).algorithm_name(),
            AlgorithmName::Pbkdf2
        );
        assert_eq!(
            KeyKind::Public(AsymmetricKeyAlgorithm::Ed25519).algorithm_name(),
            AlgorithmName::Ed25519
        );
    }

    #[test]
    fn test_requires_login() {
        assert!(!KeyKind::Public(AsymmetricKeyAlgorithm::Ed25519).requires_login());
        assert!(KeyKind::Private(AsymmetricKeyAlgorithm::Ed25519).requires_login());
        assert!(KeyKind::Secret(SecretKeyAlgorithm::Kdf(KdfName::Hkdf)).requires_login());
    }

    #[test]
    fn test_class_round_trip() {
        for class in [KeyClass::Secret, KeyClass::Public, KeyClass::Private] {
            assert_eq!(KeyClass::from_object_class(class.object_class()), Some(class));
        }
        assert_eq!(KeyClass::from_object_class(ObjectClass::DATA), None);
    }
}
