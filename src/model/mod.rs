mod algorithm;
mod key;
mod mechanism;
mod pin;
mod usage;

pub use algorithm::{
    AlgorithmDescriptor, AlgorithmError, AlgorithmName, AlgorithmParams, HashAlgorithm,
    NamedCurve, ED25519_EC_PARAMS,
};
pub use key::{
    AesMode, AsymmetricKeyAlgorithm, CryptoKey, CryptoKeyPair, EcScheme, GeneratedKey, KdfName,
    KeyClass, KeyFormat, KeyKind, KeyOrigin, RsaScheme, SecretKeyAlgorithm, StorageScope,
};
pub use mechanism::{Mechanism, MechanismParams, MechanismType, MgfType};
pub use pin::{Pin, PinError};
pub use usage::{KeyUsage, KeyUsages, UsageError};
