//! Token mechanisms: identifier plus parameter block
//!
//! A [`Mechanism`] is what the token understands. It is produced by the
//! mechanism mapper from a portable algorithm descriptor and never built by
//! callers directly.

use std::fmt;

use crate::model::{HashAlgorithm, NamedCurve};
use crate::ports::ck_constants;

/// Mechanism identifier (`CKM_*`)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MechanismType(pub u64);

ck_constants!(MechanismType {
    RSA_PKCS_KEY_PAIR_GEN = CKM_RSA_PKCS_KEY_PAIR_GEN,
    RSA_PKCS = CKM_RSA_PKCS,
    SHA1_RSA_PKCS = CKM_SHA1_RSA_PKCS,
    RSA_PKCS_OAEP = CKM_RSA_PKCS_OAEP,
    RSA_PKCS_PSS = CKM_RSA_PKCS_PSS,
    SHA1_RSA_PKCS_PSS = CKM_SHA1_RSA_PKCS_PSS,
    SHA256_RSA_PKCS = CKM_SHA256_RSA_PKCS,
    SHA384_RSA_PKCS = CKM_SHA384_RSA_PKCS,
    SHA512_RSA_PKCS = CKM_SHA512_RSA_PKCS,
    SHA256_RSA_PKCS_PSS = CKM_SHA256_RSA_PKCS_PSS,
    SHA384_RSA_PKCS_PSS = CKM_SHA384_RSA_PKCS_PSS,
    SHA512_RSA_PKCS_PSS = CKM_SHA512_RSA_PKCS_PSS,
    SHA_1 = CKM_SHA_1,
    SHA_1_HMAC = CKM_SHA_1_HMAC,
    SHA256 = CKM_SHA256,
    SHA256_HMAC = CKM_SHA256_HMAC,
    SHA384 = CKM_SHA384,
    SHA384_HMAC = CKM_SHA384_HMAC,
    SHA512 = CKM_SHA512,
    SHA512_HMAC = CKM_SHA512_HMAC,
    GENERIC_SECRET_KEY_GEN = CKM_GENERIC_SECRET_KEY_GEN,
    PKCS5_PBKD2 = CKM_PKCS5_PBKD2,
    EC_KEY_PAIR_GEN = CKM_EC_KEY_PAIR_GEN,
    ECDSA = CKM_ECDSA,
    ECDSA_SHA1 = CKM_ECDSA_SHA1,
    ECDSA_SHA256 = CKM_ECDSA_SHA256,
    ECDSA_SHA384 = CKM_ECDSA_SHA384,
    ECDSA_SHA512 = CKM_ECDSA_SHA512,
    ECDH1_DERIVE = CKM_ECDH1_DERIVE,
    EC_EDWARDS_KEY_PAIR_GEN = CKM_EC_EDWARDS_KEY_PAIR_GEN,
    EDDSA = CKM_EDDSA,
    AES_KEY_GEN = CKM_AES_KEY_GEN,
    AES_CBC = CKM_AES_CBC,
    AES_CBC_PAD = CKM_AES_CBC_PAD,
    AES_GCM = CKM_AES_GCM,
    HKDF_DERIVE = CKM_HKDF_DERIVE,
});

impl MechanismType {
    pub const VENDOR_DEFINED: Self = Self(cryptoki_sys::CKM_VENDOR_DEFINED as u64);

    pub fn is_vendor_defined(self) -> bool {
        self.0 >= Self::VENDOR_DEFINED.0
    }

    /// Whether the token can run this mechanism as init/update/final
    pub fn supports_multipart(self) -> bool {
        matches!(
            self,
            Self::SHA_1
                | Self::SHA256
                | Self::SHA384
                | Self::SHA512
                | Self::SHA_1_HMAC
                | Self::SHA256_HMAC
                | Self::SHA384_HMAC
                | Self::SHA512_HMAC
                | Self::SHA1_RSA_PKCS
                | Self::SHA256_RSA_PKCS
                | Self::SHA384_RSA_PKCS
                | Self::SHA512_RSA_PKCS
                | Self::SHA1_RSA_PKCS_PSS
                | Self::SHA256_RSA_PKCS_PSS
                | Self::SHA384_RSA_PKCS_PSS
                | Self::SHA512_RSA_PKCS_PSS
                | Self::ECDSA_SHA1
                | Self::ECDSA_SHA256
                | Self::ECDSA_SHA384
                | Self::ECDSA_SHA512
                | Self::AES_CBC_PAD
                | Self::AES_GCM
        )
    }
}

impl fmt::Debug for MechanismType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MechanismType(0x{:X})", self.0)
    }
}

/// Mask generation function for OAEP and PSS (`CKG_MGF1_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MgfType(pub u64);

ck_constants!(MgfType {
    MGF1_SHA1 = CKG_MGF1_SHA1,
    MGF1_SHA256 = CKG_MGF1_SHA256,
    MGF1_SHA384 = CKG_MGF1_SHA384,
    MGF1_SHA512 = CKG_MGF1_SHA512,
});

impl MgfType {
    pub fn for_hash(hash: HashAlgorithm) -> Self {
        match hash {
            HashAlgorithm::Sha1 => Self::MGF1_SHA1,
            HashAlgorithm::Sha256 => Self::MGF1_SHA256,
            HashAlgorithm::Sha384 => Self::MGF1_SHA384,
            HashAlgorithm::Sha512 => Self::MGF1_SHA512,
        }
    }

    pub fn hash(self) -> Option<HashAlgorithm> {
        match self {
            Self::MGF1_SHA1 => Some(HashAlgorithm::Sha1),
            Self::MGF1_SHA256 => Some(HashAlgorithm::Sha256),
            Self::MGF1_SHA384 => Some(HashAlgorithm::Sha384),
            Self::MGF1_SHA512 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}

/// Parameter block attached to a mechanism
#[derive(Clone, PartialEq, Eq)]
pub enum MechanismParams {
    None,
    /// Initialization vector for block modes
    Iv(Vec<u8>),
    Gcm {
        iv: Vec<u8>,
        additional_data: Vec<u8>,
        tag_bits: u32,
    },
    Oaep {
        hash: MechanismType,
        mgf: MgfType,
        label: Vec<u8>,
    },
    Pss {
        hash: MechanismType,
        mgf: MgfType,
        salt_length: u32,
    },
    Ecdsa {
        curve: NamedCurve,
    },
    Ecdh {
        public_data: Vec<u8>,
    },
    Hkdf {
        prf: MechanismType,
        salt: Vec<u8>,
        info: Vec<u8>,
    },
    Pbkdf2 {
        prf: MechanismType,
        salt: Vec<u8>,
        iterations: u32,
    },
    Vendor(Vec<u8>),
}

impl fmt::Debug for MechanismParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MechanismParams::None => write!(f, "None"),
            MechanismParams::Iv(iv) => write!(f, "Iv({})", hex::encode(iv)),
            MechanismParams::Gcm {
                iv,
                additional_data,
                tag_bits,
            } => write!(
                f,
                "Gcm {{ iv: {}, aad: {} bytes, tag_bits: {} }}",
                hex::encode(iv),
                additional_data.len(),
                tag_bits
            ),
            MechanismParams::Oaep { hash, mgf, label } => write!(
                f,
                "Oaep {{ hash: {:?}, mgf: {:?}, label: {} bytes }}",
                hash,
                mgf,
                label.len()
            ),
            MechanismParams::Pss {
                hash,
                mgf,
                salt_length,
            } => write!(
                f,
                "Pss {{ hash: {:?}, mgf: {:?}, salt_length: {} }}",
                hash, mgf, salt_length
            ),
            MechanismParams::Ecdsa { curve } => write!(f, "Ecdsa {{ curve: {:?} }}", curve),
            MechanismParams::Ecdh { public_data } => {
                write!(f, "Ecdh {{ public_data: {} }}", hex::encode(public_data))
            }
            MechanismParams::Hkdf { prf, salt, info } => write!(
                f,
                "Hkdf {{ prf: {:?}, salt: {} bytes, info: {} bytes }}",
                prf,
                salt.len(),
                info.len()
            ),
            MechanismParams::Pbkdf2 {
                prf,
                salt,
                iterations,
            } => write!(
                f,
                "Pbkdf2 {{ prf: {:?}, salt: {} bytes, iterations: {} }}",
                prf,
                salt.len(),
                iterations
            ),
            MechanismParams::Vendor(bytes) => write!(f, "Vendor({} bytes)", bytes.len()),
        }
    }
}

/// Resolved mechanism: identifier plus parameter block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mechanism {
    pub mechanism_type: MechanismType,
    pub params: MechanismParams,
}

impl Mechanism {
    pub fn new(mechanism_type: MechanismType) -> Self {
        Self {
            mechanism_type,
            params: MechanismParams::None,
        }
    }

    pub fn with_params(mechanism_type: MechanismType, params: MechanismParams) -> Self {
        Self {
            mechanism_type,
            params,
        }
    }

    pub fn supports_multipart(&self) -> bool {
        self.mechanism_type.supports_multipart()
    }
}
