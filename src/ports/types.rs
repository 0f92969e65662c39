//! Token vocabulary shared by every port
//!
//! These are the PKCS#11 notions the adapter layer speaks when it talks to a
//! token: object handles, attribute templates, object classes, key types and
//! return values. They carry the standard numeric identifiers so an adapter
//! over a native module can pass them straight through.

use std::fmt;

use thiserror::Error;

/// Result of a single token call
pub type TokenResult<T> = Result<T, TokenFault>;

/// Failure reported by a token call
///
/// Keeps the name of the token function that failed together with the raw
/// return value, so the core can classify it without losing diagnostics.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{function} failed: {rv}")]
pub struct TokenFault {
    /// Token function that reported the failure (e.g. `C_Sign`)
    pub function: &'static str,
    /// Status code returned by the token
    pub rv: ReturnValue,
}

impl TokenFault {
    pub fn new(function: &'static str, rv: ReturnValue) -> Self {
        Self { function, rv }
    }
}

/// Declares `CK*_` constants on a numeric newtype from their `cryptoki_sys`
/// definitions, plus the table of their symbolic names
macro_rules! ck_constants {
    ($ty:ty { $( $name:ident = $ck:ident ),+ $(,)? }) => {
        impl $ty {
            $( pub const $name: Self = Self(cryptoki_sys::$ck as u64); )+

            /// Every named constant of this type
            pub const KNOWN: &'static [(&'static str, Self)] = &[$( (stringify!($ck), Self::$name) ),+];

            /// Symbolic `CK*_` name, when known
            pub fn name(self) -> Option<&'static str> {
                Self::KNOWN
                    .iter()
                    .find(|(_, value)| *value == self)
                    .map(|(name, _)| *name)
            }
        }
    };
}

pub(crate) use ck_constants;

/// PKCS#11 return value (`CK_RV`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReturnValue(pub u64);

ck_constants!(ReturnValue {
    OK = CKR_OK,
    SLOT_ID_INVALID = CKR_SLOT_ID_INVALID,
    GENERAL_ERROR = CKR_GENERAL_ERROR,
    FUNCTION_FAILED = CKR_FUNCTION_FAILED,
    ARGUMENTS_BAD = CKR_ARGUMENTS_BAD,
    ATTRIBUTE_READ_ONLY = CKR_ATTRIBUTE_READ_ONLY,
    ATTRIBUTE_SENSITIVE = CKR_ATTRIBUTE_SENSITIVE,
    ATTRIBUTE_TYPE_INVALID = CKR_ATTRIBUTE_TYPE_INVALID,
    ATTRIBUTE_VALUE_INVALID = CKR_ATTRIBUTE_VALUE_INVALID,
    DATA_INVALID = CKR_DATA_INVALID,
    DATA_LEN_RANGE = CKR_DATA_LEN_RANGE,
    DEVICE_ERROR = CKR_DEVICE_ERROR,
    DEVICE_MEMORY = CKR_DEVICE_MEMORY,
    ENCRYPTED_DATA_INVALID = CKR_ENCRYPTED_DATA_INVALID,
    ENCRYPTED_DATA_LEN_RANGE = CKR_ENCRYPTED_DATA_LEN_RANGE,
    FUNCTION_NOT_SUPPORTED = CKR_FUNCTION_NOT_SUPPORTED,
    KEY_HANDLE_INVALID = CKR_KEY_HANDLE_INVALID,
    KEY_SIZE_RANGE = CKR_KEY_SIZE_RANGE,
    KEY_TYPE_INCONSISTENT = CKR_KEY_TYPE_INCONSISTENT,
    KEY_FUNCTION_NOT_PERMITTED = CKR_KEY_FUNCTION_NOT_PERMITTED,
    KEY_NOT_WRAPPABLE = CKR_KEY_NOT_WRAPPABLE,
    KEY_UNEXTRACTABLE = CKR_KEY_UNEXTRACTABLE,
    MECHANISM_INVALID = CKR_MECHANISM_INVALID,
    MECHANISM_PARAM_INVALID = CKR_MECHANISM_PARAM_INVALID,
    OBJECT_HANDLE_INVALID = CKR_OBJECT_HANDLE_INVALID,
    OPERATION_ACTIVE = CKR_OPERATION_ACTIVE,
    OPERATION_NOT_INITIALIZED = CKR_OPERATION_NOT_INITIALIZED,
    PIN_INCORRECT = CKR_PIN_INCORRECT,
    SESSION_CLOSED = CKR_SESSION_CLOSED,
    SESSION_HANDLE_INVALID = CKR_SESSION_HANDLE_INVALID,
    SESSION_READ_ONLY = CKR_SESSION_READ_ONLY,
    SIGNATURE_INVALID = CKR_SIGNATURE_INVALID,
    SIGNATURE_LEN_RANGE = CKR_SIGNATURE_LEN_RANGE,
    TEMPLATE_INCOMPLETE = CKR_TEMPLATE_INCOMPLETE,
    TEMPLATE_INCONSISTENT = CKR_TEMPLATE_INCONSISTENT,
    TOKEN_NOT_PRESENT = CKR_TOKEN_NOT_PRESENT,
    USER_ALREADY_LOGGED_IN = CKR_USER_ALREADY_LOGGED_IN,
    USER_NOT_LOGGED_IN = CKR_USER_NOT_LOGGED_IN,
    WRAPPED_KEY_INVALID = CKR_WRAPPED_KEY_INVALID,
    WRAPPING_KEY_HANDLE_INVALID = CKR_WRAPPING_KEY_HANDLE_INVALID,
    BUFFER_TOO_SMALL = CKR_BUFFER_TOO_SMALL,
    CRYPTOKI_NOT_INITIALIZED = CKR_CRYPTOKI_NOT_INITIALIZED,
    CRYPTOKI_ALREADY_INITIALIZED = CKR_CRYPTOKI_ALREADY_INITIALIZED,
});

impl fmt::Display for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:08X})", name, self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

/// Identifier of a slot as reported by the module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u64);

/// Handle of an open session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// Handle of an object held by the token
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u64);

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHandle(0x{:X})", self.0)
    }
}

/// Session opening flags (`CKF_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFlags(pub u64);

impl SessionFlags {
    pub const RW_SESSION: u64 = cryptoki_sys::CKF_RW_SESSION as u64;
    pub const SERIAL_SESSION: u64 = cryptoki_sys::CKF_SERIAL_SESSION as u64;

    pub fn read_write() -> Self {
        Self(Self::RW_SESSION | Self::SERIAL_SESSION)
    }

    pub fn read_only() -> Self {
        Self(Self::SERIAL_SESSION)
    }

    pub fn is_read_write(self) -> bool {
        self.0 & Self::RW_SESSION != 0
    }
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self::read_write()
    }
}

/// Object class (`CKO_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectClass(pub u64);

ck_constants!(ObjectClass {
    DATA = CKO_DATA,
    PUBLIC_KEY = CKO_PUBLIC_KEY,
    PRIVATE_KEY = CKO_PRIVATE_KEY,
    SECRET_KEY = CKO_SECRET_KEY,
});

/// Key type (`CKK_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyType(pub u64);

ck_constants!(KeyType {
    RSA = CKK_RSA,
    EC = CKK_EC,
    GENERIC_SECRET = CKK_GENERIC_SECRET,
    AES = CKK_AES,
    EC_EDWARDS = CKK_EC_EDWARDS,
    HKDF = CKK_HKDF,
});

/// Attribute type (`CKA_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeType(pub u64);

ck_constants!(AttributeType {
    CLASS = CKA_CLASS,
    TOKEN = CKA_TOKEN,
    PRIVATE = CKA_PRIVATE,
    LABEL = CKA_LABEL,
    VALUE = CKA_VALUE,
    KEY_TYPE = CKA_KEY_TYPE,
    ID = CKA_ID,
    SENSITIVE = CKA_SENSITIVE,
    ENCRYPT = CKA_ENCRYPT,
    DECRYPT = CKA_DECRYPT,
    WRAP = CKA_WRAP,
    UNWRAP = CKA_UNWRAP,
    SIGN = CKA_SIGN,
    VERIFY = CKA_VERIFY,
    DERIVE = CKA_DERIVE,
    MODULUS = CKA_MODULUS,
    MODULUS_BITS = CKA_MODULUS_BITS,
    PUBLIC_EXPONENT = CKA_PUBLIC_EXPONENT,
    PRIVATE_EXPONENT = CKA_PRIVATE_EXPONENT,
    PRIME_1 = CKA_PRIME_1,
    PRIME_2 = CKA_PRIME_2,
    VALUE_LEN = CKA_VALUE_LEN,
    EXTRACTABLE = CKA_EXTRACTABLE,
    EC_PARAMS = CKA_EC_PARAMS,
    EC_POINT = CKA_EC_POINT,
    VENDOR_DEFINED = CKA_VENDOR_DEFINED,
});

impl AttributeType {
    /// Vendor attribute carrying the WebCrypto algorithm name of a key
    pub const KEY_ALGORITHM: Self = Self(Self::VENDOR_DEFINED.0 | 0x5743_0001);

    pub fn is_vendor_defined(self) -> bool {
        self.0 & Self::VENDOR_DEFINED.0 != 0
    }
}

/// A single attribute of a token object
#[derive(Clone, PartialEq, Eq)]
pub enum Attribute {
    Class(ObjectClass),
    KeyType(KeyType),
    Token(bool),
    Private(bool),
    Sensitive(bool),
    Extractable(bool),
    Encrypt(bool),
    Decrypt(bool),
    Sign(bool),
    Verify(bool),
    Derive(bool),
    Wrap(bool),
    Unwrap(bool),
    Label(Vec<u8>),
    Id(Vec<u8>),
    Value(Vec<u8>),
    ValueLen(u64),
    ModulusBits(u64),
    Modulus(Vec<u8>),
    PublicExponent(Vec<u8>),
    PrivateExponent(Vec<u8>),
    Prime1(Vec<u8>),
    Prime2(Vec<u8>),
    EcParams(Vec<u8>),
    EcPoint(Vec<u8>),
    Vendor(AttributeType, Vec<u8>),
}

impl Attribute {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Attribute::Class(_) => AttributeType::CLASS,
            Attribute::KeyType(_) => AttributeType::KEY_TYPE,
            Attribute::Token(_) => AttributeType::TOKEN,
            Attribute::Private(_) => AttributeType::PRIVATE,
            Attribute::Sensitive(_) => AttributeType::SENSITIVE,
            Attribute::Extractable(_) => AttributeType::EXTRACTABLE,
            Attribute::Encrypt(_) => AttributeType::ENCRYPT,
            Attribute::Decrypt(_) => AttributeType::DECRYPT,
            Attribute::Sign(_) => AttributeType::SIGN,
            Attribute::Verify(_) => AttributeType::VERIFY,
            Attribute::Derive(_) => AttributeType::DERIVE,
            Attribute::Wrap(_) => AttributeType::WRAP,
            Attribute::Unwrap(_) => AttributeType::UNWRAP,
            Attribute::Label(_) => AttributeType::LABEL,
            Attribute::Id(_) => AttributeType::ID,
            Attribute::Value(_) => AttributeType::VALUE,
            Attribute::ValueLen(_) => AttributeType::VALUE_LEN,
            Attribute::ModulusBits(_) => AttributeType::MODULUS_BITS,
            Attribute::Modulus(_) => AttributeType::MODULUS,
            Attribute::PublicExponent(_) => AttributeType::PUBLIC_EXPONENT,
            Attribute::PrivateExponent(_) => AttributeType::PRIVATE_EXPONENT,
            Attribute::Prime1(_) => AttributeType::PRIME_1,
            Attribute::Prime2(_) => AttributeType::PRIME_2,
            Attribute::EcParams(_) => AttributeType::EC_PARAMS,
            Attribute::EcPoint(_) => AttributeType::EC_POINT,
            Attribute::Vendor(kind, _) => *kind,
        }
    }

    /// Whether this attribute holds secret key material
    pub fn is_sensitive_material(&self) -> bool {
        matches!(
            self,
            Attribute::Value(_)
                | Attribute::PrivateExponent(_)
                | Attribute::Prime1(_)
                | Attribute::Prime2(_)
        )
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sensitive_material() {
            return write!(f, "Attribute({:?}, [REDACTED])", self.attribute_type());
        }
        match self {
            Attribute::Class(class) => write!(f, "Class({:?})", class),
            Attribute::KeyType(key_type) => write!(f, "KeyType({:?})", key_type),
            Attribute::Label(label) => write!(f, "Label({:?})", String::from_utf8_lossy(label)),
            Attribute::Id(id) => write!(f, "Id({})", hex::encode(id)),
            Attribute::Modulus(n) => write!(f, "Modulus({} bytes)", n.len()),
            Attribute::EcPoint(point) => write!(f, "EcPoint({})", hex::encode(point)),
            Attribute::EcParams(params) => write!(f, "EcParams({})", hex::encode(params)),
            Attribute::PublicExponent(e) => write!(f, "PublicExponent({})", hex::encode(e)),
            Attribute::Vendor(kind, value) => write!(f, "Vendor({:?}, {})", kind, hex::encode(value)),
            Attribute::ValueLen(len) => write!(f, "ValueLen({})", len),
            Attribute::ModulusBits(bits) => write!(f, "ModulusBits({})", bits),
            other => write!(f, "{:?}={}", other.attribute_type(), other.flag().unwrap_or_default()),
        }
    }
}

impl Attribute {
    /// Boolean value of a flag attribute
    pub fn flag(&self) -> Option<bool> {
        match self {
            Attribute::Token(v)
            | Attribute::Private(v)
            | Attribute::Sensitive(v)
            | Attribute::Extractable(v)
            | Attribute::Encrypt(v)
            | Attribute::Decrypt(v)
            | Attribute::Sign(v)
            | Attribute::Verify(v)
            | Attribute::Derive(v)
            | Attribute::Wrap(v)
            | Attribute::Unwrap(v) => Some(*v),
            _ => None,
        }
    }
}

/// Lookup helpers over an attribute list
pub trait AttributeList {
    fn find_attribute(&self, kind: AttributeType) -> Option<&Attribute>;

    fn flag(&self, kind: AttributeType) -> Option<bool> {
        self.find_attribute(kind).and_then(Attribute::flag)
    }

    fn bytes(&self, kind: AttributeType) -> Option<&[u8]> {
        match self.find_attribute(kind)? {
            Attribute::Label(v)
            | Attribute::Id(v)
            | Attribute::Value(v)
            | Attribute::Modulus(v)
            | Attribute::PublicExponent(v)
            | Attribute::PrivateExponent(v)
            | Attribute::Prime1(v)
            | Attribute::Prime2(v)
            | Attribute::EcParams(v)
            | Attribute::EcPoint(v)
            | Attribute::Vendor(_, v) => Some(v.as_slice()),
            _ => None,
        }
    }

    fn ulong(&self, kind: AttributeType) -> Option<u64> {
        match self.find_attribute(kind)? {
            Attribute::ValueLen(v) | Attribute::ModulusBits(v) => Some(*v),
            _ => None,
        }
    }

    fn object_class(&self) -> Option<ObjectClass> {
        match self.find_attribute(AttributeType::CLASS)? {
            Attribute::Class(class) => Some(*class),
            _ => None,
        }
    }

    fn key_type(&self) -> Option<KeyType> {
        match self.find_attribute(AttributeType::KEY_TYPE)? {
            Attribute::KeyType(key_type) => Some(*key_type),
            _ => None,
        }
    }
}

impl AttributeList for [Attribute] {
    fn find_attribute(&self, kind: AttributeType) -> Option<&Attribute> {
        self.iter().find(|attr| attr.attribute_type() == kind)
    }
}

impl AttributeList for Vec<Attribute> {
    fn find_attribute(&self, kind: AttributeType) -> Option<&Attribute> {
        self.as_slice().find_attribute(kind)
    }
}
