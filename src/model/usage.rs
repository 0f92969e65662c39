use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Operation a key may take part in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyUsage {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    DeriveKey,
    DeriveBits,
    WrapKey,
    UnwrapKey,
}

impl KeyUsage {
    pub const ALL: [KeyUsage; 8] = [
        KeyUsage::Encrypt,
        KeyUsage::Decrypt,
        KeyUsage::Sign,
        KeyUsage::Verify,
        KeyUsage::DeriveKey,
        KeyUsage::DeriveBits,
        KeyUsage::WrapKey,
        KeyUsage::UnwrapKey,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KeyUsage::Encrypt => "encrypt",
            KeyUsage::Decrypt => "decrypt",
            KeyUsage::Sign => "sign",
            KeyUsage::Verify => "verify",
            KeyUsage::DeriveKey => "deriveKey",
            KeyUsage::DeriveBits => "deriveBits",
            KeyUsage::WrapKey => "wrapKey",
            KeyUsage::UnwrapKey => "unwrapKey",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyUsage {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyUsage::ALL
            .iter()
            .copied()
            .find(|usage| usage.as_str() == s)
            .ok_or_else(|| UsageError::Unknown {
                usage: s.to_string(),
            })
    }
}

/// Set of key usages
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyUsages(u8);

impl KeyUsages {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        KeyUsage::ALL.iter().copied().collect()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, usage: KeyUsage) -> bool {
        self.0 & usage.bit() != 0
    }

    pub fn with(self, usage: KeyUsage) -> Self {
        Self(self.0 | usage.bit())
    }

    pub fn insert(&mut self, usage: KeyUsage) {
        self.0 |= usage.bit();
    }

    pub fn is_subset(self, other: KeyUsages) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn intersection(self, other: KeyUsages) -> Self {
        Self(self.0 & other.0)
    }

    pub fn union(self, other: KeyUsages) -> Self {
        Self(self.0 | other.0)
    }

    pub fn difference(self, other: KeyUsages) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = KeyUsage> {
        KeyUsage::ALL
            .into_iter()
            .filter(move |usage| self.contains(*usage))
    }

    /// Parse a list of WebCrypto usage names
    pub fn parse<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, UsageError> {
        names
            .into_iter()
            .map(KeyUsage::from_str)
            .collect::<Result<KeyUsages, _>>()
    }
}

impl FromIterator<KeyUsage> for KeyUsages {
    fn from_iter<I: IntoIterator<Item = KeyUsage>>(iter: I) -> Self {
        iter.into_iter()
            .fold(KeyUsages::empty(), |set, usage| set.with(usage))
    }
}

impl<const N: usize> From<[KeyUsage; N]> for KeyUsages {
    fn from(usages: [KeyUsage; N]) -> Self {
        usages.into_iter().collect()
    }
}

impl fmt::Debug for KeyUsages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(KeyUsage::as_str)).finish()
    }
}

impl fmt::Display for KeyUsages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(KeyUsage::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("Unknown key usage: {usage}")]
    Unknown { usage: String },
}
