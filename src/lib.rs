//! WebCrypto-style operations backed by a PKCS#11 token
//!
//! [`P11Crypto`] loads a token module, opens one session on a configured
//! slot and hands out [`SubtleCrypto`], [`KeyStore`] and random values
//! working on that session. Keys never leave the token unless they are
//! extractable and exported.

pub mod adapters;
pub mod api;
pub mod config;
pub mod error;
pub mod key_store;
mod logic;
pub mod model;
pub mod ports;
pub mod random;
pub mod session;
pub mod subtle;

// Re-export commonly used types
pub use error::{P11Error, P11Result};

// Re-export public API
pub use api::P11Crypto;
pub use config::CryptoConfig;
pub use key_store::{KeyCriteria, KeyStore};
pub use logic::{MechanismMapper, MechanismRegistry, Purpose, VendorDefinition};
pub use random::RandomSource;
pub use session::{SessionManager, SessionState};
pub use subtle::SubtleCrypto;
