//! Adapters - concrete implementations of ports (traits)

#[cfg(feature = "cryptoki")]
mod pkcs11;

#[cfg(any(test, feature = "soft-token"))]
pub mod soft_token;

// Re-export for convenience
#[cfg(feature = "cryptoki")]
pub use pkcs11::{NativeModule, NativeModuleLoader, NativeSession};
#[cfg(any(test, feature = "soft-token"))]
pub use soft_token::{SoftModule, SoftModuleLoader, SoftSlot};
