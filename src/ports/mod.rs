//! Ports (traits) for token operations
//!
//! These traits define the capabilities required from a PKCS#11 token.
//! They represent ports in hexagonal architecture - the core depends on
//! these abstractions, not concrete implementations.
//!
//! Every call returns a [`TokenFault`] on failure; the core classifies it
//! into a [`P11Error`](crate::error::P11Error) at the boundary.

mod crypto_ops;
mod module;
mod object_manager;
mod random_generator;
mod session_control;
mod types;


pub use crypto_ops::{CryptoOps, OperationKind};
pub use module::{ModuleLoader, TokenModule};
pub use object_manager::ObjectManager;
pub use random_generator::RandomGenerator;
pub use session_control::SessionControl;
pub use types::{
    Attribute, AttributeList, AttributeType, KeyType, ObjectClass, ObjectHandle, ReturnValue,
    SessionFlags, SessionHandle, SlotId, TokenFault, TokenResult,
};
pub(crate) use types::ck_constants;

/// Combined trait for all session operations
///
/// This trait combines all capabilities into a single interface.
/// A session handle of a token module implements this.
pub trait TokenSession:
    SessionControl + ObjectManager + CryptoOps + RandomGenerator + Send
{
}

// Blanket implementation for types that implement all operation traits
impl<T> TokenSession for T where
    T: SessionControl + ObjectManager + CryptoOps + RandomGenerator + Send
{
}
