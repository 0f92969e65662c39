//! Module loading and slot access

use std::path::Path;

use super::{SessionFlags, SlotId, TokenResult, TokenSession};

/// Capability to load a token provider
///
/// A loader knows how to turn a library path into a module. The native
/// adapter would `dlopen` the library; the software token ignores the path.
pub trait ModuleLoader {
    type Module: TokenModule;

    /// Load the provider at `library` under the logical `name`
    ///
    /// # Errors
    ///
    /// Returns a fault if the library cannot be found or is not a token
    /// provider.
    fn load(&self, library: &Path, name: &str) -> TokenResult<Self::Module>;
}

/// A loaded token provider (`C_Initialize` .. `C_Finalize`)
pub trait TokenModule: Send {
    type Session: TokenSession;

    /// `C_Initialize`
    fn initialize(&mut self) -> TokenResult<()>;

    /// Slots with a token present, in module order
    fn slots(&self) -> TokenResult<Vec<SlotId>>;

    /// `C_OpenSession`
    fn open_session(&mut self, slot: SlotId, flags: SessionFlags) -> TokenResult<Self::Session>;

    /// `C_Finalize`
    fn finalize(&mut self) -> TokenResult<()>;
}
