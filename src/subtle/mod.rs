//! WebCrypto-shaped operation surface
//!
//! Every operation follows the same path: check the key's usages, resolve
//! the mechanism, then run all token calls for the request inside one
//! exclusive section of the session. Nothing reaches the token before the
//! first two steps pass.

mod cipher;
mod derive;
mod digest;
mod import_export;
mod keygen;
mod multipart;
mod signature;
mod wrap;

use crate::error::{CryptoError, P11Result};
use crate::logic::{MechanismMapper, Purpose};
use crate::model::{AlgorithmDescriptor, CryptoKey, KeyUsage, Mechanism};
use crate::ports::TokenModule;
use crate::session::SessionManager;

pub use multipart::CHUNK_SIZE;

/// Cryptographic operations on keys held by the token
pub struct SubtleCrypto<'a, M: TokenModule> {
    sessions: &'a SessionManager<M>,
}

impl<'a, M: TokenModule> SubtleCrypto<'a, M> {
    pub fn new(sessions: &'a SessionManager<M>) -> Self {
        Self { sessions }
    }

    fn mapper(&self) -> &MechanismMapper {
        self.sessions.mapper()
    }

    /// Usage check followed by mechanism resolution
    fn prepare(
        &self,
        purpose: Purpose,
        algorithm: &AlgorithmDescriptor,
        key: &CryptoKey,
    ) -> P11Result<Mechanism> {
        self.sessions.check_owner(key)?;
        if let Some(usage) = purpose.required_usage() {
            require_usage(key, usage)?;
        }
        self.mapper().resolve(purpose, algorithm, Some(key))
    }
}

fn require_usage(key: &CryptoKey, usage: KeyUsage) -> P11Result<()> {
    if key.usages().contains(usage) {
        Ok(())
    } else {
        Err(CryptoError::InvalidKeyUsage {
            usage: format!("{} on key {:?} ({})", usage, key.handle(), key.usages()),
        }
        .into())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use crate::adapters::soft_token::{SoftModule, SoftModuleLoader};
    use crate::ports::{ModuleLoader, SessionFlags};
    use crate::session::SessionManager;

    pub(crate) fn logged_in(loader: &SoftModuleLoader) -> SessionManager<SoftModule> {
        let sessions = opened(loader);
        sessions.login(&"1234".parse().unwrap()).unwrap();
        sessions
    }

    pub(crate) fn opened(loader: &SoftModuleLoader) -> SessionManager<SoftModule> {
        let module = loader.load(Path::new("soft"), "soft").unwrap();
        let sessions = SessionManager::new(module, "soft").unwrap();
        sessions.open(0, SessionFlags::read_write()).unwrap();
        sessions
    }
}
