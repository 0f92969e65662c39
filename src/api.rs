//! Entry point: one configured token session and the operations on it

use tracing::{info, warn};

use crate::config::CryptoConfig;
use crate::error::{P11Result, TokenError};
use crate::key_store::KeyStore;
use crate::logic::VendorDefinition;
use crate::ports::{ModuleLoader, TokenModule};
use crate::random::RandomSource;
use crate::session::SessionManager;
use crate::subtle::SubtleCrypto;

pub use crate::model::*;

/// A token module with one open session, ready for crypto calls
///
/// Share it across threads behind an `Arc`; calls on the same instance are
/// serialized on its session. Dropping it closes the session and finalizes
/// the module.
pub struct P11Crypto<M: TokenModule> {
    sessions: SessionManager<M>,
}

impl<M: TokenModule> P11Crypto<M> {
    /// Load, initialize, register vendor mechanisms, open the session and
    /// log in, in that order
    ///
    /// # Arguments
    ///
    /// * `loader` - Turns `config.library` into a token module
    /// * `config` - Slot, session flags, PIN and vendor definitions
    ///
    /// # Errors
    ///
    /// Any step failing tears down what the earlier steps built and returns
    /// that step's error:
    /// - `Config`, `Pin` or `VendorDefinition` before the module is loaded
    /// - `ModuleLoad` if the library cannot be loaded or initialized
    /// - `SlotNotFound` or `SessionOpen` when opening the session
    /// - `LoginFailure` for a rejected PIN
    pub fn open<L>(loader: &L, config: &CryptoConfig) -> P11Result<Self>
    where
        L: ModuleLoader<Module = M>,
    {
        let pin = config.login_pin()?;
        let vendors = config
            .vendors
            .iter()
            .map(|path| VendorDefinition::from_file(path))
            .collect::<P11Result<Vec<_>>>()?;

        let module = loader
            .load(&config.library, &config.name)
            .map_err(|fault| TokenError::ModuleLoad {
                name: config.name.clone(),
                reason: fault.to_string(),
            })?;
        let mut sessions = SessionManager::new(module, &config.name)?;
        for definition in &vendors {
            sessions.register_vendor_mechanism(definition);
        }

        // from here on a failed step is undone by Drop
        let crypto = Self { sessions };
        crypto.sessions.open(config.slot, config.flags())?;
        if let Some(pin) = &pin {
            crypto.sessions.login(pin)?;
        }
        info!(
            "Token {} ready on slot index {} ({})",
            config.name,
            config.slot,
            if pin.is_some() { "logged in" } else { "public session" }
        );
        Ok(crypto)
    }

    pub fn subtle(&self) -> SubtleCrypto<'_, M> {
        SubtleCrypto::new(&self.sessions)
    }

    pub fn key_store(&self) -> KeyStore<'_, M> {
        KeyStore::new(&self.sessions)
    }

    pub fn get_random_values(&self, len: usize) -> P11Result<Vec<u8>> {
        RandomSource::new(&self.sessions).get_random_values(len)
    }

    pub fn session(&self) -> &SessionManager<M> {
        &self.sessions
    }

    /// Log out, close the session and finalize the module
    ///
    /// Idempotent; see [`SessionManager::close`].
    pub fn close(&self) -> P11Result<()> {
        self.sessions.close()
    }
}

impl<M: TokenModule> Drop for P11Crypto<M> {
    fn drop(&mut self) {
        if let Err(err) = self.sessions.close() {
            warn!("Closing {} on drop failed: {}", self.sessions.name(), err);
        }
    }
}
