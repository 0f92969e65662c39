//! Session lifecycle
//!
//! One [`SessionManager`] owns one token module and at most one session on
//! it. The session moves through `Unopened -> Open -> LoggedIn -> Closed`;
//! `Closed` is terminal. All token work goes through
//! [`SessionManager::with_session`], which holds the session lock for the
//! whole closure so a multi-part operation can never interleave with another
//! call on the same session.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{KeyManagementError, P11Error, P11Result, TokenError};
use crate::logic::{MechanismMapper, VendorDefinition};
use crate::model::{CryptoKey, KeyOrigin, Pin};
use crate::ports::{SessionControl, SessionFlags, SessionHandle, SlotId, TokenModule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unopened,
    Open,
    LoggedIn,
    Closed,
}

struct Inner<M: TokenModule> {
    module: M,
    initialized: bool,
    slot: Option<SlotId>,
    session: Option<M::Session>,
    state: SessionState,
}

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Owner of the token module and its single session
pub struct SessionManager<M: TokenModule> {
    id: u64,
    name: String,
    mapper: MechanismMapper,
    inner: Mutex<Inner<M>>,
}

impl<M: TokenModule> SessionManager<M> {
    /// Initialize `module` and wrap it
    ///
    /// # Errors
    ///
    /// `ModuleLoad` if the module refuses to initialize.
    pub fn new(mut module: M, name: &str) -> P11Result<Self> {
        module.initialize().map_err(|fault| TokenError::ModuleLoad {
            name: name.to_string(),
            reason: fault.to_string(),
        })?;
        let id = NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed);
        info!("Initialized token module {} as manager {}", name, id);
        Ok(Self {
            id,
            name: name.to_string(),
            mapper: MechanismMapper::default(),
            inner: Mutex::new(Inner {
                module,
                initialized: true,
                slot: None,
                session: None,
                state: SessionState::Unopened,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity stamped into every key obtained through this manager
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn origin(&self, session: SessionHandle) -> KeyOrigin {
        KeyOrigin::new(self.id, session)
    }

    /// Refuse keys whose handles were issued to another manager
    ///
    /// Handles die with the module instance that issued them and may be
    /// reused by another one, so a foreign key is treated as missing.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` if `key` was not obtained through this manager.
    pub fn check_owner(&self, key: &CryptoKey) -> P11Result<()> {
        if key.origin().manager == self.id {
            return Ok(());
        }
        warn!(
            "Key {:?} belongs to manager {}, not {} ({})",
            key.handle(),
            key.origin().manager,
            self.id,
            self.name
        );
        Err(KeyManagementError::KeyNotFound {
            handle: format!("{:?}", key.handle()),
        }
        .into())
    }

    pub fn mapper(&self) -> &MechanismMapper {
        &self.mapper
    }

    /// Make vendor mechanisms resolvable by name
    ///
    /// Taking `&mut self` limits registration to the time before the
    /// manager is shared. Returns the number of names added.
    pub fn register_vendor_mechanism(&mut self, definition: &VendorDefinition) -> usize {
        let added = self.mapper.registry_mut().register(definition);
        info!("Registered {} vendor mechanisms for {}", added, self.name);
        added
    }

    /// Open the session on the slot at `slot_index`
    ///
    /// Opening an already open session is a no-op.
    ///
    /// # Errors
    ///
    /// - `SlotNotFound` if the module has no slot at `slot_index`
    /// - `SessionOpen` if the token refuses the session
    /// - `SessionClosed` after [`close`](Self::close)
    pub fn open(&self, slot_index: usize, flags: SessionFlags) -> P11Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Unopened => {}
            SessionState::Open | SessionState::LoggedIn => {
                debug!("Session on {} already open", self.name);
                return Ok(());
            }
            SessionState::Closed => return Err(TokenError::SessionClosed.into()),
        }

        let slots = inner
            .module
            .slots()
            .map_err(|fault| TokenError::SessionOpen { rv: fault.rv })?;
        let slot = *slots
            .get(slot_index)
            .ok_or(TokenError::SlotNotFound { index: slot_index })?;
        let session = inner
            .module
            .open_session(slot, flags)
            .map_err(|fault| TokenError::SessionOpen { rv: fault.rv })?;

        info!(
            "Opened session {:?} on slot {:?} ({})",
            session.handle(),
            slot,
            if flags.is_read_write() { "rw" } else { "ro" }
        );
        inner.slot = Some(slot);
        inner.session = Some(session);
        inner.state = SessionState::Open;
        Ok(())
    }

    /// Log the normal user in
    ///
    /// # Errors
    ///
    /// - `LoginFailure` if the PIN is rejected or the session is already
    ///   logged in
    /// - `SessionClosed` if no session is open
    pub fn login(&self, pin: &Pin) -> P11Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Open => {}
            SessionState::LoggedIn => {
                return Err(TokenError::LoginFailure {
                    reason: "session is already logged in".to_string(),
                }
                .into())
            }
            SessionState::Unopened | SessionState::Closed => {
                return Err(TokenError::SessionClosed.into())
            }
        }
        let session = inner.session.as_mut().ok_or(TokenError::SessionClosed)?;
        session
            .login(pin.as_bytes())
            .map_err(|fault| TokenError::LoginFailure {
                reason: fault.to_string(),
            })?;
        inner.state = SessionState::LoggedIn;
        info!("Logged in to {}", self.name);
        Ok(())
    }

    /// # Errors
    ///
    /// `NotAuthenticated` if the session is not logged in.
    pub fn logout(&self) -> P11Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::LoggedIn => {}
            SessionState::Open => return Err(TokenError::NotAuthenticated.into()),
            SessionState::Unopened | SessionState::Closed => {
                return Err(TokenError::SessionClosed.into())
            }
        }
        let session = inner.session.as_mut().ok_or(TokenError::SessionClosed)?;
        session.logout()?;
        inner.state = SessionState::Open;
        info!("Logged out of {}", self.name);
        Ok(())
    }

    /// Tear everything down: logout, close the session, finalize the module
    ///
    /// Every step runs even when an earlier one fails. Failures are logged
    /// and the first one is returned. Closing twice is a no-op.
    pub fn close(&self) -> P11Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            debug!("Session manager for {} already closed", self.name);
            return Ok(());
        }

        let mut first_error: Option<P11Error> = None;
        let mut record = |step: &str, err: P11Error| {
            warn!("Teardown step {} of {} failed: {}", step, self.name, err);
            first_error.get_or_insert(err);
        };

        let logged_in = inner.state == SessionState::LoggedIn;
        if let Some(mut session) = inner.session.take() {
            if logged_in {
                if let Err(fault) = session.logout() {
                    record("logout", fault.into());
                }
            }
            if let Err(fault) = session.close() {
                record("close session", fault.into());
            }
        }
        if inner.initialized {
            inner.initialized = false;
            if let Err(fault) = inner.module.finalize() {
                record("finalize", fault.into());
            }
        }
        inner.state = SessionState::Closed;
        info!("Closed session manager for {}", self.name);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run `f` with exclusive access to the open session
    ///
    /// # Errors
    ///
    /// `SessionClosed` if no session is open, else whatever `f` returns.
    pub fn with_session<T>(
        &self,
        f: impl FnOnce(&mut M::Session) -> P11Result<T>,
    ) -> P11Result<T> {
        self.with_session_as(false, f)
    }

    /// Like [`with_session`](Self::with_session), for operations on
    /// private objects
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` if the session is open but not logged in.
    pub fn with_authenticated_session<T>(
        &self,
        f: impl FnOnce(&mut M::Session) -> P11Result<T>,
    ) -> P11Result<T> {
        self.with_session_as(true, f)
    }

    pub(crate) fn with_session_as<T>(
        &self,
        requires_login: bool,
        f: impl FnOnce(&mut M::Session) -> P11Result<T>,
    ) -> P11Result<T> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::LoggedIn => {}
            SessionState::Open if !requires_login => {}
            SessionState::Open => return Err(TokenError::NotAuthenticated.into()),
            SessionState::Unopened | SessionState::Closed => {
                return Err(TokenError::SessionClosed.into())
            }
        }
        let session = inner.session.as_mut().ok_or(TokenError::SessionClosed)?;
        f(session)
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn slot(&self) -> Option<SlotId> {
        self.inner.lock().slot
    }

    pub fn session_handle(&self) -> Option<SessionHandle> {
        self.inner.lock().session.as_ref().map(|session| session.handle())
    }
}

impl<M: TokenModule> std::fmt::Debug for SessionManager<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::adapters::soft_token::{FaultPoint, SoftModule, SoftModuleLoader};
    use crate::model::MechanismType;
    use crate::ports::{ModuleLoader, RandomGenerator, ReturnValue};

    fn manager(loader: &SoftModuleLoader) -> SessionManager<SoftModule> {
        let module = loader.load(Path::new("soft"), "soft").unwrap();
        SessionManager::new(module, "soft").unwrap()
    }

    #[test]
    fn test_state_transitions() {
        let loader = SoftModuleLoader::new();
        let sessions = manager(&loader);
        assert_eq!(sessions.state(), SessionState::Unopened);
        assert!(sessions.session_handle().is_none());

        sessions.open(0, SessionFlags::read_write()).unwrap();
        assert_eq!(sessions.state(), SessionState::Open);
        assert!(sessions.slot().is_some());

        sessions.login(&"1234".parse().unwrap()).unwrap();
        assert_eq!(sessions.state(), SessionState::LoggedIn);

        sessions.logout().unwrap();
        assert_eq!(sessions.state(), SessionState::Open);

        sessions.close().unwrap();
        assert_eq!(sessions.state(), SessionState::Closed);
        assert_eq!(loader.open_sessions(), 0);
    }

    #[test]
    fn test_module_load_failure() {
        let loader = SoftModuleLoader::new();
        loader.fail(FaultPoint::Initialize, ReturnValue::GENERAL_ERROR);
        let module = loader.load(Path::new("soft"), "soft").unwrap();
        let err = SessionManager::new(module, "soft").unwrap_err();
        assert!(matches!(err, P11Error::Token(TokenError::ModuleLoad { .. })));
    }

    #[test]
    fn test_slot_not_found() {
        let loader = SoftModuleLoader::new();
        let sessions = manager(&loader);
        let err = sessions.open(4, SessionFlags::read_write()).unwrap_err();
        assert!(matches!(
            err,
            P11Error::Token(TokenError::SlotNotFound { index: 4 })
        ));
    }

    #[test]
    fn test_wrong_pin_is_login_failure() {
        let loader = SoftModuleLoader::new();
        let sessions = manager(&loader);
        sessions.open(0, SessionFlags::read_write()).unwrap();
        let err = sessions.login(&"9999".parse().unwrap()).unwrap_err();
        assert!(matches!(err, P11Error::Token(TokenError::LoginFailure { .. })));
        assert_eq!(sessions.state(), SessionState::Open);
    }

    #[test]
    fn test_authenticated_section_requires_login() {
        let loader = SoftModuleLoader::new();
        let sessions = manager(&loader);
        sessions.open(0, SessionFlags::read_write()).unwrap();

        let err = sessions
            .with_authenticated_session(|_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, P11Error::Token(TokenError::NotAuthenticated)));

        let bytes = sessions
            .with_session(|session| Ok(session.generate_random(8)?))
            .unwrap();
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn test_closed_session_rejects_work() {
        let loader = SoftModuleLoader::new();
        let sessions = manager(&loader);
        let err = sessions.with_session(|_| Ok(())).unwrap_err();
        assert!(matches!(err, P11Error::Token(TokenError::SessionClosed)));

        sessions.close().unwrap();
        let err = sessions.open(0, SessionFlags::read_write()).unwrap_err();
        assert!(matches!(err, P11Error::Token(TokenError::SessionClosed)));
    }

    #[test]
    fn test_close_runs_every_step_and_reports_first_failure() {
        let loader = SoftModuleLoader::new();
        let sessions = manager(&loader);
        sessions.open(0, SessionFlags::read_write()).unwrap();
        sessions.login(&"1234".parse().unwrap()).unwrap();

        loader.fail(FaultPoint::Logout, ReturnValue::DEVICE_ERROR);
        loader.fail(FaultPoint::Finalize, ReturnValue::GENERAL_ERROR);
        let err = sessions.close().unwrap_err();
        assert_eq!(err.return_value(), Some(ReturnValue::DEVICE_ERROR));
        assert_eq!(sessions.state(), SessionState::Closed);
        assert_eq!(loader.open_sessions(), 0);

        let calls = loader.call_count();
        sessions.close().unwrap();
        assert_eq!(loader.call_count(), calls);
    }

    #[test]
    fn test_close_without_session() {
        let loader = SoftModuleLoader::new();
        let sessions = manager(&loader);
        sessions.close().unwrap();
        assert_eq!(sessions.state(), SessionState::Closed);
    }

    #[test]
    fn test_vendor_registration() {
        let loader = SoftModuleLoader::new();
        let mut sessions = manager(&loader);
        let definition = VendorDefinition::new([
            ("CKM_ACME_SIGN", MechanismType(0x8000_0101)),
            ("CKM_SHA256", MechanismType(0x8000_0102)),
        ]);
        assert_eq!(sessions.register_vendor_mechanism(&definition), 1);
        assert_eq!(
            sessions.mapper().registry().get("ckm_acme_sign"),
            Some(MechanismType(0x8000_0101))
        );
        assert_eq!(
            sessions.mapper().registry().get("CKM_SHA256"),
            Some(MechanismType::SHA256)
        );
    }
}
