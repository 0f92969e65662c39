//! In-process software token
//!
//! Implements the token ports with an in-memory object store and pure-Rust
//! crypto. It behaves like a PKCS#11 module as far as the core can observe:
//! sessions, login state, private and sensitive objects, read-only
//! sessions, one active operation per session and `CKR_*` return values.
//!
//! Token objects are shared by every module loaded from the same
//! [`SoftModuleLoader`]; session objects die with their session. Faults can
//! be injected at the module and session entry points.

mod mechanisms;
mod store;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use self::mechanisms::{Direction, MechResult};
use self::store::{ObjectStore, SoftObject};
use crate::logic::encoding::{decode_pkcs8, encode_pkcs8};
use crate::model::Mechanism;
use crate::ports::{
    Attribute, AttributeList, AttributeType, CryptoOps, ModuleLoader, ObjectClass, ObjectHandle,
    ObjectManager, OperationKind, RandomGenerator, ReturnValue, SessionControl, SessionFlags,
    SessionHandle, SlotId, TokenFault, TokenModule, TokenResult,
};

const FIRST_SLOT_ID: u64 = 0x10;

/// Configuration of one slot of the software token
#[derive(Clone)]
pub struct SoftSlot {
    pub label: String,
    pub user_pin: Vec<u8>,
    /// Maximum number of token objects, unlimited when `None`
    pub capacity: Option<usize>,
}

impl SoftSlot {
    pub fn new(label: impl Into<String>, user_pin: &str) -> Self {
        Self {
            label: label.into(),
            user_pin: user_pin.as_bytes().to_vec(),
            capacity: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

impl std::fmt::Debug for SoftSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftSlot")
            .field("label", &self.label)
            .field("user_pin", &"[REDACTED]")
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Entry points a fault can be injected at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Load,
    Initialize,
    OpenSession,
    Login,
    Logout,
    CloseSession,
    GetAttributes,
    Finalize,
}

#[derive(Debug)]
struct SlotState {
    config: SoftSlot,
    objects: ObjectStore,
}

#[derive(Debug)]
struct Shared {
    slots: Vec<Mutex<SlotState>>,
    faults: Mutex<HashMap<FaultPoint, ReturnValue>>,
    calls: AtomicUsize,
    open_sessions: AtomicUsize,
    next_handle: AtomicU64,
    next_session: AtomicU64,
}

impl Shared {
    /// Count a token call and report an injected fault for it
    fn enter(&self, function: &'static str, point: Option<FaultPoint>) -> TokenResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = point.and_then(|point| self.faults.lock().get(&point).copied());
        match injected {
            Some(rv) => {
                debug!("Injected fault {} for {}", rv, function);
                Err(TokenFault::new(function, rv))
            }
            None => Ok(()),
        }
    }

    fn allocate_handle(&self) -> ObjectHandle {
        ObjectHandle(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }
}

/// Loader handing out software token modules that share one token state
#[derive(Debug, Clone)]
pub struct SoftModuleLoader {
    shared: Arc<Shared>,
}

impl SoftModuleLoader {
    /// One slot labelled `soft-token` with user PIN `1234`
    pub fn new() -> Self {
        Self::with_slots(vec![SoftSlot::new("soft-token", "1234")])
    }

    pub fn with_slots(slots: Vec<SoftSlot>) -> Self {
        let slots = slots
            .into_iter()
            .map(|config| {
                Mutex::new(SlotState {
                    config,
                    objects: ObjectStore::default(),
                })
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                slots,
                faults: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
                open_sessions: AtomicUsize::new(0),
                next_handle: AtomicU64::new(1),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Make every later call through `point` fail with `rv`
    pub fn fail(&self, point: FaultPoint, rv: ReturnValue) {
        self.shared.faults.lock().insert(point, rv);
    }

    pub fn clear_faults(&self) {
        self.shared.faults.lock().clear();
    }

    /// Number of token calls made so far, across all modules and sessions
    pub fn call_count(&self) -> usize {
        self.shared.calls.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }

    /// Number of persistent objects in the slot at `index`
    pub fn token_object_count(&self, index: usize) -> usize {
        self.shared
            .slots
            .get(index)
            .map(|slot| slot.lock().objects.len())
            .unwrap_or(0)
    }
}

impl Default for SoftModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLoader for SoftModuleLoader {
    type Module = SoftModule;

    fn load(&self, library: &Path, name: &str) -> TokenResult<SoftModule> {
        self.shared.enter("C_GetFunctionList", Some(FaultPoint::Load))?;
        if library.as_os_str().is_empty() {
            return Err(TokenFault::new("C_GetFunctionList", ReturnValue::ARGUMENTS_BAD));
        }
        debug!("Loaded software token {} from {}", name, library.display());
        Ok(SoftModule {
            shared: Arc::clone(&self.shared),
            live: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// A loaded software token module
#[derive(Debug)]
pub struct SoftModule {
    shared: Arc<Shared>,
    live: Arc<AtomicBool>,
}

impl SoftModule {
    fn require_live(&self, function: &'static str) -> TokenResult<()> {
        if self.live.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TokenFault::new(function, ReturnValue::CRYPTOKI_NOT_INITIALIZED))
        }
    }
}

impl TokenModule for SoftModule {
    type Session = SoftSession;

    fn initialize(&mut self) -> TokenResult<()> {
        self.shared.enter("C_Initialize", Some(FaultPoint::Initialize))?;
        if self.live.swap(true, Ordering::SeqCst) {
            return Err(TokenFault::new(
                "C_Initialize",
                ReturnValue::CRYPTOKI_ALREADY_INITIALIZED,
            ));
        }
        Ok(())
    }

    fn slots(&self) -> TokenResult<Vec<SlotId>> {
        self.shared.enter("C_GetSlotList", None)?;
        self.require_live("C_GetSlotList")?;
        Ok((0..self.shared.slots.len())
            .map(|index| SlotId(FIRST_SLOT_ID + index as u64))
            .collect())
    }

    fn open_session(&mut self, slot: SlotId, flags: SessionFlags) -> TokenResult<SoftSession> {
        self.shared.enter("C_OpenSession", Some(FaultPoint::OpenSession))?;
        self.require_live("C_OpenSession")?;
        let slot_index = slot
            .0
            .checked_sub(FIRST_SLOT_ID)
            .map(|index| index as usize)
            .filter(|index| *index < self.shared.slots.len())
            .ok_or(TokenFault::new("C_OpenSession", ReturnValue::SLOT_ID_INVALID))?;
        if flags.0 & SessionFlags::SERIAL_SESSION == 0 {
            return Err(TokenFault::new("C_OpenSession", ReturnValue::ARGUMENTS_BAD));
        }

        let handle = SessionHandle(self.shared.next_session.fetch_add(1, Ordering::SeqCst));
        self.shared.open_sessions.fetch_add(1, Ordering::SeqCst);
        debug!("Opened software token session {:?} on {:?}", handle, slot);
        Ok(SoftSession {
            shared: Arc::clone(&self.shared),
            live: Arc::clone(&self.live),
            slot_index,
            handle,
            read_write: flags.is_read_write(),
            logged_in: false,
            closed: false,
            objects: ObjectStore::default(),
            active: None,
        })
    }

    fn finalize(&mut self) -> TokenResult<()> {
        self.shared.enter("C_Finalize", Some(FaultPoint::Finalize))?;
        if !self.live.swap(false, Ordering::SeqCst) {
            return Err(TokenFault::new(
                "C_Finalize",
                ReturnValue::CRYPTOKI_NOT_INITIALIZED,
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ActiveOperation {
    kind: OperationKind,
    mechanism: Mechanism,
    key: Option<SoftObject>,
    buffer: Vec<u8>,
}

/// Session of the software token
///
/// Multi-part operations accumulate their input and run at `*_final`.
#[derive(Debug)]
pub struct SoftSession {
    shared: Arc<Shared>,
    live: Arc<AtomicBool>,
    slot_index: usize,
    handle: SessionHandle,
    read_write: bool,
    logged_in: bool,
    closed: bool,
    objects: ObjectStore,
    active: Option<ActiveOperation>,
}

impl SoftSession {
    fn enter(&self, function: &'static str) -> TokenResult<()> {
        self.enter_at(function, None)
    }

    fn enter_at(&self, function: &'static str, point: Option<FaultPoint>) -> TokenResult<()> {
        self.shared.enter(function, point)?;
        if !self.live.load(Ordering::SeqCst) {
            return Err(TokenFault::new(function, ReturnValue::CRYPTOKI_NOT_INITIALIZED));
        }
        if self.closed {
            return Err(TokenFault::new(function, ReturnValue::SESSION_HANDLE_INVALID));
        }
        Ok(())
    }

    fn slot(&self) -> parking_lot::MutexGuard<'_, SlotState> {
        self.shared.slots[self.slot_index].lock()
    }

    /// Copy of a visible object
    fn object(
        &self,
        function: &'static str,
        handle: ObjectHandle,
        missing: ReturnValue,
    ) -> TokenResult<SoftObject> {
        let object = match self.objects.get(handle) {
            Some(object) => object.clone(),
            None => self
                .slot()
                .objects
                .get(handle)
                .cloned()
                .ok_or(TokenFault::new(function, missing))?,
        };
        if object.is_private() && !self.logged_in {
            return Err(TokenFault::new(function, ReturnValue::USER_NOT_LOGGED_IN));
        }
        Ok(object)
    }

    /// Key usable for an operation that needs `permission`
    fn usable_key(
        &self,
        function: &'static str,
        handle: ObjectHandle,
        permission: AttributeType,
    ) -> TokenResult<SoftObject> {
        let key = self.object(function, handle, ReturnValue::KEY_HANDLE_INVALID)?;
        if !key.flag(permission) {
            return Err(TokenFault::new(
                function,
                ReturnValue::KEY_FUNCTION_NOT_PERMITTED,
            ));
        }
        Ok(key)
    }

    fn store(&mut self, function: &'static str, mut object: SoftObject) -> TokenResult<ObjectHandle> {
        object.set_default(Attribute::Token(false));
        let private_default = object.class() != Some(ObjectClass::PUBLIC_KEY);
        object.set_default(Attribute::Private(private_default));
        if object.class() == Some(ObjectClass::PRIVATE_KEY)
            || object.class() == Some(ObjectClass::SECRET_KEY)
        {
            object.set_default(Attribute::Sensitive(false));
            object.set_default(Attribute::Extractable(true));
        }
        if let Some(len) = object.bytes(AttributeType::VALUE).map(<[u8]>::len) {
            if object.class() == Some(ObjectClass::SECRET_KEY) {
                object.set(Attribute::ValueLen(len as u64));
            }
        }

        if object.is_private() && !self.logged_in {
            return Err(TokenFault::new(function, ReturnValue::USER_NOT_LOGGED_IN));
        }
        let handle = self.shared.allocate_handle();
        if object.is_token() {
            if !self.read_write {
                return Err(TokenFault::new(function, ReturnValue::SESSION_READ_ONLY));
            }
            let mut slot = self.slot();
            if slot
                .config
                .capacity
                .is_some_and(|capacity| slot.objects.len() >= capacity)
            {
                return Err(TokenFault::new(function, ReturnValue::DEVICE_MEMORY));
            }
            slot.objects.insert(handle, object);
        } else {
            self.objects.insert(handle, object);
        }
        Ok(handle)
    }

    fn start(
        &mut self,
        function: &'static str,
        kind: OperationKind,
        mechanism: &Mechanism,
        key: Option<SoftObject>,
    ) -> TokenResult<()> {
        if self.active.is_some() {
            return Err(TokenFault::new(function, ReturnValue::OPERATION_ACTIVE));
        }
        if !mechanism.supports_multipart() {
            return Err(TokenFault::new(function, ReturnValue::MECHANISM_INVALID));
        }
        self.active = Some(ActiveOperation {
            kind,
            mechanism: mechanism.clone(),
            key,
            buffer: Vec::new(),
        });
        Ok(())
    }

    fn feed(&mut self, function: &'static str, kind: OperationKind, data: &[u8]) -> TokenResult<()> {
        match self.active.as_mut() {
            Some(active) if active.kind == kind => {
                active.buffer.extend_from_slice(data);
                Ok(())
            }
            _ => Err(TokenFault::new(
                function,
                ReturnValue::OPERATION_NOT_INITIALIZED,
            )),
        }
    }

    /// End the active operation of `kind`, handing back its state
    fn finish(&mut self, function: &'static str, kind: OperationKind) -> TokenResult<ActiveOperation> {
        match self.active.take() {
            Some(active) if active.kind == kind => Ok(active),
            other => {
                self.active = other;
                Err(TokenFault::new(
                    function,
                    ReturnValue::OPERATION_NOT_INITIALIZED,
                ))
            }
        }
    }

    fn single_shot(&self, function: &'static str) -> TokenResult<()> {
        if self.active.is_some() {
            return Err(TokenFault::new(function, ReturnValue::OPERATION_ACTIVE));
        }
        Ok(())
    }

    fn key_of<'a>(function: &'static str, active: &'a ActiveOperation) -> TokenResult<&'a SoftObject> {
        active
            .key
            .as_ref()
            .ok_or(TokenFault::new(function, ReturnValue::KEY_HANDLE_INVALID))
    }
}

fn run<T>(function: &'static str, result: MechResult<T>) -> TokenResult<T> {
    result.map_err(|rv| TokenFault::new(function, rv))
}

impl Drop for SoftSession {
    fn drop(&mut self) {
        if !self.closed {
            self.shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl SessionControl for SoftSession {
    fn handle(&self) -> SessionHandle {
        self.handle
    }

    fn login(&mut self, pin: &[u8]) -> TokenResult<()> {
        self.enter_at("C_Login", Some(FaultPoint::Login))?;
        if self.logged_in {
            return Err(TokenFault::new("C_Login", ReturnValue::USER_ALREADY_LOGGED_IN));
        }
        if self.slot().config.user_pin != pin {
            return Err(TokenFault::new("C_Login", ReturnValue::PIN_INCORRECT));
        }
        self.logged_in = true;
        Ok(())
    }

    fn logout(&mut self) -> TokenResult<()> {
        self.enter_at("C_Logout", Some(FaultPoint::Logout))?;
        if !self.logged_in {
            return Err(TokenFault::new("C_Logout", ReturnValue::USER_NOT_LOGGED_IN));
        }
        self.logged_in = false;
        Ok(())
    }

    fn close(&mut self) -> TokenResult<()> {
        self.enter_at("C_CloseSession", Some(FaultPoint::CloseSession))?;
        self.closed = true;
        self.logged_in = false;
        self.active = None;
        self.objects.clear();
        self.shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
        debug!("Closed software token session {:?}", self.handle);
        Ok(())
    }
}

impl ObjectManager for SoftSession {
    fn create_object(&mut self, template: &[Attribute]) -> TokenResult<ObjectHandle> {
        self.enter("C_CreateObject")?;
        let object = SoftObject::new(template.to_vec());
        let class = object
            .class()
            .ok_or(TokenFault::new("C_CreateObject", ReturnValue::TEMPLATE_INCOMPLETE))?;
        if class != ObjectClass::DATA && object.key_type().is_none() {
            return Err(TokenFault::new(
                "C_CreateObject",
                ReturnValue::TEMPLATE_INCOMPLETE,
            ));
        }
        if class == ObjectClass::SECRET_KEY && object.bytes(AttributeType::VALUE).is_none() {
            return Err(TokenFault::new(
                "C_CreateObject",
                ReturnValue::TEMPLATE_INCOMPLETE,
            ));
        }
        self.store("C_CreateObject", object)
    }

    fn copy_object(
        &mut self,
        object: ObjectHandle,
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle> {
        self.enter("C_CopyObject")?;
        let mut copy = self.object("C_CopyObject", object, ReturnValue::OBJECT_HANDLE_INVALID)?;
        for attribute in template {
            let widens = match attribute {
                Attribute::Extractable(true) => !copy.flag(AttributeType::EXTRACTABLE),
                Attribute::Sensitive(false) => copy.flag(AttributeType::SENSITIVE),
                _ => false,
            };
            if widens {
                return Err(TokenFault::new("C_CopyObject", ReturnValue::ATTRIBUTE_READ_ONLY));
            }
            copy.set(attribute.clone());
        }
        self.store("C_CopyObject", copy)
    }

    fn destroy_object(&mut self, object: ObjectHandle) -> TokenResult<()> {
        self.enter("C_DestroyObject")?;
        let target = self.object("C_DestroyObject", object, ReturnValue::OBJECT_HANDLE_INVALID)?;
        if target.is_token() {
            if !self.read_write {
                return Err(TokenFault::new("C_DestroyObject", ReturnValue::SESSION_READ_ONLY));
            }
            self.slot().objects.remove(object);
        } else {
            self.objects.remove(object);
        }
        Ok(())
    }

    fn find_objects(&mut self, template: &[Attribute]) -> TokenResult<Vec<ObjectHandle>> {
        self.enter("C_FindObjects")?;
        let visible = |object: &SoftObject| {
            (self.logged_in || !object.is_private()) && object.matches(template)
        };
        let mut found: Vec<ObjectHandle> = self
            .objects
            .iter()
            .filter(|(_, object)| visible(object))
            .map(|(handle, _)| handle)
            .collect();
        found.extend(
            self.slot()
                .objects
                .iter()
                .filter(|(_, object)| visible(object))
                .map(|(handle, _)| handle),
        );
        found.sort();
        Ok(found)
    }

    fn get_attributes(
        &mut self,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> TokenResult<Vec<Attribute>> {
        self.enter_at("C_GetAttributeValue", Some(FaultPoint::GetAttributes))?;
        let object = self.object(
            "C_GetAttributeValue",
            object,
            ReturnValue::OBJECT_HANDLE_INVALID,
        )?;
        let mut values = Vec::with_capacity(types.len());
        for kind in types {
            let Some(attribute) = object.attributes().find_attribute(*kind) else {
                continue;
            };
            if attribute.is_sensitive_material() && !object.reveals_material() {
                return Err(TokenFault::new(
                    "C_GetAttributeValue",
                    ReturnValue::ATTRIBUTE_SENSITIVE,
                ));
            }
            values.push(attribute.clone());
        }
        Ok(values)
    }

    fn generate_key(
        &mut self,
        mechanism: &Mechanism,
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle> {
        self.enter("C_GenerateKey")?;
        let material = run("C_GenerateKey", mechanisms::generate_secret(mechanism, template))?;
        let mut object = SoftObject::new(template.to_vec());
        for attribute in material {
            object.set(attribute);
        }
        self.store("C_GenerateKey", object)
    }

    fn generate_key_pair(
        &mut self,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> TokenResult<(ObjectHandle, ObjectHandle)> {
        self.enter("C_GenerateKeyPair")?;
        let (public_material, private_material) = run(
            "C_GenerateKeyPair",
            mechanisms::generate_pair(mechanism, public_template, private_template),
        )?;
        let mut public = SoftObject::new(public_template.to_vec());
        public_material.into_iter().for_each(|attribute| public.set(attribute));
        let mut private = SoftObject::new(private_template.to_vec());
        private_material.into_iter().for_each(|attribute| private.set(attribute));

        let public = self.store("C_GenerateKeyPair", public)?;
        match self.store("C_GenerateKeyPair", private) {
            Ok(private) => Ok((public, private)),
            Err(fault) => {
                self.objects.remove(public);
                self.slot().objects.remove(public);
                Err(fault)
            }
        }
    }

    fn derive_key(
        &mut self,
        mechanism: &Mechanism,
        base_key: ObjectHandle,
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle> {
        self.enter("C_DeriveKey")?;
        let base = self.usable_key("C_DeriveKey", base_key, AttributeType::DERIVE)?;
        let material = run("C_DeriveKey", mechanisms::derive(mechanism, &base, template))?;
        let mut object = SoftObject::new(template.to_vec());
        for attribute in material {
            object.set(attribute);
        }
        self.store("C_DeriveKey", object)
    }

    fn wrap_key(
        &mut self,
        mechanism: &Mechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> TokenResult<Vec<u8>> {
        self.enter("C_WrapKey")?;
        let wrapping = self.usable_key("C_WrapKey", wrapping_key, AttributeType::WRAP)?;
        let target = self.object("C_WrapKey", key, ReturnValue::KEY_HANDLE_INVALID)?;
        if !target.flag(AttributeType::EXTRACTABLE) {
            return Err(TokenFault::new("C_WrapKey", ReturnValue::KEY_UNEXTRACTABLE));
        }
        let payload = match target.class() {
            Some(ObjectClass::SECRET_KEY) => target
                .bytes(AttributeType::VALUE)
                .map(<[u8]>::to_vec)
                .ok_or(TokenFault::new("C_WrapKey", ReturnValue::KEY_HANDLE_INVALID))?,
            Some(ObjectClass::PRIVATE_KEY) => {
                let key_type = target
                    .key_type()
                    .ok_or(TokenFault::new("C_WrapKey", ReturnValue::KEY_HANDLE_INVALID))?;
                encode_pkcs8(key_type, target.attributes())
                    .map_err(|_| TokenFault::new("C_WrapKey", ReturnValue::KEY_NOT_WRAPPABLE))?
            }
            _ => return Err(TokenFault::new("C_WrapKey", ReturnValue::KEY_NOT_WRAPPABLE)),
        };
        run(
            "C_WrapKey",
            mechanisms::cipher(Direction::Encrypt, mechanism, &wrapping, &payload),
        )
    }

    fn unwrap_key(
        &mut self,
        mechanism: &Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped_key: &[u8],
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle> {
        self.enter("C_UnwrapKey")?;
        let unwrapping = self.usable_key("C_UnwrapKey", unwrapping_key, AttributeType::UNWRAP)?;
        let payload = run(
            "C_UnwrapKey",
            mechanisms::cipher(Direction::Decrypt, mechanism, &unwrapping, wrapped_key),
        )
        .map_err(|fault| match fault.rv {
            ReturnValue::ENCRYPTED_DATA_INVALID => {
                TokenFault::new("C_UnwrapKey", ReturnValue::WRAPPED_KEY_INVALID)
            }
            _ => fault,
        })?;

        let mut object = SoftObject::new(template.to_vec());
        match object.class() {
            Some(ObjectClass::SECRET_KEY) => object.set(Attribute::Value(payload)),
            Some(ObjectClass::PRIVATE_KEY) => {
                let material = decode_pkcs8(&payload)
                    .map_err(|_| TokenFault::new("C_UnwrapKey", ReturnValue::WRAPPED_KEY_INVALID))?;
                if object.key_type().is_some_and(|key_type| key_type != material.key_type) {
                    return Err(TokenFault::new(
                        "C_UnwrapKey",
                        ReturnValue::TEMPLATE_INCONSISTENT,
                    ));
                }
                object.set(Attribute::KeyType(material.key_type));
                for attribute in material.attributes {
                    object.set(attribute);
                }
            }
            _ => {
                return Err(TokenFault::new(
                    "C_UnwrapKey",
                    ReturnValue::TEMPLATE_INCONSISTENT,
                ))
            }
        }
        self.store("C_UnwrapKey", object)
    }
}

impl CryptoOps for SoftSession {
    fn digest(&mut self, mechanism: &Mechanism, data: &[u8]) -> TokenResult<Vec<u8>> {
        self.enter("C_Digest")?;
        self.single_shot("C_Digest")?;
        run("C_Digest", mechanisms::digest(mechanism, data))
    }

    fn digest_init(&mut self, mechanism: &Mechanism) -> TokenResult<()> {
        self.enter("C_DigestInit")?;
        self.start("C_DigestInit", OperationKind::Digest, mechanism, None)
    }

    fn digest_update(&mut self, data: &[u8]) -> TokenResult<()> {
        self.enter("C_DigestUpdate")?;
        self.feed("C_DigestUpdate", OperationKind::Digest, data)
    }

    fn digest_final(&mut self) -> TokenResult<Vec<u8>> {
        self.enter("C_DigestFinal")?;
        let active = self.finish("C_DigestFinal", OperationKind::Digest)?;
        run(
            "C_DigestFinal",
            mechanisms::digest(&active.mechanism, &active.buffer),
        )
    }

    fn encrypt(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> TokenResult<Vec<u8>> {
        self.enter("C_Encrypt")?;
        self.single_shot("C_Encrypt")?;
        let key = self.usable_key("C_Encrypt", key, AttributeType::ENCRYPT)?;
        run(
            "C_Encrypt",
            mechanisms::cipher(Direction::Encrypt, mechanism, &key, data),
        )
    }

    fn encrypt_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()> {
        self.enter("C_EncryptInit")?;
        let key = self.usable_key("C_EncryptInit", key, AttributeType::ENCRYPT)?;
        self.start("C_EncryptInit", OperationKind::Encrypt, mechanism, Some(key))
    }

    fn encrypt_update(&mut self, data: &[u8]) -> TokenResult<Vec<u8>> {
        self.enter("C_EncryptUpdate")?;
        self.feed("C_EncryptUpdate", OperationKind::Encrypt, data)?;
        Ok(Vec::new())
    }

    fn encrypt_final(&mut self) -> TokenResult<Vec<u8>> {
        self.enter("C_EncryptFinal")?;
        let active = self.finish("C_EncryptFinal", OperationKind::Encrypt)?;
        let key = Self::key_of("C_EncryptFinal", &active)?;
        run(
            "C_EncryptFinal",
            mechanisms::cipher(Direction::Encrypt, &active.mechanism, key, &active.buffer),
        )
    }

    fn decrypt(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> TokenResult<Vec<u8>> {
        self.enter("C_Decrypt")?;
        self.single_shot("C_Decrypt")?;
        let key = self.usable_key("C_Decrypt", key, AttributeType::DECRYPT)?;
        run(
            "C_Decrypt",
            mechanisms::cipher(Direction::Decrypt, mechanism, &key, data),
        )
    }

    fn decrypt_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()> {
        self.enter("C_DecryptInit")?;
        let key = self.usable_key("C_DecryptInit", key, AttributeType::DECRYPT)?;
        self.start("C_DecryptInit", OperationKind::Decrypt, mechanism, Some(key))
    }

    fn decrypt_update(&mut self, data: &[u8]) -> TokenResult<Vec<u8>> {
        self.enter("C_DecryptUpdate")?;
        self.feed("C_DecryptUpdate", OperationKind::Decrypt, data)?;
        Ok(Vec::new())
    }

    fn decrypt_final(&mut self) -> TokenResult<Vec<u8>> {
        self.enter("C_DecryptFinal")?;
        let active = self.finish("C_DecryptFinal", OperationKind::Decrypt)?;
        let key = Self::key_of("C_DecryptFinal", &active)?;
        run(
            "C_DecryptFinal",
            mechanisms::cipher(Direction::Decrypt, &active.mechanism, key, &active.buffer),
        )
    }

    fn sign(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> TokenResult<Vec<u8>> {
        self.enter("C_Sign")?;
        self.single_shot("C_Sign")?;
        let key = self.usable_key("C_Sign", key, AttributeType::SIGN)?;
        run("C_Sign", mechanisms::sign(mechanism, &key, data))
    }

    fn sign_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()> {
        self.enter("C_SignInit")?;
        let key = self.usable_key("C_SignInit", key, AttributeType::SIGN)?;
        self.start("C_SignInit", OperationKind::Sign, mechanism, Some(key))
    }

    fn sign_update(&mut self, data: &[u8]) -> TokenResult<()> {
        self.enter("C_SignUpdate")?;
        self.feed("C_SignUpdate", OperationKind::Sign, data)
    }

    fn sign_final(&mut self) -> TokenResult<Vec<u8>> {
        self.enter("C_SignFinal")?;
        let active = self.finish("C_SignFinal", OperationKind::Sign)?;
        let key = Self::key_of("C_SignFinal", &active)?;
        run(
            "C_SignFinal",
            mechanisms::sign(&active.mechanism, key, &active.buffer),
        )
    }

    fn verify(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> TokenResult<()> {
        self.enter("C_Verify")?;
        self.single_shot("C_Verify")?;
        let key = self.usable_key("C_Verify", key, AttributeType::VERIFY)?;
        run(
            "C_Verify",
            mechanisms::verify(mechanism, &key, data, signature),
        )
    }

    fn verify_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()> {
        self.enter("C_VerifyInit")?;
        let key = self.usable_key("C_VerifyInit", key, AttributeType::VERIFY)?;
        self.start("C_VerifyInit", OperationKind::Verify, mechanism, Some(key))
    }

    fn verify_update(&mut self, data: &[u8]) -> TokenResult<()> {
        self.enter("C_VerifyUpdate")?;
        self.feed("C_VerifyUpdate", OperationKind::Verify, data)
    }

    fn verify_final(&mut self, signature: &[u8]) -> TokenResult<()> {
        self.enter("C_VerifyFinal")?;
        let active = self.finish("C_VerifyFinal", OperationKind::Verify)?;
        let key = Self::key_of("C_VerifyFinal", &active)?;
        run(
            "C_VerifyFinal",
            mechanisms::verify(&active.mechanism, key, &active.buffer, signature),
        )
    }

    fn cancel_operation(&mut self, kind: OperationKind) -> TokenResult<()> {
        self.enter("C_SessionCancel")?;
        if self.active.as_ref().is_some_and(|active| active.kind == kind) {
            debug!("Cancelled active {} operation", kind.as_str());
            self.active = None;
        }
        Ok(())
    }
}

impl RandomGenerator for SoftSession {
    fn generate_random(&mut self, len: usize) -> TokenResult<Vec<u8>> {
        self.enter("C_GenerateRandom")?;
        Ok(mechanisms::random_bytes(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MechanismParams, MechanismType};
    use crate::ports::KeyType;

    fn open(loader: &SoftModuleLoader, flags: SessionFlags) -> (SoftModule, SoftSession) {
        let mut module = loader.load(Path::new("soft"), "soft").unwrap();
        module.initialize().unwrap();
        let slot = module.slots().unwrap()[0];
        let session = module.open_session(slot, flags).unwrap();
        (module, session)
    }

    fn aes_template(token: bool) -> Vec<Attribute> {
        vec![
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::KeyType(KeyType::AES),
            Attribute::Token(token),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Encrypt(true),
            Attribute::ValueLen(16),
        ]
    }

    #[test]
    fn test_private_objects_need_login() {
        let loader = SoftModuleLoader::new();
        let (_module, mut session) = open(&loader, SessionFlags::read_write());
        let mechanism = Mechanism::new(MechanismType::AES_KEY_GEN);

        let err = session.generate_key(&mechanism, &aes_template(false)).unwrap_err();
        assert_eq!(err.rv, ReturnValue::USER_NOT_LOGGED_IN);

        session.login(b"1234").unwrap();
        let key = session.generate_key(&mechanism, &aes_template(false)).unwrap();
        assert_eq!(session.find_objects(&[]).unwrap(), vec![key]);

        session.logout().unwrap();
        assert!(session.find_objects(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_pin() {
        let loader = SoftModuleLoader::new();
        let (_module, mut session) = open(&loader, SessionFlags::read_write());
        assert_eq!(
            session.login(b"0000").unwrap_err().rv,
            ReturnValue::PIN_INCORRECT
        );
    }

    #[test]
    fn test_sensitive_value_not_readable() {
        let loader = SoftModuleLoader::new();
        let (_module, mut session) = open(&loader, SessionFlags::read_write());
        session.login(b"1234").unwrap();
        let key = session
            .generate_key(&Mechanism::new(MechanismType::AES_KEY_GEN), &aes_template(false))
            .unwrap();

        let err = session
            .get_attributes(key, &[AttributeType::VALUE])
            .unwrap_err();
        assert_eq!(err.rv, ReturnValue::ATTRIBUTE_SENSITIVE);

        let metadata = session
            .get_attributes(key, &[AttributeType::VALUE_LEN, AttributeType::MODULUS])
            .unwrap();
        assert_eq!(metadata, vec![Attribute::ValueLen(16)]);
    }

    #[test]
    fn test_read_only_session_rejects_token_objects() {
        let loader = SoftModuleLoader::new();
        let (_module, mut session) = open(&loader, SessionFlags::read_only());
        session.login(b"1234").unwrap();
        let err = session
            .generate_key(&Mechanism::new(MechanismType::AES_KEY_GEN), &aes_template(true))
            .unwrap_err();
        assert_eq!(err.rv, ReturnValue::SESSION_READ_ONLY);
    }

    #[test]
    fn test_token_objects_outlive_sessions() {
        let loader = SoftModuleLoader::new();
        let (_module, mut session) = open(&loader, SessionFlags::read_write());
        session.login(b"1234").unwrap();
        let mechanism = Mechanism::new(MechanismType::AES_KEY_GEN);
        session.generate_key(&mechanism, &aes_template(true)).unwrap();
        session.generate_key(&mechanism, &aes_template(false)).unwrap();
        session.close().unwrap();

        assert_eq!(loader.token_object_count(0), 1);
        assert_eq!(loader.open_sessions(), 0);
        assert_eq!(
            session.find_objects(&[]).unwrap_err().rv,
            ReturnValue::SESSION_HANDLE_INVALID
        );
    }

    #[test]
    fn test_capacity_exhausted() {
        let loader = SoftModuleLoader::with_slots(vec![SoftSlot::new("tiny", "1234").with_capacity(1)]);
        let (_module, mut session) = open(&loader, SessionFlags::read_write());
        session.login(b"1234").unwrap();
        let mechanism = Mechanism::new(MechanismType::AES_KEY_GEN);
        session.generate_key(&mechanism, &aes_template(true)).unwrap();
        assert_eq!(
            session
                .generate_key(&mechanism, &aes_template(true))
                .unwrap_err()
                .rv,
            ReturnValue::DEVICE_MEMORY
        );
    }

    #[test]
    fn test_one_operation_at_a_time() {
        let loader = SoftModuleLoader::new();
        let (_module, mut session) = open(&loader, SessionFlags::read_write());
        let sha256 = Mechanism::new(MechanismType::SHA256);

        session.digest_init(&sha256).unwrap();
        assert_eq!(
            session.digest_init(&sha256).unwrap_err().rv,
            ReturnValue::OPERATION_ACTIVE
        );
        assert_eq!(
            session.digest(&sha256, b"abc").unwrap_err().rv,
            ReturnValue::OPERATION_ACTIVE
        );
        session.digest_update(b"a").unwrap();
        session.digest_update(b"bc").unwrap();
        let streamed = session.digest_final().unwrap();
        assert_eq!(streamed, session.digest(&sha256, b"abc").unwrap());

        assert_eq!(
            session.digest_update(b"x").unwrap_err().rv,
            ReturnValue::OPERATION_NOT_INITIALIZED
        );
    }

    #[test]
    fn test_cancel_frees_the_session() {
        let loader = SoftModuleLoader::new();
        let (_module, mut session) = open(&loader, SessionFlags::read_write());
        let sha256 = Mechanism::new(MechanismType::SHA256);

        session.digest_init(&sha256).unwrap();
        session.cancel_operation(OperationKind::Digest).unwrap();
        session.cancel_operation(OperationKind::Digest).unwrap();
        assert!(session.digest(&sha256, b"abc").is_ok());
    }

    #[test]
    fn test_single_part_mechanism_cannot_stream() {
        let loader = SoftModuleLoader::new();
        let (_module, mut session) = open(&loader, SessionFlags::read_write());
        session.login(b"1234").unwrap();
        let (_, private) = session
            .generate_key_pair(
                &Mechanism::new(MechanismType::EC_EDWARDS_KEY_PAIR_GEN),
                &[Attribute::Token(false), Attribute::Verify(true)],
                &[Attribute::Token(false), Attribute::Sign(true)],
            )
            .unwrap();
        let err = session
            .sign_init(&Mechanism::new(MechanismType::EDDSA), private)
            .unwrap_err();
        assert_eq!(err.rv, ReturnValue::MECHANISM_INVALID);
    }

    #[test]
    fn test_key_function_not_permitted() {
        let loader = SoftModuleLoader::new();
        let (_module, mut session) = open(&loader, SessionFlags::read_write());
        session.login(b"1234").unwrap();
        let key = session
            .generate_key(&Mechanism::new(MechanismType::AES_KEY_GEN), &aes_template(false))
            .unwrap();
        let gcm = Mechanism::with_params(
            MechanismType::AES_GCM,
            MechanismParams::Gcm {
                iv: vec![0; 12],
                additional_data: Vec::new(),
                tag_bits: 128,
            },
        );
        assert!(session.encrypt(&gcm, key, b"data").is_ok());
        assert_eq!(
            session.decrypt(&gcm, key, b"data").unwrap_err().rv,
            ReturnValue::KEY_FUNCTION_NOT_PERMITTED
        );
    }

    #[test]
    fn test_injected_faults_and_call_count() {
        let loader = SoftModuleLoader::new();
        loader.fail(FaultPoint::Load, ReturnValue::GENERAL_ERROR);
        let before = loader.call_count();
        assert!(loader.load(Path::new("soft"), "soft").is_err());
        assert_eq!(loader.call_count(), before + 1);

        loader.clear_faults();
        let (mut module, mut session) = open(&loader, SessionFlags::read_write());
        module.finalize().unwrap();
        assert_eq!(
            session.generate_random(4).unwrap_err().rv,
            ReturnValue::CRYPTOKI_NOT_INITIALIZED
        );
    }

    mod contract {
        use super::SoftModuleLoader;
        use crate::contract_tests_for;
        use crate::ports::contract_tests::token_contract;

        contract_tests_for!(
            soft_token_contract,
            make = SoftModuleLoader::new,
            tests = {
                test_login_success => token_contract::test_login_success,
                test_login_failure => token_contract::test_login_failure,
                test_double_initialize => token_contract::test_double_initialize,
                test_private_object_needs_login => token_contract::test_private_object_needs_login,
                test_session_objects_end_with_session => token_contract::test_session_objects_end_with_session,
                test_read_only_session_refuses_token_objects => token_contract::test_read_only_session_refuses_token_objects,
                test_value_len_reported => token_contract::test_value_len_reported,
                test_one_operation_per_session => token_contract::test_one_operation_per_session,
                test_random_length => token_contract::test_random_length,
                test_closed_session_rejects_calls => token_contract::test_closed_session_rejects_calls,
            }
        );
    }
}
