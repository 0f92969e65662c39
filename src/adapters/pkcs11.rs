//! Native PKCS#11 implementation of the token ports
//!
//! This module loads a vendor module (SoftHSM2, a smart card middleware, a
//! network HSM client) through the `cryptoki` crate and forwards every port
//! call to it.
//!
//! `cryptoki` object handles cannot be rebuilt from a raw number, so each
//! session keeps a registry mapping the handles it hands out to the native
//! ones. Multi-part operations are collected in the session and run as one
//! native call at `*_final`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CkError, Rv};
use cryptoki::mechanism::aead::GcmParams;
use cryptoki::mechanism::elliptic_curve::{EcKdf, Ecdh1DeriveParams};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsOaepParams, PkcsOaepSource, PkcsPssParams};
use cryptoki::mechanism::{Mechanism as CkMechanism, MechanismType as CkMechanismType};
use cryptoki::object::{
    Attribute as CkAttribute, AttributeType as CkAttributeType, KeyType as CkKeyType,
    ObjectClass as CkObjectClass, ObjectHandle as CkObjectHandle,
};
use cryptoki::session::{Session, UserType};
use cryptoki::types::{AuthPin, Ulong};
use cryptoki_sys::{CK_RV, CK_ULONG};
use tracing::{debug, info, warn};

use crate::model::{Mechanism, MechanismParams, MechanismType, MgfType};
use crate::ports::{
    Attribute, AttributeType, CryptoOps, KeyType, ModuleLoader, ObjectClass, ObjectHandle,
    ObjectManager, OperationKind, RandomGenerator, ReturnValue, SessionControl, SessionFlags,
    SessionHandle, SlotId, TokenFault, TokenModule, TokenResult,
};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

const CLASSES: [(ObjectClass, CkObjectClass); 4] = [
    (ObjectClass::DATA, CkObjectClass::DATA),
    (ObjectClass::PUBLIC_KEY, CkObjectClass::PUBLIC_KEY),
    (ObjectClass::PRIVATE_KEY, CkObjectClass::PRIVATE_KEY),
    (ObjectClass::SECRET_KEY, CkObjectClass::SECRET_KEY),
];

const KEY_TYPES: [(KeyType, CkKeyType); 5] = [
    (KeyType::RSA, CkKeyType::RSA),
    (KeyType::EC, CkKeyType::EC),
    (KeyType::GENERIC_SECRET, CkKeyType::GENERIC_SECRET),
    (KeyType::AES, CkKeyType::AES),
    (KeyType::EC_EDWARDS, CkKeyType::EC_EDWARDS),
];

const ATTRIBUTE_TYPES: [(AttributeType, CkAttributeType); 25] = [
    (AttributeType::CLASS, CkAttributeType::Class),
    (AttributeType::KEY_TYPE, CkAttributeType::KeyType),
    (AttributeType::TOKEN, CkAttributeType::Token),
    (AttributeType::PRIVATE, CkAttributeType::Private),
    (AttributeType::SENSITIVE, CkAttributeType::Sensitive),
    (AttributeType::EXTRACTABLE, CkAttributeType::Extractable),
    (AttributeType::ENCRYPT, CkAttributeType::Encrypt),
    (AttributeType::DECRYPT, CkAttributeType::Decrypt),
    (AttributeType::SIGN, CkAttributeType::Sign),
    (AttributeType::VERIFY, CkAttributeType::Verify),
    (AttributeType::DERIVE, CkAttributeType::Derive),
    (AttributeType::WRAP, CkAttributeType::Wrap),
    (AttributeType::UNWRAP, CkAttributeType::Unwrap),
    (AttributeType::LABEL, CkAttributeType::Label),
    (AttributeType::ID, CkAttributeType::Id),
    (AttributeType::VALUE, CkAttributeType::Value),
    (AttributeType::VALUE_LEN, CkAttributeType::ValueLen),
    (AttributeType::MODULUS_BITS, CkAttributeType::ModulusBits),
    (AttributeType::MODULUS, CkAttributeType::Modulus),
    (AttributeType::PUBLIC_EXPONENT, CkAttributeType::PublicExponent),
    (AttributeType::PRIVATE_EXPONENT, CkAttributeType::PrivateExponent),
    (AttributeType::PRIME_1, CkAttributeType::Prime1),
    (AttributeType::PRIME_2, CkAttributeType::Prime2),
    (AttributeType::EC_PARAMS, CkAttributeType::EcParams),
    (AttributeType::EC_POINT, CkAttributeType::EcPoint),
];

/// Loads a PKCS#11 shared library from disk
#[derive(Debug, Clone, Default)]
pub struct NativeModuleLoader;

impl NativeModuleLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleLoader for NativeModuleLoader {
    type Module = NativeModule;

    fn load(&self, library: &Path, name: &str) -> TokenResult<Self::Module> {
        let context = Pkcs11::new(library).map_err(|e| {
            warn!("Failed to load PKCS#11 module {} from {}: {}", name, library.display(), e);
            fault("C_GetFunctionList", e)
        })?;
        info!("Loaded PKCS#11 module {} from {}", name, library.display());
        Ok(NativeModule {
            name: name.to_string(),
            context: Some(context),
            initialized: false,
        })
    }
}

/// A loaded PKCS#11 module
pub struct NativeModule {
    name: String,
    context: Option<Pkcs11>,
    initialized: bool,
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModule")
            .field("name", &self.name)
            .field("loaded", &self.context.is_some())
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl NativeModule {
    fn context(&self, function: &'static str) -> TokenResult<&Pkcs11> {
        match self.context.as_ref() {
            Some(context) if self.initialized => Ok(context),
            _ => Err(TokenFault::new(
                function,
                ReturnValue::CRYPTOKI_NOT_INITIALIZED,
            )),
        }
    }
}

impl TokenModule for NativeModule {
    type Session = NativeSession;

    fn initialize(&mut self) -> TokenResult<()> {
        if self.initialized {
            return Err(TokenFault::new(
                "C_Initialize",
                ReturnValue::CRYPTOKI_ALREADY_INITIALIZED,
            ));
        }
        let context = self.context.as_ref().ok_or(TokenFault::new(
            "C_Initialize",
            ReturnValue::CRYPTOKI_NOT_INITIALIZED,
        ))?;
        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| fault("C_Initialize", e))?;
        self.initialized = true;
        debug!("Initialized PKCS#11 module {}", self.name);
        Ok(())
    }

    fn slots(&self) -> TokenResult<Vec<SlotId>> {
        let slots = self
            .context("C_GetSlotList")?
            .get_slots_with_token()
            .map_err(|e| fault("C_GetSlotList", e))?;
        Ok(slots.into_iter().map(|slot| SlotId(slot.id())).collect())
    }

    fn open_session(&mut self, slot: SlotId, flags: SessionFlags) -> TokenResult<Self::Session> {
        let context = self.context("C_OpenSession")?;
        let native = context
            .get_slots_with_token()
            .map_err(|e| fault("C_OpenSession", e))?
            .into_iter()
            .find(|candidate| candidate.id() == slot.0)
            .ok_or(TokenFault::new("C_OpenSession", ReturnValue::SLOT_ID_INVALID))?;

        let session = if flags.is_read_write() {
            context.open_rw_session(native)
        } else {
            context.open_ro_session(native)
        }
        .map_err(|e| fault("C_OpenSession", e))?;

        let handle = SessionHandle(NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
        debug!("Opened session {:?} on slot {:?}", handle, slot);
        Ok(NativeSession {
            handle,
            session: Some(session),
            objects: ObjectRegistry::default(),
            pending: None,
        })
    }

    fn finalize(&mut self) -> TokenResult<()> {
        // C_Finalize runs when the context is dropped
        if self.context.take().is_none() || !self.initialized {
            return Err(TokenFault::new(
                "C_Finalize",
                ReturnValue::CRYPTOKI_NOT_INITIALIZED,
            ));
        }
        self.initialized = false;
        info!("Finalized PKCS#11 module {}", self.name);
        Ok(())
    }
}

/// Two-way map between port handles and native handles
#[derive(Default)]
struct ObjectRegistry {
    next: u64,
    native: HashMap<u64, CkObjectHandle>,
    ours: HashMap<CkObjectHandle, ObjectHandle>,
}

impl ObjectRegistry {
    fn register(&mut self, native: CkObjectHandle) -> ObjectHandle {
        if let Some(handle) = self.ours.get(&native) {
            return *handle;
        }
        self.next += 1;
        let handle = ObjectHandle(self.next);
        self.native.insert(handle.0, native);
        self.ours.insert(native, handle);
        handle
    }

    fn resolve(&self, function: &'static str, handle: ObjectHandle) -> TokenResult<CkObjectHandle> {
        self.native.get(&handle.0).copied().ok_or(TokenFault::new(
            function,
            ReturnValue::OBJECT_HANDLE_INVALID,
        ))
    }

    fn forget(&mut self, handle: ObjectHandle) {
        if let Some(native) = self.native.remove(&handle.0) {
            self.ours.remove(&native);
        }
    }
}

/// A multi-part operation collected until `*_final`
struct Pending {
    kind: OperationKind,
    mechanism: Mechanism,
    key: Option<CkObjectHandle>,
    data: Vec<u8>,
}

/// An open session on a native module
pub struct NativeSession {
    handle: SessionHandle,
    session: Option<Session>,
    objects: ObjectRegistry,
    pending: Option<Pending>,
}

impl std::fmt::Debug for NativeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeSession")
            .field("handle", &self.handle)
            .field("open", &self.session.is_some())
            .field("objects", &self.objects.native.len())
            .finish()
    }
}

impl NativeSession {
    fn session(&self, function: &'static str) -> TokenResult<&Session> {
        self.session.as_ref().ok_or(TokenFault::new(
            function,
            ReturnValue::SESSION_HANDLE_INVALID,
        ))
    }

    fn idle(&self, function: &'static str) -> TokenResult<&Session> {
        let session = self.session(function)?;
        if self.pending.is_some() {
            return Err(TokenFault::new(function, ReturnValue::OPERATION_ACTIVE));
        }
        Ok(session)
    }

    fn template(&self, function: &'static str, template: &[Attribute]) -> TokenResult<Vec<CkAttribute>> {
        let mut converted = Vec::with_capacity(template.len());
        for attribute in template {
            match to_native_attribute(function, attribute)? {
                Some(native) => converted.push(native),
                None => debug!("Skipping {:?} for native module", attribute.attribute_type()),
            }
        }
        Ok(converted)
    }

    fn start(
        &mut self,
        function: &'static str,
        kind: OperationKind,
        mechanism: &Mechanism,
        key: Option<ObjectHandle>,
    ) -> TokenResult<()> {
        self.idle(function)?;
        if !mechanism.supports_multipart() {
            return Err(TokenFault::new(function, ReturnValue::MECHANISM_INVALID));
        }
        to_native_mechanism(function, mechanism)?;
        let key = key
            .map(|key| self.objects.resolve(function, key))
            .transpose()?;
        self.pending = Some(Pending {
            kind,
            mechanism: mechanism.clone(),
            key,
            data: Vec::new(),
        });
        Ok(())
    }

    fn feed(&mut self, function: &'static str, kind: OperationKind, data: &[u8]) -> TokenResult<()> {
        self.session(function)?;
        match self.pending.as_mut() {
            Some(pending) if pending.kind == kind => {
                pending.data.extend_from_slice(data);
                Ok(())
            }
            _ => Err(TokenFault::new(
                function,
                ReturnValue::OPERATION_NOT_INITIALIZED,
            )),
        }
    }

    fn finish(&mut self, function: &'static str, kind: OperationKind) -> TokenResult<Pending> {
        self.session(function)?;
        match self.pending.take() {
            Some(pending) if pending.kind == kind => Ok(pending),
            other => {
                self.pending = other;
                Err(TokenFault::new(
                    function,
                    ReturnValue::OPERATION_NOT_INITIALIZED,
                ))
            }
        }
    }

    fn pending_key(function: &'static str, pending: &Pending) -> TokenResult<CkObjectHandle> {
        pending
            .key
            .ok_or(TokenFault::new(function, ReturnValue::KEY_HANDLE_INVALID))
    }
}

impl SessionControl for NativeSession {
    fn handle(&self) -> SessionHandle {
        self.handle
    }

    fn login(&mut self, pin: &[u8]) -> TokenResult<()> {
        let pin = String::from_utf8(pin.to_vec())
            .map_err(|_| TokenFault::new("C_Login", ReturnValue::ARGUMENTS_BAD))?;
        self.session("C_Login")?
            .login(UserType::User, Some(&AuthPin::new(pin)))
            .map_err(|e| fault("C_Login", e))?;
        debug!("User logged in on session {:?}", self.handle);
        Ok(())
    }

    fn logout(&mut self) -> TokenResult<()> {
        self.session("C_Logout")?
            .logout()
            .map_err(|e| fault("C_Logout", e))
    }

    fn close(&mut self) -> TokenResult<()> {
        // dropping the session runs C_CloseSession
        self.session
            .take()
            .ok_or(TokenFault::new("C_CloseSession", ReturnValue::SESSION_HANDLE_INVALID))?;
        self.pending = None;
        self.objects = ObjectRegistry::default();
        debug!("Closed session {:?}", self.handle);
        Ok(())
    }
}

impl ObjectManager for NativeSession {
    fn create_object(&mut self, template: &[Attribute]) -> TokenResult<ObjectHandle> {
        let template = self.template("C_CreateObject", template)?;
        let native = self
            .session("C_CreateObject")?
            .create_object(&template)
            .map_err(|e| fault("C_CreateObject", e))?;
        Ok(self.objects.register(native))
    }

    fn copy_object(
        &mut self,
        object: ObjectHandle,
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle> {
        let source = self.objects.resolve("C_CopyObject", object)?;
        let template = self.template("C_CopyObject", template)?;
        let native = self
            .session("C_CopyObject")?
            .copy_object(source, &template)
            .map_err(|e| fault("C_CopyObject", e))?;
        Ok(self.objects.register(native))
    }

    fn destroy_object(&mut self, object: ObjectHandle) -> TokenResult<()> {
        let native = self.objects.resolve("C_DestroyObject", object)?;
        self.session("C_DestroyObject")?
            .destroy_object(native)
            .map_err(|e| fault("C_DestroyObject", e))?;
        self.objects.forget(object);
        Ok(())
    }

    fn find_objects(&mut self, template: &[Attribute]) -> TokenResult<Vec<ObjectHandle>> {
        let template = self.template("C_FindObjectsInit", template)?;
        let found = self
            .session("C_FindObjectsInit")?
            .find_objects(&template)
            .map_err(|e| fault("C_FindObjects", e))?;
        Ok(found
            .into_iter()
            .map(|native| self.objects.register(native))
            .collect())
    }

    fn get_attributes(
        &mut self,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> TokenResult<Vec<Attribute>> {
        let native = self.objects.resolve("C_GetAttributeValue", object)?;
        let requested: Vec<CkAttributeType> = types
            .iter()
            .filter_map(|kind| to_native_attribute_type(*kind))
            .collect();
        let attributes = self
            .session("C_GetAttributeValue")?
            .get_attributes(native, &requested)
            .map_err(|e| fault("C_GetAttributeValue", e))?;
        Ok(attributes.iter().filter_map(from_native_attribute).collect())
    }

    fn generate_key(
        &mut self,
        mechanism: &Mechanism,
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle> {
        let mech = to_native_mechanism("C_GenerateKey", mechanism)?;
        let template = self.template("C_GenerateKey", template)?;
        let native = self
            .idle("C_GenerateKey")?
            .generate_key(&mech, &template)
            .map_err(|e| fault("C_GenerateKey", e))?;
        Ok(self.objects.register(native))
    }

    fn generate_key_pair(
        &mut self,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> TokenResult<(ObjectHandle, ObjectHandle)> {
        let mech = to_native_mechanism("C_GenerateKeyPair", mechanism)?;
        let public_template = self.template("C_GenerateKeyPair", public_template)?;
        let private_template = self.template("C_GenerateKeyPair", private_template)?;
        let (public, private) = self
            .idle("C_GenerateKeyPair")?
            .generate_key_pair(&mech, &public_template, &private_template)
            .map_err(|e| fault("C_GenerateKeyPair", e))?;
        Ok((self.objects.register(public), self.objects.register(private)))
    }

    fn derive_key(
        &mut self,
        mechanism: &Mechanism,
        base_key: ObjectHandle,
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle> {
        let mech = to_native_mechanism("C_DeriveKey", mechanism)?;
        let base = self.objects.resolve("C_DeriveKey", base_key)?;
        let template = self.template("C_DeriveKey", template)?;
        let native = self
            .idle("C_DeriveKey")?
            .derive_key(&mech, base, &template)
            .map_err(|e| fault("C_DeriveKey", e))?;
        Ok(self.objects.register(native))
    }

    fn wrap_key(
        &mut self,
        mechanism: &Mechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> TokenResult<Vec<u8>> {
        let mech = to_native_mechanism("C_WrapKey", mechanism)?;
        let wrapping = self.objects.resolve("C_WrapKey", wrapping_key)?;
        let key = self.objects.resolve("C_WrapKey", key)?;
        self.idle("C_WrapKey")?
            .wrap_key(&mech, wrapping, key)
            .map_err(|e| fault("C_WrapKey", e))
    }

    fn unwrap_key(
        &mut self,
        mechanism: &Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped_key: &[u8],
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle> {
        let mech = to_native_mechanism("C_UnwrapKey", mechanism)?;
        let unwrapping = self.objects.resolve("C_UnwrapKey", unwrapping_key)?;
        let template = self.template("C_UnwrapKey", template)?;
        let native = self
            .idle("C_UnwrapKey")?
            .unwrap_key(&mech, unwrapping, wrapped_key, &template)
            .map_err(|e| fault("C_UnwrapKey", e))?;
        Ok(self.objects.register(native))
    }
}

impl CryptoOps for NativeSession {
    fn digest(&mut self, mechanism: &Mechanism, data: &[u8]) -> TokenResult<Vec<u8>> {
        let mech = to_native_mechanism("C_Digest", mechanism)?;
        self.idle("C_Digest")?
            .digest(&mech, data)
            .map_err(|e| fault("C_Digest", e))
    }

    fn digest_init(&mut self, mechanism: &Mechanism) -> TokenResult<()> {
        self.start("C_DigestInit", OperationKind::Digest, mechanism, None)
    }

    fn digest_update(&mut self, data: &[u8]) -> TokenResult<()> {
        self.feed("C_DigestUpdate", OperationKind::Digest, data)
    }

    fn digest_final(&mut self) -> TokenResult<Vec<u8>> {
        let pending = self.finish("C_DigestFinal", OperationKind::Digest)?;
        self.digest(&pending.mechanism, &pending.data)
    }

    fn encrypt(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> TokenResult<Vec<u8>> {
        let mech = to_native_mechanism("C_Encrypt", mechanism)?;
        let key = self.objects.resolve("C_Encrypt", key)?;
        self.idle("C_Encrypt")?
            .encrypt(&mech, key, data)
            .map_err(|e| fault("C_Encrypt", e))
    }

    fn encrypt_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()> {
        self.start("C_EncryptInit", OperationKind::Encrypt, mechanism, Some(key))
    }

    fn encrypt_update(&mut self, data: &[u8]) -> TokenResult<Vec<u8>> {
        self.feed("C_EncryptUpdate", OperationKind::Encrypt, data)?;
        Ok(Vec::new())
    }

    fn encrypt_final(&mut self) -> TokenResult<Vec<u8>> {
        let pending = self.finish("C_EncryptFinal", OperationKind::Encrypt)?;
        let key = Self::pending_key("C_EncryptFinal", &pending)?;
        let mech = to_native_mechanism("C_EncryptFinal", &pending.mechanism)?;
        self.session("C_EncryptFinal")?
            .encrypt(&mech, key, &pending.data)
            .map_err(|e| fault("C_EncryptFinal", e))
    }

    fn decrypt(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> TokenResult<Vec<u8>> {
        let mech = to_native_mechanism("C_Decrypt", mechanism)?;
        let key = self.objects.resolve("C_Decrypt", key)?;
        self.idle("C_Decrypt")?
            .decrypt(&mech, key, data)
            .map_err(|e| fault("C_Decrypt", e))
    }

    fn decrypt_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()> {
        self.start("C_DecryptInit", OperationKind::Decrypt, mechanism, Some(key))
    }

    fn decrypt_update(&mut self, data: &[u8]) -> TokenResult<Vec<u8>> {
        self.feed("C_DecryptUpdate", OperationKind::Decrypt, data)?;
        Ok(Vec::new())
    }

    fn decrypt_final(&mut self) -> TokenResult<Vec<u8>> {
        let pending = self.finish("C_DecryptFinal", OperationKind::Decrypt)?;
        let key = Self::pending_key("C_DecryptFinal", &pending)?;
        let mech = to_native_mechanism("C_DecryptFinal", &pending.mechanism)?;
        self.session("C_DecryptFinal")?
            .decrypt(&mech, key, &pending.data)
            .map_err(|e| fault("C_DecryptFinal", e))
    }

    fn sign(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> TokenResult<Vec<u8>> {
        let mech = to_native_mechanism("C_Sign", mechanism)?;
        let key = self.objects.resolve("C_Sign", key)?;
        self.idle("C_Sign")?
            .sign(&mech, key, data)
            .map_err(|e| fault("C_Sign", e))
    }

    fn sign_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()> {
        self.start("C_SignInit", OperationKind::Sign, mechanism, Some(key))
    }

    fn sign_update(&mut self, data: &[u8]) -> TokenResult<()> {
        self.feed("C_SignUpdate", OperationKind::Sign, data)
    }

    fn sign_final(&mut self) -> TokenResult<Vec<u8>> {
        let pending = self.finish("C_SignFinal", OperationKind::Sign)?;
        let key = Self::pending_key("C_SignFinal", &pending)?;
        let mech = to_native_mechanism("C_SignFinal", &pending.mechanism)?;
        self.session("C_SignFinal")?
            .sign(&mech, key, &pending.data)
            .map_err(|e| fault("C_SignFinal", e))
    }

    fn verify(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> TokenResult<()> {
        let mech = to_native_mechanism("C_Verify", mechanism)?;
        let key = self.objects.resolve("C_Verify", key)?;
        self.idle("C_Verify")?
            .verify(&mech, key, data, signature)
            .map_err(|e| fault("C_Verify", e))
    }

    fn verify_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()> {
        self.start("C_VerifyInit", OperationKind::Verify, mechanism, Some(key))
    }

    fn verify_update(&mut self, data: &[u8]) -> TokenResult<()> {
        self.feed("C_VerifyUpdate", OperationKind::Verify, data)
    }

    fn verify_final(&mut self, signature: &[u8]) -> TokenResult<()> {
        let pending = self.finish("C_VerifyFinal", OperationKind::Verify)?;
        let key = Self::pending_key("C_VerifyFinal", &pending)?;
        let mech = to_native_mechanism("C_VerifyFinal", &pending.mechanism)?;
        self.session("C_VerifyFinal")?
            .verify(&mech, key, &pending.data, signature)
            .map_err(|e| fault("C_VerifyFinal", e))
    }

    fn cancel_operation(&mut self, kind: OperationKind) -> TokenResult<()> {
        self.session("C_SessionCancel")?;
        if self.pending.as_ref().is_some_and(|pending| pending.kind == kind) {
            debug!("Cancelled pending {} operation", kind.as_str());
            self.pending = None;
        }
        Ok(())
    }
}

impl RandomGenerator for NativeSession {
    fn generate_random(&mut self, len: usize) -> TokenResult<Vec<u8>> {
        let session = self.session("C_GenerateRandom")?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let len = u32::try_from(len)
            .map_err(|_| TokenFault::new("C_GenerateRandom", ReturnValue::ARGUMENTS_BAD))?;
        session
            .generate_random_vec(len)
            .map_err(|e| fault("C_GenerateRandom", e))
    }
}

/// Classify a `cryptoki` error as the return value the module reported
fn fault(function: &'static str, error: CkError) -> TokenFault {
    let rv = match &error {
        CkError::Pkcs11(reported, _) => ReturnValue::KNOWN
            .iter()
            .map(|(_, known)| *known)
            .find(|known| {
                matches!(
                    CK_RV::try_from(known.0).map(Rv::from),
                    Ok(Rv::Error(candidate)) if candidate == *reported
                )
            })
            .unwrap_or(ReturnValue::FUNCTION_FAILED),
        _ => ReturnValue::GENERAL_ERROR,
    };
    debug!("{} failed: {} ({})", function, rv, error);
    TokenFault::new(function, rv)
}

fn ulong(function: &'static str, value: u64) -> TokenResult<Ulong> {
    CK_ULONG::try_from(value)
        .map(Ulong::from)
        .map_err(|_| TokenFault::new(function, ReturnValue::ATTRIBUTE_VALUE_INVALID))
}

fn to_native_attribute_type(kind: AttributeType) -> Option<CkAttributeType> {
    ATTRIBUTE_TYPES
        .iter()
        .find(|(ours, _)| *ours == kind)
        .map(|(_, native)| *native)
}

/// Native form of one template entry; `None` for attributes the module
/// cannot store
fn to_native_attribute(function: &'static str, attribute: &Attribute) -> TokenResult<Option<CkAttribute>> {
    let invalid = || TokenFault::new(function, ReturnValue::ATTRIBUTE_VALUE_INVALID);
    let native = match attribute {
        Attribute::Class(class) => CkAttribute::Class(
            CLASSES
                .iter()
                .find(|(ours, _)| ours == class)
                .map(|(_, native)| *native)
                .ok_or_else(invalid)?,
        ),
        Attribute::KeyType(key_type) => CkAttribute::KeyType(
            KEY_TYPES
                .iter()
                .find(|(ours, _)| ours == key_type)
                .map(|(_, native)| *native)
                .ok_or_else(invalid)?,
        ),
        Attribute::Token(v) => CkAttribute::Token(*v),
        Attribute::Private(v) => CkAttribute::Private(*v),
        Attribute::Sensitive(v) => CkAttribute::Sensitive(*v),
        Attribute::Extractable(v) => CkAttribute::Extractable(*v),
        Attribute::Encrypt(v) => CkAttribute::Encrypt(*v),
        Attribute::Decrypt(v) => CkAttribute::Decrypt(*v),
        Attribute::Sign(v) => CkAttribute::Sign(*v),
        Attribute::Verify(v) => CkAttribute::Verify(*v),
        Attribute::Derive(v) => CkAttribute::Derive(*v),
        Attribute::Wrap(v) => CkAttribute::Wrap(*v),
        Attribute::Unwrap(v) => CkAttribute::Unwrap(*v),
        Attribute::Label(v) => CkAttribute::Label(v.clone()),
        Attribute::Id(v) => CkAttribute::Id(v.clone()),
        Attribute::Value(v) => CkAttribute::Value(v.clone()),
        Attribute::ValueLen(v) => CkAttribute::ValueLen(ulong(function, *v)?),
        Attribute::ModulusBits(v) => CkAttribute::ModulusBits(ulong(function, *v)?),
        Attribute::Modulus(v) => CkAttribute::Modulus(v.clone()),
        Attribute::PublicExponent(v) => CkAttribute::PublicExponent(v.clone()),
        Attribute::PrivateExponent(v) => CkAttribute::PrivateExponent(v.clone()),
        Attribute::Prime1(v) => CkAttribute::Prime1(v.clone()),
        Attribute::Prime2(v) => CkAttribute::Prime2(v.clone()),
        Attribute::EcParams(v) => CkAttribute::EcParams(v.clone()),
        Attribute::EcPoint(v) => CkAttribute::EcPoint(v.clone()),
        Attribute::Vendor(..) => return Ok(None),
    };
    Ok(Some(native))
}

fn from_native_attribute(attribute: &CkAttribute) -> Option<Attribute> {
    let ulong = |v: &Ulong| {
        let raw: CK_ULONG = (*v).into();
        u64::from(raw)
    };
    Some(match attribute {
        CkAttribute::Class(class) => Attribute::Class(
            CLASSES
                .iter()
                .find(|(_, native)| native == class)
                .map(|(ours, _)| *ours)?,
        ),
        CkAttribute::KeyType(key_type) => Attribute::KeyType(
            KEY_TYPES
                .iter()
                .find(|(_, native)| native == key_type)
                .map(|(ours, _)| *ours)?,
        ),
        CkAttribute::Token(v) => Attribute::Token(*v),
        CkAttribute::Private(v) => Attribute::Private(*v),
        CkAttribute::Sensitive(v) => Attribute::Sensitive(*v),
        CkAttribute::Extractable(v) => Attribute::Extractable(*v),
        CkAttribute::Encrypt(v) => Attribute::Encrypt(*v),
        CkAttribute::Decrypt(v) => Attribute::Decrypt(*v),
        CkAttribute::Sign(v) => Attribute::Sign(*v),
        CkAttribute::Verify(v) => Attribute::Verify(*v),
        CkAttribute::Derive(v) => Attribute::Derive(*v),
        CkAttribute::Wrap(v) => Attribute::Wrap(*v),
        CkAttribute::Unwrap(v) => Attribute::Unwrap(*v),
        CkAttribute::Label(v) => Attribute::Label(v.clone()),
        CkAttribute::Id(v) => Attribute::Id(v.clone()),
        CkAttribute::Value(v) => Attribute::Value(v.clone()),
        CkAttribute::ValueLen(v) => Attribute::ValueLen(ulong(v)),
        CkAttribute::ModulusBits(v) => Attribute::ModulusBits(ulong(v)),
        CkAttribute::Modulus(v) => Attribute::Modulus(v.clone()),
        CkAttribute::PublicExponent(v) => Attribute::PublicExponent(v.clone()),
        CkAttribute::PrivateExponent(v) => Attribute::PrivateExponent(v.clone()),
        CkAttribute::Prime1(v) => Attribute::Prime1(v.clone()),
        CkAttribute::Prime2(v) => Attribute::Prime2(v.clone()),
        CkAttribute::EcParams(v) => Attribute::EcParams(v.clone()),
        CkAttribute::EcPoint(v) => Attribute::EcPoint(v.clone()),
        _ => return None,
    })
}

fn native_hash(function: &'static str, hash: MechanismType) -> TokenResult<CkMechanismType> {
    match hash {
        MechanismType::SHA_1 => Ok(CkMechanismType::SHA1),
        MechanismType::SHA256 => Ok(CkMechanismType::SHA256),
        MechanismType::SHA384 => Ok(CkMechanismType::SHA384),
        MechanismType::SHA512 => Ok(CkMechanismType::SHA512),
        _ => Err(TokenFault::new(function, ReturnValue::MECHANISM_PARAM_INVALID)),
    }
}

fn native_mgf(function: &'static str, mgf: MgfType) -> TokenResult<PkcsMgfType> {
    match mgf {
        MgfType::MGF1_SHA1 => Ok(PkcsMgfType::MGF1_SHA1),
        MgfType::MGF1_SHA256 => Ok(PkcsMgfType::MGF1_SHA256),
        MgfType::MGF1_SHA384 => Ok(PkcsMgfType::MGF1_SHA384),
        MgfType::MGF1_SHA512 => Ok(PkcsMgfType::MGF1_SHA512),
        _ => Err(TokenFault::new(function, ReturnValue::MECHANISM_PARAM_INVALID)),
    }
}

fn pss(function: &'static str, params: &MechanismParams) -> TokenResult<PkcsPssParams> {
    match params {
        MechanismParams::Pss {
            hash,
            mgf,
            salt_length,
        } => Ok(PkcsPssParams {
            hash_alg: native_hash(function, *hash)?,
            mgf: native_mgf(function, *mgf)?,
            s_len: ulong(function, u64::from(*salt_length))?,
        }),
        _ => Err(TokenFault::new(function, ReturnValue::MECHANISM_PARAM_INVALID)),
    }
}

/// Native form of a mechanism, borrowing its parameter block
///
/// HKDF, PBKDF2 and vendor mechanisms have no `cryptoki` binding and are
/// reported as `CKR_MECHANISM_INVALID`.
fn to_native_mechanism<'a>(
    function: &'static str,
    mechanism: &'a Mechanism,
) -> TokenResult<CkMechanism<'a>> {
    let bad_params = || TokenFault::new(function, ReturnValue::MECHANISM_PARAM_INVALID);
    let params = &mechanism.params;
    let native = match mechanism.mechanism_type {
        MechanismType::AES_KEY_GEN => CkMechanism::AesKeyGen,
        MechanismType::GENERIC_SECRET_KEY_GEN => CkMechanism::GenericSecretKeyGen,
        MechanismType::RSA_PKCS_KEY_PAIR_GEN => CkMechanism::RsaPkcsKeyPairGen,
        MechanismType::EC_KEY_PAIR_GEN => CkMechanism::EccKeyPairGen,
        MechanismType::EC_EDWARDS_KEY_PAIR_GEN => CkMechanism::EccEdwardsKeyPairGen,

        MechanismType::AES_CBC | MechanismType::AES_CBC_PAD => {
            let iv: [u8; 16] = match params {
                MechanismParams::Iv(iv) => iv.as_slice().try_into().map_err(|_| bad_params())?,
                _ => return Err(bad_params()),
            };
            if mechanism.mechanism_type == MechanismType::AES_CBC {
                CkMechanism::AesCbc(iv)
            } else {
                CkMechanism::AesCbcPad(iv)
            }
        }
        MechanismType::AES_GCM => match params {
            MechanismParams::Gcm {
                iv,
                additional_data,
                tag_bits,
            } => CkMechanism::AesGcm(GcmParams::new(
                iv,
                additional_data,
                ulong(function, u64::from(*tag_bits))?,
            )),
            _ => return Err(bad_params()),
        },
        MechanismType::RSA_PKCS_OAEP => match params {
            MechanismParams::Oaep { hash, mgf, label } => {
                let source = if label.is_empty() {
                    PkcsOaepSource::empty()
                } else {
                    PkcsOaepSource::data_specified(label)
                };
                CkMechanism::RsaPkcsOaep(PkcsOaepParams::new(
                    native_hash(function, *hash)?,
                    native_mgf(function, *mgf)?,
                    source,
                ))
            }
            _ => return Err(bad_params()),
        },

        MechanismType::RSA_PKCS => CkMechanism::RsaPkcs,
        MechanismType::SHA1_RSA_PKCS => CkMechanism::Sha1RsaPkcs,
        MechanismType::SHA256_RSA_PKCS => CkMechanism::Sha256RsaPkcs,
        MechanismType::SHA384_RSA_PKCS => CkMechanism::Sha384RsaPkcs,
        MechanismType::SHA512_RSA_PKCS => CkMechanism::Sha512RsaPkcs,
        MechanismType::RSA_PKCS_PSS => CkMechanism::RsaPkcsPss(pss(function, params)?),
        MechanismType::SHA1_RSA_PKCS_PSS => CkMechanism::Sha1RsaPkcsPss(pss(function, params)?),
        MechanismType::SHA256_RSA_PKCS_PSS => CkMechanism::Sha256RsaPkcsPss(pss(function, params)?),
        MechanismType::SHA384_RSA_PKCS_PSS => CkMechanism::Sha384RsaPkcsPss(pss(function, params)?),
        MechanismType::SHA512_RSA_PKCS_PSS => CkMechanism::Sha512RsaPkcsPss(pss(function, params)?),

        MechanismType::ECDSA => CkMechanism::Ecdsa,
        MechanismType::ECDSA_SHA1 => CkMechanism::EcdsaSha1,
        MechanismType::ECDSA_SHA256 => CkMechanism::EcdsaSha256,
        MechanismType::ECDSA_SHA384 => CkMechanism::EcdsaSha384,
        MechanismType::ECDSA_SHA512 => CkMechanism::EcdsaSha512,
        MechanismType::EDDSA => CkMechanism::Eddsa,
        MechanismType::ECDH1_DERIVE => match params {
            MechanismParams::Ecdh { public_data } => {
                CkMechanism::Ecdh1Derive(Ecdh1DeriveParams::new(EcKdf::null(), public_data))
            }
            _ => return Err(bad_params()),
        },

        MechanismType::SHA_1 => CkMechanism::Sha1,
        MechanismType::SHA256 => CkMechanism::Sha256,
        MechanismType::SHA384 => CkMechanism::Sha384,
        MechanismType::SHA512 => CkMechanism::Sha512,
        MechanismType::SHA_1_HMAC => CkMechanism::Sha1Hmac,
        MechanismType::SHA256_HMAC => CkMechanism::Sha256Hmac,
        MechanismType::SHA384_HMAC => CkMechanism::Sha384Hmac,
        MechanismType::SHA512_HMAC => CkMechanism::Sha512Hmac,

        other => {
            debug!("No native binding for mechanism {:?}", other);
            return Err(TokenFault::new(function, ReturnValue::MECHANISM_INVALID));
        }
    };
    Ok(native)
}
