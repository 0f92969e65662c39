//! Key objects on the token
//!
//! Finding, persisting and removing key objects, and moving key material in
//! and out of the token in the raw, SPKI and PKCS#8 encodings.

use tracing::{debug, info, warn};

use crate::error::{CryptoError, KeyManagementError, P11Error, P11Result};
use crate::logic::encoding::{
    decode_pkcs8, decode_raw_ec_public, decode_raw_ed25519_public, decode_spki,
    encode_pkcs8, encode_raw_public, encode_spki, export_attribute_types, secret, EncodingError,
    KeyMaterial,
};
use crate::logic::templates::{self, key_from_attributes, KeySpec, METADATA_ATTRIBUTES};
use crate::logic::MechanismMapper;
use crate::model::{
    AlgorithmDescriptor, AlgorithmName, AsymmetricKeyAlgorithm, CryptoKey, KeyClass, KeyFormat,
    KeyKind, KeyOrigin, KeyUsages, StorageScope,
};
use crate::ports::{
    Attribute, AttributeList, AttributeType, ObjectHandle, ObjectManager, SessionControl,
    TokenModule, TokenSession,
};
use crate::session::SessionManager;

/// Filter for [`KeyStore::find`]; unset fields match anything
#[derive(Debug, Clone, Default)]
pub struct KeyCriteria {
    pub label: Option<String>,
    pub class: Option<KeyClass>,
    pub id: Option<Vec<u8>>,
    pub algorithm: Option<AlgorithmName>,
}

impl KeyCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_class(mut self, class: KeyClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn with_id(mut self, id: impl Into<Vec<u8>>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_algorithm(mut self, algorithm: AlgorithmName) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    fn template(&self) -> Vec<Attribute> {
        let mut template = Vec::new();
        if let Some(class) = self.class {
            template.push(Attribute::Class(class.object_class()));
        }
        if let Some(label) = &self.label {
            template.push(Attribute::Label(label.as_bytes().to_vec()));
        }
        if let Some(id) = &self.id {
            template.push(Attribute::Id(id.clone()));
        }
        template
    }
}

/// Key handle and persistence management
pub struct KeyStore<'a, M: TokenModule> {
    sessions: &'a SessionManager<M>,
}

impl<'a, M: TokenModule> KeyStore<'a, M> {
    pub fn new(sessions: &'a SessionManager<M>) -> Self {
        Self { sessions }
    }

    /// Keys matching `criteria`, session and token objects alike
    ///
    /// Matching handles are collected now; each key's metadata is read when
    /// the iterator reaches it. Objects destroyed in between are skipped.
    pub fn find(&self, criteria: &KeyCriteria) -> P11Result<KeyIter<'a, M>> {
        let template = criteria.template();
        let handles = self
            .sessions
            .with_session(|session| Ok(session.find_objects(&template)?))?;
        debug!("Found {} objects matching {:?}", handles.len(), criteria);
        Ok(KeyIter {
            sessions: self.sessions,
            handles: handles.into_iter(),
            algorithm: criteria.algorithm,
        })
    }

    /// Rebuild the key behind `handle`
    pub fn get(&self, handle: ObjectHandle) -> P11Result<CryptoKey> {
        self.sessions.with_session(|session| {
            let origin = self.sessions.origin(session.handle());
            read_key(session, origin, handle)
        })
    }

    /// Move `key` to token storage (`persistent`) or back to the session
    ///
    /// Returns the key under its new handle; the old handle is destroyed.
    /// A key already in the requested scope is returned unchanged.
    pub fn save(&self, key: &CryptoKey, persistent: bool) -> P11Result<CryptoKey> {
        self.sessions.check_owner(key)?;
        let scope = scope_of(persistent);
        if key.scope() == scope {
            return Ok(key.clone());
        }
        self.replace(key, scope, vec![Attribute::Token(persistent)])
            .map(|handle| key.clone().with_handle(handle, scope))
    }

    /// Like [`save`](Self::save), but also sets `CKA_LABEL` and `CKA_ID` so
    /// the key can be found again with [`KeyCriteria`]
    ///
    /// Always replaces the object, even if it already has the requested
    /// scope.
    pub fn save_as(
        &self,
        key: &CryptoKey,
        persistent: bool,
        label: &str,
        id: Option<&[u8]>,
    ) -> P11Result<CryptoKey> {
        let scope = scope_of(persistent);
        let mut template = vec![
            Attribute::Token(persistent),
            Attribute::Label(label.as_bytes().to_vec()),
        ];
        if let Some(id) = id {
            template.push(Attribute::Id(id.to_vec()));
        }
        let handle = self.replace(key, scope, template)?;
        Ok(key
            .clone()
            .with_handle(handle, scope)
            .with_identity(Some(label.to_string()), id.map(<[u8]>::to_vec)))
    }

    /// Copy the key object with `template` applied, then destroy the original
    fn replace(
        &self,
        key: &CryptoKey,
        scope: StorageScope,
        template: Vec<Attribute>,
    ) -> P11Result<ObjectHandle> {
        self.sessions.check_owner(key)?;
        self.sessions
            .with_session_as(key.kind().requires_login(), |session| {
                let copy = session.copy_object(key.handle(), &template)?;
                if let Err(fault) = session.destroy_object(key.handle()) {
                    warn!("Failed to destroy {:?} after copying it: {}", key.handle(), fault);
                    if let Err(cleanup) = session.destroy_object(copy) {
                        warn!("Failed to destroy copy {:?}: {}", copy, cleanup);
                    }
                    return Err(fault.into());
                }
                info!("Saved key {:?} as {:?} ({:?})", key.handle(), copy, scope);
                Ok(copy)
            })
    }

    /// Destroy the key object
    ///
    /// # Errors
    ///
    /// `KeyNotFound` if the object is gone or `key` came from another
    /// manager; nothing is destroyed in that case.
    pub fn remove(&self, key: &CryptoKey) -> P11Result<()> {
        self.sessions.check_owner(key)?;
        self.sessions
            .with_session_as(key.kind().requires_login(), |session| {
                session.destroy_object(key.handle())?;
                info!("Removed key {:?}", key.handle());
                Ok(())
            })
    }

    /// Key material in an external encoding
    ///
    /// # Errors
    ///
    /// - `NotExtractable` for non-extractable keys, before any token call
    /// - `KeyAlgorithmMismatch` if `format` does not apply to the key
    pub fn to_external_encoding(&self, key: &CryptoKey, format: KeyFormat) -> P11Result<Vec<u8>> {
        self.sessions.check_owner(key)?;
        if !key.extractable() {
            return Err(KeyManagementError::NotExtractable.into());
        }
        self.sessions
            .with_session_as(key.kind().requires_login(), |session| {
                export_material(session, key, format)
            })
    }

    /// Create a key object from externally encoded material
    ///
    /// # Errors
    ///
    /// - `ImportFormat` for malformed material or material that does not
    ///   match `algorithm`
    /// - `InvalidKeyUsage` if `usages` are not allowed for the key
    pub fn from_external_encoding(
        &self,
        bytes: &[u8],
        format: KeyFormat,
        algorithm: &AlgorithmDescriptor,
        usages: KeyUsages,
        extractable: bool,
    ) -> P11Result<CryptoKey> {
        let (spec, material) =
            import_spec(self.sessions.mapper(), bytes, format, algorithm, usages, extractable)?;
        self.sessions
            .with_session_as(spec.kind.requires_login(), |session| {
                let origin = self.sessions.origin(session.handle());
                create_imported(session, origin, spec, material)
            })
    }
}

fn scope_of(persistent: bool) -> StorageScope {
    if persistent {
        StorageScope::Token
    } else {
        StorageScope::Session
    }
}

/// Lazy iterator over the results of [`KeyStore::find`]
pub struct KeyIter<'a, M: TokenModule> {
    sessions: &'a SessionManager<M>,
    handles: std::vec::IntoIter<ObjectHandle>,
    algorithm: Option<AlgorithmName>,
}

impl<M: TokenModule> Iterator for KeyIter<'_, M> {
    type Item = P11Result<CryptoKey>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let handle = self.handles.next()?;
            let read = self.sessions.with_session(|session| {
                let attributes = session.get_attributes(handle, METADATA_ATTRIBUTES)?;
                if attributes
                    .object_class()
                    .and_then(KeyClass::from_object_class)
                    .is_none()
                {
                    return Ok(None);
                }
                key_from_attributes(handle, self.sessions.origin(session.handle()), &attributes)
                    .map(Some)
            });
            match read {
                Ok(Some(key)) if self.algorithm.map_or(true, |name| key.algorithm_name() == name) => {
                    return Some(Ok(key))
                }
                Ok(_) => continue,
                Err(P11Error::KeyManagement(KeyManagementError::KeyNotFound { .. })) => {
                    debug!("Object {:?} vanished during iteration", handle);
                    continue;
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.handles.len()))
    }
}

pub(crate) fn read_key<S: TokenSession>(
    session: &mut S,
    origin: KeyOrigin,
    handle: ObjectHandle,
) -> P11Result<CryptoKey> {
    let attributes = session.get_attributes(handle, METADATA_ATTRIBUTES)?;
    key_from_attributes(handle, origin, &attributes)
}

fn format_error(format: KeyFormat, err: EncodingError) -> CryptoError {
    CryptoError::ImportFormat {
        format: format.as_str().to_string(),
        reason: err.to_string(),
    }
}

/// Whether `format` can carry `key`
pub(crate) fn check_format(key: &CryptoKey, format: KeyFormat) -> P11Result<()> {
    let applies = match (format, key.kind()) {
        (KeyFormat::Raw, KeyKind::Secret(_)) => true,
        (KeyFormat::Raw, KeyKind::Public(alg)) => {
            !matches!(alg, AsymmetricKeyAlgorithm::Rsa { .. })
        }
        (KeyFormat::Spki, KeyKind::Public(_)) => true,
        (KeyFormat::Pkcs8, KeyKind::Private(_)) => true,
        _ => false,
    };
    if applies {
        Ok(())
    } else {
        Err(CryptoError::KeyAlgorithmMismatch {
            key: format!("{} {}", key.class().as_str(), key.algorithm_name()),
            algorithm: format!("{} encoding", format.as_str()),
        }
        .into())
    }
}

/// Export inside an already held session section
pub(crate) fn export_material<S: TokenSession>(
    session: &mut S,
    key: &CryptoKey,
    format: KeyFormat,
) -> P11Result<Vec<u8>> {
    let class = key.class();
    let key_type = templates::key_type(key.kind());
    check_format(key, format)?;

    let attributes = session.get_attributes(key.handle(), &export_attribute_types(key_type, class))?;
    let encoded = match (format, class) {
        (KeyFormat::Raw, KeyClass::Secret) => attributes
            .bytes(AttributeType::VALUE)
            .map(<[u8]>::to_vec)
            .ok_or(EncodingError::MissingAttribute(AttributeType::VALUE)),
        (KeyFormat::Raw, _) => encode_raw_public(key_type, &attributes),
        (KeyFormat::Spki, _) => encode_spki(key_type, &attributes),
        (KeyFormat::Pkcs8, _) => encode_pkcs8(key_type, &attributes),
    };
    let encoded = encoded.map_err(|err| format_error(format, err))?;
    debug!("Exported {:?} as {}", key.handle(), format.as_str());
    Ok(encoded)
}

/// Decode external material and settle the metadata of the key it becomes
pub(crate) fn import_spec(
    mapper: &MechanismMapper,
    bytes: &[u8],
    format: KeyFormat,
    algorithm: &AlgorithmDescriptor,
    usages: KeyUsages,
    extractable: bool,
) -> P11Result<(KeySpec, KeyMaterial)> {
    let name = algorithm
        .known_name()
        .ok_or_else(|| CryptoError::UnsupportedAlgorithm {
            algorithm: algorithm.name.clone(),
        })?;
    let material = match format {
        KeyFormat::Raw => match name {
            AlgorithmName::Ecdsa | AlgorithmName::Ecdh => {
                decode_raw_ec_public(mapper.named_curve(algorithm)?, bytes)
            }
            AlgorithmName::Ed25519 => decode_raw_ed25519_public(bytes),
            AlgorithmName::RsaOaep | AlgorithmName::RsaPss | AlgorithmName::RsassaPkcs1v15 => {
                Err(EncodingError::Unsupported(
                    "RSA keys have no raw encoding".to_string(),
                ))
            }
            _ => Ok(secret(bytes)),
        },
        KeyFormat::Spki => decode_spki(bytes),
        KeyFormat::Pkcs8 => decode_pkcs8(bytes),
    }
    .map_err(|err| format_error(format, err))?;

    let kind = mapper.imported_kind(algorithm, material.class, &material.shape, format.as_str())?;
    templates::validate_usages(&kind, usages)?;
    let extractable = extractable || kind.class() == KeyClass::Public;
    Ok((KeySpec::new(kind, usages, extractable), material))
}

/// Create the object for decoded material inside a held session section
pub(crate) fn create_imported<S: TokenSession>(
    session: &mut S,
    origin: KeyOrigin,
    spec: KeySpec,
    material: KeyMaterial,
) -> P11Result<CryptoKey> {
    let mut template = spec.template();
    template.extend(material.attributes);
    let handle = session.create_object(&template)?;
    info!(
        "Imported {} {} key as {:?}",
        spec.kind.class().as_str(),
        spec.kind.algorithm_name(),
        handle
    );
    let key = spec.into_key(handle, origin);
    Ok(match (key.class(), material.public_point) {
        (KeyClass::Public, Some(point)) => key.with_public_point(point),
        _ => key,
    })
}
