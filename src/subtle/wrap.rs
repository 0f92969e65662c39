use tracing::{info, warn};

use super::{require_usage, SubtleCrypto};
use crate::error::{CryptoError, KeyManagementError, P11Result, TokenError};
use crate::key_store::{check_format, create_imported, export_material, import_spec, read_key};
use crate::logic::templates::{transient_secret_template, validate_usages, KeySpec};
use crate::logic::Purpose;
use crate::model::{
    AlgorithmDescriptor, AlgorithmName, CryptoKey, KeyClass, KeyFormat, KeyKind, KeyUsage,
    KeyUsages, Mechanism, SecretKeyAlgorithm,
};
use crate::ports::{
    Attribute, AttributeList, AttributeType, ObjectHandle, ObjectManager, ReturnValue, SessionControl,
    TokenModule, TokenSession,
};

/// Generic secret holding `value`, for moving encoded bytes through the
/// wrap mechanisms
fn transient_value_template(value: &[u8]) -> Vec<Attribute> {
    let mut template = transient_secret_template(value.len());
    template.retain(|attribute| attribute.attribute_type() != AttributeType::VALUE_LEN);
    template.push(Attribute::Value(value.to_vec()));
    template
}

fn destroy_transient<S: TokenSession>(session: &mut S, handle: ObjectHandle) {
    if let Err(fault) = session.destroy_object(handle) {
        warn!("Failed to destroy transient object {:?}: {}", handle, fault);
    }
}

/// Encrypt already encoded key bytes under `wrapping_key`
fn wrap_bytes<S: TokenSession>(
    session: &mut S,
    mechanism: &Mechanism,
    wrapping_key: ObjectHandle,
    bytes: &[u8],
) -> P11Result<Vec<u8>> {
    let transient = session.create_object(&transient_value_template(bytes))?;
    let wrapped = session.wrap_key(mechanism, wrapping_key, transient);
    destroy_transient(session, transient);
    Ok(wrapped?)
}

/// Decrypt wrapped bytes under `unwrapping_key` without creating a key
fn unwrap_bytes<S: TokenSession>(
    session: &mut S,
    mechanism: &Mechanism,
    unwrapping_key: ObjectHandle,
    wrapped: &[u8],
) -> P11Result<Vec<u8>> {
    let mut template = transient_secret_template(0);
    template.retain(|attribute| attribute.attribute_type() != AttributeType::VALUE_LEN);
    let transient = session.unwrap_key(mechanism, unwrapping_key, wrapped, &template)?;
    let read = session.get_attributes(transient, &[AttributeType::VALUE]);
    destroy_transient(session, transient);
    let bytes = read?
        .bytes(AttributeType::VALUE)
        .map(<[u8]>::to_vec)
        .ok_or(TokenError::OperationFailure {
            operation: "C_GetAttributeValue",
            rv: ReturnValue::ATTRIBUTE_TYPE_INVALID,
        })?;
    Ok(bytes)
}

/// Whether raw material for `name` is a public key rather than a secret
fn raw_is_public(name: AlgorithmName) -> bool {
    matches!(
        name,
        AlgorithmName::Ecdsa | AlgorithmName::Ecdh | AlgorithmName::Ed25519
    )
}

/// Check sizes the unwrap template could not carry against the descriptor
fn check_unwrapped(key: &CryptoKey, algorithm: &AlgorithmDescriptor, format: KeyFormat) -> P11Result<()> {
    let mismatch = |reason: String| CryptoError::ImportFormat {
        format: format.as_str().to_string(),
        reason,
    };
    match key.kind() {
        KeyKind::Secret(SecretKeyAlgorithm::Aes { length, .. }) => {
            if !matches!(length, 128 | 192 | 256) {
                return Err(mismatch(format!("AES key of {} bits", length)).into());
            }
            if algorithm.params.length.is_some_and(|requested| requested != *length) {
                return Err(mismatch("AES key length does not match".to_string()).into());
            }
        }
        KeyKind::Secret(SecretKeyAlgorithm::Hmac { length, .. }) => {
            if algorithm.params.length.is_some_and(|requested| requested != *length) {
                return Err(mismatch("HMAC key length does not match".to_string()).into());
            }
        }
        KeyKind::Private(_) => {
            if let (Some(requested), Some(curve)) =
                (&algorithm.params.named_curve, key.kind().curve())
            {
                if !requested.eq_ignore_ascii_case(curve.name()) {
                    return Err(mismatch(format!("key is on {}, not {}", curve, requested)).into());
                }
            }
        }
        _ => {}
    }
    Ok(())
}

impl<M: TokenModule> SubtleCrypto<'_, M> {
    /// Export `key` in `format` and encrypt it under `wrapping_key`
    ///
    /// Secret keys (raw) and private keys (PKCS#8) are wrapped by the token
    /// directly. Public encodings are exported first and pass through a
    /// transient secret, so wrapping them also needs a logged-in session.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyUsage` if `wrapping_key` lacks `wrapKey`
    /// - `NotExtractable` if `key` is not extractable, before any token call
    /// - `KeyAlgorithmMismatch` if `format` does not apply to `key`
    pub fn wrap_key(
        &self,
        format: KeyFormat,
        key: &CryptoKey,
        wrapping_key: &CryptoKey,
        algorithm: &AlgorithmDescriptor,
    ) -> P11Result<Vec<u8>> {
        self.sessions.check_owner(key)?;
        self.sessions.check_owner(wrapping_key)?;
        require_usage(wrapping_key, KeyUsage::WrapKey)?;
        if !key.extractable() {
            return Err(KeyManagementError::NotExtractable.into());
        }
        check_format(key, format)?;
        let mechanism = self.prepare(Purpose::Wrap, algorithm, wrapping_key)?;

        self.sessions.with_authenticated_session(|session| {
            let wrapped = match (format, key.class()) {
                (KeyFormat::Raw, KeyClass::Secret) | (KeyFormat::Pkcs8, KeyClass::Private) => {
                    session.wrap_key(&mechanism, wrapping_key.handle(), key.handle())?
                }
                _ => {
                    let encoded = export_material(session, key, format)?;
                    wrap_bytes(session, &mechanism, wrapping_key.handle(), &encoded)?
                }
            };
            info!(
                "Wrapped {:?} as {} under {:?}",
                key.handle(),
                format.as_str(),
                wrapping_key.handle()
            );
            Ok(wrapped)
        })
    }

    /// Decrypt `wrapped` under `unwrapping_key` and create the key it holds
    ///
    /// Raw secrets and PKCS#8 private keys are unwrapped by the token with
    /// the full metadata template; sizes the template cannot know are read
    /// back and checked, and a key that fails the check is destroyed.
    /// SPKI and raw public keys are decrypted and then imported.
    #[allow(clippy::too_many_arguments)]
    pub fn unwrap_key(
        &self,
        format: KeyFormat,
        wrapped: &[u8],
        unwrapping_key: &CryptoKey,
        unwrap_algorithm: &AlgorithmDescriptor,
        unwrapped_algorithm: &AlgorithmDescriptor,
        extractable: bool,
        usages: KeyUsages,
    ) -> P11Result<CryptoKey> {
        let mechanism = self.prepare(Purpose::Unwrap, unwrap_algorithm, unwrapping_key)?;
        let name = unwrapped_algorithm
            .known_name()
            .ok_or_else(|| CryptoError::UnsupportedAlgorithm {
                algorithm: unwrapped_algorithm.name.clone(),
            })?;

        let class = match format {
            KeyFormat::Pkcs8 => Some(KeyClass::Private),
            KeyFormat::Raw if !raw_is_public(name) => Some(KeyClass::Secret),
            _ => None,
        };
        let Some(class) = class else {
            return self.sessions.with_authenticated_session(|session| {
                let origin = self.sessions.origin(session.handle());
                let bytes = unwrap_bytes(session, &mechanism, unwrapping_key.handle(), wrapped)?;
                let (spec, material) = import_spec(
                    self.mapper(),
                    &bytes,
                    format,
                    unwrapped_algorithm,
                    usages,
                    extractable,
                )?;
                create_imported(session, origin, spec, material)
            });
        };

        let kind = self.mapper().unwrap_kind(unwrapped_algorithm, class)?;
        validate_usages(&kind, usages)?;
        let template = KeySpec::new(kind, usages, extractable).template();

        self.sessions.with_authenticated_session(|session| {
            let origin = self.sessions.origin(session.handle());
            let handle = session.unwrap_key(&mechanism, unwrapping_key.handle(), wrapped, &template)?;
            let checked = read_key(session, origin, handle)
                .and_then(|key| check_unwrapped(&key, unwrapped_algorithm, format).map(|()| key));
            match checked {
                Ok(key) => {
                    info!("Unwrapped {} key {:?}", key.algorithm_name(), handle);
                    Ok(key)
                }
                Err(err) => {
                    destroy_transient(session, handle);
                    Err(err)
                }
            }
        })
    }
}
