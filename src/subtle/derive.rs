use tracing::{info, warn};

use super::{require_usage, SubtleCrypto};
use crate::error::{CryptoError, P11Result, TokenError};
use crate::logic::templates::{transient_secret_template, validate_usages, KeySpec};
use crate::logic::Purpose;
use crate::model::{
    AlgorithmDescriptor, CryptoKey, KeyKind, KeyUsage, KeyUsages, SecretKeyAlgorithm,
};
use crate::ports::{
    AttributeList, AttributeType, ObjectManager, ReturnValue, SessionControl, TokenModule,
};

impl<M: TokenModule> SubtleCrypto<'_, M> {
    /// Derive `length` bits from `base`
    ///
    /// The bits come out of a short-lived extractable secret created by the
    /// derivation; the object is destroyed before returning, whether or not
    /// reading it succeeded.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyUsage` if `base` lacks `deriveBits`
    /// - `MechanismParameter` if `length` is zero or not a multiple of 8
    pub fn derive_bits(
        &self,
        algorithm: &AlgorithmDescriptor,
        base: &CryptoKey,
        length: u32,
    ) -> P11Result<Vec<u8>> {
        self.sessions.check_owner(base)?;
        require_usage(base, KeyUsage::DeriveBits)?;
        if length == 0 || length % 8 != 0 {
            return Err(CryptoError::MechanismParameter {
                reason: format!("derived length {} is not a positive multiple of 8", length),
            }
            .into());
        }
        let mechanism = self.mapper().resolve(Purpose::Derive, algorithm, Some(base))?;
        let len = (length / 8) as usize;
        let template = transient_secret_template(len);

        self.sessions.with_authenticated_session(|session| {
            let handle = session.derive_key(&mechanism, base.handle(), &template)?;
            let read = session.get_attributes(handle, &[AttributeType::VALUE]);
            if let Err(fault) = session.destroy_object(handle) {
                warn!("Failed to destroy derived object {:?}: {}", handle, fault);
            }
            let bits = read?
                .bytes(AttributeType::VALUE)
                .map(<[u8]>::to_vec)
                .filter(|bits| bits.len() == len)
                .ok_or(TokenError::OperationFailure {
                    operation: "C_GetAttributeValue",
                    rv: ReturnValue::KEY_SIZE_RANGE,
                })?;
            Ok(bits)
        })
    }

    /// Derive a new AES or HMAC key from `base`
    ///
    /// `derived_algorithm` names the new key and carries its length (AES)
    /// or hash (HMAC).
    pub fn derive_key(
        &self,
        algorithm: &AlgorithmDescriptor,
        base: &CryptoKey,
        derived_algorithm: &AlgorithmDescriptor,
        extractable: bool,
        usages: KeyUsages,
    ) -> P11Result<CryptoKey> {
        self.sessions.check_owner(base)?;
        require_usage(base, KeyUsage::DeriveKey)?;
        let mechanism = self.mapper().resolve(Purpose::Derive, algorithm, Some(base))?;
        let secret = self.mapper().secret_algorithm(derived_algorithm)?;
        if let SecretKeyAlgorithm::Kdf(_) = secret {
            return Err(CryptoError::UnsupportedAlgorithm {
                algorithm: format!("{} as a derived key", derived_algorithm.name),
            }
            .into());
        }
        let kind = KeyKind::Secret(secret);
        validate_usages(&kind, usages)?;
        let spec = KeySpec::new(kind, usages, extractable);
        let template = spec.generation_template();

        self.sessions.with_authenticated_session(|session| {
            let origin = self.sessions.origin(session.handle());
            let handle = session.derive_key(&mechanism, base.handle(), &template)?;
            info!(
                "Derived {} key {:?} from {:?}",
                spec.kind.algorithm_name(),
                handle,
                base.handle()
            );
            Ok(spec.into_key(handle, origin))
        })
    }
}

#[cfg(test)]
mod tests {
    use hkdf::Hkdf;
    use sha2::Sha256;

    use super::super::test_support::logged_in;
    use super::*;
    use crate::adapters::soft_token::{SoftModule, SoftModuleLoader};
    use crate::error::P11Error;
    use crate::key_store::{KeyCriteria, KeyStore};
    use crate::model::{AlgorithmName, KeyFormat};

    fn import_secret(
        subtle: &SubtleCrypto<'_, SoftModule>,
        name: &str,
        bytes: &[u8],
    ) -> CryptoKey {
        subtle
            .import_key(
                KeyFormat::Raw,
                bytes,
                &AlgorithmDescriptor::new(name),
                false,
                KeyUsages::from([KeyUsage::DeriveBits, KeyUsage::DeriveKey]),
            )
            .unwrap()
    }

    #[test]
    fn test_hkdf_bits_match_reference() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let base = import_secret(&subtle, "HKDF", b"input keying material");
        let alg = AlgorithmDescriptor::new("HKDF")
            .with_hash("SHA-256")
            .with_salt(b"salt".to_vec())
            .with_info(b"info".to_vec());

        let bits = subtle.derive_bits(&alg, &base, 256).unwrap();
        let mut expected = [0u8; 32];
        Hkdf::<Sha256>::new(Some(b"salt"), b"input keying material")
            .expand(b"info", &mut expected)
            .unwrap();
        assert_eq!(bits, expected);

        // only the base key is left behind
        let store = KeyStore::new(&sessions);
        assert_eq!(store.find(&KeyCriteria::new()).unwrap().count(), 1);
    }

    #[test]
    fn test_derive_bits_length_checked() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let base = import_secret(&subtle, "PBKDF2", b"password");
        let alg = AlgorithmDescriptor::new("PBKDF2")
            .with_hash("SHA-256")
            .with_salt(b"salt".to_vec())
            .with_iterations(10);

        for length in [0, 12] {
            assert!(matches!(
                subtle.derive_bits(&alg, &base, length),
                Err(P11Error::Crypto(CryptoError::MechanismParameter { .. }))
            ));
        }
        assert_eq!(subtle.derive_bits(&alg, &base, 128).unwrap().len(), 16);
    }

    #[test]
    fn test_ecdh_both_sides_agree() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let generate = || {
            subtle
                .generate_key(
                    &AlgorithmDescriptor::new("ECDH").with_named_curve("P-256"),
                    false,
                    KeyUsages::from([KeyUsage::DeriveBits]),
                )
                .unwrap()
                .into_pair()
                .unwrap()
        };
        let alice = generate();
        let bob = generate();

        let ours = subtle
            .derive_bits(
                &AlgorithmDescriptor::new("ECDH").with_public(bob.public_key.clone()),
                &alice.private_key,
                256,
            )
            .unwrap();
        let theirs = subtle
            .derive_bits(
                &AlgorithmDescriptor::new("ECDH").with_public(alice.public_key.clone()),
                &bob.private_key,
                256,
            )
            .unwrap();
        assert_eq!(ours, theirs);
    }

    #[test]
    fn test_derive_aes_key_and_use_it() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let base = import_secret(&subtle, "HKDF", &[0x0b; 22]);
        let alg = AlgorithmDescriptor::new("HKDF").with_hash("SHA-256");

        let key = subtle
            .derive_key(
                &alg,
                &base,
                &AlgorithmDescriptor::new("AES-GCM").with_length(128),
                false,
                KeyUsages::from([KeyUsage::Encrypt, KeyUsage::Decrypt]),
            )
            .unwrap();
        assert_eq!(key.algorithm_name(), AlgorithmName::AesGcm);

        let gcm = AlgorithmDescriptor::new("AES-GCM").with_iv(vec![0u8; 12]);
        let ciphertext = subtle.encrypt(&gcm, &key, b"derived").unwrap();
        assert_eq!(subtle.decrypt(&gcm, &key, &ciphertext).unwrap(), b"derived");

        let err = subtle
            .derive_key(
                &alg,
                &base,
                &AlgorithmDescriptor::new("PBKDF2"),
                false,
                KeyUsages::from([KeyUsage::DeriveBits]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            P11Error::Crypto(CryptoError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_derive_requires_usage() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let base = subtle
            .import_key(
                KeyFormat::Raw,
                b"ikm",
                &AlgorithmDescriptor::new("HKDF"),
                false,
                KeyUsages::from([KeyUsage::DeriveKey]),
            )
            .unwrap();

        // both derive usages ride on one token flag, the handle keeps only what was asked
        let err = subtle
            .derive_bits(&AlgorithmDescriptor::new("HKDF").with_hash("SHA-256"), &base, 64)
            .unwrap_err();
        assert!(matches!(err, P11Error::Crypto(CryptoError::InvalidKeyUsage { .. })));
    }
}
