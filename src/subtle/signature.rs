use tracing::debug;

use super::{multipart, SubtleCrypto};
use crate::error::P11Result;
use crate::logic::Purpose;
use crate::model::{AlgorithmDescriptor, CryptoKey};
use crate::ports::{ReturnValue, TokenModule};

impl<M: TokenModule> SubtleCrypto<'_, M> {
    /// Sign `data` with a private or HMAC key
    pub fn sign(
        &self,
        algorithm: &AlgorithmDescriptor,
        key: &CryptoKey,
        data: &[u8],
    ) -> P11Result<Vec<u8>> {
        let mechanism = self.prepare(Purpose::Sign, algorithm, key)?;
        self.sessions
            .with_session_as(key.kind().requires_login(), |session| {
                Ok(multipart::sign(session, &mechanism, key.handle(), data)?)
            })
    }

    /// Check `signature` over `data`
    ///
    /// A signature that does not match is `Ok(false)`, never an error.
    /// Public keys verify without login.
    pub fn verify(
        &self,
        algorithm: &AlgorithmDescriptor,
        key: &CryptoKey,
        signature: &[u8],
        data: &[u8],
    ) -> P11Result<bool> {
        let mechanism = self.prepare(Purpose::Verify, algorithm, key)?;
        self.sessions
            .with_session_as(key.kind().requires_login(), |session| {
                match multipart::verify(session, &mechanism, key.handle(), data, signature) {
                    Ok(()) => Ok(true),
                    Err(fault)
                        if matches!(
                            fault.rv,
                            ReturnValue::SIGNATURE_INVALID | ReturnValue::SIGNATURE_LEN_RANGE
                        ) =>
                    {
                        debug!("Signature rejected by {}: {}", fault.function, fault.rv);
                        Ok(false)
                    }
                    Err(fault) => Err(fault.into()),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::logged_in;
    use super::*;
    use crate::adapters::soft_token::SoftModuleLoader;
    use crate::error::{KeyManagementError, P11Error, TokenError};
    use crate::model::{CryptoKeyPair, KeyUsage, KeyUsages};

    fn pair(
        subtle: &SubtleCrypto<'_, crate::adapters::soft_token::SoftModule>,
        alg: &AlgorithmDescriptor,
    ) -> CryptoKeyPair {
        subtle
            .generate_key(alg, false, KeyUsages::from([KeyUsage::Sign, KeyUsage::Verify]))
            .unwrap()
            .into_pair()
            .unwrap()
    }

    #[test]
    fn test_ecdsa_sign_verify_and_tamper() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let keys = pair(&subtle, &AlgorithmDescriptor::new("ECDSA").with_named_curve("P-256"));
        let alg = AlgorithmDescriptor::new("ECDSA").with_hash("SHA-256");

        let signature = subtle.sign(&alg, &keys.private_key, b"message").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(subtle
            .verify(&alg, &keys.public_key, &signature, b"message")
            .unwrap());
        assert!(!subtle
            .verify(&alg, &keys.public_key, &signature, b"massage")
            .unwrap());
        assert!(!subtle
            .verify(&alg, &keys.public_key, &signature[..10], b"message")
            .unwrap());
    }

    #[test]
    fn test_key_of_other_manager_never_reaches_token() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let other = logged_in(&SoftModuleLoader::new());
        let foreign = pair(
            &SubtleCrypto::new(&other),
            &AlgorithmDescriptor::new("ECDSA").with_named_curve("P-256"),
        );
        let alg = AlgorithmDescriptor::new("ECDSA").with_hash("SHA-256");
        let subtle = SubtleCrypto::new(&sessions);

        let calls = loader.call_count();
        let err = subtle.sign(&alg, &foreign.private_key, b"message").unwrap_err();
        assert!(matches!(
            err,
            P11Error::KeyManagement(KeyManagementError::KeyNotFound { .. })
        ));
        assert_eq!(loader.call_count(), calls);
    }

    #[test]
    fn test_ed25519_large_input_single_part() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let keys = pair(&subtle, &AlgorithmDescriptor::new("Ed25519"));
        let alg = AlgorithmDescriptor::new("Ed25519");
        let data = vec![7u8; super::super::CHUNK_SIZE * 3];

        let calls = loader.call_count();
        let signature = subtle.sign(&alg, &keys.private_key, &data).unwrap();
        assert_eq!(loader.call_count() - calls, 1);
        assert!(subtle.verify(&alg, &keys.public_key, &signature, &data).unwrap());
    }

    #[test]
    fn test_hmac_streamed_sign_matches_verify() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let key = subtle
            .generate_key(
                &AlgorithmDescriptor::new("HMAC").with_hash("SHA-512"),
                false,
                KeyUsages::from([KeyUsage::Sign, KeyUsage::Verify]),
            )
            .unwrap()
            .into_secret()
            .unwrap();
        let alg = AlgorithmDescriptor::new("HMAC");
        let data = vec![1u8; super::super::CHUNK_SIZE + 1];

        let mac = subtle.sign(&alg, &key, &data).unwrap();
        assert_eq!(mac.len(), 64);
        assert!(subtle.verify(&alg, &key, &mac, &data).unwrap());
        assert!(!subtle.verify(&alg, &key, &mac, &data[1..]).unwrap());
    }

    #[test]
    fn test_public_verify_needs_no_login() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let keys = pair(
            &subtle,
            &AlgorithmDescriptor::new("RSASSA-PKCS1-v1_5")
                .with_modulus_length(1024)
                .with_hash("SHA-256"),
        );
        let alg = AlgorithmDescriptor::new("RSASSA-PKCS1-v1_5");
        let signature = subtle.sign(&alg, &keys.private_key, b"doc").unwrap();

        sessions.logout().unwrap();
        assert!(subtle.verify(&alg, &keys.public_key, &signature, b"doc").unwrap());
        let err = subtle.sign(&alg, &keys.private_key, b"doc").unwrap_err();
        assert!(matches!(err, P11Error::Token(TokenError::NotAuthenticated)));
    }

    #[test]
    fn test_verify_on_closed_session() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let keys = pair(&subtle, &AlgorithmDescriptor::new("Ed25519"));

        sessions.close().unwrap();
        let err = subtle
            .verify(
                &AlgorithmDescriptor::new("Ed25519"),
                &keys.public_key,
                &[0u8; 64],
                b"x",
            )
            .unwrap_err();
        assert!(matches!(err, P11Error::Token(TokenError::SessionClosed)));
    }
}
