use super::{multipart, SubtleCrypto};
use crate::error::P11Result;
use crate::logic::Purpose;
use crate::model::{AlgorithmDescriptor, CryptoKey};
use crate::ports::TokenModule;

impl<M: TokenModule> SubtleCrypto<'_, M> {
    /// Encrypt `data` with `key`
    ///
    /// # Errors
    ///
    /// - `InvalidKeyUsage` if the key lacks `encrypt`
    /// - `KeyAlgorithmMismatch` if the key belongs to another algorithm
    /// - `NotAuthenticated` for secret keys on a session without login
    pub fn encrypt(
        &self,
        algorithm: &AlgorithmDescriptor,
        key: &CryptoKey,
        data: &[u8],
    ) -> P11Result<Vec<u8>> {
        let mechanism = self.prepare(Purpose::Encrypt, algorithm, key)?;
        self.sessions
            .with_session_as(key.kind().requires_login(), |session| {
                Ok(multipart::encrypt(session, &mechanism, key.handle(), data)?)
            })
    }

    /// Decrypt `data` with `key`
    ///
    /// An authentication failure (AES-GCM tag, bad padding) surfaces as
    /// `OperationFailure` carrying the token's return value.
    pub fn decrypt(
        &self,
        algorithm: &AlgorithmDescriptor,
        key: &CryptoKey,
        data: &[u8],
    ) -> P11Result<Vec<u8>> {
        let mechanism = self.prepare(Purpose::Decrypt, algorithm, key)?;
        self.sessions
            .with_session_as(key.kind().requires_login(), |session| {
                Ok(multipart::decrypt(session, &mechanism, key.handle(), data)?)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::logged_in;
    use super::*;
    use crate::adapters::soft_token::SoftModuleLoader;
    use crate::error::{CryptoError, P11Error, TokenError};
    use crate::model::{KeyUsage, KeyUsages};

    fn aes_key(subtle: &SubtleCrypto<'_, crate::adapters::soft_token::SoftModule>, name: &str) -> CryptoKey {
        subtle
            .generate_key(
                &AlgorithmDescriptor::new(name).with_length(256),
                false,
                KeyUsages::from([KeyUsage::Encrypt, KeyUsage::Decrypt]),
            )
            .unwrap()
            .into_secret()
            .unwrap()
    }

    #[test]
    fn test_aes_gcm_round_trip_with_aad() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let key = aes_key(&subtle, "AES-GCM");
        let alg = AlgorithmDescriptor::new("AES-GCM")
            .with_iv(vec![3u8; 12])
            .with_additional_data(b"header".to_vec());

        let ciphertext = subtle.encrypt(&alg, &key, b"attack at dawn").unwrap();
        assert_eq!(ciphertext.len(), 14 + 16);
        assert_eq!(subtle.decrypt(&alg, &key, &ciphertext).unwrap(), b"attack at dawn");

        let mut tampered = ciphertext.clone();
        tampered[0] ^= 1;
        let err = subtle.decrypt(&alg, &key, &tampered).unwrap_err();
        assert!(matches!(err, P11Error::Token(TokenError::OperationFailure { .. })));
    }

    #[test]
    fn test_aes_cbc_streams_large_input() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let key = aes_key(&subtle, "AES-CBC");
        let alg = AlgorithmDescriptor::new("AES-CBC").with_iv(vec![9u8; 16]);
        let data: Vec<u8> = (0..super::super::CHUNK_SIZE * 2 + 100)
            .map(|i| (i % 251) as u8)
            .collect();

        let ciphertext = subtle.encrypt(&alg, &key, &data).unwrap();
        assert_eq!(ciphertext.len() % 16, 0);
        assert!(ciphertext.len() > data.len());
        assert_eq!(subtle.decrypt(&alg, &key, &ciphertext).unwrap(), data);
    }

    #[test]
    fn test_usage_checked_before_token() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let key = subtle
            .generate_key(
                &AlgorithmDescriptor::new("AES-GCM").with_length(128),
                false,
                KeyUsages::from([KeyUsage::Decrypt]),
            )
            .unwrap()
            .into_secret()
            .unwrap();

        let calls = loader.call_count();
        let err = subtle
            .encrypt(
                &AlgorithmDescriptor::new("AES-GCM").with_iv(vec![0u8; 12]),
                &key,
                b"data",
            )
            .unwrap_err();
        assert!(matches!(err, P11Error::Crypto(CryptoError::InvalidKeyUsage { .. })));
        assert_eq!(loader.call_count(), calls);
    }

    #[test]
    fn test_wrong_key_fails() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let key = aes_key(&subtle, "AES-GCM");
        let other = aes_key(&subtle, "AES-GCM");
        let alg = AlgorithmDescriptor::new("AES-GCM").with_iv(vec![1u8; 12]);

        let ciphertext = subtle.encrypt(&alg, &key, b"secret").unwrap();
        assert!(subtle.decrypt(&alg, &other, &ciphertext).is_err());
    }
}
