use super::SubtleCrypto;
use crate::error::P11Result;
use crate::key_store::KeyStore;
use crate::model::{AlgorithmDescriptor, CryptoKey, KeyFormat, KeyUsages};
use crate::ports::TokenModule;

impl<M: TokenModule> SubtleCrypto<'_, M> {
    /// Create a key from external material; see
    /// [`KeyStore::from_external_encoding`]
    pub fn import_key(
        &self,
        format: KeyFormat,
        bytes: &[u8],
        algorithm: &AlgorithmDescriptor,
        extractable: bool,
        usages: KeyUsages,
    ) -> P11Result<CryptoKey> {
        KeyStore::new(self.sessions).from_external_encoding(
            bytes,
            format,
            algorithm,
            usages,
            extractable,
        )
    }

    /// Key material in `format`; see [`KeyStore::to_external_encoding`]
    pub fn export_key(&self, format: KeyFormat, key: &CryptoKey) -> P11Result<Vec<u8>> {
        KeyStore::new(self.sessions).to_external_encoding(key, format)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{logged_in, opened};
    use super::*;
    use crate::adapters::soft_token::SoftModuleLoader;
    use crate::error::{CryptoError, P11Error};
    use crate::model::{AlgorithmName, KeyClass, KeyUsage};

    #[test]
    fn test_spki_round_trip_keeps_metadata() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let pair = subtle
            .generate_key(
                &AlgorithmDescriptor::new("RSA-OAEP")
                    .with_modulus_length(1024)
                    .with_hash("SHA-256"),
                false,
                KeyUsages::from([KeyUsage::Encrypt, KeyUsage::Decrypt]),
            )
            .unwrap()
            .into_pair()
            .unwrap();

        let spki = subtle.export_key(KeyFormat::Spki, &pair.public_key).unwrap();
        let imported = subtle
            .import_key(
                KeyFormat::Spki,
                &spki,
                &AlgorithmDescriptor::new("RSA-OAEP").with_hash("SHA-256"),
                false,
                KeyUsages::from([KeyUsage::Encrypt]),
            )
            .unwrap();
        assert_eq!(imported.kind(), pair.public_key.kind());
        assert_eq!(imported.usages(), pair.public_key.usages());
        // public keys are always extractable
        assert!(imported.extractable());
        assert_eq!(subtle.export_key(KeyFormat::Spki, &imported).unwrap(), spki);

        let alg = AlgorithmDescriptor::new("RSA-OAEP");
        let ciphertext = subtle.encrypt(&alg, &imported, b"to the token").unwrap();
        assert_eq!(
            subtle.decrypt(&alg, &pair.private_key, &ciphertext).unwrap(),
            b"to the token"
        );
    }

    #[test]
    fn test_raw_ec_public_import_without_login() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let pair = subtle
            .generate_key(
                &AlgorithmDescriptor::new("ECDSA").with_named_curve("P-256"),
                false,
                KeyUsages::from([KeyUsage::Sign, KeyUsage::Verify]),
            )
            .unwrap()
            .into_pair()
            .unwrap();
        let raw = subtle.export_key(KeyFormat::Raw, &pair.public_key).unwrap();
        assert_eq!(raw.len(), 65);
        assert_eq!(raw[0], 0x04);

        let other = SoftModuleLoader::new();
        let public_only = opened(&other);
        let subtle = SubtleCrypto::new(&public_only);
        let imported = subtle
            .import_key(
                KeyFormat::Raw,
                &raw,
                &AlgorithmDescriptor::new("ECDSA").with_named_curve("P-256"),
                true,
                KeyUsages::from([KeyUsage::Verify]),
            )
            .unwrap();
        assert_eq!(imported.class(), KeyClass::Public);
        assert_eq!(imported.algorithm_name(), AlgorithmName::Ecdsa);
        assert_eq!(imported.public_point(), Some(raw.as_slice()));
    }

    #[test]
    fn test_import_usage_outside_kind() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);

        let calls = loader.call_count();
        let err = subtle
            .import_key(
                KeyFormat::Raw,
                &[1u8; 16],
                &AlgorithmDescriptor::new("AES-GCM"),
                false,
                KeyUsages::from([KeyUsage::Sign]),
            )
            .unwrap_err();
        assert!(matches!(err, P11Error::Crypto(CryptoError::InvalidKeyUsage { .. })));
        assert_eq!(loader.call_count(), calls);
    }

    #[test]
    fn test_pkcs8_export_of_extractable_private_key() {
        let loader = SoftModuleLoader::new();
        let sessions = logged_in(&loader);
        let subtle = SubtleCrypto::new(&sessions);
        let pair = subtle
            .generate_key(
                &AlgorithmDescriptor::new("Ed25519"),
                true,
                KeyUsages::from([KeyUsage::Sign, KeyUsage::Verify]),
            )
            .unwrap()
            .into_pair()
            .unwrap();

        let pkcs8 = subtle.export_key(KeyFormat::Pkcs8, &pair.private_key).unwrap();
        let imported = subtle
            .import_key(
                KeyFormat::Pkcs8,
                &pkcs8,
                &AlgorithmDescriptor::new("Ed25519"),
                false,
                KeyUsages::from([KeyUsage::Sign]),
            )
            .unwrap();
        let alg = AlgorithmDescriptor::new("Ed25519");
        let signature = subtle.sign(&alg, &imported, b"same key").unwrap();
        assert!(subtle
            .verify(&alg, &pair.public_key, &signature, b"same key")
            .unwrap());
    }
}
