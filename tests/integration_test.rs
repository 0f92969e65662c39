#![cfg(feature = "soft-token")]

use std::sync::{Arc, Once};
use std::thread;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use p11webcrypto::adapters::{SoftModule, SoftModuleLoader, SoftSlot};
use p11webcrypto::error::{CryptoError, KeyManagementError, P11Error, TokenError};
use p11webcrypto::model::{
    AlgorithmDescriptor, AlgorithmName, KeyClass, KeyFormat, KeyUsage, KeyUsages, StorageScope,
};
use p11webcrypto::{CryptoConfig, KeyCriteria, P11Crypto, SessionState};

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn open(loader: &SoftModuleLoader) -> P11Crypto<SoftModule> {
    init_tracing();
    P11Crypto::open(loader, &CryptoConfig::new("soft", "soft").with_pin("1234"))
        .expect("failed to open the software token")
}

#[test]
fn test_random_values_from_token() {
    let loader = SoftModuleLoader::new();
    let crypto = open(&loader);

    let first = crypto.get_random_values(64).unwrap();
    let second = crypto.get_random_values(64).unwrap();
    assert_eq!(first.len(), 64);
    assert_ne!(first, second);
    assert!(crypto.get_random_values(0).unwrap().is_empty());
}

#[test]
fn test_sign_and_verify_detects_tampering() {
    let loader = SoftModuleLoader::new();
    let crypto = open(&loader);
    let subtle = crypto.subtle();
    let alg = AlgorithmDescriptor::new("ECDSA")
        .with_named_curve("P-256")
        .with_hash("SHA-256");

    let pair = subtle
        .generate_key(&alg, false, KeyUsages::from([KeyUsage::Sign, KeyUsage::Verify]))
        .unwrap()
        .into_pair()
        .unwrap();
    let message = b"transfer 10 coins to alice";
    let signature = subtle.sign(&alg, &pair.private_key, message).unwrap();

    assert!(subtle
        .verify(&alg, &pair.public_key, &signature, message)
        .unwrap());
    assert!(!subtle
        .verify(&alg, &pair.public_key, &signature, b"transfer 99 coins to alice")
        .unwrap());
}

#[test]
fn test_encrypt_round_trip_and_wrong_key() {
    let loader = SoftModuleLoader::new();
    let crypto = open(&loader);
    let subtle = crypto.subtle();
    let usages = KeyUsages::from([KeyUsage::Encrypt, KeyUsage::Decrypt]);
    let key_alg = AlgorithmDescriptor::new("AES-GCM").with_length(256);

    let key = subtle
        .generate_key(&key_alg, false, usages)
        .unwrap()
        .into_secret()
        .unwrap();
    let other = subtle
        .generate_key(&key_alg, false, usages)
        .unwrap()
        .into_secret()
        .unwrap();

    let iv = crypto.get_random_values(12).unwrap();
    let alg = AlgorithmDescriptor::new("AES-GCM").with_iv(iv);
    let ciphertext = subtle.encrypt(&alg, &key, b"attack at dawn").unwrap();
    assert_eq!(ciphertext.len(), b"attack at dawn".len() + 16);
    assert_eq!(
        subtle.decrypt(&alg, &key, &ciphertext).unwrap(),
        b"attack at dawn"
    );

    let err = subtle.decrypt(&alg, &other, &ciphertext).unwrap_err();
    assert!(matches!(
        err,
        P11Error::Token(TokenError::OperationFailure { .. })
    ));
}

#[test]
fn test_import_export_keeps_metadata() {
    let loader = SoftModuleLoader::new();
    let crypto = open(&loader);
    let subtle = crypto.subtle();
    let alg = AlgorithmDescriptor::new("HMAC").with_hash("SHA-384");
    let material = [0x5au8; 48];

    let key = subtle
        .import_key(
            KeyFormat::Raw,
            &material,
            &alg,
            true,
            KeyUsages::from([KeyUsage::Sign]),
        )
        .unwrap();
    assert_eq!(key.algorithm_name(), AlgorithmName::Hmac);
    assert_eq!(key.class(), KeyClass::Secret);
    assert_eq!(key.usages(), KeyUsages::from([KeyUsage::Sign]));
    assert!(key.extractable());
    assert_eq!(subtle.export_key(KeyFormat::Raw, &key).unwrap(), material);

    let store = crypto.key_store();
    let saved = store.save_as(&key, true, "hmac-384", None).unwrap();
    assert_eq!(saved.scope(), StorageScope::Token);

    let found = store
        .find(&KeyCriteria::new().with_label("hmac-384"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(found.kind(), key.kind());
    assert_eq!(found.usages(), key.usages());
    store.remove(&found).unwrap();
    assert_eq!(loader.token_object_count(0), 0);
}

#[test]
fn test_non_extractable_key_stays_on_token() {
    let loader = SoftModuleLoader::new();
    let crypto = open(&loader);
    let subtle = crypto.subtle();

    let key = subtle
        .generate_key(
            &AlgorithmDescriptor::new("AES-CBC").with_length(128),
            false,
            KeyUsages::from([KeyUsage::Encrypt, KeyUsage::Decrypt]),
        )
        .unwrap()
        .into_secret()
        .unwrap();

    let calls = loader.call_count();
    let err = subtle.export_key(KeyFormat::Raw, &key).unwrap_err();
    assert!(matches!(
        err,
        P11Error::KeyManagement(KeyManagementError::NotExtractable)
    ));
    assert_eq!(loader.call_count(), calls);
}

#[test]
fn test_unknown_algorithm_makes_no_token_call() {
    let loader = SoftModuleLoader::new();
    let crypto = open(&loader);

    let calls = loader.call_count();
    let err = crypto
        .subtle()
        .digest(&AlgorithmDescriptor::new("WHIRLPOOL"), b"data")
        .unwrap_err();
    assert!(matches!(
        err,
        P11Error::Crypto(CryptoError::UnsupportedAlgorithm { .. })
    ));
    assert_eq!(loader.call_count(), calls);
}

#[test]
fn test_shared_instance_across_threads() {
    let loader = SoftModuleLoader::new();
    let crypto = Arc::new(open(&loader));
    let key = crypto
        .subtle()
        .generate_key(
            &AlgorithmDescriptor::new("HMAC").with_hash("SHA-256"),
            false,
            KeyUsages::from([KeyUsage::Sign, KeyUsage::Verify]),
        )
        .unwrap()
        .into_secret()
        .unwrap();
    let alg = AlgorithmDescriptor::new("HMAC");
    // large enough to stream through init/update/final
    let inputs: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 20 * 1024]).collect();
    let expected: Vec<Vec<u8>> = inputs
        .iter()
        .map(|data| crypto.subtle().sign(&alg, &key, data).unwrap())
        .collect();

    let handles: Vec<_> = inputs
        .into_iter()
        .map(|data| {
            let crypto = Arc::clone(&crypto);
            let key = key.clone();
            let alg = alg.clone();
            thread::spawn(move || {
                let subtle = crypto.subtle();
                let mac = subtle.sign(&alg, &key, &data).unwrap();
                assert!(subtle.verify(&alg, &key, &mac, &data).unwrap());
                assert_eq!(crypto.get_random_values(32).unwrap().len(), 32);
                mac
            })
        })
        .collect();

    let macs: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(macs, expected);
}

#[test]
fn test_separate_instances_run_concurrently() {
    init_tracing();
    let loader = SoftModuleLoader::with_slots(vec![
        SoftSlot::new("first", "1234"),
        SoftSlot::new("second", "5678"),
    ]);
    let secret = [0x3cu8; 32];
    let message = vec![0xa7u8; 12 * 1024];
    let expected = {
        let mut mac = Hmac::<Sha256>::new_from_slice(&secret).unwrap();
        mac.update(&message);
        mac.finalize().into_bytes().to_vec()
    };

    let handles: Vec<_> = [(0usize, "1234"), (1, "5678")]
        .into_iter()
        .map(|(slot, pin)| {
            let loader = loader.clone();
            let message = message.clone();
            thread::spawn(move || {
                let config = CryptoConfig::new("soft", format!("soft-{}", slot))
                    .with_slot(slot)
                    .with_pin(pin);
                let crypto = P11Crypto::open(&loader, &config).unwrap();
                let subtle = crypto.subtle();

                let ecdsa = AlgorithmDescriptor::new("ECDSA")
                    .with_named_curve("P-256")
                    .with_hash("SHA-256");
                let pair = subtle
                    .generate_key(&ecdsa, false, KeyUsages::from([KeyUsage::Sign, KeyUsage::Verify]))
                    .unwrap()
                    .into_pair()
                    .unwrap();
                let signature = subtle.sign(&ecdsa, &pair.private_key, &message).unwrap();
                assert!(subtle
                    .verify(&ecdsa, &pair.public_key, &signature, &message)
                    .unwrap());

                let hmac = AlgorithmDescriptor::new("HMAC").with_hash("SHA-256");
                let key = subtle
                    .import_key(KeyFormat::Raw, &secret, &hmac, false, KeyUsages::from([KeyUsage::Sign]))
                    .unwrap();
                let mac = subtle
                    .sign(&AlgorithmDescriptor::new("HMAC"), &key, &message)
                    .unwrap();
                crypto.close().unwrap();
                (signature, mac)
            })
        })
        .collect();

    let results: Vec<(Vec<u8>, Vec<u8>)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for (signature, mac) in &results {
        assert_eq!(signature.len(), 64);
        assert_eq!(mac, &expected);
    }
    assert_ne!(results[0].0, results[1].0);
    assert_eq!(loader.open_sessions(), 0);
}

#[test]
fn test_close_is_idempotent() {
    let loader = SoftModuleLoader::new();
    let crypto = open(&loader);
    assert_eq!(loader.open_sessions(), 1);

    crypto.close().unwrap();
    crypto.close().unwrap();
    assert_eq!(crypto.session().state(), SessionState::Closed);
    assert_eq!(loader.open_sessions(), 0);

    let err = crypto.get_random_values(8).unwrap_err();
    assert!(matches!(err, P11Error::Token(TokenError::SessionClosed)));
}
