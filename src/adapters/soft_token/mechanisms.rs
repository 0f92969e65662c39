//! Mechanisms of the software token, run over object attributes
//!
//! Every function reports failures as the `CKR_*` value a hardware token
//! would return; the session adds the function name.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use ed25519_dalek::{Signer, Verifier};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{BigUint, Oaep, Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use super::store::SoftObject;
use crate::logic::encoding::{
    der_octet_string, ec_point_from_attribute, ec_public_material, rsa_private_from,
    rsa_private_material, rsa_public_from, rsa_public_material,
};
use crate::model::{
    HashAlgorithm, Mechanism, MechanismParams, MechanismType, MgfType, NamedCurve,
    ED25519_EC_PARAMS,
};
use crate::ports::{Attribute, AttributeList, AttributeType, KeyType, ObjectClass, ReturnValue};

type Aes192Gcm = AesGcm<Aes192, U12>;

pub(crate) type MechResult<T> = Result<T, ReturnValue>;

const GCM_IV_LEN: usize = 12;
const GCM_TAG_BITS: u32 = 128;
const CBC_IV_LEN: usize = 16;
const MIN_RSA_BITS: u64 = 512;
const MAX_RSA_BITS: u64 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Encrypt,
    Decrypt,
}

pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn hash_bytes(hash: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match hash {
        HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
    }
}

fn boxed_digest(hash: HashAlgorithm) -> Box<dyn sha2::digest::DynDigest + Send + Sync> {
    match hash {
        HashAlgorithm::Sha1 => Box::new(Sha1::new()),
        HashAlgorithm::Sha256 => Box::new(Sha256::new()),
        HashAlgorithm::Sha384 => Box::new(Sha384::new()),
        HashAlgorithm::Sha512 => Box::new(Sha512::new()),
    }
}

fn expect_type(key: &SoftObject, key_type: KeyType) -> MechResult<()> {
    if key.key_type() == Some(key_type) {
        Ok(())
    } else {
        Err(ReturnValue::KEY_TYPE_INCONSISTENT)
    }
}

fn expect_class(key: &SoftObject, class: ObjectClass) -> MechResult<()> {
    if key.class() == Some(class) {
        Ok(())
    } else {
        Err(ReturnValue::KEY_TYPE_INCONSISTENT)
    }
}

fn value(key: &SoftObject) -> MechResult<&[u8]> {
    key.bytes(AttributeType::VALUE)
        .ok_or(ReturnValue::KEY_TYPE_INCONSISTENT)
}

fn curve_of(key: &SoftObject) -> MechResult<NamedCurve> {
    key.bytes(AttributeType::EC_PARAMS)
        .and_then(NamedCurve::from_ec_params)
        .ok_or(ReturnValue::KEY_TYPE_INCONSISTENT)
}

fn public_point(key: &SoftObject) -> MechResult<Vec<u8>> {
    key.bytes(AttributeType::EC_POINT)
        .map(ec_point_from_attribute)
        .ok_or(ReturnValue::KEY_TYPE_INCONSISTENT)
}

fn rsa_public(key: &SoftObject) -> MechResult<RsaPublicKey> {
    expect_type(key, KeyType::RSA)?;
    rsa_public_from(key.attributes()).map_err(|_| ReturnValue::KEY_TYPE_INCONSISTENT)
}

fn rsa_private(key: &SoftObject) -> MechResult<RsaPrivateKey> {
    expect_type(key, KeyType::RSA)?;
    expect_class(key, ObjectClass::PRIVATE_KEY)?;
    rsa_private_from(key.attributes()).map_err(|_| ReturnValue::KEY_TYPE_INCONSISTENT)
}

fn ed25519_seed(key: &SoftObject) -> MechResult<[u8; 32]> {
    expect_type(key, KeyType::EC_EDWARDS)?;
    value(key)?
        .try_into()
        .map_err(|_| ReturnValue::KEY_TYPE_INCONSISTENT)
}

pub(crate) fn digest(mechanism: &Mechanism, data: &[u8]) -> MechResult<Vec<u8>> {
    let hash = HashAlgorithm::from_digest_mechanism(mechanism.mechanism_type)
        .ok_or(ReturnValue::MECHANISM_INVALID)?;
    Ok(hash_bytes(hash, data))
}

fn gcm_apply<C>(direction: Direction, key: &[u8], iv: &[u8], aad: &[u8], data: &[u8]) -> MechResult<Vec<u8>>
where
    C: KeyInit + Aead<NonceSize = U12>,
{
    let cipher = C::new_from_slice(key).map_err(|_| ReturnValue::KEY_SIZE_RANGE)?;
    let nonce = GenericArray::from_slice(iv);
    let payload = Payload { msg: data, aad };
    match direction {
        Direction::Encrypt => cipher
            .encrypt(nonce, payload)
            .map_err(|_| ReturnValue::FUNCTION_FAILED),
        Direction::Decrypt => cipher
            .decrypt(nonce, payload)
            .map_err(|_| ReturnValue::ENCRYPTED_DATA_INVALID),
    }
}

fn aes_gcm(
    direction: Direction,
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    tag_bits: u32,
    data: &[u8],
) -> MechResult<Vec<u8>> {
    if iv.len() != GCM_IV_LEN || tag_bits != GCM_TAG_BITS {
        return Err(ReturnValue::MECHANISM_PARAM_INVALID);
    }
    match key.len() {
        16 => gcm_apply::<Aes128Gcm>(direction, key, iv, aad, data),
        24 => gcm_apply::<Aes192Gcm>(direction, key, iv, aad, data),
        32 => gcm_apply::<Aes256Gcm>(direction, key, iv, aad, data),
        _ => Err(ReturnValue::KEY_SIZE_RANGE),
    }
}

macro_rules! cbc_apply {
    ($cipher:ty, $direction:expr, $key:expr, $iv:expr, $data:expr) => {
        match $direction {
            Direction::Encrypt => cbc::Encryptor::<$cipher>::new_from_slices($key, $iv)
                .map(|cipher| cipher.encrypt_padded_vec_mut::<Pkcs7>($data))
                .map_err(|_| ReturnValue::KEY_SIZE_RANGE),
            Direction::Decrypt => cbc::Decryptor::<$cipher>::new_from_slices($key, $iv)
                .map_err(|_| ReturnValue::KEY_SIZE_RANGE)
                .and_then(|cipher| {
                    cipher
                        .decrypt_padded_vec_mut::<Pkcs7>($data)
                        .map_err(|_| ReturnValue::ENCRYPTED_DATA_INVALID)
                }),
        }
    };
}

fn aes_cbc_pad(direction: Direction, key: &[u8], iv: &[u8], data: &[u8]) -> MechResult<Vec<u8>> {
    if iv.len() != CBC_IV_LEN {
        return Err(ReturnValue::MECHANISM_PARAM_INVALID);
    }
    match key.len() {
        16 => cbc_apply!(Aes128, direction, key, iv, data),
        24 => cbc_apply!(Aes192, direction, key, iv, data),
        32 => cbc_apply!(Aes256, direction, key, iv, data),
        _ => Err(ReturnValue::KEY_SIZE_RANGE),
    }
}

fn oaep(hash: MechanismType, mgf: MgfType, label: &[u8]) -> MechResult<Oaep> {
    let hash =
        HashAlgorithm::from_digest_mechanism(hash).ok_or(ReturnValue::MECHANISM_PARAM_INVALID)?;
    let mgf_hash = mgf.hash().ok_or(ReturnValue::MECHANISM_PARAM_INVALID)?;
    let label = if label.is_empty() {
        None
    } else {
        Some(String::from_utf8(label.to_vec()).map_err(|_| ReturnValue::MECHANISM_PARAM_INVALID)?)
    };
    Ok(Oaep {
        digest: boxed_digest(hash),
        mgf_digest: boxed_digest(mgf_hash),
        label,
    })
}

/// Encrypt or decrypt `data` with `key`
pub(crate) fn cipher(
    direction: Direction,
    mechanism: &Mechanism,
    key: &SoftObject,
    data: &[u8],
) -> MechResult<Vec<u8>> {
    match (mechanism.mechanism_type, &mechanism.params) {
        (
            MechanismType::AES_GCM,
            MechanismParams::Gcm {
                iv,
                additional_data,
                tag_bits,
            },
        ) => {
            expect_type(key, KeyType::AES)?;
            aes_gcm(direction, value(key)?, iv, additional_data, *tag_bits, data)
        }
        (MechanismType::AES_CBC_PAD, MechanismParams::Iv(iv)) => {
            expect_type(key, KeyType::AES)?;
            aes_cbc_pad(direction, value(key)?, iv, data)
        }
        (MechanismType::RSA_PKCS_OAEP, MechanismParams::Oaep { hash, mgf, label }) => {
            let padding = oaep(*hash, *mgf, label)?;
            match direction {
                Direction::Encrypt => {
                    expect_class(key, ObjectClass::PUBLIC_KEY)?;
                    rsa_public(key)?
                        .encrypt(&mut OsRng, padding, data)
                        .map_err(|_| ReturnValue::DATA_LEN_RANGE)
                }
                Direction::Decrypt => rsa_private(key)?
                    .decrypt(padding, data)
                    .map_err(|_| ReturnValue::ENCRYPTED_DATA_INVALID),
            }
        }
        (MechanismType::AES_GCM | MechanismType::AES_CBC_PAD | MechanismType::RSA_PKCS_OAEP, _) => {
            Err(ReturnValue::MECHANISM_PARAM_INVALID)
        }
        _ => Err(ReturnValue::MECHANISM_INVALID),
    }
}

fn hmac_hash(mechanism: MechanismType) -> Option<HashAlgorithm> {
    match mechanism {
        MechanismType::SHA_1_HMAC => Some(HashAlgorithm::Sha1),
        MechanismType::SHA256_HMAC => Some(HashAlgorithm::Sha256),
        MechanismType::SHA384_HMAC => Some(HashAlgorithm::Sha384),
        MechanismType::SHA512_HMAC => Some(HashAlgorithm::Sha512),
        _ => None,
    }
}

fn pkcs1_hash(mechanism: MechanismType) -> Option<HashAlgorithm> {
    match mechanism {
        MechanismType::SHA1_RSA_PKCS => Some(HashAlgorithm::Sha1),
        MechanismType::SHA256_RSA_PKCS => Some(HashAlgorithm::Sha256),
        MechanismType::SHA384_RSA_PKCS => Some(HashAlgorithm::Sha384),
        MechanismType::SHA512_RSA_PKCS => Some(HashAlgorithm::Sha512),
        _ => None,
    }
}

fn pss_hash(mechanism: MechanismType) -> Option<HashAlgorithm> {
    match mechanism {
        MechanismType::SHA1_RSA_PKCS_PSS => Some(HashAlgorithm::Sha1),
        MechanismType::SHA256_RSA_PKCS_PSS => Some(HashAlgorithm::Sha256),
        MechanismType::SHA384_RSA_PKCS_PSS => Some(HashAlgorithm::Sha384),
        MechanismType::SHA512_RSA_PKCS_PSS => Some(HashAlgorithm::Sha512),
        _ => None,
    }
}

fn ecdsa_hash(mechanism: MechanismType) -> Option<HashAlgorithm> {
    match mechanism {
        MechanismType::ECDSA_SHA1 => Some(HashAlgorithm::Sha1),
        MechanismType::ECDSA_SHA256 => Some(HashAlgorithm::Sha256),
        MechanismType::ECDSA_SHA384 => Some(HashAlgorithm::Sha384),
        MechanismType::ECDSA_SHA512 => Some(HashAlgorithm::Sha512),
        _ => None,
    }
}

fn pkcs1v15(hash: HashAlgorithm) -> Pkcs1v15Sign {
    match hash {
        HashAlgorithm::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
        HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
        HashAlgorithm::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
        HashAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
    }
}

fn pss(hash: HashAlgorithm, mechanism: &Mechanism) -> MechResult<Pss> {
    match mechanism.params {
        MechanismParams::Pss { salt_length, .. } => Ok(Pss {
            blinded: true,
            digest: boxed_digest(hash),
            salt_len: salt_length as usize,
        }),
        _ => Err(ReturnValue::MECHANISM_PARAM_INVALID),
    }
}

macro_rules! hmac_mac {
    ($digest:ty, $key:expr, $data:expr) => {{
        let mut mac = <Hmac<$digest> as Mac>::new_from_slice($key)
            .map_err(|_| ReturnValue::KEY_SIZE_RANGE)?;
        Mac::update(&mut mac, $data);
        mac
    }};
}

fn hmac_sign(hash: HashAlgorithm, key: &[u8], data: &[u8]) -> MechResult<Vec<u8>> {
    Ok(match hash {
        HashAlgorithm::Sha1 => Mac::finalize(hmac_mac!(Sha1, key, data)).into_bytes().to_vec(),
        HashAlgorithm::Sha256 => Mac::finalize(hmac_mac!(Sha256, key, data)).into_bytes().to_vec(),
        HashAlgorithm::Sha384 => Mac::finalize(hmac_mac!(Sha384, key, data)).into_bytes().to_vec(),
        HashAlgorithm::Sha512 => Mac::finalize(hmac_mac!(Sha512, key, data)).into_bytes().to_vec(),
    })
}

fn hmac_verify(hash: HashAlgorithm, key: &[u8], data: &[u8], tag: &[u8]) -> MechResult<()> {
    if tag.len() != hash.output_len() {
        return Err(ReturnValue::SIGNATURE_LEN_RANGE);
    }
    let verified = match hash {
        HashAlgorithm::Sha1 => Mac::verify_slice(hmac_mac!(Sha1, key, data), tag),
        HashAlgorithm::Sha256 => Mac::verify_slice(hmac_mac!(Sha256, key, data), tag),
        HashAlgorithm::Sha384 => Mac::verify_slice(hmac_mac!(Sha384, key, data), tag),
        HashAlgorithm::Sha512 => Mac::verify_slice(hmac_mac!(Sha512, key, data), tag),
    };
    verified.map_err(|_| ReturnValue::SIGNATURE_INVALID)
}

macro_rules! ecdsa_sign {
    ($curve:ident, $secret:expr, $digest:expr) => {{
        let signing = $curve::ecdsa::SigningKey::from_slice($secret)
            .map_err(|_| ReturnValue::KEY_TYPE_INCONSISTENT)?;
        let signature: $curve::ecdsa::Signature = signing
            .sign_prehash($digest)
            .map_err(|_| ReturnValue::FUNCTION_FAILED)?;
        signature.to_bytes().to_vec()
    }};
}

macro_rules! ecdsa_verify {
    ($curve:ident, $point:expr, $digest:expr, $signature:expr) => {{
        let verifying = $curve::ecdsa::VerifyingKey::from_sec1_bytes($point)
            .map_err(|_| ReturnValue::KEY_TYPE_INCONSISTENT)?;
        let signature = $curve::ecdsa::Signature::from_slice($signature)
            .map_err(|_| ReturnValue::SIGNATURE_LEN_RANGE)?;
        verifying
            .verify_prehash($digest, &signature)
            .map_err(|_| ReturnValue::SIGNATURE_INVALID)
    }};
}

pub(crate) fn sign(mechanism: &Mechanism, key: &SoftObject, data: &[u8]) -> MechResult<Vec<u8>> {
    let mechanism_type = mechanism.mechanism_type;
    if let Some(hash) = hmac_hash(mechanism_type) {
        expect_class(key, ObjectClass::SECRET_KEY)?;
        return hmac_sign(hash, value(key)?, data);
    }
    if let Some(hash) = pkcs1_hash(mechanism_type) {
        return rsa_private(key)?
            .sign(pkcs1v15(hash), &hash_bytes(hash, data))
            .map_err(|_| ReturnValue::FUNCTION_FAILED);
    }
    if let Some(hash) = pss_hash(mechanism_type) {
        let padding = pss(hash, mechanism)?;
        return rsa_private(key)?
            .sign_with_rng(&mut OsRng, padding, &hash_bytes(hash, data))
            .map_err(|_| ReturnValue::FUNCTION_FAILED);
    }
    if let Some(hash) = ecdsa_hash(mechanism_type) {
        expect_type(key, KeyType::EC)?;
        expect_class(key, ObjectClass::PRIVATE_KEY)?;
        let digest = hash_bytes(hash, data);
        return Ok(match curve_of(key)? {
            NamedCurve::P256 => ecdsa_sign!(p256, value(key)?, &digest),
            NamedCurve::P384 => ecdsa_sign!(p384, value(key)?, &digest),
        });
    }
    if mechanism_type == MechanismType::EDDSA {
        expect_class(key, ObjectClass::PRIVATE_KEY)?;
        let signing = ed25519_dalek::SigningKey::from_bytes(&ed25519_seed(key)?);
        return Ok(signing.sign(data).to_bytes().to_vec());
    }
    Err(ReturnValue::MECHANISM_INVALID)
}

pub(crate) fn verify(
    mechanism: &Mechanism,
    key: &SoftObject,
    data: &[u8],
    signature: &[u8],
) -> MechResult<()> {
    let mechanism_type = mechanism.mechanism_type;
    if let Some(hash) = hmac_hash(mechanism_type) {
        expect_class(key, ObjectClass::SECRET_KEY)?;
        return hmac_verify(hash, value(key)?, data, signature);
    }
    if let Some(hash) = pkcs1_hash(mechanism_type) {
        let public = rsa_public(key)?;
        return public
            .verify(pkcs1v15(hash), &hash_bytes(hash, data), signature)
            .map_err(|_| ReturnValue::SIGNATURE_INVALID);
    }
    if let Some(hash) = pss_hash(mechanism_type) {
        let padding = pss(hash, mechanism)?;
        let public = rsa_public(key)?;
        return public
            .verify(padding, &hash_bytes(hash, data), signature)
            .map_err(|_| ReturnValue::SIGNATURE_INVALID);
    }
    if let Some(hash) = ecdsa_hash(mechanism_type) {
        expect_type(key, KeyType::EC)?;
        expect_class(key, ObjectClass::PUBLIC_KEY)?;
        let digest = hash_bytes(hash, data);
        let point = public_point(key)?;
        return match curve_of(key)? {
            NamedCurve::P256 => ecdsa_verify!(p256, &point, &digest, signature),
            NamedCurve::P384 => ecdsa_verify!(p384, &point, &digest, signature),
        };
    }
    if mechanism_type == MechanismType::EDDSA {
        expect_type(key, KeyType::EC_EDWARDS)?;
        expect_class(key, ObjectClass::PUBLIC_KEY)?;
        let point: [u8; 32] = public_point(key)?
            .as_slice()
            .try_into()
            .map_err(|_| ReturnValue::KEY_TYPE_INCONSISTENT)?;
        let verifying = ed25519_dalek::VerifyingKey::from_bytes(&point)
            .map_err(|_| ReturnValue::KEY_TYPE_INCONSISTENT)?;
        let signature = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| ReturnValue::SIGNATURE_LEN_RANGE)?;
        return verifying
            .verify(data, &signature)
            .map_err(|_| ReturnValue::SIGNATURE_INVALID);
    }
    Err(ReturnValue::MECHANISM_INVALID)
}

fn requested_key_type(template: &[Attribute], generated: KeyType) -> MechResult<()> {
    match template.key_type() {
        Some(key_type) if key_type != generated => Err(ReturnValue::TEMPLATE_INCONSISTENT),
        _ => Ok(()),
    }
}

fn value_len(template: &[Attribute]) -> MechResult<usize> {
    match template.ulong(AttributeType::VALUE_LEN) {
        Some(0) => Err(ReturnValue::KEY_SIZE_RANGE),
        Some(len) => Ok(len as usize),
        None => Err(ReturnValue::TEMPLATE_INCOMPLETE),
    }
}

fn check_aes_len(key_type: Option<KeyType>, len: usize) -> MechResult<()> {
    if key_type == Some(KeyType::AES) && !matches!(len, 16 | 24 | 32) {
        return Err(ReturnValue::KEY_SIZE_RANGE);
    }
    Ok(())
}

/// Material attributes of a new secret key
pub(crate) fn generate_secret(mechanism: &Mechanism, template: &[Attribute]) -> MechResult<Vec<Attribute>> {
    let key_type = match mechanism.mechanism_type {
        MechanismType::AES_KEY_GEN => KeyType::AES,
        MechanismType::GENERIC_SECRET_KEY_GEN => KeyType::GENERIC_SECRET,
        _ => return Err(ReturnValue::MECHANISM_INVALID),
    };
    requested_key_type(template, key_type)?;
    let len = value_len(template)?;
    check_aes_len(Some(key_type), len)?;
    Ok(vec![
        Attribute::Class(ObjectClass::SECRET_KEY),
        Attribute::KeyType(key_type),
        Attribute::Value(random_bytes(len)),
        Attribute::ValueLen(len as u64),
    ])
}

macro_rules! ec_key_pair {
    ($curve:ident) => {{
        let secret = $curve::SecretKey::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        (secret.to_bytes().to_vec(), point)
    }};
}

/// Material attributes of a new key pair, public half first
pub(crate) fn generate_pair(
    mechanism: &Mechanism,
    public_template: &[Attribute],
    private_template: &[Attribute],
) -> MechResult<(Vec<Attribute>, Vec<Attribute>)> {
    let (key_type, mut public, mut private) = match mechanism.mechanism_type {
        MechanismType::RSA_PKCS_KEY_PAIR_GEN => {
            let bits = public_template
                .ulong(AttributeType::MODULUS_BITS)
                .ok_or(ReturnValue::TEMPLATE_INCOMPLETE)?;
            if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
                return Err(ReturnValue::KEY_SIZE_RANGE);
            }
            let exponent = public_template
                .bytes(AttributeType::PUBLIC_EXPONENT)
                .map(BigUint::from_bytes_be)
                .unwrap_or_else(|| BigUint::from(65_537u32));
            let key = RsaPrivateKey::new_with_exp(&mut OsRng, bits as usize, &exponent)
                .map_err(|_| ReturnValue::TEMPLATE_INCONSISTENT)?;
            let private = rsa_private_material(&key)
                .map_err(|_| ReturnValue::FUNCTION_FAILED)?
                .attributes;
            let public = rsa_public_material(&key.to_public_key()).attributes;
            (KeyType::RSA, public, private)
        }
        MechanismType::EC_KEY_PAIR_GEN => {
            let curve = public_template
                .bytes(AttributeType::EC_PARAMS)
                .ok_or(ReturnValue::TEMPLATE_INCOMPLETE)
                .and_then(|params| {
                    NamedCurve::from_ec_params(params).ok_or(ReturnValue::ATTRIBUTE_VALUE_INVALID)
                })?;
            let (secret, point) = match curve {
                NamedCurve::P256 => ec_key_pair!(p256),
                NamedCurve::P384 => ec_key_pair!(p384),
            };
            let public = ec_public_material(curve, point)
                .map_err(|_| ReturnValue::FUNCTION_FAILED)?
                .attributes;
            let private = vec![
                Attribute::EcParams(curve.ec_params().to_vec()),
                Attribute::Value(secret),
            ];
            (KeyType::EC, public, private)
        }
        MechanismType::EC_EDWARDS_KEY_PAIR_GEN => {
            match public_template.bytes(AttributeType::EC_PARAMS) {
                Some(params) if params != ED25519_EC_PARAMS => {
                    return Err(ReturnValue::ATTRIBUTE_VALUE_INVALID)
                }
                _ => {}
            }
            let seed: [u8; 32] = random_bytes(32)
                .try_into()
                .map_err(|_| ReturnValue::FUNCTION_FAILED)?;
            let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
            let public = vec![
                Attribute::EcParams(ED25519_EC_PARAMS.to_vec()),
                Attribute::EcPoint(
                    der_octet_string(signing.verifying_key().as_bytes())
                        .map_err(|_| ReturnValue::FUNCTION_FAILED)?,
                ),
            ];
            let private = vec![
                Attribute::EcParams(ED25519_EC_PARAMS.to_vec()),
                Attribute::Value(seed.to_vec()),
            ];
            (KeyType::EC_EDWARDS, public, private)
        }
        _ => return Err(ReturnValue::MECHANISM_INVALID),
    };
    requested_key_type(public_template, key_type)?;
    requested_key_type(private_template, key_type)?;

    public.push(Attribute::Class(ObjectClass::PUBLIC_KEY));
    public.push(Attribute::KeyType(key_type));
    private.push(Attribute::Class(ObjectClass::PRIVATE_KEY));
    private.push(Attribute::KeyType(key_type));
    Ok((public, private))
}

macro_rules! ecdh_shared {
    ($curve:ident, $secret:expr, $peer:expr) => {{
        let secret = $curve::SecretKey::from_slice($secret)
            .map_err(|_| ReturnValue::KEY_TYPE_INCONSISTENT)?;
        let peer = $curve::PublicKey::from_sec1_bytes($peer)
            .map_err(|_| ReturnValue::MECHANISM_PARAM_INVALID)?;
        $curve::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine())
            .raw_secret_bytes()
            .to_vec()
    }};
}

macro_rules! hkdf_okm {
    ($digest:ty, $salt:expr, $ikm:expr, $info:expr, $okm:expr) => {
        Hkdf::<$digest>::new(Some($salt.as_slice()), $ikm)
            .expand($info.as_slice(), $okm)
            .map_err(|_| ReturnValue::KEY_SIZE_RANGE)
    };
}

fn prf_hash(prf: MechanismType) -> MechResult<HashAlgorithm> {
    HashAlgorithm::from_digest_mechanism(prf).ok_or(ReturnValue::MECHANISM_PARAM_INVALID)
}

/// Material attributes of a key derived from `base`
pub(crate) fn derive(
    mechanism: &Mechanism,
    base: &SoftObject,
    template: &[Attribute],
) -> MechResult<Vec<Attribute>> {
    let len = value_len(template)?;
    check_aes_len(template.key_type(), len)?;

    let material = match (mechanism.mechanism_type, &mechanism.params) {
        (MechanismType::ECDH1_DERIVE, MechanismParams::Ecdh { public_data }) => {
            expect_type(base, KeyType::EC)?;
            expect_class(base, ObjectClass::PRIVATE_KEY)?;
            let mut shared = match curve_of(base)? {
                NamedCurve::P256 => ecdh_shared!(p256, value(base)?, public_data),
                NamedCurve::P384 => ecdh_shared!(p384, value(base)?, public_data),
            };
            if len > shared.len() {
                return Err(ReturnValue::KEY_SIZE_RANGE);
            }
            shared.truncate(len);
            shared
        }
        (MechanismType::HKDF_DERIVE, MechanismParams::Hkdf { prf, salt, info }) => {
            expect_class(base, ObjectClass::SECRET_KEY)?;
            let ikm = value(base)?;
            let mut okm = vec![0u8; len];
            match prf_hash(*prf)? {
                HashAlgorithm::Sha1 => hkdf_okm!(Sha1, salt, ikm, info, &mut okm),
                HashAlgorithm::Sha256 => hkdf_okm!(Sha256, salt, ikm, info, &mut okm),
                HashAlgorithm::Sha384 => hkdf_okm!(Sha384, salt, ikm, info, &mut okm),
                HashAlgorithm::Sha512 => hkdf_okm!(Sha512, salt, ikm, info, &mut okm),
            }?;
            okm
        }
        (
            MechanismType::PKCS5_PBKD2,
            MechanismParams::Pbkdf2 {
                prf,
                salt,
                iterations,
            },
        ) => {
            expect_class(base, ObjectClass::SECRET_KEY)?;
            let password = value(base)?;
            let mut okm = vec![0u8; len];
            match prf_hash(*prf)? {
                HashAlgorithm::Sha1 => pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, *iterations, &mut okm),
                HashAlgorithm::Sha256 => {
                    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, *iterations, &mut okm)
                }
                HashAlgorithm::Sha384 => {
                    pbkdf2::pbkdf2_hmac::<Sha384>(password, salt, *iterations, &mut okm)
                }
                HashAlgorithm::Sha512 => {
                    pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, *iterations, &mut okm)
                }
            }
            okm
        }
        (
            MechanismType::ECDH1_DERIVE | MechanismType::HKDF_DERIVE | MechanismType::PKCS5_PBKD2,
            _,
        ) => return Err(ReturnValue::MECHANISM_PARAM_INVALID),
        _ => return Err(ReturnValue::MECHANISM_INVALID),
    };

    Ok(vec![
        Attribute::Class(ObjectClass::SECRET_KEY),
        Attribute::Value(material),
        Attribute::ValueLen(len as u64),
    ])
}
