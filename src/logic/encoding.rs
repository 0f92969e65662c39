//! External key encodings
//!
//! Converts between the attribute form a token stores (modulus, exponents,
//! EC parameters and points, secret values) and the interchange formats:
//! raw bytes, DER SubjectPublicKeyInfo and DER PKCS#8.

use der::asn1::OctetStringRef;
use der::{Decode, Encode};
use ed25519_dalek::{SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

use crate::model::{KeyClass, NamedCurve, ED25519_EC_PARAMS};
use crate::ports::{Attribute, AttributeList, AttributeType, KeyType};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("malformed key material: {0}")]
    Malformed(String),

    #[error("attribute {0:?} is missing")]
    MissingAttribute(AttributeType),

    #[error("{0}")]
    Unsupported(String),
}

/// What the decoded material looks like, for metadata checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterialShape {
    Secret { len: usize },
    Rsa { modulus_bits: u32, public_exponent: Vec<u8> },
    Ec { curve: NamedCurve },
    Ed25519,
}

/// Decoded key ready to be turned into a token object
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub class: KeyClass,
    pub key_type: KeyType,
    pub shape: MaterialShape,
    /// Material attributes: values, moduli, curve parameters, points
    pub attributes: Vec<Attribute>,
    /// Uncompressed public point of EC and Ed25519 keys
    pub public_point: Option<Vec<u8>>,
}

/// Encode bytes as a DER OCTET STRING, the `CKA_EC_POINT` convention
pub fn der_octet_string(bytes: &[u8]) -> Result<Vec<u8>, EncodingError> {
    OctetStringRef::new(bytes)
        .and_then(|octets| octets.to_der())
        .map_err(|err| EncodingError::Malformed(err.to_string()))
}

/// Content of a DER OCTET STRING spanning the whole input
pub fn parse_der_octet_string(der: &[u8]) -> Option<&[u8]> {
    OctetStringRef::from_der(der).ok().map(|octets| octets.as_bytes())
}

/// Raw point from a `CKA_EC_POINT` value; tolerates tokens storing it unwrapped
pub fn ec_point_from_attribute(value: &[u8]) -> Vec<u8> {
    match parse_der_octet_string(value) {
        Some(inner) if !inner.is_empty() => inner.to_vec(),
        _ => value.to_vec(),
    }
}

/// Curve of an EC key from its `CKA_EC_PARAMS`
pub fn curve_from_params(params: &[u8]) -> Result<NamedCurve, EncodingError> {
    NamedCurve::from_ec_params(params)
        .ok_or_else(|| EncodingError::Unsupported("unknown EC parameters".to_string()))
}

pub fn secret(value: &[u8]) -> KeyMaterial {
    KeyMaterial {
        class: KeyClass::Secret,
        key_type: KeyType::GENERIC_SECRET,
        shape: MaterialShape::Secret { len: value.len() },
        attributes: vec![Attribute::Value(value.to_vec())],
        public_point: None,
    }
}

pub fn ec_public_material(curve: NamedCurve, point: Vec<u8>) -> Result<KeyMaterial, EncodingError> {
    Ok(KeyMaterial {
        class: KeyClass::Public,
        key_type: KeyType::EC,
        shape: MaterialShape::Ec { curve },
        attributes: vec![
            Attribute::EcParams(curve.ec_params().to_vec()),
            Attribute::EcPoint(der_octet_string(&point)?),
        ],
        public_point: Some(point),
    })
}

fn ed25519_public(point: [u8; 32]) -> Result<KeyMaterial, EncodingError> {
    Ok(KeyMaterial {
        class: KeyClass::Public,
        key_type: KeyType::EC_EDWARDS,
        shape: MaterialShape::Ed25519,
        attributes: vec![
            Attribute::EcParams(ED25519_EC_PARAMS.to_vec()),
            Attribute::EcPoint(der_octet_string(&point)?),
        ],
        public_point: Some(point.to_vec()),
    })
}

pub fn rsa_public_material(key: &RsaPublicKey) -> KeyMaterial {
    let exponent = key.e().to_bytes_be();
    KeyMaterial {
        class: KeyClass::Public,
        key_type: KeyType::RSA,
        shape: MaterialShape::Rsa {
            modulus_bits: (key.size() * 8) as u32,
            public_exponent: exponent.clone(),
        },
        attributes: vec![
            Attribute::Modulus(key.n().to_bytes_be()),
            Attribute::PublicExponent(exponent),
            Attribute::ModulusBits((key.size() * 8) as u64),
        ],
        public_point: None,
    }
}

pub fn rsa_private_material(key: &RsaPrivateKey) -> Result<KeyMaterial, EncodingError> {
    let [p, q] = key.primes() else {
        return Err(EncodingError::Unsupported(
            "multi-prime RSA keys are not supported".to_string(),
        ));
    };
    let exponent = key.e().to_bytes_be();
    Ok(KeyMaterial {
        class: KeyClass::Private,
        key_type: KeyType::RSA,
        shape: MaterialShape::Rsa {
            modulus_bits: (key.size() * 8) as u32,
            public_exponent: exponent.clone(),
        },
        attributes: vec![
            Attribute::Modulus(key.n().to_bytes_be()),
            Attribute::PublicExponent(exponent),
            Attribute::ModulusBits((key.size() * 8) as u64),
            Attribute::PrivateExponent(key.d().to_bytes_be()),
            Attribute::Prime1(p.to_bytes_be()),
            Attribute::Prime2(q.to_bytes_be()),
        ],
        public_point: None,
    })
}

macro_rules! ec_private_material {
    ($curve:ident, $named:expr, $secret:expr) => {{
        let secret: $curve::SecretKey = $secret;
        let point = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        KeyMaterial {
            class: KeyClass::Private,
            key_type: KeyType::EC,
            shape: MaterialShape::Ec { curve: $named },
            attributes: vec![
                Attribute::EcParams($named.ec_params().to_vec()),
                Attribute::Value(secret.to_bytes().to_vec()),
            ],
            public_point: Some(point),
        }
    }};
}

/// Uncompressed EC point, validated against `curve`
pub fn decode_raw_ec_public(curve: NamedCurve, bytes: &[u8]) -> Result<KeyMaterial, EncodingError> {
    let point = match curve {
        NamedCurve::P256 => p256::PublicKey::from_sec1_bytes(bytes)
            .map(|key| key.to_encoded_point(false).as_bytes().to_vec()),
        NamedCurve::P384 => p384::PublicKey::from_sec1_bytes(bytes)
            .map(|key| key.to_encoded_point(false).as_bytes().to_vec()),
    }
    .map_err(|_| EncodingError::Malformed(format!("not a {} point", curve)))?;
    ec_public_material(curve, point)
}

pub fn decode_raw_ed25519_public(bytes: &[u8]) -> Result<KeyMaterial, EncodingError> {
    let point: [u8; 32] = bytes
        .try_into()
        .map_err(|_| EncodingError::Malformed("Ed25519 public keys are 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&point)
        .map_err(|err| EncodingError::Malformed(err.to_string()))?;
    ed25519_public(point)
}

/// Decode a DER SubjectPublicKeyInfo of any supported key type
pub fn decode_spki(der: &[u8]) -> Result<KeyMaterial, EncodingError> {
    if let Ok(key) = RsaPublicKey::from_public_key_der(der) {
        return Ok(rsa_public_material(&key));
    }
    if let Ok(key) = p256::PublicKey::from_public_key_der(der) {
        let point = key.to_encoded_point(false).as_bytes().to_vec();
        return ec_public_material(NamedCurve::P256, point);
    }
    if let Ok(key) = p384::PublicKey::from_public_key_der(der) {
        let point = key.to_encoded_point(false).as_bytes().to_vec();
        return ec_public_material(NamedCurve::P384, point);
    }
    if let Ok(key) = VerifyingKey::from_public_key_der(der) {
        return ed25519_public(key.to_bytes());
    }
    Err(EncodingError::Malformed(
        "not a supported SubjectPublicKeyInfo".to_string(),
    ))
}

/// Decode a DER PKCS#8 PrivateKeyInfo of any supported key type
pub fn decode_pkcs8(der: &[u8]) -> Result<KeyMaterial, EncodingError> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der) {
        return rsa_private_material(&key);
    }
    if let Ok(secret) = p256::SecretKey::from_pkcs8_der(der) {
        return Ok(ec_private_material!(p256, NamedCurve::P256, secret));
    }
    if let Ok(secret) = p384::SecretKey::from_pkcs8_der(der) {
        return Ok(ec_private_material!(p384, NamedCurve::P384, secret));
    }
    if let Ok(key) = SigningKey::from_pkcs8_der(der) {
        return Ok(KeyMaterial {
            class: KeyClass::Private,
            key_type: KeyType::EC_EDWARDS,
            shape: MaterialShape::Ed25519,
            attributes: vec![
                Attribute::EcParams(ED25519_EC_PARAMS.to_vec()),
                Attribute::Value(key.to_bytes().to_vec()),
            ],
            public_point: Some(key.verifying_key().to_bytes().to_vec()),
        });
    }
    Err(EncodingError::Malformed(
        "not a supported PKCS#8 private key".to_string(),
    ))
}

/// Attributes to read from a key object to encode it
pub fn export_attribute_types(key_type: KeyType, class: KeyClass) -> Vec<AttributeType> {
    match (key_type, class) {
        (_, KeyClass::Secret) => vec![AttributeType::VALUE],
        (KeyType::RSA, KeyClass::Public) => {
            vec![AttributeType::MODULUS, AttributeType::PUBLIC_EXPONENT]
        }
        (KeyType::RSA, KeyClass::Private) => vec![
            AttributeType::MODULUS,
            AttributeType::PUBLIC_EXPONENT,
            AttributeType::PRIVATE_EXPONENT,
            AttributeType::PRIME_1,
            AttributeType::PRIME_2,
        ],
        (_, KeyClass::Public) => vec![AttributeType::EC_PARAMS, AttributeType::EC_POINT],
        (_, KeyClass::Private) => vec![AttributeType::EC_PARAMS, AttributeType::VALUE],
    }
}

fn required(attributes: &[Attribute], kind: AttributeType) -> Result<&[u8], EncodingError> {
    attributes
        .bytes(kind)
        .ok_or(EncodingError::MissingAttribute(kind))
}

/// RSA public key from its token attributes
pub fn rsa_public_from(attributes: &[Attribute]) -> Result<RsaPublicKey, EncodingError> {
    let n = BigUint::from_bytes_be(required(attributes, AttributeType::MODULUS)?);
    let e = BigUint::from_bytes_be(required(attributes, AttributeType::PUBLIC_EXPONENT)?);
    RsaPublicKey::new(n, e).map_err(|err| EncodingError::Malformed(err.to_string()))
}

/// RSA private key from its token attributes
pub fn rsa_private_from(attributes: &[Attribute]) -> Result<RsaPrivateKey, EncodingError> {
    let part = |kind| required(attributes, kind).map(BigUint::from_bytes_be);
    RsaPrivateKey::from_components(
        part(AttributeType::MODULUS)?,
        part(AttributeType::PUBLIC_EXPONENT)?,
        part(AttributeType::PRIVATE_EXPONENT)?,
        vec![part(AttributeType::PRIME_1)?, part(AttributeType::PRIME_2)?],
    )
    .map_err(|err| EncodingError::Malformed(err.to_string()))
}

fn der_error(err: impl std::fmt::Display) -> EncodingError {
    EncodingError::Malformed(err.to_string())
}

/// Encode a public key object as SubjectPublicKeyInfo
pub fn encode_spki(key_type: KeyType, attributes: &[Attribute]) -> Result<Vec<u8>, EncodingError> {
    match key_type {
        KeyType::RSA => rsa_public_from(attributes)?
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(der_error),
        KeyType::EC => {
            let curve = curve_from_params(required(attributes, AttributeType::EC_PARAMS)?)?;
            let point = ec_point_from_attribute(required(attributes, AttributeType::EC_POINT)?);
            match curve {
                NamedCurve::P256 => p256::PublicKey::from_sec1_bytes(&point)
                    .map_err(der_error)?
                    .to_public_key_der()
                    .map(|doc| doc.as_bytes().to_vec())
                    .map_err(der_error),
                NamedCurve::P384 => p384::PublicKey::from_sec1_bytes(&point)
                    .map_err(der_error)?
                    .to_public_key_der()
                    .map(|doc| doc.as_bytes().to_vec())
                    .map_err(der_error),
            }
        }
        KeyType::EC_EDWARDS => {
            let point = ec_point_from_attribute(required(attributes, AttributeType::EC_POINT)?);
            let point: [u8; 32] = point
                .as_slice()
                .try_into()
                .map_err(|_| EncodingError::Malformed("Ed25519 point length".to_string()))?;
            VerifyingKey::from_bytes(&point)
                .map_err(der_error)?
                .to_public_key_der()
                .map(|doc| doc.as_bytes().to_vec())
                .map_err(der_error)
        }
        other => Err(EncodingError::Unsupported(format!(
            "no SubjectPublicKeyInfo encoding for key type {:?}",
            other
        ))),
    }
}

/// Encode a private key object as PKCS#8
pub fn encode_pkcs8(key_type: KeyType, attributes: &[Attribute]) -> Result<Vec<u8>, EncodingError> {
    match key_type {
        KeyType::RSA => rsa_private_from(attributes)?
            .to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(der_error),
        KeyType::EC => {
            let curve = curve_from_params(required(attributes, AttributeType::EC_PARAMS)?)?;
            let value = required(attributes, AttributeType::VALUE)?;
            match curve {
                NamedCurve::P256 => p256::SecretKey::from_slice(value)
                    .map_err(der_error)?
                    .to_pkcs8_der()
                    .map(|doc| doc.as_bytes().to_vec())
                    .map_err(der_error),
                NamedCurve::P384 => p384::SecretKey::from_slice(value)
                    .map_err(der_error)?
                    .to_pkcs8_der()
                    .map(|doc| doc.as_bytes().to_vec())
                    .map_err(der_error),
            }
        }
        KeyType::EC_EDWARDS => {
            let seed: [u8; 32] = required(attributes, AttributeType::VALUE)?
                .try_into()
                .map_err(|_| EncodingError::Malformed("Ed25519 seed length".to_string()))?;
            SigningKey::from_bytes(&seed)
                .to_pkcs8_der()
                .map(|doc| doc.as_bytes().to_vec())
                .map_err(der_error)
        }
        other => Err(EncodingError::Unsupported(format!(
            "no PKCS#8 encoding for key type {:?}",
            other
        ))),
    }
}

/// Raw export of a public EC or Ed25519 key: its uncompressed point
pub fn encode_raw_public(key_type: KeyType, attributes: &[Attribute]) -> Result<Vec<u8>, EncodingError> {
    match key_type {
        KeyType::EC | KeyType::EC_EDWARDS => Ok(ec_point_from_attribute(required(
            attributes,
            AttributeType::EC_POINT,
        )?)),
        other => Err(EncodingError::Unsupported(format!(
            "no raw encoding for public key type {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_octet_string_round_trip() {
        let short = [0xAB; 65];
        let wrapped = der_octet_string(&short).unwrap();
        assert_eq!(&wrapped[..2], &[0x04, 65]);
        assert_eq!(parse_der_octet_string(&wrapped), Some(&short[..]));

        let long = [0xCD; 200];
        let wrapped = der_octet_string(&long).unwrap();
        assert_eq!(&wrapped[..3], &[0x04, 0x81, 200]);
        assert_eq!(parse_der_octet_string(&wrapped), Some(&long[..]));

        assert_eq!(parse_der_octet_string(&[0x04, 0x05, 1, 2]), None);
        assert_eq!(parse_der_octet_string(&[0x03, 0x01, 1]), None);
    }

    #[test]
    fn test_octet_string_three_byte_length() {
        let huge = vec![0x11; 0x1_0005];
        let wrapped = der_octet_string(&huge).unwrap();
        assert_eq!(&wrapped[..5], &[0x04, 0x83, 0x01, 0x00, 0x05]);
        assert_eq!(wrapped.len(), huge.len() + 5);
        assert_eq!(parse_der_octet_string(&wrapped), Some(&huge[..]));
        assert_eq!(ec_point_from_attribute(&wrapped), huge);
    }

    #[test]
    fn test_ec_point_attribute_unwrapped_fallback() {
        let point = vec![0x04; 65];
        assert_eq!(ec_point_from_attribute(&der_octet_string(&point).unwrap()), point);
        assert_eq!(ec_point_from_attribute(&point), point);
    }

    #[test]
    fn test_ed25519_pkcs8_round_trip() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let der = signing.to_pkcs8_der().unwrap();

        let material = decode_pkcs8(der.as_bytes()).unwrap();
        assert_eq!(material.class, KeyClass::Private);
        assert_eq!(material.key_type, KeyType::EC_EDWARDS);
        assert_eq!(
            material.public_point.as_deref(),
            Some(&signing.verifying_key().to_bytes()[..])
        );

        let encoded = encode_pkcs8(KeyType::EC_EDWARDS, &material.attributes).unwrap();
        assert_eq!(encoded, der.as_bytes());
    }

    #[test]
    fn test_p256_spki_and_raw_agree() {
        let secret = p256::SecretKey::from_slice(&[0x11; 32]).unwrap();
        let spki = secret.public_key().to_public_key_der().unwrap();
        let raw = secret.public_key().to_encoded_point(false).as_bytes().to_vec();

        let from_spki = decode_spki(spki.as_bytes()).unwrap();
        let from_raw = decode_raw_ec_public(NamedCurve::P256, &raw).unwrap();
        assert_eq!(from_spki.shape, MaterialShape::Ec { curve: NamedCurve::P256 });
        assert_eq!(from_spki.attributes, from_raw.attributes);
        assert_eq!(
            encode_raw_public(KeyType::EC, &from_spki.attributes).unwrap(),
            raw
        );
        assert_eq!(
            encode_spki(KeyType::EC, &from_raw.attributes).unwrap(),
            spki.as_bytes()
        );
    }

    #[test]
    fn test_raw_point_wrong_curve_rejected() {
        let secret = p256::SecretKey::from_slice(&[0x22; 32]).unwrap();
        let raw = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        assert!(decode_raw_ec_public(NamedCurve::P384, &raw).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            decode_spki(b"not der at all"),
            Err(EncodingError::Malformed(_))
        ));
        assert!(decode_pkcs8(&[0x30, 0x03, 0x02, 0x01, 0x00]).is_err());
        assert!(decode_raw_ed25519_public(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_missing_attribute_reported() {
        let err = encode_spki(KeyType::RSA, &[Attribute::Modulus(vec![1])]).unwrap_err();
        assert_eq!(
            err,
            EncodingError::MissingAttribute(AttributeType::PUBLIC_EXPONENT)
        );
    }
}
