use tracing::{info, warn};

use super::SubtleCrypto;
use crate::error::{CryptoError, P11Result};
use crate::logic::encoding::ec_point_from_attribute;
use crate::logic::templates::{validate_usages, KeySpec};
use crate::logic::Purpose;
use crate::model::{
    AlgorithmDescriptor, AsymmetricKeyAlgorithm, CryptoKey, CryptoKeyPair, GeneratedKey, KeyKind,
    KeyUsages, Mechanism, MechanismType,
};
use crate::ports::{AttributeList, AttributeType, ObjectManager, SessionControl, TokenModule};

impl<M: TokenModule> SubtleCrypto<'_, M> {
    /// Generate a secret key or a key pair on the token
    ///
    /// For pairs, `usages` is split between the halves: the public key gets
    /// the public usages (encrypt, verify, wrapKey) and is always
    /// extractable; `extractable` applies to the private key.
    ///
    /// # Errors
    ///
    /// - `UnsupportedAlgorithm` for names that cannot be generated
    /// - `MechanismParameter` for bad lengths, curves or exponents
    /// - `InvalidKeyUsage` for usages the algorithm does not allow, or no
    ///   usage at all for the secret or private key
    /// - `NotAuthenticated` without login
    pub fn generate_key(
        &self,
        algorithm: &AlgorithmDescriptor,
        extractable: bool,
        usages: KeyUsages,
    ) -> P11Result<GeneratedKey> {
        let mechanism = self
            .mapper()
            .resolve(Purpose::GenerateKey, algorithm, None)?;
        match mechanism.mechanism_type {
            MechanismType::AES_KEY_GEN | MechanismType::GENERIC_SECRET_KEY_GEN => self
                .generate_secret(&mechanism, algorithm, extractable, usages)
                .map(GeneratedKey::Secret),
            _ => self
                .generate_pair(&mechanism, algorithm, extractable, usages)
                .map(GeneratedKey::Pair),
        }
    }

    fn generate_secret(
        &self,
        mechanism: &Mechanism,
        algorithm: &AlgorithmDescriptor,
        extractable: bool,
        usages: KeyUsages,
    ) -> P11Result<CryptoKey> {
        let kind = KeyKind::Secret(self.mapper().secret_algorithm(algorithm)?);
        validate_usages(&kind, usages)?;
        let spec = KeySpec::new(kind, usages, extractable);
        let template = spec.generation_template();

        self.sessions.with_authenticated_session(|session| {
            let origin = self.sessions.origin(session.handle());
            let handle = session.generate_key(mechanism, &template)?;
            info!("Generated {} key {:?}", spec.kind.algorithm_name(), handle);
            Ok(spec.into_key(handle, origin))
        })
    }

    fn generate_pair(
        &self,
        mechanism: &Mechanism,
        algorithm: &AlgorithmDescriptor,
        extractable: bool,
        usages: KeyUsages,
    ) -> P11Result<CryptoKeyPair> {
        let asymmetric = self.mapper().asymmetric_algorithm(algorithm)?;
        let has_point = !matches!(asymmetric, AsymmetricKeyAlgorithm::Rsa { .. });
        let public_kind = KeyKind::Public(asymmetric.clone());
        let private_kind = KeyKind::Private(asymmetric);

        let public_permitted = public_kind.permitted_usages();
        let private_permitted = private_kind.permitted_usages();
        let foreign = usages.difference(public_permitted.union(private_permitted));
        if !foreign.is_empty() {
            return Err(CryptoError::InvalidKeyUsage {
                usage: format!("{} for {} keys", foreign, private_kind.algorithm_name()),
            }
            .into());
        }
        let private_usages = usages.intersection(private_permitted);
        validate_usages(&private_kind, private_usages)?;

        let public_spec = KeySpec::new(public_kind, usages.intersection(public_permitted), true);
        let private_spec = KeySpec::new(private_kind, private_usages, extractable);
        let public_template = public_spec.generation_template();
        let private_template = private_spec.generation_template();

        self.sessions.with_authenticated_session(|session| {
            let origin = self.sessions.origin(session.handle());
            let (public, private) =
                session.generate_key_pair(mechanism, &public_template, &private_template)?;
            info!(
                "Generated {} key pair {:?}/{:?}",
                private_spec.kind.algorithm_name(),
                public,
                private
            );
            let point = if has_point {
                match session.get_attributes(public, &[AttributeType::EC_POINT]) {
                    Ok(attributes) => attributes
                        .bytes(AttributeType::EC_POINT)
                        .map(ec_point_from_attribute),
                    Err(fault) => {
                        // the caller never sees these handles
                        for handle in [public, private] {
                            if let Err(err) = session.destroy_object(handle) {
                                warn!("Failed to destroy {:?} of unfinished pair: {}", handle, err);
                            }
                        }
                        return Err(fault.into());
                    }
                }
            } else {
                None
            };

            let public_key = public_spec.into_key(public, origin);
            let public_key = match point {
                Some(point) => public_key.with_public_point(point),
                None => public_key,
            };
            Ok(CryptoKeyPair {
                public_key,
                private_key: private_spec.into_key(private, origin),
            })
        })
    }
}
