//! CryptoOps trait - single-part and multi-part token operations

use super::{ObjectHandle, TokenResult};
use crate::model::Mechanism;

/// Kind of operation context a session can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Digest,
    Encrypt,
    Decrypt,
    Sign,
    Verify,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Digest => "digest",
            OperationKind::Encrypt => "encrypt",
            OperationKind::Decrypt => "decrypt",
            OperationKind::Sign => "sign",
            OperationKind::Verify => "verify",
        }
    }
}

/// Capability to run cryptographic operations on token keys
///
/// Every operation comes in a single-part form and an init/update/final
/// form. A session holds at most one operation context; starting a second
/// one fails with `CKR_OPERATION_ACTIVE`. Failing `update` or `final` calls
/// end the context.
pub trait CryptoOps {
    fn digest(&mut self, mechanism: &Mechanism, data: &[u8]) -> TokenResult<Vec<u8>>;
    fn digest_init(&mut self, mechanism: &Mechanism) -> TokenResult<()>;
    fn digest_update(&mut self, data: &[u8]) -> TokenResult<()>;
    fn digest_final(&mut self) -> TokenResult<Vec<u8>>;

    fn encrypt(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> TokenResult<Vec<u8>>;
    fn encrypt_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()>;
    fn encrypt_update(&mut self, data: &[u8]) -> TokenResult<Vec<u8>>;
    fn encrypt_final(&mut self) -> TokenResult<Vec<u8>>;

    fn decrypt(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> TokenResult<Vec<u8>>;
    fn decrypt_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()>;
    fn decrypt_update(&mut self, data: &[u8]) -> TokenResult<Vec<u8>>;
    fn decrypt_final(&mut self) -> TokenResult<Vec<u8>>;

    fn sign(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> TokenResult<Vec<u8>>;
    fn sign_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()>;
    fn sign_update(&mut self, data: &[u8]) -> TokenResult<()>;
    fn sign_final(&mut self) -> TokenResult<Vec<u8>>;

    /// # Errors
    ///
    /// `CKR_SIGNATURE_INVALID` or `CKR_SIGNATURE_LEN_RANGE` when the
    /// signature does not match.
    fn verify(
        &mut self,
        mechanism: &Mechanism,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> TokenResult<()>;
    fn verify_init(&mut self, mechanism: &Mechanism, key: ObjectHandle) -> TokenResult<()>;
    fn verify_update(&mut self, data: &[u8]) -> TokenResult<()>;
    fn verify_final(&mut self, signature: &[u8]) -> TokenResult<()>;

    /// Abandon the active operation context of `kind`, if any
    fn cancel_operation(&mut self, kind: OperationKind) -> TokenResult<()>;
}
