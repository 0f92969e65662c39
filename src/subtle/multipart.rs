//! Chunked init/update/final sequencing
//!
//! Large inputs on mechanisms that support it are fed to the token in
//! [`CHUNK_SIZE`] pieces. [`MultiPart`] owns the operation context while it
//! runs and cancels it if the sequence ends without reaching `final`.

use tracing::warn;

use crate::model::Mechanism;
use crate::ports::{ObjectHandle, OperationKind, TokenResult, TokenSession};

/// Bytes passed per update call
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Whether `len` bytes under `mechanism` go through init/update/final
pub(crate) fn streams(mechanism: &Mechanism, len: usize) -> bool {
    mechanism.supports_multipart() && len > CHUNK_SIZE
}

/// Active operation context on a session
pub(crate) struct MultiPart<'s, S: TokenSession> {
    session: &'s mut S,
    kind: OperationKind,
    done: bool,
}

impl<'s, S: TokenSession> MultiPart<'s, S> {
    /// Run `init`; the context exists only if it succeeds
    pub(crate) fn begin(
        session: &'s mut S,
        kind: OperationKind,
        init: impl FnOnce(&mut S) -> TokenResult<()>,
    ) -> TokenResult<Self> {
        init(session)?;
        Ok(Self {
            session,
            kind,
            done: false,
        })
    }

    pub(crate) fn step<T>(&mut self, f: impl FnOnce(&mut S) -> TokenResult<T>) -> TokenResult<T> {
        f(&mut *self.session)
    }

    /// Final call; the context is gone afterwards whatever the outcome
    pub(crate) fn finish<T>(mut self, f: impl FnOnce(&mut S) -> TokenResult<T>) -> TokenResult<T> {
        self.done = true;
        f(&mut *self.session)
    }
}

impl<S: TokenSession> Drop for MultiPart<'_, S> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(fault) = self.session.cancel_operation(self.kind) {
            warn!("Failed to cancel {} operation: {}", self.kind.as_str(), fault);
        }
    }
}

pub(crate) fn digest<S: TokenSession>(
    session: &mut S,
    mechanism: &Mechanism,
    data: &[u8],
) -> TokenResult<Vec<u8>> {
    if !streams(mechanism, data.len()) {
        return session.digest(mechanism, data);
    }
    let mut op = MultiPart::begin(session, OperationKind::Digest, |s| s.digest_init(mechanism))?;
    for chunk in data.chunks(CHUNK_SIZE) {
        op.step(|s| s.digest_update(chunk))?;
    }
    op.finish(|s| s.digest_final())
}

pub(crate) fn encrypt<S: TokenSession>(
    session: &mut S,
    mechanism: &Mechanism,
    key: ObjectHandle,
    data: &[u8],
) -> TokenResult<Vec<u8>> {
    if !streams(mechanism, data.len()) {
        return session.encrypt(mechanism, key, data);
    }
    let mut op = MultiPart::begin(session, OperationKind::Encrypt, |s| {
        s.encrypt_init(mechanism, key)
    })?;
    let mut output = Vec::with_capacity(data.len() + 32);
    for chunk in data.chunks(CHUNK_SIZE) {
        output.extend(op.step(|s| s.encrypt_update(chunk))?);
    }
    output.extend(op.finish(|s| s.encrypt_final())?);
    Ok(output)
}

pub(crate) fn decrypt<S: TokenSession>(
    session: &mut S,
    mechanism: &Mechanism,
    key: ObjectHandle,
    data: &[u8],
) -> TokenResult<Vec<u8>> {
    if !streams(mechanism, data.len()) {
        return session.decrypt(mechanism, key, data);
    }
    let mut op = MultiPart::begin(session, OperationKind::Decrypt, |s| {
        s.decrypt_init(mechanism, key)
    })?;
    let mut output = Vec::with_capacity(data.len());
    for chunk in data.chunks(CHUNK_SIZE) {
        output.extend(op.step(|s| s.decrypt_update(chunk))?);
    }
    output.extend(op.finish(|s| s.decrypt_final())?);
    Ok(output)
}

pub(crate) fn sign<S: TokenSession>(
    session: &mut S,
    mechanism: &Mechanism,
    key: ObjectHandle,
    data: &[u8],
) -> TokenResult<Vec<u8>> {
    if !streams(mechanism, data.len()) {
        return session.sign(mechanism, key, data);
    }
    let mut op = MultiPart::begin(session, OperationKind::Sign, |s| s.sign_init(mechanism, key))?;
    for chunk in data.chunks(CHUNK_SIZE) {
        op.step(|s| s.sign_update(chunk))?;
    }
    op.finish(|s| s.sign_final())
}

pub(crate) fn verify<S: TokenSession>(
    session: &mut S,
    mechanism: &Mechanism,
    key: ObjectHandle,
    data: &[u8],
    signature: &[u8],
) -> TokenResult<()> {
    if !streams(mechanism, data.len()) {
        return session.verify(mechanism, key, data, signature);
    }
    let mut op = MultiPart::begin(session, OperationKind::Verify, |s| {
        s.verify_init(mechanism, key)
    })?;
    for chunk in data.chunks(CHUNK_SIZE) {
        op.step(|s| s.verify_update(chunk))?;
    }
    op.finish(|s| s.verify_final(signature))
}
