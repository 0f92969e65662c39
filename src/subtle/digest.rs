use super::{multipart, SubtleCrypto};
use crate::error::P11Result;
use crate::logic::Purpose;
use crate::model::AlgorithmDescriptor;
use crate::ports::TokenModule;

impl<M: TokenModule> SubtleCrypto<'_, M> {
    /// Hash `data` on the token
    ///
    /// Needs an open session but no login.
    pub fn digest(&self, algorithm: &AlgorithmDescriptor, data: &[u8]) -> P11Result<Vec<u8>> {
        let mechanism = self.mapper().resolve(Purpose::Digest, algorithm, None)?;
        self.sessions
            .with_session(|session| Ok(multipart::digest(session, &mechanism, data)?))
    }
}
