//! Random bytes from the token's generator

use tracing::debug;

use crate::error::{P11Result, TokenError};
use crate::ports::{RandomGenerator, ReturnValue, TokenModule};
use crate::session::SessionManager;

pub struct RandomSource<'a, M: TokenModule> {
    sessions: &'a SessionManager<M>,
}

impl<'a, M: TokenModule> RandomSource<'a, M> {
    pub fn new(sessions: &'a SessionManager<M>) -> Self {
        Self { sessions }
    }

    /// Exactly `len` random bytes
    ///
    /// `len == 0` returns an empty vector without touching the token.
    pub fn get_random_values(&self, len: usize) -> P11Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let bytes = self
            .sessions
            .with_session(|session| Ok(session.generate_random(len)?))?;
        if bytes.len() != len {
            return Err(TokenError::OperationFailure {
                operation: "C_GenerateRandom",
                rv: ReturnValue::DATA_LEN_RANGE,
            }
            .into());
        }
        debug!("Generated {} random bytes", len);
        Ok(bytes)
    }
}
