use super::{SessionHandle, TokenResult};

/// Capability to authenticate and end a session
pub trait SessionControl {
    fn handle(&self) -> SessionHandle;

    /// `C_Login` as the normal user
    fn login(&mut self, pin: &[u8]) -> TokenResult<()>;

    /// `C_Logout`
    fn logout(&mut self) -> TokenResult<()>;

    /// `C_CloseSession`; session objects are destroyed by the token
    fn close(&mut self) -> TokenResult<()>;
}
