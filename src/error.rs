//! Error types for p11webcrypto
//!
//! This module defines the error hierarchy for all adapter operations.
//! Errors are organized hierarchically and use thiserror for implementation.
//! Token failures arrive as [`TokenFault`]s from the port layer and are
//! classified here, keeping the original `CKR_*` return value.

use std::path::PathBuf;

use thiserror::Error;

use crate::ports::{ReturnValue, TokenFault};

/// Result type alias for adapter operations
pub type P11Result<T> = Result<T, P11Error>;

/// Top-level error type for all adapter operations
#[derive(Error, Debug)]
pub enum P11Error {
    /// Module, session and token call failures
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// Algorithm and key usage errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Key management errors
    #[error("Key management error: {0}")]
    KeyManagement(#[from] KeyManagementError),

    /// Domain validation errors
    #[error("Domain validation error: {0}")]
    Domain(#[from] DomainError),
}

/// Whether an error is the caller's fault or the environment's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad algorithm, parameters, usage or key; retrying will not help
    InvalidRequest,
    /// Module, slot, session or device trouble
    Environment,
}

/// Token and session errors
#[derive(Error, Debug)]
pub enum TokenError {
    /// The token module could not be loaded or initialized
    #[error("Failed to load token module {name}: {reason}")]
    ModuleLoad { name: String, reason: String },

    /// The configured slot index does not exist
    #[error("Slot by index {index} is not found")]
    SlotNotFound { index: usize },

    /// The token refused to open a session
    #[error("Failed to open session: {rv}")]
    SessionOpen { rv: ReturnValue },

    /// PIN rejected or login not possible in the current state
    #[error("Login failed: {reason}")]
    LoginFailure { reason: String },

    /// Operation requires a logged-in session
    #[error("Operation requires a logged-in session")]
    NotAuthenticated,

    /// Session closed or never opened
    #[error("Session is closed")]
    SessionClosed,

    /// Any other token refusal
    #[error("Token operation {operation} failed: {rv}")]
    OperationFailure {
        operation: &'static str,
        rv: ReturnValue,
    },
}

/// Algorithm, parameter and usage errors
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Unknown algorithm or algorithm not valid for the operation
    #[error("Algorithm not supported: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    /// Missing or malformed algorithm parameter
    #[error("Invalid mechanism parameter: {reason}")]
    MechanismParameter { reason: String },

    /// Key does not carry the usage the operation needs
    #[error("Key usage {usage} is not permitted for this key")]
    InvalidKeyUsage { usage: String },

    /// Key kind does not match the requested algorithm
    #[error("Key algorithm {key} cannot be used with {algorithm}")]
    KeyAlgorithmMismatch { key: String, algorithm: String },

    /// Malformed or mismatched key material
    #[error("Invalid {format} key material: {reason}")]
    ImportFormat { format: String, reason: String },
}

/// Key management errors
#[derive(Error, Debug)]
pub enum KeyManagementError {
    /// Key material cannot leave the token
    #[error("Key is not extractable")]
    NotExtractable,

    /// The handle does not refer to a live object
    #[error("Key object not found: {handle}")]
    KeyNotFound { handle: String },
}

/// Domain validation errors
#[derive(Error, Debug)]
pub enum DomainError {
    /// PIN validation error
    #[error("PIN validation error: {0}")]
    Pin(#[from] crate::model::PinError),

    /// Key usage name error
    #[error("Usage error: {0}")]
    Usage(#[from] crate::model::UsageError),

    /// Configuration could not be read
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// Vendor mechanism definition could not be read
    #[error("Invalid vendor definition {}: {reason}", .path.display())]
    VendorDefinition { path: PathBuf, reason: String },
}

impl P11Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            P11Error::Token(TokenError::NotAuthenticated) => ErrorCategory::InvalidRequest,
            P11Error::Token(TokenError::OperationFailure { rv, .. }) if is_request_fault(*rv) => {
                ErrorCategory::InvalidRequest
            }
            P11Error::Token(_) => ErrorCategory::Environment,
            P11Error::Crypto(_) | P11Error::KeyManagement(_) => ErrorCategory::InvalidRequest,
            P11Error::Domain(DomainError::Config { .. })
            | P11Error::Domain(DomainError::VendorDefinition { .. }) => ErrorCategory::Environment,
            P11Error::Domain(_) => ErrorCategory::InvalidRequest,
        }
    }

    /// Only environment failures may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Environment
    }

    /// Return value of the token call behind this error, if any
    pub fn return_value(&self) -> Option<ReturnValue> {
        match self {
            P11Error::Token(TokenError::SessionOpen { rv })
            | P11Error::Token(TokenError::OperationFailure { rv, .. }) => Some(*rv),
            _ => None,
        }
    }

    /// Classify a token call failure
    pub fn from_fault(fault: TokenFault) -> Self {
        match fault.rv {
            ReturnValue::OBJECT_HANDLE_INVALID | ReturnValue::KEY_HANDLE_INVALID => {
                KeyManagementError::KeyNotFound {
                    handle: format!("{} via {}", fault.rv, fault.function),
                }
                .into()
            }
            ReturnValue::USER_NOT_LOGGED_IN => TokenError::NotAuthenticated.into(),
            ReturnValue::SESSION_CLOSED | ReturnValue::SESSION_HANDLE_INVALID => {
                TokenError::SessionClosed.into()
            }
            ReturnValue::MECHANISM_PARAM_INVALID => CryptoError::MechanismParameter {
                reason: fault.to_string(),
            }
            .into(),
            ReturnValue::KEY_UNEXTRACTABLE => KeyManagementError::NotExtractable.into(),
            rv => TokenError::OperationFailure {
                operation: fault.function,
                rv,
            }
            .into(),
        }
    }
}

fn is_request_fault(rv: ReturnValue) -> bool {
    matches!(
        rv,
        ReturnValue::ARGUMENTS_BAD
            | ReturnValue::ATTRIBUTE_VALUE_INVALID
            | ReturnValue::DATA_INVALID
            | ReturnValue::DATA_LEN_RANGE
            | ReturnValue::ENCRYPTED_DATA_INVALID
            | ReturnValue::ENCRYPTED_DATA_LEN_RANGE
            | ReturnValue::KEY_SIZE_RANGE
            | ReturnValue::KEY_TYPE_INCONSISTENT
            | ReturnValue::KEY_FUNCTION_NOT_PERMITTED
            | ReturnValue::MECHANISM_INVALID
            | ReturnValue::TEMPLATE_INCOMPLETE
            | ReturnValue::TEMPLATE_INCONSISTENT
            | ReturnValue::WRAPPED_KEY_INVALID
    )
}

impl From<TokenFault> for P11Error {
    fn from(fault: TokenFault) -> Self {
        P11Error::from_fault(fault)
    }
}

/// Convert algorithm interpretation errors
impl From<crate::model::AlgorithmError> for P11Error {
    fn from(err: crate::model::AlgorithmError) -> Self {
        use crate::model::AlgorithmError;
        match err {
            AlgorithmError::Unsupported { algorithm } => {
                CryptoError::UnsupportedAlgorithm { algorithm }.into()
            }
            AlgorithmError::UnsupportedHash { hash } => {
                CryptoError::UnsupportedAlgorithm { algorithm: hash }.into()
            }
            other @ AlgorithmError::UnsupportedCurve { .. } => CryptoError::MechanismParameter {
                reason: other.to_string(),
            }
            .into(),
        }
    }
}

/// Convert model errors to P11Error (via DomainError)
impl From<crate::model::PinError> for P11Error {
    fn from(err: crate::model::PinError) -> Self {
        P11Error::Domain(DomainError::Pin(err))
    }
}

impl From<crate::model::UsageError> for P11Error {
    fn from(err: crate::model::UsageError) -> Self {
        P11Error::Domain(DomainError::Usage(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = P11Error::Token(TokenError::SlotNotFound { index: 3 });
        assert!(err.to_string().contains("Slot by index 3 is not found"));
    }

    #[test]
    fn test_pin_error_conversion() {
        let pin_err = crate::model::PinError::TooShort;
        let err: P11Error = pin_err.into();
        assert!(err.to_string().contains("PIN"));
        assert_eq!(err.category(), ErrorCategory::InvalidRequest);
    }

    #[test]
    fn test_fault_classification() {
        let err = P11Error::from(TokenFault::new("C_DestroyObject", ReturnValue::OBJECT_HANDLE_INVALID));
        assert!(matches!(
            err,
            P11Error::KeyManagement(KeyManagementError::KeyNotFound { .. })
        ));

        let err = P11Error::from(TokenFault::new("C_Sign", ReturnValue::USER_NOT_LOGGED_IN));
        assert!(matches!(err, P11Error::Token(TokenError::NotAuthenticated)));

        let err = P11Error::from(TokenFault::new("C_CopyObject", ReturnValue::DEVICE_MEMORY));
        assert_eq!(err.return_value(), Some(ReturnValue::DEVICE_MEMORY));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_request_faults_not_retryable() {
        let err = P11Error::from(TokenFault::new("C_Decrypt", ReturnValue::ENCRYPTED_DATA_INVALID));
        assert_eq!(err.category(), ErrorCategory::InvalidRequest);
        assert!(!err.is_retryable());

        let err: P11Error = CryptoError::UnsupportedAlgorithm {
            algorithm: "ROT13".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_algorithm_error_conversion() {
        let err: P11Error = crate::model::AlgorithmError::UnsupportedCurve {
            curve: "P-521".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            P11Error::Crypto(CryptoError::MechanismParameter { .. })
        ));
    }

    #[test]
    fn test_result_type_alias() {
        let result: P11Result<i32> = Ok(42);
        assert_eq!(result.unwrap(), 42);

        let result: P11Result<i32> = Err(P11Error::Token(TokenError::SessionClosed));
        assert!(result.is_err());
    }
}
