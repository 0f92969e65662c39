//! Adapter configuration: which module, which slot, how to log in

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{DomainError, P11Result};
use crate::model::Pin;
use crate::ports::SessionFlags;

/// Settings for [`P11Crypto::open`](crate::api::P11Crypto::open)
#[derive(Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Token provider library
    pub library: PathBuf,
    /// Logical module name, used in logs and errors
    pub name: String,
    /// Index into the module's slot list
    #[serde(default)]
    pub slot: usize,
    /// `CKF_*` session flags; read-write serial session unless set
    #[serde(default = "default_session_flags")]
    pub session_flags: u64,
    /// User PIN; no login when absent
    #[serde(default)]
    pub pin: Option<String>,
    /// Vendor mechanism definition files
    #[serde(default)]
    pub vendors: Vec<PathBuf>,
}

fn default_session_flags() -> u64 {
    SessionFlags::read_write().0
}

impl CryptoConfig {
    pub fn new(library: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            name: name.into(),
            slot: 0,
            session_flags: default_session_flags(),
            pin: None,
            vendors: Vec::new(),
        }
    }

    pub fn with_slot(mut self, slot: usize) -> Self {
        self.slot = slot;
        self
    }

    pub fn with_session_flags(mut self, flags: SessionFlags) -> Self {
        self.session_flags = flags.0;
        self
    }

    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin = Some(pin.into());
        self
    }

    pub fn with_vendor(mut self, path: impl Into<PathBuf>) -> Self {
        self.vendors.push(path.into());
        self
    }

    pub fn from_json(json: &str) -> P11Result<Self> {
        serde_json::from_str(json).map_err(|err| {
            DomainError::Config {
                reason: err.to_string(),
            }
            .into()
        })
    }

    pub fn from_file(path: &Path) -> P11Result<Self> {
        let json = fs::read_to_string(path).map_err(|err| DomainError::Config {
            reason: format!("{}: {}", path.display(), err),
        })?;
        Self::from_json(&json)
    }

    pub fn flags(&self) -> SessionFlags {
        SessionFlags(self.session_flags)
    }

    /// Validated login PIN, if one is configured
    pub fn login_pin(&self) -> P11Result<Option<Pin>> {
        match &self.pin {
            Some(pin) => Ok(Some(pin.parse().map_err(DomainError::Pin)?)),
            None => Ok(None),
        }
    }
}

impl Drop for CryptoConfig {
    fn drop(&mut self) {
        if let Some(pin) = self.pin.as_mut() {
            pin.zeroize();
        }
    }
}

impl fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoConfig")
            .field("library", &self.library)
            .field("name", &self.name)
            .field("slot", &self.slot)
            .field("session_flags", &format_args!("{:#x}", self.session_flags))
            .field("pin", &self.pin.as_ref().map(|_| "<redacted>"))
            .field("vendors", &self.vendors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::P11Error;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config = CryptoConfig::from_json(r#"{"library": "/usr/lib/softhsm.so", "name": "hsm"}"#)
            .unwrap();
        assert_eq!(config.slot, 0);
        assert!(config.flags().is_read_write());
        assert_eq!(config.session_flags, 0x6);
        assert!(config.login_pin().unwrap().is_none());
        assert!(config.vendors.is_empty());
    }

    #[test]
    fn test_debug_redacts_pin() {
        let config = CryptoConfig::new("lib.so", "hsm").with_pin("987654");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("987654"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_short_pin_rejected() {
        let config = CryptoConfig::new("lib.so", "hsm").with_pin("12");
        assert!(matches!(
            config.login_pin(),
            Err(P11Error::Domain(DomainError::Pin(_)))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"library": "soft", "name": "soft", "slot": 1, "session_flags": 4, "pin": "1234", "vendors": ["v.json"]}}"#
        )
        .unwrap();

        let config = CryptoConfig::from_file(file.path()).unwrap();
        assert_eq!(config.slot, 1);
        assert!(!config.flags().is_read_write());
        assert_eq!(config.vendors, vec![PathBuf::from("v.json")]);

        assert!(matches!(
            CryptoConfig::from_file(Path::new("/nonexistent/config.json")),
            Err(P11Error::Domain(DomainError::Config { .. }))
        ));
        assert!(CryptoConfig::from_json("{").is_err());
    }
}
