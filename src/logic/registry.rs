//! Mechanism name registry
//!
//! Maps `CKM_*` names to numeric mechanism identifiers. The registry starts
//! with the standard mechanisms and can be extended with vendor definition
//! files, which is how token-specific mechanisms become reachable by name.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{DomainError, P11Result};
use crate::model::MechanismType;

const BUILT_IN: &[(&str, MechanismType)] = MechanismType::KNOWN;

/// Name to identifier table for token mechanisms
#[derive(Debug, Clone)]
pub struct MechanismRegistry {
    entries: BTreeMap<String, MechanismType>,
}

impl MechanismRegistry {
    /// Registry holding the standard mechanisms
    pub fn new() -> Self {
        let entries = BUILT_IN
            .iter()
            .map(|(name, mechanism)| (name.to_string(), *mechanism))
            .collect();
        Self { entries }
    }

    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Option<MechanismType> {
        self.entries.get(&name.trim().to_ascii_uppercase()).copied()
    }

    pub fn is_built_in(name: &str) -> bool {
        let name = name.trim().to_ascii_uppercase();
        BUILT_IN.iter().any(|(built_in, _)| *built_in == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add the mechanisms of a vendor definition
    ///
    /// Built-in names are never replaced. Returns the number of names added
    /// or updated.
    pub fn register(&mut self, definition: &VendorDefinition) -> usize {
        let mut added = 0;
        for (name, mechanism) in &definition.mechanisms {
            if Self::is_built_in(name) {
                warn!(
                    "Vendor definition {} redefines built-in mechanism {}, keeping built-in",
                    definition.source_name(),
                    name
                );
                continue;
            }
            debug!("Registering vendor mechanism {} = {:?}", name, mechanism);
            self.entries.insert(name.clone(), *mechanism);
            added += 1;
        }
        added
    }
}

impl Default for MechanismRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Vendor mechanism definitions read from a JSON file
///
/// The file is an object mapping mechanism names to identifiers, either as
/// numbers or as `"0x..."` strings. The map may also be nested under a
/// `"mechanisms"` key.
#[derive(Debug, Clone, Default)]
pub struct VendorDefinition {
    source: Option<PathBuf>,
    mechanisms: BTreeMap<String, MechanismType>,
}

impl VendorDefinition {
    pub fn new<I, S>(mechanisms: I) -> Self
    where
        I: IntoIterator<Item = (S, MechanismType)>,
        S: AsRef<str>,
    {
        Self {
            source: None,
            mechanisms: mechanisms
                .into_iter()
                .map(|(name, mechanism)| (name.as_ref().trim().to_ascii_uppercase(), mechanism))
                .collect(),
        }
    }

    pub fn from_file(path: &Path) -> P11Result<Self> {
        let json = fs::read_to_string(path).map_err(|err| DomainError::VendorDefinition {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let mut definition = Self::parse(&json).map_err(|reason| DomainError::VendorDefinition {
            path: path.to_path_buf(),
            reason,
        })?;
        definition.source = Some(path.to_path_buf());
        Ok(definition)
    }

    pub fn from_json_str(json: &str) -> P11Result<Self> {
        Self::parse(json).map_err(|reason| {
            DomainError::VendorDefinition {
                path: PathBuf::from("<inline>"),
                reason,
            }
            .into()
        })
    }

    fn parse(json: &str) -> Result<Self, String> {
        let root: Value = serde_json::from_str(json).map_err(|err| err.to_string())?;
        let table = match root.get("mechanisms") {
            Some(nested) => nested,
            None => &root,
        };
        let object = table
            .as_object()
            .ok_or_else(|| "expected an object of mechanism names".to_string())?;

        let mut mechanisms = BTreeMap::new();
        for (name, value) in object {
            let id = parse_mechanism_id(value)
                .ok_or_else(|| format!("invalid identifier for {}: {}", name, value))?;
            mechanisms.insert(name.trim().to_ascii_uppercase(), MechanismType(id));
        }
        Ok(Self {
            source: None,
            mechanisms,
        })
    }

    pub fn mechanisms(&self) -> impl Iterator<Item = (&str, MechanismType)> {
        self.mechanisms
            .iter()
            .map(|(name, mechanism)| (name.as_str(), *mechanism))
    }

    fn source_name(&self) -> String {
        self.source
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<inline>".to_string())
    }
}

fn parse_mechanism_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => {
            let text = text.trim();
            match text
                .strip_prefix("0x")
                .or_else(|| text.strip_prefix("0X"))
            {
                Some(hex_digits) => u64::from_str_radix(hex_digits, 16).ok(),
                None => text.parse().ok(),
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::P11Error;

    #[test]
    fn test_built_in_lookup() {
        let registry = MechanismRegistry::new();
        assert_eq!(registry.get("CKM_AES_GCM"), Some(MechanismType::AES_GCM));
        assert_eq!(registry.get("ckm_sha256"), Some(MechanismType::SHA256));
        assert_eq!(registry.get("CKM_NOPE"), None);
    }

    #[test]
    fn test_vendor_definition_flat_and_nested() {
        let flat = VendorDefinition::from_json_str(
            r#"{"CKM_VENDOR_GOST": 2147484161, "CKM_VENDOR_SM4": "0x80000102"}"#,
        )
        .unwrap();
        let nested =
            VendorDefinition::from_json_str(r#"{"mechanisms": {"CKM_VENDOR_SM4": "0x80000102"}}"#)
                .unwrap();

        let mut registry = MechanismRegistry::new();
        assert_eq!(registry.register(&flat), 2);
        assert_eq!(registry.register(&nested), 1);
        assert_eq!(
            registry.get("CKM_VENDOR_GOST"),
            Some(MechanismType(0x8000_0201))
        );
        assert_eq!(
            registry.get("ckm_vendor_sm4"),
            Some(MechanismType(0x8000_0102))
        );
    }

    #[test]
    fn test_vendor_cannot_override_built_in() {
        let definition =
            VendorDefinition::new([("CKM_AES_GCM", MechanismType(0x8000_0001))]);
        let mut registry = MechanismRegistry::new();
        let before = registry.len();

        assert_eq!(registry.register(&definition), 0);
        assert_eq!(registry.len(), before);
        assert_eq!(registry.get("CKM_AES_GCM"), Some(MechanismType::AES_GCM));
    }

    #[test]
    fn test_vendor_definition_invalid() {
        let err = VendorDefinition::from_json_str(r#"{"CKM_X": true}"#).unwrap_err();
        assert!(matches!(
            err,
            P11Error::Domain(DomainError::VendorDefinition { .. })
        ));
        assert!(VendorDefinition::from_json_str("[1, 2]").is_err());
    }

    #[test]
    fn test_vendor_definition_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"CKM_VENDOR_X": "0x80001000"}}"#).unwrap();

        let definition = VendorDefinition::from_file(file.path()).unwrap();
        let names: Vec<_> = definition.mechanisms().collect();
        assert_eq!(names, vec![("CKM_VENDOR_X", MechanismType(0x8000_1000))]);

        let missing = VendorDefinition::from_file(Path::new("/nonexistent/vendor.json"));
        assert!(missing.is_err());
    }
}
