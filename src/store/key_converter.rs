//! Store Key Conversion
//!
//! Resolves superseded blob keys to their canonical replacements so data
//! operations keep working after blobs are merged or re-keyed. Keys missing
//! from every table convert to themselves.
//!
//! Converters come from a [`StoreKeyConverterFactory`]. A factory that cannot
//! build its converter fails with [`InstantiationError`] at the call site,
//! never later on first use.

use crate::store::StoreKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Error as IoError;
use std::path::PathBuf;
use std::sync::Arc;

/// Error returned when a converter cannot be built
#[derive(Debug)]
pub enum InstantiationError {
    /// A required configuration value is absent
    MissingConfig(&'static str),
    /// The mapping table could not be read
    Io { path: PathBuf, source: IoError },
    /// The mapping table is not valid JSON
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// Following the table from this key never reaches a canonical key
    Cycle(StoreKey),
}

impl fmt::Display for InstantiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstantiationError::MissingConfig(name) => {
                write!(f, "Cannot instantiate key converter: missing {}", name)
            }
            InstantiationError::Io { path, source } => write!(
                f,
                "Cannot instantiate key converter: failed to read {}: {}",
                path.display(),
                source
            ),
            InstantiationError::Parse { path, source } => write!(
                f,
                "Cannot instantiate key converter: invalid mapping in {}: {}",
                path.display(),
                source
            ),
            InstantiationError::Cycle(key) => write!(
                f,
                "Cannot instantiate key converter: mapping cycle starting at {}",
                key
            ),
        }
    }
}

impl std::error::Error for InstantiationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstantiationError::Io { source, .. } => Some(source),
            InstantiationError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Maps store keys to their canonical form
pub trait StoreKeyConverter: Send + Sync + fmt::Debug {
    /// Canonical form of `key`
    fn convert(&self, key: &StoreKey) -> StoreKey;

    /// Canonical form of every key in `keys`
    ///
    /// Implementations that pay per-lookup costs should override this to
    /// share work across the batch.
    fn convert_many(&self, keys: &[StoreKey]) -> HashMap<StoreKey, StoreKey> {
        keys.iter()
            .map(|key| (key.clone(), self.convert(key)))
            .collect()
    }
}

/// Builds converters
pub trait StoreKeyConverterFactory: Send + Sync {
    fn store_key_converter(&self) -> Result<Arc<dyn StoreKeyConverter>, InstantiationError>;
}

/// Configuration for the table-driven converter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyConverterConfig {
    /// JSON file holding `{"old-key": "new-key", ...}`
    pub mapping_path: Option<PathBuf>,
}

// ============================================================================
// IdentityStoreKeyConverter
// ============================================================================

/// Converter for deployments with no re-keyed blobs
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityStoreKeyConverter;

impl StoreKeyConverter for IdentityStoreKeyConverter {
    fn convert(&self, key: &StoreKey) -> StoreKey {
        key.clone()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityStoreKeyConverterFactory;

impl StoreKeyConverterFactory for IdentityStoreKeyConverterFactory {
    fn store_key_converter(&self) -> Result<Arc<dyn StoreKeyConverter>, InstantiationError> {
        Ok(Arc::new(IdentityStoreKeyConverter))
    }
}

// ============================================================================
// MappingStoreKeyConverter
// ============================================================================

/// Table-driven converter
///
/// Chains are flattened at construction (`a -> b`, `b -> c` resolves `a` to
/// `c`), so every lookup is a single map probe.
#[derive(Debug, Clone, Default)]
pub struct MappingStoreKeyConverter {
    resolved: HashMap<StoreKey, StoreKey>,
}

impl MappingStoreKeyConverter {
    pub fn from_table(table: HashMap<StoreKey, StoreKey>) -> Result<Self, InstantiationError> {
        let mut resolved = HashMap::with_capacity(table.len());

        for start in table.keys() {
            let mut current = start;
            let mut seen = HashSet::new();
            seen.insert(start);

            while let Some(next) = table.get(current) {
                if next == current {
                    break;
                }
                if !seen.insert(next) {
                    return Err(InstantiationError::Cycle(start.clone()));
                }
                current = next;
            }

            if current != start {
                resolved.insert(start.clone(), current.clone());
            }
        }

        Ok(MappingStoreKeyConverter { resolved })
    }

    /// Number of keys that convert to something other than themselves
    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

impl StoreKeyConverter for MappingStoreKeyConverter {
    fn convert(&self, key: &StoreKey) -> StoreKey {
        self.resolved.get(key).cloned().unwrap_or_else(|| key.clone())
    }
}

/// Loads a [`MappingStoreKeyConverter`] from a JSON table and caches it
#[derive(Debug)]
pub struct MappingStoreKeyConverterFactory {
    config: KeyConverterConfig,
    cached: Mutex<Option<Arc<MappingStoreKeyConverter>>>,
}

impl MappingStoreKeyConverterFactory {
    pub fn new(config: KeyConverterConfig) -> Self {
        MappingStoreKeyConverterFactory {
            config,
            cached: Mutex::new(None),
        }
    }

    fn load(&self) -> Result<MappingStoreKeyConverter, InstantiationError> {
        let path = self
            .config
            .mapping_path
            .clone()
            .ok_or(InstantiationError::MissingConfig("key_converter.mapping_path"))?;

        let raw = std::fs::read_to_string(&path).map_err(|source| InstantiationError::Io {
            path: path.clone(),
            source,
        })?;
        let table: HashMap<StoreKey, StoreKey> =
            serde_json::from_str(&raw).map_err(|source| InstantiationError::Parse {
                path: path.clone(),
                source,
            })?;

        let converter = MappingStoreKeyConverter::from_table(table)?;
        tracing::info!(
            path = %path.display(),
            mappings = converter.len(),
            "Loaded store key mapping table"
        );
        Ok(converter)
    }
}

impl StoreKeyConverterFactory for MappingStoreKeyConverterFactory {
    fn store_key_converter(&self) -> Result<Arc<dyn StoreKeyConverter>, InstantiationError> {
        let mut cached = self.cached.lock();
        if let Some(converter) = cached.as_ref() {
            return Ok(converter.clone());
        }
        let converter = Arc::new(self.load()?);
        *cached = Some(converter.clone());
        Ok(converter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table(pairs: &[(&str, &str)]) -> HashMap<StoreKey, StoreKey> {
        pairs
            .iter()
            .map(|(from, to)| (StoreKey::from(*from), StoreKey::from(*to)))
            .collect()
    }

    #[test]
    fn test_identity_converter() {
        let converter = IdentityStoreKeyConverterFactory.store_key_converter().unwrap();
        assert_eq!(converter.convert(&"a".into()), StoreKey::from("a"));
    }

    #[test]
    fn test_mapping_resolves_chains() {
        let converter =
            MappingStoreKeyConverter::from_table(table(&[("a", "b"), ("b", "c"), ("x", "y")]))
                .unwrap();

        assert_eq!(converter.convert(&"a".into()), StoreKey::from("c"));
        assert_eq!(converter.convert(&"b".into()), StoreKey::from("c"));
        assert_eq!(converter.convert(&"x".into()), StoreKey::from("y"));
        assert_eq!(converter.convert(&"c".into()), StoreKey::from("c"));
        assert_eq!(converter.convert(&"unknown".into()), StoreKey::from("unknown"));
    }

    #[test]
    fn test_mapping_self_reference_is_identity() {
        let converter = MappingStoreKeyConverter::from_table(table(&[("a", "a")])).unwrap();
        assert!(converter.is_empty());
        assert_eq!(converter.convert(&"a".into()), StoreKey::from("a"));
    }

    #[test]
    fn test_mapping_rejects_cycle() {
        let result = MappingStoreKeyConverter::from_table(table(&[("a", "b"), ("b", "a")]));
        assert!(matches!(result, Err(InstantiationError::Cycle(_))));
    }

    #[test]
    fn test_convert_many() {
        let converter =
            MappingStoreKeyConverter::from_table(table(&[("old-1", "new-1")])).unwrap();
        let keys = vec![StoreKey::from("old-1"), StoreKey::from("other")];

        let converted = converter.convert_many(&keys);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[&StoreKey::from("old-1")], StoreKey::from("new-1"));
        assert_eq!(converted[&StoreKey::from("other")], StoreKey::from("other"));
    }

    #[test]
    fn test_factory_missing_path() {
        let factory = MappingStoreKeyConverterFactory::new(KeyConverterConfig::default());
        let err = factory.store_key_converter().unwrap_err();
        assert!(matches!(err, InstantiationError::MissingConfig(_)));
    }

    #[test]
    fn test_factory_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MappingStoreKeyConverterFactory::new(KeyConverterConfig {
            mapping_path: Some(dir.path().join("missing.json")),
        });
        let err = factory.store_key_converter().unwrap_err();
        assert!(matches!(err, InstantiationError::Io { .. }));
    }

    #[test]
    fn test_factory_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not json").unwrap();
        let factory = MappingStoreKeyConverterFactory::new(KeyConverterConfig {
            mapping_path: Some(file.path().to_path_buf()),
        });
        let err = factory.store_key_converter().unwrap_err();
        assert!(matches!(err, InstantiationError::Parse { .. }));
    }

    #[test]
    fn test_factory_loads_and_caches() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"old": "new"}"#).unwrap();
        let factory = MappingStoreKeyConverterFactory::new(KeyConverterConfig {
            mapping_path: Some(file.path().to_path_buf()),
        });

        let first = factory.store_key_converter().unwrap();
        let second = factory.store_key_converter().unwrap();

        assert_eq!(first.convert(&"old".into()), StoreKey::from("new"));
        assert!(Arc::ptr_eq(&first, &second));
    }
}
