use serde::de::{self, Deserialize, Deserializer, MapAccess, Visitor};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading a declarative registry document.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The registry file could not be read.
    #[error("Failed to read registry at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry is not a JSON object of non-empty, unique names mapped to
    /// non-empty string references.
    #[error("Malformed registry {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One fuzz target: the contract identifier and the configuration reference
/// handed to the fuzz tool unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEntry {
    pub identifier: String,
    pub config_ref: String,
}

impl TargetEntry {
    pub fn new(identifier: impl Into<String>, config_ref: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            config_ref: config_ref.into(),
        }
    }
}

/// One invariants/setup pairing for the transaction log pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupEntry {
    pub invariants: String,
    pub setup_ref: String,
}

impl SetupEntry {
    pub fn new(invariants: impl Into<String>, setup_ref: impl Into<String>) -> Self {
        Self {
            invariants: invariants.into(),
            setup_ref: setup_ref.into(),
        }
    }
}

/// Key/value pairs of a JSON object in document order.
///
/// `serde_json::Map` either sorts keys or silently keeps the last of a
/// duplicated key, so the object is walked by hand instead.
struct OrderedPairs(Vec<(String, String)>);

struct OrderedPairsVisitor;

impl<'de> Visitor<'de> for OrderedPairsVisitor {
    type Value = OrderedPairs;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON object mapping names to string references")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut seen = HashSet::new();
        let mut pairs = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((name, reference)) = map.next_entry::<String, String>()? {
            if name.trim().is_empty() {
                return Err(de::Error::custom("registry names must not be empty"));
            }
            if reference.trim().is_empty() {
                return Err(de::Error::custom(format!(
                    "empty reference for `{name}`"
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(de::Error::custom(format!("duplicate name `{name}`")));
            }
            pairs.push((name, reference));
        }
        Ok(OrderedPairs(pairs))
    }
}

impl<'de> Deserialize<'de> for OrderedPairs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(OrderedPairsVisitor)
    }
}

fn parse_pairs(text: &str, path: Option<&Path>) -> Result<Vec<(String, String)>, RegistryError> {
    serde_json::from_str::<OrderedPairs>(text)
        .map(|pairs| pairs.0)
        .map_err(|source| RegistryError::Parse {
            origin: path.map_or_else(|| "document".to_string(), |p| format!("at {p:?}")),
            source,
        })
}

fn read_pairs(path: &Path) -> Result<Vec<(String, String)>, RegistryError> {
    let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_pairs(&text, Some(path))
}

/// The ordered target set of a campaign. Declaration order in the source
/// document is execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetRegistry {
    entries: Vec<TargetEntry>,
}

impl TargetRegistry {
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        Ok(Self::from_pairs(read_pairs(path)?))
    }

    pub fn from_json_str(text: &str) -> Result<Self, RegistryError> {
        Ok(Self::from_pairs(parse_pairs(text, None)?))
    }

    fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(identifier, config_ref)| TargetEntry::new(identifier, config_ref))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<TargetEntry>> for TargetRegistry {
    fn from(entries: Vec<TargetEntry>) -> Self {
        Self { entries }
    }
}

/// Invariants name to setup script pairings, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupRegistry {
    entries: Vec<SetupEntry>,
}

impl SetupRegistry {
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        Ok(Self::from_pairs(read_pairs(path)?))
    }

    pub fn from_json_str(text: &str) -> Result<Self, RegistryError> {
        Ok(Self::from_pairs(parse_pairs(text, None)?))
    }

    fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(invariants, setup_ref)| SetupEntry::new(invariants, setup_ref))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SetupEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<SetupEntry>> for SetupRegistry {
    fn from(entries: Vec<SetupEntry>) -> Self {
        Self { entries }
    }
}
