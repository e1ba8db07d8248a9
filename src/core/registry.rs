/// Module definition registry — the static schema of modules and fields.
use rustc_hash::FxHashMap;
use std::path::Path;

use crate::schema::definition::{FieldDefinition, ModuleDefinition};

/// Module schema shipped with the crate.
pub const PACKAGED_MODULES: &str = include_str!("../../schema/modules.ron");

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("module schema defines no modules")]
    Empty,
    #[error("duplicate module key: {0}")]
    DuplicateModule(String),
    #[error("duplicate field '{field}' in module '{module}'")]
    DuplicateField { module: String, field: String },
    #[error("field '{field}' in module '{module}' has min_length above max_length")]
    InvalidBounds { module: String, field: String },
    #[error("module not found: {0}")]
    UnknownModule(String),
    #[error("field not found: {module}.{field}")]
    UnknownField { module: String, field: String },
}

/// Read-only, ordered set of module definitions. Built once at start-up and
/// shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ModuleRegistry {
    modules: Vec<ModuleDefinition>,
    index: FxHashMap<String, usize>,
}

impl ModuleRegistry {
    /// Validate and order definitions. Fails on an empty set, duplicate
    /// keys, or inverted length bounds.
    pub fn from_definitions(mut modules: Vec<ModuleDefinition>) -> Result<Self, RegistryError> {
        if modules.is_empty() {
            return Err(RegistryError::Empty);
        }
        modules.sort_by_key(|m| m.order);

        let mut index = FxHashMap::default();
        for (i, module) in modules.iter().enumerate() {
            if index.insert(module.key.clone(), i).is_some() {
                return Err(RegistryError::DuplicateModule(module.key.clone()));
            }
            for (j, field) in module.fields.iter().enumerate() {
                if module.fields[..j].iter().any(|f| f.key == field.key) {
                    return Err(RegistryError::DuplicateField {
                        module: module.key.clone(),
                        field: field.key.clone(),
                    });
                }
                if let (Some(min), Some(max)) = (field.min_length, field.max_length) {
                    if min > max {
                        return Err(RegistryError::InvalidBounds {
                            module: module.key.clone(),
                            field: field.key.clone(),
                        });
                    }
                }
            }
        }

        Ok(Self { modules, index })
    }

    /// Parse a registry from a RON list of module definitions.
    pub fn parse_ron(input: &str) -> Result<Self, RegistryError> {
        let modules: Vec<ModuleDefinition> = ron::from_str(input)?;
        Self::from_definitions(modules)
    }

    /// Load a registry from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<Self, RegistryError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// The schema compiled into the crate.
    pub fn packaged() -> Result<Self, RegistryError> {
        Self::parse_ron(PACKAGED_MODULES)
    }

    /// All definitions in `order`.
    pub fn all(&self) -> &[ModuleDefinition] {
        &self.modules
    }

    pub fn get(&self, key: &str) -> Option<&ModuleDefinition> {
        self.index.get(key).map(|&i| &self.modules[i])
    }

    pub fn require(&self, key: &str) -> Result<&ModuleDefinition, RegistryError> {
        self.get(key)
            .ok_or_else(|| RegistryError::UnknownModule(key.to_string()))
    }

    pub fn require_field(
        &self,
        module_key: &str,
        field_key: &str,
    ) -> Result<&FieldDefinition, RegistryError> {
        self.require(module_key)?
            .field(field_key)
            .ok_or_else(|| RegistryError::UnknownField {
                module: module_key.to_string(),
                field: field_key.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
