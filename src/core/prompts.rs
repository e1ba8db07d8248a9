/// Prompt catalog — compiled templates per generation stage, with
/// per-module overrides.
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::core::registry::ModuleRegistry;
use crate::core::template::{Template, TemplateEngine, TemplateError};

/// Prompt templates shipped with the crate.
pub const PACKAGED_PROMPTS: &str = include_str!("../../schema/prompts.ron");

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("template '{name}' failed to compile: {source}")]
    Compile {
        name: String,
        #[source]
        source: TemplateError,
    },
    #[error("prompt override for unknown module '{0}'")]
    UnknownModule(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptStage {
    /// Propose field values as a JSON object.
    Draft,
    /// Write a module's full content.
    Final,
    /// Rewrite one field's text.
    Refine,
}

impl PromptStage {
    pub const ALL: [PromptStage; 3] = [Self::Draft, Self::Final, Self::Refine];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Final => "final",
            Self::Refine => "refine",
        }
    }
}

impl fmt::Display for PromptStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PromptStage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "final" => Ok(Self::Final),
            "refine" => Ok(Self::Refine),
            other => Err(format!("unknown prompt stage: {other}")),
        }
    }
}

/// On-disk form of the catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptSource {
    pub draft: String,
    #[serde(rename = "final")]
    pub final_stage: String,
    pub refine: String,
    #[serde(default)]
    pub modules: BTreeMap<String, StageOverrides>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StageOverrides {
    #[serde(default)]
    pub draft: Option<String>,
    #[serde(default, rename = "final")]
    pub final_stage: Option<String>,
    #[serde(default)]
    pub refine: Option<String>,
}

impl StageOverrides {
    fn get(&self, stage: PromptStage) -> Option<&str> {
        match stage {
            PromptStage::Draft => self.draft.as_deref(),
            PromptStage::Final => self.final_stage.as_deref(),
            PromptStage::Refine => self.refine.as_deref(),
        }
    }
}

impl PromptSource {
    fn default_for(&self, stage: PromptStage) -> &str {
        match stage {
            PromptStage::Draft => &self.draft,
            PromptStage::Final => &self.final_stage,
            PromptStage::Refine => &self.refine,
        }
    }
}

/// Every template compiled once against one [`TemplateEngine`].
#[derive(Debug, Clone)]
pub struct PromptCatalog {
    defaults: FxHashMap<PromptStage, Template>,
    overrides: FxHashMap<(String, PromptStage), Template>,
}

impl PromptCatalog {
    /// Compile a source. Any template that fails to parse or calls a function
    /// the engine does not know rejects the whole catalog.
    pub fn compile(source: &PromptSource, engine: &TemplateEngine) -> Result<Self, PromptError> {
        let mut defaults = FxHashMap::default();
        for stage in PromptStage::ALL {
            let template = compile_named(engine, stage.as_str(), source.default_for(stage))?;
            defaults.insert(stage, template);
        }

        let mut overrides = FxHashMap::default();
        for (module_key, stages) in &source.modules {
            for stage in PromptStage::ALL {
                if let Some(text) = stages.get(stage) {
                    let name = format!("{module_key}.{stage}");
                    let template = compile_named(engine, &name, text)?;
                    overrides.insert((module_key.clone(), stage), template);
                }
            }
        }

        Ok(Self {
            defaults,
            overrides,
        })
    }

    pub fn parse_ron(input: &str, engine: &TemplateEngine) -> Result<Self, PromptError> {
        let source: PromptSource = ron::from_str(input)?;
        Self::compile(&source, engine)
    }

    pub fn load_from_ron(path: &Path, engine: &TemplateEngine) -> Result<Self, PromptError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents, engine)
    }

    pub fn packaged(engine: &TemplateEngine) -> Result<Self, PromptError> {
        Self::parse_ron(PACKAGED_PROMPTS, engine)
    }

    /// Reject overrides for modules the registry does not define.
    pub fn check_modules(&self, registry: &ModuleRegistry) -> Result<(), PromptError> {
        let mut keys: Vec<&str> = self.overrides.keys().map(|(k, _)| k.as_str()).collect();
        keys.sort_unstable();
        match keys.into_iter().find(|k| registry.get(k).is_none()) {
            Some(unknown) => Err(PromptError::UnknownModule(unknown.to_string())),
            None => Ok(()),
        }
    }

    /// The template for `stage`, preferring a module override.
    pub fn template(&self, stage: PromptStage, module_key: &str) -> &Template {
        self.overrides
            .get(&(module_key.to_string(), stage))
            .unwrap_or(&self.defaults[&stage])
    }

    pub fn has_override(&self, stage: PromptStage, module_key: &str) -> bool {
        self.overrides
            .contains_key(&(module_key.to_string(), stage))
    }
}

fn compile_named(engine: &TemplateEngine, name: &str, text: &str) -> Result<Template, PromptError> {
    engine.compile(text).map_err(|source| PromptError::Compile {
        name: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SMALL: &str = r#"(
        draft: "Draft ${module.label}",
        final: "Final ${module.label}",
        refine: "Refine ${field.label}",
        modules: {
            "power": (final: Some("Power: ${module.label|upper}")),
        },
    )"#;

    #[test]
    fn override_wins_for_its_module_only() {
        let catalog = PromptCatalog::parse_ron(SMALL, &TemplateEngine::default()).unwrap();
        let engine = TemplateEngine::default();
        let ctx = json!({"module": {"label": "Magic"}});

        let t = catalog.template(PromptStage::Final, "power");
        assert_eq!(engine.render(t, &ctx).unwrap(), "Power: MAGIC");
        let t = catalog.template(PromptStage::Final, "history");
        assert_eq!(engine.render(t, &ctx).unwrap(), "Final Magic");
        let t = catalog.template(PromptStage::Draft, "power");
        assert_eq!(engine.render(t, &ctx).unwrap(), "Draft Magic");

        assert!(catalog.has_override(PromptStage::Final, "power"));
        assert!(!catalog.has_override(PromptStage::Draft, "power"));
    }

    #[test]
    fn unknown_function_rejects_catalog() {
        let bad = r#"(draft: "${a|shout}", final: "", refine: "")"#;
        let err = PromptCatalog::parse_ron(bad, &TemplateEngine::default()).unwrap_err();
        assert!(matches!(
            err,
            PromptError::Compile { ref name, source: TemplateError::UnknownFunction(_) } if name == "draft"
        ));
    }

    #[test]
    fn override_name_in_compile_error() {
        let bad = r#"(draft: "", final: "", refine: "",
            modules: { "power": (refine: Some("${}")) })"#;
        let err = PromptCatalog::parse_ron(bad, &TemplateEngine::default()).unwrap_err();
        assert!(matches!(err, PromptError::Compile { ref name, .. } if name == "power.refine"));
    }

    #[test]
    fn check_modules_flags_unknown_override() {
        let registry = ModuleRegistry::packaged().unwrap();
        let catalog = PromptCatalog::parse_ron(SMALL, &TemplateEngine::default()).unwrap();
        assert!(catalog.check_modules(&registry).is_ok());

        let stray = r#"(draft: "", final: "", refine: "",
            modules: { "weather": (draft: Some("x")) })"#;
        let catalog = PromptCatalog::parse_ron(stray, &TemplateEngine::default()).unwrap();
        assert!(matches!(
            catalog.check_modules(&registry),
            Err(PromptError::UnknownModule(k)) if k == "weather"
        ));
    }

    #[test]
    fn packaged_catalog_compiles() {
        let catalog = PromptCatalog::packaged(&TemplateEngine::default()).unwrap();
        let registry = ModuleRegistry::packaged().unwrap();
        catalog.check_modules(&registry).unwrap();
        for stage in PromptStage::ALL {
            assert!(!catalog.template(stage, "geography").segments.is_empty());
        }
    }

    #[test]
    fn stage_round_trips_through_str() {
        for stage in PromptStage::ALL {
            assert_eq!(stage.as_str().parse::<PromptStage>().unwrap(), stage);
        }
        assert!("outline".parse::<PromptStage>().is_err());
    }
}
