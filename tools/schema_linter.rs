/// Schema Linter — validates a module schema and a prompt catalog together.
///
/// Usage: schema_linter [--modules <file>] [--prompts <file>]
///
/// Without arguments the packaged files are checked.
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::process;

use worldsmith::core::context::{
    field_refine_context, module_draft_context, module_final_context, ContextInput,
};
use worldsmith::core::prompts::{PromptSource, PromptStage, PACKAGED_PROMPTS};
use worldsmith::core::registry::ModuleRegistry;
use worldsmith::core::template::{PathSegment, TemplateEngine};
use worldsmith::schema::ids::OwnerId;
use worldsmith::schema::module::WorldModule;
use worldsmith::schema::world::World;

#[derive(Parser)]
#[command(name = "schema_linter")]
#[command(about = "Checks module definitions and prompt templates")]
struct Cli {
    /// Module schema (RON). Defaults to the packaged schema.
    #[arg(long)]
    modules: Option<PathBuf>,

    /// Prompt catalog (RON). Defaults to the packaged catalog.
    #[arg(long)]
    prompts: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let registry = match &cli.modules {
        Some(path) => ModuleRegistry::load_from_ron(path),
        None => ModuleRegistry::packaged(),
    };
    let registry = match registry {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("ERROR: Failed to load module schema: {}", e);
            process::exit(1);
        }
    };
    println!("Loaded {} module definitions", registry.len());

    let prompts_text = match &cli.prompts {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("ERROR: Failed to read {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => PACKAGED_PROMPTS.to_string(),
    };
    let source: PromptSource = match ron::from_str(&prompts_text) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("ERROR: Failed to parse prompt catalog: {}", e);
            process::exit(1);
        }
    };

    let (errors, warnings) = lint(&registry, &source);

    println!("\n=== Schema Lint Report ===\n");

    if errors.is_empty() && warnings.is_empty() {
        println!("All checks passed!");
    }
    for warning in &warnings {
        println!("WARNING: {}", warning);
    }
    for error in &errors {
        println!("ERROR: {}", error);
    }
    println!(
        "\nSummary: {} errors, {} warnings",
        errors.len(),
        warnings.len()
    );

    process::exit(if errors.is_empty() { 0 } else { 1 });
}

fn lint(registry: &ModuleRegistry, source: &PromptSource) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let engine = TemplateEngine::default();

    for definition in registry.all() {
        if definition.required_fields().next().is_none() {
            warnings.push(format!(
                "Module '{}' has no required field; it can be published empty",
                definition.key
            ));
        }
        for field in &definition.fields {
            if field.focus.is_none() {
                warnings.push(format!(
                    "Field '{}.{}' has no focus note for refinement",
                    definition.key, field.key
                ));
            }
            if field.max_length.is_none() {
                warnings.push(format!(
                    "Field '{}.{}' has no max_length",
                    definition.key, field.key
                ));
            }
        }
    }

    for key in source.modules.keys() {
        if registry.get(key).is_none() {
            errors.push(format!("Prompt override for unknown module '{}'", key));
        }
    }

    let mut templates: Vec<(String, PromptStage, &str)> = Vec::new();
    templates.push(("draft".to_string(), PromptStage::Draft, source.draft.as_str()));
    templates.push(("final".to_string(), PromptStage::Final, source.final_stage.as_str()));
    templates.push(("refine".to_string(), PromptStage::Refine, source.refine.as_str()));
    for (key, overrides) in &source.modules {
        let stages = [
            (PromptStage::Draft, &overrides.draft),
            (PromptStage::Final, &overrides.final_stage),
            (PromptStage::Refine, &overrides.refine),
        ];
        for (stage, text) in stages {
            if let Some(text) = text {
                templates.push((format!("{key}.{stage}"), stage, text.as_str()));
            }
        }
    }

    for (name, stage, text) in templates {
        let template = match engine.compile(text) {
            Ok(t) => t,
            Err(e) => {
                errors.push(format!("Template '{}' does not compile: {}", name, e));
                continue;
            }
        };
        let roots = context_roots(registry, stage);
        for expr in template.expressions() {
            let root = match expr.path.first() {
                Some(PathSegment::Key(k)) | Some(PathSegment::Wildcard(k)) => k,
                None => continue,
            };
            if !roots.iter().any(|r| r == root) {
                errors.push(format!(
                    "Template '{}' reads '{}', but the {} context has no '{}'",
                    name,
                    expr.dotted_path(),
                    stage,
                    root
                ));
            }
        }
        if template.expressions().next().is_none() {
            warnings.push(format!("Template '{}' has no expressions", name));
        }
    }

    (errors, warnings)
}

/// Top-level keys of the context a stage renders against, taken from a
/// sample world built against the registry.
fn context_roots(registry: &ModuleRegistry, stage: PromptStage) -> Vec<String> {
    let Some(definition) = registry.all().first() else {
        return Vec::new();
    };
    let world = World::new(OwnerId::new("linter"), "Sample");
    let mut module = WorldModule::new(world.id.clone(), &definition.key);
    for field in &definition.fields {
        module.fields.insert(field.key.clone(), "sample".to_string());
    }
    let others = [module.clone()];
    let input = ContextInput::new(&world, definition, &module, &others);

    let context = match (stage, definition.fields.first()) {
        (PromptStage::Draft, _) => module_draft_context(&input, registry),
        (PromptStage::Final, _) => module_final_context(&input, registry),
        (PromptStage::Refine, Some(field)) => field_refine_context(&input, field, registry),
        (PromptStage::Refine, None) => module_final_context(&input, registry),
    };
    match context {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}
