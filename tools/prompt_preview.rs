/// Prompt Preview — renders generation prompts from a world fixture without
/// calling any model.
///
/// Usage: prompt_preview <fixture.json> --module <key> [--stage draft|final|refine]
///                       [--field <key> --text <text>] [--instruction <text>]
///                       [--prompts <file>] [--modules <file>] [--context]
///
/// The fixture is a JSON object:
///   { "name": "...", "tagline": "...", "themes": ["..."],
///     "modules": { "<module_key>": { "<field_key>": "text", ... }, ... },
///     "content": { "<module_key>": "generated prose", ... } }
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;

use worldsmith::core::context::{
    field_refine_context, module_draft_context, module_final_context, ContextInput,
};
use worldsmith::core::prompts::{PromptCatalog, PromptStage};
use worldsmith::core::registry::ModuleRegistry;
use worldsmith::core::template::TemplateEngine;
use worldsmith::schema::ids::OwnerId;
use worldsmith::schema::module::{ModuleStatus, WorldModule};
use worldsmith::schema::world::World;

#[derive(Parser)]
#[command(name = "prompt_preview")]
#[command(about = "Renders draft, final and refine prompts from a world fixture")]
struct Cli {
    /// World fixture (JSON).
    fixture: PathBuf,

    /// Module to render the prompt for.
    #[arg(long)]
    module: String,

    #[arg(long, default_value = "final")]
    stage: PromptStage,

    /// Field to refine (refine stage only).
    #[arg(long)]
    field: Option<String>,

    /// Text to refine. Defaults to the field's value in the fixture.
    #[arg(long)]
    text: Option<String>,

    #[arg(long)]
    instruction: Option<String>,

    /// Prompt catalog (RON). Defaults to the packaged catalog.
    #[arg(long)]
    prompts: Option<PathBuf>,

    /// Module schema (RON). Defaults to the packaged schema.
    #[arg(long)]
    modules: Option<PathBuf>,

    /// Print the template context as JSON before the prompt.
    #[arg(long)]
    context: bool,
}

#[derive(Debug, Deserialize)]
struct Fixture {
    name: String,
    #[serde(default)]
    tagline: Option<String>,
    #[serde(default)]
    themes: Vec<String>,
    #[serde(default)]
    modules: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    content: BTreeMap<String, String>,
}

fn main() {
    let cli = Cli::parse();

    let registry = match &cli.modules {
        Some(path) => ModuleRegistry::load_from_ron(path),
        None => ModuleRegistry::packaged(),
    };
    let registry = registry.unwrap_or_else(|e| fail(&format!("Failed to load module schema: {e}")));

    let engine = TemplateEngine::default();
    let catalog = match &cli.prompts {
        Some(path) => PromptCatalog::load_from_ron(path, &engine),
        None => PromptCatalog::packaged(&engine),
    };
    let catalog = catalog.unwrap_or_else(|e| fail(&format!("Failed to load prompts: {e}")));

    let fixture_text = std::fs::read_to_string(&cli.fixture)
        .unwrap_or_else(|e| fail(&format!("Failed to read {}: {e}", cli.fixture.display())));
    let fixture: Fixture = serde_json::from_str(&fixture_text)
        .unwrap_or_else(|e| fail(&format!("Invalid fixture: {e}")));

    let mut world = World::new(OwnerId::new("preview"), fixture.name.clone());
    world.tagline = fixture.tagline.clone();
    world.themes = fixture.themes.clone();

    let modules = build_modules(&registry, &world, &fixture);
    let definition = registry
        .require(&cli.module)
        .unwrap_or_else(|e| fail(&e.to_string()));
    let module = modules
        .iter()
        .find(|m| m.module_key == definition.key)
        .cloned()
        .unwrap_or_else(|| WorldModule::new(world.id.clone(), &definition.key));

    let base = ContextInput::new(&world, definition, &module, &modules);
    let context = match cli.stage {
        PromptStage::Draft => module_draft_context(&base, &registry),
        PromptStage::Final => module_final_context(&base, &registry),
        PromptStage::Refine => {
            let field_key = cli
                .field
                .as_deref()
                .unwrap_or_else(|| fail("--field is required for the refine stage"));
            let field = registry
                .require_field(&definition.key, field_key)
                .unwrap_or_else(|e| fail(&e.to_string()));
            let text = cli
                .text
                .as_deref()
                .or_else(|| module.field(field_key))
                .unwrap_or_else(|| fail("--text is required when the fixture has no value"));
            let input = base
                .with_focus_note(field.focus.as_deref())
                .with_prior_text(Some(text))
                .with_instruction(cli.instruction.as_deref());
            field_refine_context(&input, field, &registry)
        }
    };

    if cli.context {
        match serde_json::to_string_pretty(&context) {
            Ok(json) => println!("{json}\n"),
            Err(e) => fail(&format!("Failed to print context: {e}")),
        }
    }

    let template = catalog.template(cli.stage, &definition.key);
    let prompt = engine
        .render(template, &context)
        .unwrap_or_else(|e| fail(&format!("Render failed: {e}")));

    let source = if catalog.has_override(cli.stage, &definition.key) {
        "module override"
    } else {
        "default"
    };
    println!("--- {} / {} ({}) ---", definition.key, cli.stage, source);
    println!("{prompt}");
    println!("--- {} characters ---", prompt.chars().count());
}

/// Modules in registry order, with status derived from the fixture values.
fn build_modules(registry: &ModuleRegistry, world: &World, fixture: &Fixture) -> Vec<WorldModule> {
    for key in fixture.modules.keys().chain(fixture.content.keys()) {
        if registry.get(key).is_none() {
            eprintln!("WARNING: fixture module '{}' is not in the schema", key);
        }
    }

    registry
        .all()
        .iter()
        .map(|definition| {
            let mut module = WorldModule::new(world.id.clone(), &definition.key);
            if let Some(fields) = fixture.modules.get(&definition.key) {
                module.fields = fields.clone();
            }
            module.status = ModuleStatus::derive(definition, &module.fields);
            if let Some(content) = fixture.content.get(&definition.key) {
                module.full_content = Some(content.clone());
                module.status = ModuleStatus::Completed;
            }
            module
        })
        .collect()
}

fn fail(message: &str) -> ! {
    eprintln!("ERROR: {message}");
    process::exit(1);
}
