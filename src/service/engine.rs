/// The world engine — shared handles for the publication, workflow and
/// one-shot services.
///
/// Built via `WorldEngine::builder()`. Cloning is cheap; every clone talks to
/// the same database and collaborators.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;
use tracing::info;

use crate::config::EngineConfig;
use crate::core::context::ContextInput;
use crate::core::prompts::{PromptCatalog, PromptStage};
use crate::core::registry::ModuleRegistry;
use crate::core::template::{FunctionRegistry, TemplateEngine};
use crate::error::ServiceError;
use crate::llm::{
    ChatCompletionsGenerator, ConfiguredCredentials, Credentials, CredentialsResolver,
    GenerationError, Generator,
};
use crate::schema::definition::ModuleDefinition;
use crate::schema::ids::{OwnerId, WorldId};
use crate::schema::module::{ModuleStatus, WorldModule};
use crate::schema::world::World;
use crate::store::{modules, worlds, Database};

#[derive(Clone)]
pub struct WorldEngine {
    pub(crate) db: Database,
    pub(crate) registry: Arc<ModuleRegistry>,
    pub(crate) prompts: Arc<PromptCatalog>,
    pub(crate) templates: TemplateEngine,
    pub(crate) generator: Arc<dyn Generator>,
    pub(crate) credentials: Arc<dyn CredentialsResolver>,
    pub(crate) generation_timeout: Duration,
}

/// Builder for constructing a `WorldEngine`.
pub struct WorldEngineBuilder {
    database: Option<Database>,
    database_path: Option<PathBuf>,
    modules_path: Option<PathBuf>,
    prompts_path: Option<PathBuf>,
    functions: FunctionRegistry,
    generator: Option<Arc<dyn Generator>>,
    credentials: Option<Arc<dyn CredentialsResolver>>,
    generation_timeout: Duration,
    /// Directly provided registry (for testing without files).
    registry: Option<ModuleRegistry>,
    /// Directly provided prompt source (for testing without files).
    prompts_ron: Option<String>,
}

impl WorldEngine {
    pub fn builder() -> WorldEngineBuilder {
        WorldEngineBuilder {
            database: None,
            database_path: None,
            modules_path: None,
            prompts_path: None,
            functions: FunctionRegistry::builtin(),
            generator: None,
            credentials: None,
            generation_timeout: Duration::from_secs(120),
            registry: None,
            prompts_ron: None,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn prompts(&self) -> &PromptCatalog {
        &self.prompts
    }

    pub fn generation_timeout(&self) -> Duration {
        self.generation_timeout
    }

    /// Create a draft world. The surrounding application owns world CRUD;
    /// this is the minimal entry point the engine needs.
    pub fn create_world(
        &self,
        owner: &OwnerId,
        name: &str,
        tagline: Option<&str>,
        themes: &[&str],
    ) -> Result<World, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::Validation("world name must not be blank".to_string()));
        }
        let mut world = World::new(owner.clone(), name.trim());
        world.tagline = tagline.map(str::to_string);
        world.themes = themes.iter().map(|t| t.to_string()).collect();
        self.db.with_conn(|conn| worlds::insert(conn, &world))?;
        Ok(world)
    }

    /// Overwrite some fields of a module as its owner would in an editor.
    /// Keys outside the module definition are rejected. The editing status
    /// is derived from field completeness.
    pub fn save_module_fields(
        &self,
        world_id: &WorldId,
        module_key: &str,
        owner: &OwnerId,
        fields: &[(&str, &str)],
    ) -> Result<WorldModule, ServiceError> {
        let definition = self.registry.require(module_key)?;
        if let Some((unknown, _)) = fields.iter().find(|(k, _)| definition.field(k).is_none()) {
            return Err(ServiceError::Validation(format!(
                "module {module_key} has no field {unknown}"
            )));
        }

        self.db.with_tx(|tx| {
            owned_world(tx, world_id, owner)?;
            let mut module = module_or_new(tx, world_id, definition)?;
            for (key, value) in fields {
                module.fields.insert(key.to_string(), value.to_string());
            }
            module.status = ModuleStatus::derive(definition, &module.fields);
            module.touch(Some(owner), Utc::now());
            modules::save(tx, &module)?;
            Ok(module)
        })
    }

    /// The owned world, the module (fresh when unsaved) and all stored
    /// modules of the world, read without taking the write lock.
    pub(crate) fn load_scope(
        &self,
        world_id: &WorldId,
        owner: &OwnerId,
        definition: &ModuleDefinition,
    ) -> Result<(World, WorldModule, Vec<WorldModule>), ServiceError> {
        let (world, siblings) = self.db.with_conn(|conn| {
            Ok((
                worlds::get(conn, world_id)?,
                modules::list_for_world(conn, world_id)?,
            ))
        })?;
        ensure_owner(&world, owner)?;
        let module = siblings
            .iter()
            .find(|m| m.module_key == definition.key)
            .cloned()
            .unwrap_or_else(|| empty_module(world_id, definition));
        Ok((world, module, siblings))
    }

    /// Render the prompt of `stage` for one module.
    pub(crate) fn render_prompt(
        &self,
        stage: PromptStage,
        input: &ContextInput<'_>,
        context: &Value,
    ) -> Result<String, ServiceError> {
        let template = self.prompts.template(stage, &input.definition.key);
        Ok(self.templates.render(template, context)?)
    }

    /// Resolve credentials for the owner of `world`.
    pub(crate) fn credentials_for(&self, world: &World) -> Result<Credentials, ServiceError> {
        Ok(self.credentials.resolve(&world.owner_id)?)
    }

    /// A generator call bounded by the configured timeout.
    pub(crate) async fn call_generator(
        &self,
        prompt: &str,
        credentials: &Credentials,
        json: bool,
    ) -> Result<String, GenerationError> {
        let call = async {
            if json {
                self.generator.generate_json(prompt, credentials).await
            } else {
                self.generator.generate(prompt, credentials).await
            }
        };
        match tokio::time::timeout(self.generation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(self.generation_timeout)),
        }
    }
}

/// Load a live world and check its owner.
pub(crate) fn owned_world(
    conn: &Connection,
    world_id: &WorldId,
    owner: &OwnerId,
) -> Result<World, ServiceError> {
    let world = worlds::get(conn, world_id)?;
    ensure_owner(&world, owner)?;
    Ok(world)
}

fn ensure_owner(world: &World, owner: &OwnerId) -> Result<(), ServiceError> {
    if world.is_owned_by(owner) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(format!(
            "world {} is not owned by {owner}",
            world.id
        )))
    }
}

/// The stored module, or a fresh empty one when no row exists yet.
pub(crate) fn module_or_new(
    conn: &Connection,
    world_id: &WorldId,
    definition: &ModuleDefinition,
) -> Result<WorldModule, ServiceError> {
    Ok(modules::find(conn, world_id, &definition.key)?
        .unwrap_or_else(|| empty_module(world_id, definition)))
}

fn empty_module(world_id: &WorldId, definition: &ModuleDefinition) -> WorldModule {
    let mut module = WorldModule::new(world_id.clone(), &definition.key);
    module.status = ModuleStatus::derive(definition, &module.fields);
    module
}

impl WorldEngineBuilder {
    /// Take paths, timeouts and credentials from configuration and talk to
    /// an OpenAI-compatible endpoint.
    pub fn config(mut self, config: &EngineConfig) -> Result<Self, ServiceError> {
        self.database_path = Some(config.database_path.clone());
        self.modules_path = config.modules_path.clone();
        self.prompts_path = config.prompts_path.clone();
        self.generation_timeout = Duration::from_secs(config.generator.timeout_secs);
        self.credentials = Some(Arc::new(ConfiguredCredentials::from_config(
            &config.credentials,
        )));
        let generator = ChatCompletionsGenerator::new(&config.generator)
            .map_err(|e| ServiceError::Startup(e.to_string()))?;
        self.generator = Some(Arc::new(generator));
        Ok(self)
    }

    pub fn database(mut self, db: Database) -> Self {
        self.database = Some(db);
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn modules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.modules_path = Some(path.into());
        self
    }

    pub fn prompts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.prompts_path = Some(path.into());
        self
    }

    /// Template functions available to the prompt catalog.
    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialsResolver>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    /// Provide the registry directly (for testing without files).
    pub fn with_registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Provide the prompt catalog source directly (for testing without files).
    pub fn with_prompts_ron(mut self, source: impl Into<String>) -> Self {
        self.prompts_ron = Some(source.into());
        self
    }

    pub fn build(self) -> Result<WorldEngine, ServiceError> {
        let db = match (self.database, self.database_path) {
            (Some(db), _) => db,
            (None, Some(path)) => Database::open(&path)?,
            (None, None) => {
                return Err(ServiceError::Startup("no database configured".to_string()))
            }
        };

        let registry = match (self.registry, self.modules_path) {
            (Some(registry), _) => registry,
            (None, Some(path)) => ModuleRegistry::load_from_ron(&path)?,
            (None, None) => ModuleRegistry::packaged()?,
        };

        let templates = TemplateEngine::new(self.functions);
        let prompts = match (self.prompts_ron, self.prompts_path) {
            (Some(source), _) => PromptCatalog::parse_ron(&source, &templates)?,
            (None, Some(path)) => PromptCatalog::load_from_ron(&path, &templates)?,
            (None, None) => PromptCatalog::packaged(&templates)?,
        };
        prompts.check_modules(&registry)?;

        let generator = self
            .generator
            .ok_or_else(|| ServiceError::Startup("no generator configured".to_string()))?;
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(ConfiguredCredentials::new()));

        info!(
            modules = registry.len(),
            db = %db.path().display(),
            timeout_secs = self.generation_timeout.as_secs(),
            "world engine ready"
        );

        Ok(WorldEngine {
            db,
            registry: Arc::new(registry),
            prompts: Arc::new(prompts),
            templates,
            generator,
            credentials,
            generation_timeout: self.generation_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedGenerator;

    fn engine() -> WorldEngine {
        WorldEngine::builder()
            .database(Database::in_memory().unwrap())
            .generator(Arc::new(ScriptedGenerator::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn build_requires_database_and_generator() {
        let err = WorldEngine::builder()
            .generator(Arc::new(ScriptedGenerator::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::Startup(_)));

        let err = WorldEngine::builder()
            .database(Database::in_memory().unwrap())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::Startup(_)));
    }

    #[test]
    fn packaged_resources_by_default() {
        let engine = engine();
        assert_eq!(engine.registry().len(), 5);
        assert!(engine.prompts().has_override(PromptStage::Final, "factions"));
    }

    #[test]
    fn prompt_override_for_unknown_module_fails_build() {
        let err = WorldEngine::builder()
            .database(Database::in_memory().unwrap())
            .generator(Arc::new(ScriptedGenerator::new()))
            .with_prompts_ron(r#"(draft: "", final: "", refine: "", modules: {"weather": (draft: Some("x"))})"#)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::Startup(ref m) if m.contains("weather")));
    }

    #[test]
    fn custom_functions_reach_the_catalog() {
        let mut functions = FunctionRegistry::builtin();
        functions.register("shout", |v, _| Ok(v));
        let built = WorldEngine::builder()
            .database(Database::in_memory().unwrap())
            .generator(Arc::new(ScriptedGenerator::new()))
            .functions(functions)
            .with_prompts_ron(r#"(draft: "${module.label|shout}", final: "", refine: "")"#)
            .build();
        assert!(built.is_ok());
    }

    #[test]
    fn save_fields_derives_status_and_checks_owner() {
        let engine = engine();
        let owner = OwnerId::new("u1");
        let world = engine.create_world(&owner, "Aster", None, &[]).unwrap();

        let module = engine
            .save_module_fields(&world.id, "history", &owner, &[("eras", "Three ages")])
            .unwrap();
        assert_eq!(module.status, ModuleStatus::InProgress);

        let module = engine
            .save_module_fields(&world.id, "history", &owner, &[("origins", "Born of storms")])
            .unwrap();
        assert_eq!(module.status, ModuleStatus::Ready);
        assert_eq!(module.last_editor, Some(owner.clone()));

        assert!(matches!(
            engine.save_module_fields(&world.id, "history", &OwnerId::new("u2"), &[]),
            Err(ServiceError::Forbidden(_))
        ));
        assert!(matches!(
            engine.save_module_fields(&world.id, "history", &owner, &[("weather", "x")]),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            engine.save_module_fields(&world.id, "weather", &owner, &[]),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn blank_world_name_rejected() {
        let engine = engine();
        assert!(matches!(
            engine.create_world(&OwnerId::new("u1"), "  ", None, &[]),
            Err(ServiceError::Validation(_))
        ));
    }
}
