/// Publication: decide which modules need generating and start the cycle.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};

use crate::error::ServiceError;
use crate::schema::ids::{OwnerId, WorldId};
use crate::schema::job::GenerationJob;
use crate::schema::module::{ModuleStatus, WorldModule};
use crate::schema::world::World;
use crate::service::engine::{module_or_new, owned_world, WorldEngine};
use crate::service::workflow::rebuild_jobs;
use crate::store::{modules, worlds};

/// Outcome of a publish request.
#[derive(Debug, Clone, Serialize)]
pub struct PublicationAnalysis {
    /// The world as persisted at the end of the call.
    pub world: World,
    /// Module keys queued for generation, in registry order.
    pub modules_to_generate: Vec<String>,
    /// Completed modules whose fields are unchanged since generation.
    pub modules_to_reuse: Vec<String>,
    /// The fresh job queue. Empty when the world was activated directly.
    pub jobs: Vec<GenerationJob>,
}

impl PublicationAnalysis {
    pub fn activated(&self) -> bool {
        self.modules_to_generate.is_empty()
    }
}

impl WorldEngine {
    /// Validate every module, then either activate the world at once (all
    /// modules reusable) or move it to `GENERATING` with a fresh job queue.
    /// All of it happens in one transaction: a validation failure changes
    /// nothing.
    #[instrument(skip(self), fields(world_id = %world_id, owner_id = %owner))]
    pub fn prepare_publish(
        &self,
        world_id: &WorldId,
        owner: &OwnerId,
    ) -> Result<PublicationAnalysis, ServiceError> {
        self.db.with_tx(|tx| {
            let mut world = owned_world(tx, world_id, owner)?;

            let mut current: Vec<WorldModule> = Vec::with_capacity(self.registry.len());
            let mut violations = Vec::new();
            for definition in self.registry.all() {
                let module = module_or_new(tx, world_id, definition)?;
                for field in definition.required_fields() {
                    if let Some(violation) = field.violation(module.field(&field.key)) {
                        violations.push(format!("{}.{} {violation}", definition.key, field.key));
                    }
                }
                current.push(module);
            }
            if !violations.is_empty() {
                return Err(ServiceError::Validation(violations.join("; ")));
            }

            let now = Utc::now();
            let mut modules_to_generate = Vec::new();
            let mut modules_to_reuse = Vec::new();
            for mut module in current {
                if module.is_reusable() {
                    modules_to_reuse.push(module.module_key);
                    continue;
                }
                module.status = ModuleStatus::AwaitingGeneration;
                module.touch(Some(owner), now);
                modules::save(tx, &module)?;
                modules_to_generate.push(module.module_key);
            }

            let jobs = if modules_to_generate.is_empty() {
                world.activate(now);
                worlds::update(tx, &world)?;
                info!(version = world.version, "world activated without generation");
                Vec::new()
            } else {
                world.begin_generation(now);
                worlds::update(tx, &world)?;
                let jobs = rebuild_jobs(tx, world_id, &modules_to_generate)?;
                info!(
                    generate = modules_to_generate.len(),
                    reuse = modules_to_reuse.len(),
                    "world queued for generation"
                );
                jobs
            };

            Ok(PublicationAnalysis {
                world,
                modules_to_generate,
                modules_to_reuse,
                jobs,
            })
        })
    }
}
