/// Generation workflow — the job queue and its single-consumer processing.

use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, error, info, instrument, warn};

use crate::core::context::{module_final_context, ContextInput};
use crate::core::prompts::PromptStage;
use crate::error::ServiceError;
use crate::llm::GenerationError;
use crate::schema::ids::{JobId, OwnerId, WorldId};
use crate::schema::job::GenerationJob;
use crate::schema::module::{content_hash, ModuleStatus};
use crate::schema::world::WorldStatus;
use crate::service::engine::{owned_world, WorldEngine};
use crate::store::{jobs, modules, worlds, StoreError};

/// Message recorded on jobs whose worker vanished mid-call.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Result of one `process_queue` iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOutcome {
    /// No job was eligible.
    Idle,
    Succeeded {
        job_id: JobId,
        world_id: WorldId,
        module_key: String,
        /// The job was the world's last outstanding one.
        world_activated: bool,
    },
    Failed {
        job_id: JobId,
        world_id: WorldId,
        module_key: String,
        error: String,
    },
    /// The job was reset, or its world deleted, while the call was in
    /// flight. The result was discarded; a job still leased is failed.
    LeaseLost { job_id: JobId },
    /// The database could not be read or written.
    StoreUnavailable(String),
}

impl QueueOutcome {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Delete the world's jobs and queue one `WAITING` job per key, sequenced
/// from 1 in the given order. Refused with `Conflict` while one of the
/// world's jobs holds the lease.
pub(crate) fn rebuild_jobs(
    conn: &Connection,
    world_id: &WorldId,
    module_keys: &[String],
) -> Result<Vec<GenerationJob>, StoreError> {
    if let Some(running) = jobs::running_for_world(conn, world_id)? {
        return Err(StoreError::Conflict(format!(
            "world {world_id} is generating '{}'; try again once it finishes",
            running.module_key
        )));
    }
    let queue: Vec<GenerationJob> = module_keys
        .iter()
        .enumerate()
        .map(|(i, key)| GenerationJob::waiting(world_id.clone(), key.as_str(), i as u32 + 1))
        .collect();
    jobs::replace_for_world(conn, world_id, &queue)?;
    Ok(queue)
}

impl WorldEngine {
    /// Replace the world's job queue with one job per module key.
    #[instrument(skip(self, module_keys), fields(world_id = %world_id))]
    pub fn initialize_jobs(
        &self,
        world_id: &WorldId,
        module_keys: &[String],
    ) -> Result<Vec<GenerationJob>, ServiceError> {
        for key in module_keys {
            self.registry.require(key)?;
        }
        self.db.with_tx(|tx| {
            worlds::get(tx, world_id)?;
            Ok(rebuild_jobs(tx, world_id, module_keys)?)
        })
    }

    /// Lease the next eligible job and run it to a terminal state. Never
    /// fails: every problem ends up on the job or in the outcome.
    pub async fn process_queue(&self) -> QueueOutcome {
        let leased = self.db.with_tx(|tx| -> Result<_, ServiceError> {
            let now = Utc::now();
            let Some(job) = jobs::lease_next(tx, now)? else {
                return Ok(None);
            };
            if let Some(mut module) = modules::find(tx, &job.world_id, &job.module_key)? {
                module.status = ModuleStatus::Generating;
                module.touch(None, now);
                modules::save(tx, &module)?;
            }
            Ok(Some(job))
        });

        let job = match leased {
            Ok(Some(job)) => job,
            Ok(None) => return QueueOutcome::Idle,
            Err(e) => {
                error!(error = %e, "failed to lease next job");
                return QueueOutcome::StoreUnavailable(e.to_string());
            }
        };

        info!(
            job_id = %job.id,
            world_id = %job.world_id,
            module_key = %job.module_key,
            attempt = job.attempts,
            "job leased"
        );

        match self.run_job(&job).await {
            Ok(content) => self.complete_job(&job, content),
            Err(e) => self.fail_job(&job, e),
        }
    }

    /// Render the final prompt and call the generator. Reads only.
    async fn run_job(&self, job: &GenerationJob) -> Result<String, ServiceError> {
        let definition = self.registry.require(&job.module_key)?;
        let (world, siblings) = self.db.with_conn(|conn| {
            Ok((
                worlds::get(conn, &job.world_id)?,
                modules::list_for_world(conn, &job.world_id)?,
            ))
        })?;
        let module = siblings
            .iter()
            .find(|m| m.module_key == job.module_key)
            .ok_or_else(|| ServiceError::NotFound(format!("module {}", job.module_key)))?;

        let input = ContextInput::new(&world, definition, module, &siblings);
        let context = module_final_context(&input, &self.registry);
        let prompt = self.render_prompt(PromptStage::Final, &input, &context)?;

        let credentials = self.credentials_for(&world)?;
        debug!(job_id = %job.id, prompt_chars = prompt.len(), "calling generator");
        let text = self.call_generator(&prompt, &credentials, false).await?;

        let text = text.trim();
        if text.is_empty() {
            return Err(GenerationError::EmptyResponse.into());
        }
        Ok(text.to_string())
    }

    fn complete_job(&self, job: &GenerationJob, content: String) -> QueueOutcome {
        let result = self.db.with_tx(|tx| -> Result<bool, ServiceError> {
            let now = Utc::now();
            // A world deleted mid-call gets nothing written.
            let mut world = worlds::get(tx, &job.world_id)?;
            jobs::mark_succeeded(tx, &job.id, now)?;

            let mut module = modules::get(tx, &job.world_id, &job.module_key)?;
            module.full_content = Some(content);
            module.content_hash = Some(content_hash(&module.fields));
            module.status = ModuleStatus::Completed;
            module.touch(None, now);
            modules::save(tx, &module)?;

            if jobs::count_outstanding(tx, &job.world_id)? > 0 {
                return Ok(false);
            }
            world.activate(now);
            worlds::update(tx, &world)?;
            info!(world_id = %world.id, version = world.version, "world activated");
            Ok(true)
        });

        match result {
            Ok(world_activated) => {
                info!(job_id = %job.id, module_key = %job.module_key, "job succeeded");
                QueueOutcome::Succeeded {
                    job_id: job.id.clone(),
                    world_id: job.world_id.clone(),
                    module_key: job.module_key.clone(),
                    world_activated,
                }
            }
            Err(e) => self.settle_error(job, e),
        }
    }

    fn fail_job(&self, job: &GenerationJob, cause: ServiceError) -> QueueOutcome {
        let message = cause.to_string();
        warn!(
            job_id = %job.id,
            module_key = %job.module_key,
            kind = cause.error_kind(),
            error = %message,
            "job failed"
        );

        let result = self.db.with_tx(|tx| -> Result<(), ServiceError> {
            let now = Utc::now();
            jobs::mark_failed(tx, &job.id, &message, now)?;
            if let Some(mut module) = modules::find(tx, &job.world_id, &job.module_key)? {
                module.status = ModuleStatus::Failed;
                module.touch(None, now);
                modules::save(tx, &module)?;
            }
            Ok(())
        });

        match result {
            Ok(()) => QueueOutcome::Failed {
                job_id: job.id.clone(),
                world_id: job.world_id.clone(),
                module_key: job.module_key.clone(),
                error: message,
            },
            Err(e) => self.settle_error(job, e),
        }
    }

    fn settle_error(&self, job: &GenerationJob, e: ServiceError) -> QueueOutcome {
        match e {
            ServiceError::Conflict(_) | ServiceError::NotFound(_) => {
                warn!(job_id = %job.id, error = %e, "lease lost, result discarded");
                self.release_lease(job, &e);
                QueueOutcome::LeaseLost {
                    job_id: job.id.clone(),
                }
            }
            other => {
                error!(job_id = %job.id, error = %other, "failed to record job result");
                QueueOutcome::StoreUnavailable(other.to_string())
            }
        }
    }

    /// The result transaction rolled back (world deleted, module gone). If the
    /// job still holds its lease, fail it so the global lease is freed.
    fn release_lease(&self, job: &GenerationJob, cause: &ServiceError) {
        let message = format!("result discarded: {cause}");
        let released = self.db.with_tx(|tx| -> Result<bool, ServiceError> {
            let now = Utc::now();
            match jobs::mark_failed(tx, &job.id, &message, now) {
                Ok(()) => {}
                Err(StoreError::Conflict(_) | StoreError::NotFound(_)) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            if let Some(mut module) = modules::find(tx, &job.world_id, &job.module_key)? {
                module.status = ModuleStatus::Failed;
                module.touch(None, now);
                modules::save(tx, &module)?;
            }
            Ok(true)
        });

        match released {
            Ok(true) => warn!(job_id = %job.id, "lease released after discarded result"),
            Ok(false) => {}
            Err(e) => error!(job_id = %job.id, error = %e, "failed to release lease"),
        }
    }

    /// Put a finished job back in the queue. The only way a failed job runs
    /// again. A job that is running right now is left alone (`Conflict`).
    #[instrument(skip(self), fields(world_id = %world_id, module_key = %module_key))]
    pub fn retry_module(
        &self,
        world_id: &WorldId,
        module_key: &str,
        owner: &OwnerId,
    ) -> Result<GenerationJob, ServiceError> {
        self.registry.require(module_key)?;
        self.db.with_tx(|tx| {
            let mut world = owned_world(tx, world_id, owner)?;
            let job = jobs::find(tx, world_id, module_key)?.ok_or_else(|| {
                ServiceError::NotFound(format!("job for {world_id}/{module_key}"))
            })?;

            let now = Utc::now();
            jobs::reset_for_retry(tx, &job.id, now)?;

            let mut module = modules::get(tx, world_id, module_key)?;
            module.status = ModuleStatus::AwaitingGeneration;
            module.touch(Some(owner), now);
            modules::save(tx, &module)?;

            if world.status != WorldStatus::Generating {
                world.begin_generation(now);
                worlds::update(tx, &world)?;
            }

            info!(job_id = %job.id, attempts = job.attempts, "job requeued");
            Ok(jobs::get(tx, &job.id)?)
        })
    }

    /// Fail every `RUNNING` job leased longer ago than `timeout`, with its
    /// module. Recovered jobs still need `retry_module`.
    pub fn recover_stale_leases(&self, timeout: Duration) -> Result<Vec<GenerationJob>, ServiceError> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| ServiceError::Validation(format!("lease timeout out of range: {e}")))?;
        self.db.with_tx(|tx| {
            let now = Utc::now();
            let stale = jobs::running_since_before(tx, now - timeout)?;
            let mut recovered = Vec::with_capacity(stale.len());
            for job in stale {
                jobs::mark_failed(tx, &job.id, LEASE_EXPIRED, now)?;
                if let Some(mut module) = modules::find(tx, &job.world_id, &job.module_key)? {
                    module.status = ModuleStatus::Failed;
                    module.touch(None, now);
                    modules::save(tx, &module)?;
                }
                warn!(job_id = %job.id, module_key = %job.module_key, "stale lease recovered");
                recovered.push(jobs::get(tx, &job.id)?);
            }
            Ok(recovered)
        })
    }
}
