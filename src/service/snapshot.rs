use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ServiceError;
use crate::schema::ids::{OwnerId, WorldId};
use crate::schema::job::JobStatus;
use crate::schema::module::ModuleStatus;
use crate::schema::world::WorldStatus;
use crate::service::engine::{owned_world, WorldEngine};
use crate::store::{jobs, modules};

/// Where a world's current publish cycle stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSnapshot {
    pub world_id: WorldId,
    pub status: WorldStatus,
    pub version: i64,
    pub published_at: Option<DateTime<Utc>>,
    pub jobs: Vec<JobSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub module_key: String,
    pub label: String,
    pub sequence: u32,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `None` when the module row is gone.
    pub module_status: Option<ModuleStatus>,
}

impl GenerationSnapshot {
    /// No job is waiting or running.
    pub fn is_complete(&self) -> bool {
        self.jobs.iter().all(|j| j.status.is_terminal())
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobSnapshot> {
        self.jobs.iter().filter(|j| j.status == JobStatus::Failed)
    }
}

impl WorldEngine {
    pub fn generation_status(
        &self,
        world_id: &WorldId,
        owner: &OwnerId,
    ) -> Result<GenerationSnapshot, ServiceError> {
        let (world, queue, stored) = self.db.with_tx(|tx| -> Result<_, ServiceError> {
            Ok((
                owned_world(tx, world_id, owner)?,
                jobs::list_for_world(tx, world_id)?,
                modules::list_for_world(tx, world_id)?,
            ))
        })?;

        let jobs = queue
            .into_iter()
            .map(|job| {
                let label = self
                    .registry
                    .get(&job.module_key)
                    .map_or_else(|| job.module_key.clone(), |d| d.label.clone());
                let module_status = stored
                    .iter()
                    .find(|m| m.module_key == job.module_key)
                    .map(|m| m.status);
                JobSnapshot {
                    module_key: job.module_key,
                    label,
                    sequence: job.sequence,
                    status: job.status,
                    attempts: job.attempts,
                    last_error: job.last_error,
                    started_at: job.started_at,
                    finished_at: job.finished_at,
                    module_status,
                }
            })
            .collect();

        Ok(GenerationSnapshot {
            world_id: world.id,
            status: world.status,
            version: world.version,
            published_at: world.published_at,
            jobs,
        })
    }
}
