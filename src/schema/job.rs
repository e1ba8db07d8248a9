use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, WorldId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Waiting,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(Self::Waiting),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Render the final-stage prompt and store the result as full content.
    ModuleFinal,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModuleFinal => "MODULE_FINAL",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MODULE_FINAL" => Ok(Self::ModuleFinal),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// One queued unit of work: produce a module's final content.
///
/// Jobs refer to their module by key, not by row id, so module rows may be
/// recreated between publish cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: JobId,
    pub world_id: WorldId,
    pub module_key: String,
    /// 1-based processing order within a publish cycle.
    pub sequence: u32,
    pub job_type: JobType,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    pub fn waiting(world_id: WorldId, module_key: impl Into<String>, sequence: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            world_id,
            module_key: module_key.into(),
            sequence,
            job_type: JobType::ModuleFinal,
            status: JobStatus::Waiting,
            attempts: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
