use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{OwnerId, WorldId};

/// Lifecycle of a world. Only publication and the generation workflow move
/// a world between these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorldStatus {
    Draft,
    Generating,
    Active,
    Archived,
}

impl WorldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Generating => "GENERATING",
            Self::Active => "ACTIVE",
            Self::Archived => "ARCHIVED",
        }
    }
}

impl std::fmt::Display for WorldStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorldStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "GENERATING" => Ok(Self::Generating),
            "ACTIVE" => Ok(Self::Active),
            "ARCHIVED" => Ok(Self::Archived),
            other => Err(format!("unknown world status: {other}")),
        }
    }
}

/// The top-level creative aggregate, built from modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct World {
    pub id: WorldId,
    pub owner_id: OwnerId,
    pub name: String,
    pub tagline: Option<String>,
    pub themes: Vec<String>,
    pub status: WorldStatus,
    pub version: i64,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl World {
    /// A fresh draft world with version 0.
    pub fn new(owner_id: OwnerId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorldId::new(),
            owner_id,
            name: name.into(),
            tagline: None,
            themes: Vec::new(),
            status: WorldStatus::Draft,
            version: 0,
            published_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_owned_by(&self, owner: &OwnerId) -> bool {
        &self.owner_id == owner
    }

    /// Promote to `ACTIVE`: bumps the version and stamps the publish time.
    pub fn activate(&mut self, now: DateTime<Utc>) {
        self.status = WorldStatus::Active;
        self.version += 1;
        self.published_at = Some(now);
        self.updated_at = now;
    }

    pub fn begin_generation(&mut self, now: DateTime<Utc>) {
        self.status = WorldStatus::Generating;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            WorldStatus::Draft,
            WorldStatus::Generating,
            WorldStatus::Active,
            WorldStatus::Archived,
        ] {
            assert_eq!(status.as_str().parse::<WorldStatus>().unwrap(), status);
        }
        assert!("nope".parse::<WorldStatus>().is_err());
    }

    #[test]
    fn activate_bumps_version() {
        let mut world = World::new(OwnerId::new("u1"), "Aster");
        assert_eq!(world.status, WorldStatus::Draft);
        let now = Utc::now();
        world.activate(now);
        assert_eq!(world.status, WorldStatus::Active);
        assert_eq!(world.version, 1);
        assert_eq!(world.published_at, Some(now));
        world.activate(now);
        assert_eq!(world.version, 2);
    }

    #[test]
    fn ownership() {
        let world = World::new(OwnerId::new("u1"), "Aster");
        assert!(world.is_owned_by(&OwnerId::new("u1")));
        assert!(!world.is_owned_by(&OwnerId::new("u2")));
    }
}
