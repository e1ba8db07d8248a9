use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use crate::schema::ids::{OwnerId, WorldId};
use crate::schema::world::World;
use crate::store::error::StoreError;
use crate::store::row_helpers::{self, format_time};

const COLUMNS: &str = "id, owner_id, name, tagline, themes, status, version, published_at,
                       created_at, updated_at, deleted_at";

/// Insert a new world row.
#[instrument(skip(conn, world), fields(world_id = %world.id))]
pub fn insert(conn: &Connection, world: &World) -> Result<(), StoreError> {
    let themes = serde_json::to_string(&world.themes)?;
    conn.execute(
        "INSERT INTO worlds (id, owner_id, name, tagline, themes, status, version, published_at,
                             created_at, updated_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            world.id.as_str(),
            world.owner_id.as_str(),
            world.name,
            world.tagline,
            themes,
            world.status.as_str(),
            world.version,
            world.published_at.as_ref().map(format_time),
            format_time(&world.created_at),
            format_time(&world.updated_at),
            world.deleted_at.as_ref().map(format_time),
        ],
    )?;
    Ok(())
}

/// Fetch a live world. Soft-deleted rows are reported as missing.
#[instrument(skip(conn), fields(world_id = %id))]
pub fn get(conn: &Connection, id: &WorldId) -> Result<World, StoreError> {
    find(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("world {id}")))
}

pub fn find(conn: &Connection, id: &WorldId) -> Result<Option<World>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM worlds WHERE id = ?1 AND deleted_at IS NULL");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_world(row)?)),
        None => Ok(None),
    }
}

/// Live worlds of one owner, newest first.
#[instrument(skip(conn), fields(owner_id = %owner))]
pub fn list_for_owner(conn: &Connection, owner: &OwnerId) -> Result<Vec<World>, StoreError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM worlds
         WHERE owner_id = ?1 AND deleted_at IS NULL
         ORDER BY created_at DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([owner.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_world(row)?);
    }
    Ok(out)
}

/// Write back every mutable column of a live world.
#[instrument(skip(conn, world), fields(world_id = %world.id, status = %world.status))]
pub fn update(conn: &Connection, world: &World) -> Result<(), StoreError> {
    let themes = serde_json::to_string(&world.themes)?;
    let changed = conn.execute(
        "UPDATE worlds
         SET name = ?2, tagline = ?3, themes = ?4, status = ?5, version = ?6,
             published_at = ?7, updated_at = ?8
         WHERE id = ?1 AND deleted_at IS NULL",
        params![
            world.id.as_str(),
            world.name,
            world.tagline,
            themes,
            world.status.as_str(),
            world.version,
            world.published_at.as_ref().map(format_time),
            format_time(&world.updated_at),
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("world {}", world.id)));
    }
    Ok(())
}

/// Mark a world deleted. Its modules and jobs stay until a hard delete.
#[instrument(skip(conn), fields(world_id = %id))]
pub fn soft_delete(conn: &Connection, id: &WorldId, now: DateTime<Utc>) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE worlds SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
        params![id.as_str(), format_time(&now)],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("world {id}")));
    }
    Ok(())
}

/// Remove a world together with its modules and jobs.
pub fn hard_delete(conn: &Connection, id: &WorldId) -> Result<bool, StoreError> {
    let changed = conn.execute("DELETE FROM worlds WHERE id = ?1", [id.as_str()])?;
    Ok(changed > 0)
}

/// Owner of a world, deleted or not. Used to tell "missing" from "not yours".
pub fn owner_of(conn: &Connection, id: &WorldId) -> Result<Option<OwnerId>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT owner_id FROM worlds WHERE id = ?1 AND deleted_at IS NULL",
            [id.as_str()],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(OwnerId::new))
}

fn row_to_world(row: &rusqlite::Row<'_>) -> Result<World, StoreError> {
    let status_str: String = row_helpers::get(row, 5, "worlds", "status")?;
    let themes_str: String = row_helpers::get(row, 4, "worlds", "themes")?;

    Ok(World {
        id: WorldId::from_raw(row_helpers::get::<String>(row, 0, "worlds", "id")?),
        owner_id: OwnerId::new(row_helpers::get::<String>(row, 1, "worlds", "owner_id")?),
        name: row_helpers::get(row, 2, "worlds", "name")?,
        tagline: row_helpers::get_opt(row, 3, "worlds", "tagline")?,
        themes: row_helpers::parse_json(&themes_str, "worlds", "themes")?,
        status: row_helpers::parse_enum(&status_str, "worlds", "status")?,
        version: row_helpers::get(row, 6, "worlds", "version")?,
        published_at: row_helpers::get_time_opt(row, 7, "worlds", "published_at")?,
        created_at: row_helpers::get_time(row, 8, "worlds", "created_at")?,
        updated_at: row_helpers::get_time(row, 9, "worlds", "updated_at")?,
        deleted_at: row_helpers::get_time_opt(row, 10, "worlds", "deleted_at")?,
    })
}
