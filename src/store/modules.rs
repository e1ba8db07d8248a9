use rusqlite::{params, Connection};
use tracing::instrument;

use crate::schema::ids::{ModuleId, OwnerId, WorldId};
use crate::schema::module::{FieldMap, WorldModule};
use crate::store::error::StoreError;
use crate::store::row_helpers::{self, format_time};

const COLUMNS: &str = "id, world_id, module_key, fields, status, content_hash, full_content,
                       last_editor, created_at, updated_at";

/// Insert or overwrite the row for `(world_id, module_key)`. The row id of an
/// existing module is kept.
#[instrument(skip(conn, module), fields(world_id = %module.world_id, module_key = %module.module_key))]
pub fn save(conn: &Connection, module: &WorldModule) -> Result<(), StoreError> {
    let fields = serde_json::to_string(&module.fields)?;
    conn.execute(
        "INSERT INTO world_modules (id, world_id, module_key, fields, status, content_hash,
                                    full_content, last_editor, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (world_id, module_key) DO UPDATE SET
             fields = excluded.fields,
             status = excluded.status,
             content_hash = excluded.content_hash,
             full_content = excluded.full_content,
             last_editor = excluded.last_editor,
             updated_at = excluded.updated_at",
        params![
            module.id.as_str(),
            module.world_id.as_str(),
            module.module_key,
            fields,
            module.status.as_str(),
            module.content_hash,
            module.full_content,
            module.last_editor.as_ref().map(OwnerId::as_str),
            format_time(&module.created_at),
            format_time(&module.updated_at),
        ],
    )?;
    Ok(())
}

pub fn find(
    conn: &Connection,
    world_id: &WorldId,
    module_key: &str,
) -> Result<Option<WorldModule>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM world_modules WHERE world_id = ?1 AND module_key = ?2");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![world_id.as_str(), module_key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_module(row)?)),
        None => Ok(None),
    }
}

pub fn get(conn: &Connection, world_id: &WorldId, module_key: &str) -> Result<WorldModule, StoreError> {
    find(conn, world_id, module_key)?
        .ok_or_else(|| StoreError::NotFound(format!("module {module_key} of world {world_id}")))
}

/// Every module row of a world, in key order.
#[instrument(skip(conn), fields(world_id = %world_id))]
pub fn list_for_world(conn: &Connection, world_id: &WorldId) -> Result<Vec<WorldModule>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM world_modules WHERE world_id = ?1 ORDER BY module_key");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([world_id.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_module(row)?);
    }
    Ok(out)
}

fn row_to_module(row: &rusqlite::Row<'_>) -> Result<WorldModule, StoreError> {
    let fields_str: String = row_helpers::get(row, 3, "world_modules", "fields")?;
    let status_str: String = row_helpers::get(row, 4, "world_modules", "status")?;
    let fields: FieldMap = row_helpers::parse_json(&fields_str, "world_modules", "fields")?;

    Ok(WorldModule {
        id: ModuleId::from_raw(row_helpers::get::<String>(row, 0, "world_modules", "id")?),
        world_id: WorldId::from_raw(row_helpers::get::<String>(row, 1, "world_modules", "world_id")?),
        module_key: row_helpers::get(row, 2, "world_modules", "module_key")?,
        fields,
        status: row_helpers::parse_enum(&status_str, "world_modules", "status")?,
        content_hash: row_helpers::get_opt(row, 5, "world_modules", "content_hash")?,
        full_content: row_helpers::get_opt(row, 6, "world_modules", "full_content")?,
        last_editor: row_helpers::get_opt::<String>(row, 7, "world_modules", "last_editor")?
            .map(OwnerId::new),
        created_at: row_helpers::get_time(row, 8, "world_modules", "created_at")?,
        updated_at: row_helpers::get_time(row, 9, "world_modules", "updated_at")?,
    })
}
