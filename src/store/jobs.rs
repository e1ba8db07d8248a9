use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use crate::schema::ids::{JobId, WorldId};
use crate::schema::job::GenerationJob;
use crate::store::error::StoreError;
use crate::store::row_helpers::{self, format_time};

const COLUMNS: &str = "id, world_id, module_key, sequence, job_type, status, attempts, last_error,
                       started_at, finished_at, created_at, updated_at";

/// Drop every job of the world and insert `jobs` in their place.
#[instrument(skip(conn, jobs), fields(world_id = %world_id, count = jobs.len()))]
pub fn replace_for_world(
    conn: &Connection,
    world_id: &WorldId,
    jobs: &[GenerationJob],
) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM world_generation_jobs WHERE world_id = ?1",
        [world_id.as_str()],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO world_generation_jobs (id, world_id, module_key, sequence, job_type, status,
                                            attempts, last_error, started_at, finished_at,
                                            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    for job in jobs {
        stmt.execute(params![
            job.id.as_str(),
            job.world_id.as_str(),
            job.module_key,
            job.sequence,
            job.job_type.as_str(),
            job.status.as_str(),
            job.attempts,
            job.last_error,
            job.started_at.as_ref().map(format_time),
            job.finished_at.as_ref().map(format_time),
            format_time(&job.created_at),
            format_time(&job.updated_at),
        ])?;
    }
    Ok(())
}

/// Jobs of a world in sequence order.
pub fn list_for_world(conn: &Connection, world_id: &WorldId) -> Result<Vec<GenerationJob>, StoreError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM world_generation_jobs WHERE world_id = ?1 ORDER BY sequence"
    );
    collect(conn, &sql, params![world_id.as_str()])
}

pub fn find(
    conn: &Connection,
    world_id: &WorldId,
    module_key: &str,
) -> Result<Option<GenerationJob>, StoreError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM world_generation_jobs WHERE world_id = ?1 AND module_key = ?2"
    );
    Ok(collect(conn, &sql, params![world_id.as_str(), module_key])?
        .into_iter()
        .next())
}

pub fn get(conn: &Connection, id: &JobId) -> Result<GenerationJob, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM world_generation_jobs WHERE id = ?1");
    collect(conn, &sql, params![id.as_str()])?
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::NotFound(format!("job {id}")))
}

/// Claim the next `WAITING` job, ordered by world then sequence, in a single
/// compare-and-swap statement. Nothing is leased while any job anywhere is
/// `RUNNING`, and jobs of deleted worlds are never picked.
#[instrument(skip(conn))]
pub fn lease_next(conn: &Connection, now: DateTime<Utc>) -> Result<Option<GenerationJob>, StoreError> {
    let sql = format!(
        "UPDATE world_generation_jobs
         SET status = 'RUNNING', attempts = attempts + 1, started_at = ?1,
             finished_at = NULL, updated_at = ?1
         WHERE id = (
             SELECT j.id FROM world_generation_jobs j
             JOIN worlds w ON w.id = j.world_id
             WHERE j.status = 'WAITING' AND w.deleted_at IS NULL
             ORDER BY j.world_id, j.sequence
             LIMIT 1
         )
         AND status = 'WAITING'
         AND NOT EXISTS (SELECT 1 FROM world_generation_jobs WHERE status = 'RUNNING')
         RETURNING {COLUMNS}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([format_time(&now)])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_job(row)?)),
        None => Ok(None),
    }
}

/// `RUNNING` → `SUCCEEDED`. Fails with `Conflict` when the job no longer
/// holds its lease.
#[instrument(skip(conn), fields(job_id = %id))]
pub fn mark_succeeded(conn: &Connection, id: &JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE world_generation_jobs
         SET status = 'SUCCEEDED', last_error = NULL, finished_at = ?2, updated_at = ?2
         WHERE id = ?1 AND status = 'RUNNING'",
        params![id.as_str(), format_time(&now)],
    )?;
    ensure_leased(conn, id, changed)
}

/// `RUNNING` → `FAILED` with a message.
#[instrument(skip(conn, error), fields(job_id = %id))]
pub fn mark_failed(
    conn: &Connection,
    id: &JobId,
    error: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE world_generation_jobs
         SET status = 'FAILED', last_error = ?2, finished_at = ?3, updated_at = ?3
         WHERE id = ?1 AND status = 'RUNNING'",
        params![id.as_str(), error, format_time(&now)],
    )?;
    ensure_leased(conn, id, changed)
}

/// Back to `WAITING` with error and timestamps cleared. `attempts` is kept.
/// A job that is currently `RUNNING` is left alone and reported as `Conflict`.
#[instrument(skip(conn), fields(job_id = %id))]
pub fn reset_for_retry(conn: &Connection, id: &JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE world_generation_jobs
         SET status = 'WAITING', last_error = NULL, started_at = NULL, finished_at = NULL,
             updated_at = ?2
         WHERE id = ?1 AND status <> 'RUNNING'",
        params![id.as_str(), format_time(&now)],
    )?;
    if changed == 0 {
        // Distinguish a leased job from a missing one.
        get(conn, id)?;
        return Err(StoreError::Conflict(format!("job {id} is running")));
    }
    Ok(())
}

/// Number of jobs of the world still `WAITING` or `RUNNING`.
pub fn count_outstanding(conn: &Connection, world_id: &WorldId) -> Result<u32, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM world_generation_jobs
         WHERE world_id = ?1 AND status IN ('WAITING', 'RUNNING')",
        [world_id.as_str()],
        |row| row.get(0),
    )?)
}

/// The job currently holding the global lease, if any.
pub fn running(conn: &Connection) -> Result<Option<GenerationJob>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM world_generation_jobs WHERE status = 'RUNNING' LIMIT 1");
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_row([], |row| Ok(row_to_job(row)))
        .optional()?
        .transpose()
}

pub fn running_for_world(
    conn: &Connection,
    world_id: &WorldId,
) -> Result<Option<GenerationJob>, StoreError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM world_generation_jobs WHERE world_id = ?1 AND status = 'RUNNING' LIMIT 1"
    );
    Ok(collect(conn, &sql, params![world_id.as_str()])?.into_iter().next())
}

/// `RUNNING` jobs whose lease began before `cutoff`.
pub fn running_since_before(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<GenerationJob>, StoreError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM world_generation_jobs
         WHERE status = 'RUNNING' AND started_at < ?1
         ORDER BY started_at"
    );
    collect(conn, &sql, params![format_time(&cutoff)])
}

fn ensure_leased(conn: &Connection, id: &JobId, changed: usize) -> Result<(), StoreError> {
    if changed == 0 {
        get(conn, id)?;
        return Err(StoreError::Conflict(format!("job {id} is not running")));
    }
    Ok(())
}

fn collect(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<GenerationJob>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_job(row)?);
    }
    Ok(out)
}

fn row_to_job(row: &rusqlite::Row<'_>) -> Result<GenerationJob, StoreError> {
    const T: &str = "world_generation_jobs";
    let job_type: String = row_helpers::get(row, 4, T, "job_type")?;
    let status: String = row_helpers::get(row, 5, T, "status")?;

    Ok(GenerationJob {
        id: JobId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        world_id: WorldId::from_raw(row_helpers::get::<String>(row, 1, T, "world_id")?),
        module_key: row_helpers::get(row, 2, T, "module_key")?,
        sequence: row_helpers::get(row, 3, T, "sequence")?,
        job_type: row_helpers::parse_enum(&job_type, T, "job_type")?,
        status: row_helpers::parse_enum(&status, T, "status")?,
        attempts: row_helpers::get(row, 6, T, "attempts")?,
        last_error: row_helpers::get_opt(row, 7, T, "last_error")?,
        started_at: row_helpers::get_time_opt(row, 8, T, "started_at")?,
        finished_at: row_helpers::get_time_opt(row, 9, T, "finished_at")?,
        created_at: row_helpers::get_time(row, 10, T, "created_at")?,
        updated_at: row_helpers::get_time(row, 11, T, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ids::OwnerId;
    use crate::schema::job::JobStatus;
    use crate::schema::world::World;
    use crate::store::{worlds, Database};
    use chrono::Duration;

    fn world(db: &Database) -> WorldId {
        let world = World::new(OwnerId::new("u1"), "Aster");
        db.with_conn(|conn| worlds::insert(conn, &world)).unwrap();
        world.id
    }

    fn queue(db: &Database, world_id: &WorldId, keys: &[&str]) -> Vec<GenerationJob> {
        let jobs: Vec<_> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| GenerationJob::waiting(world_id.clone(), *k, i as u32 + 1))
            .collect();
        db.with_conn(|conn| replace_for_world(conn, world_id, &jobs))
            .unwrap();
        jobs
    }

    #[test]
    fn replace_drops_previous_cycle() {
        let db = Database::in_memory().unwrap();
        let w = world(&db);
        queue(&db, &w, &["geography", "society"]);
        queue(&db, &w, &["history"]);

        let jobs = db.with_conn(|conn| list_for_world(conn, &w)).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].module_key, "history");
        assert_eq!(jobs[0].sequence, 1);
    }

    #[test]
    fn lease_takes_lowest_sequence_and_counts_attempt() {
        let db = Database::in_memory().unwrap();
        let w = world(&db);
        queue(&db, &w, &["geography", "society"]);

        let leased = db
            .with_conn(|conn| lease_next(conn, Utc::now()))
            .unwrap()
            .unwrap();
        assert_eq!(leased.module_key, "geography");
        assert_eq!(leased.status, JobStatus::Running);
        assert_eq!(leased.attempts, 1);
        assert!(leased.started_at.is_some());
    }

    #[test]
    fn only_one_job_runs_at_a_time() {
        let db = Database::in_memory().unwrap();
        let a = world(&db);
        let b = world(&db);
        queue(&db, &a, &["geography"]);
        queue(&db, &b, &["geography"]);

        let first = db.with_conn(|conn| lease_next(conn, Utc::now())).unwrap();
        assert!(first.is_some());
        let second = db.with_conn(|conn| lease_next(conn, Utc::now())).unwrap();
        assert!(second.is_none());

        let first = first.unwrap();
        db.with_conn(|conn| mark_succeeded(conn, &first.id, Utc::now()))
            .unwrap();
        let third = db
            .with_conn(|conn| lease_next(conn, Utc::now()))
            .unwrap()
            .unwrap();
        assert_ne!(third.world_id, first.world_id);
    }

    #[test]
    fn empty_queue_leases_nothing() {
        let db = Database::in_memory().unwrap();
        assert!(db.with_conn(|conn| lease_next(conn, Utc::now())).unwrap().is_none());
    }

    #[test]
    fn deleted_world_jobs_are_skipped() {
        let db = Database::in_memory().unwrap();
        let w = world(&db);
        queue(&db, &w, &["geography"]);
        db.with_conn(|conn| worlds::soft_delete(conn, &w, Utc::now()))
            .unwrap();
        assert!(db.with_conn(|conn| lease_next(conn, Utc::now())).unwrap().is_none());
    }

    #[test]
    fn failed_job_is_not_released() {
        let db = Database::in_memory().unwrap();
        let w = world(&db);
        queue(&db, &w, &["geography"]);

        let job = db.with_conn(|conn| lease_next(conn, Utc::now())).unwrap().unwrap();
        db.with_conn(|conn| mark_failed(conn, &job.id, "boom", Utc::now()))
            .unwrap();

        let stored = db.with_conn(|conn| get(conn, &job.id)).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert!(stored.finished_at.is_some());
        assert!(db.with_conn(|conn| lease_next(conn, Utc::now())).unwrap().is_none());
        assert_eq!(db.with_conn(|conn| count_outstanding(conn, &w)).unwrap(), 0);
    }

    #[test]
    fn completion_requires_lease() {
        let db = Database::in_memory().unwrap();
        let w = world(&db);
        let jobs = queue(&db, &w, &["geography"]);
        let err = db
            .with_conn(|conn| mark_succeeded(conn, &jobs[0].id, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = db
            .with_conn(|conn| mark_failed(conn, &JobId::new(), "x", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn retry_resets_but_keeps_attempts() {
        let db = Database::in_memory().unwrap();
        let w = world(&db);
        queue(&db, &w, &["geography"]);
        let job = db.with_conn(|conn| lease_next(conn, Utc::now())).unwrap().unwrap();

        let err = db
            .with_conn(|conn| reset_for_retry(conn, &job.id, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        db.with_conn(|conn| mark_failed(conn, &job.id, "boom", Utc::now()))
            .unwrap();
        db.with_conn(|conn| reset_for_retry(conn, &job.id, Utc::now()))
            .unwrap();

        let stored = db.with_conn(|conn| get(conn, &job.id)).unwrap();
        assert_eq!(stored.status, JobStatus::Waiting);
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_error.is_none());
        assert!(stored.started_at.is_none());
        assert!(stored.finished_at.is_none());

        let again = db.with_conn(|conn| lease_next(conn, Utc::now())).unwrap().unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn stale_running_jobs_by_cutoff() {
        let db = Database::in_memory().unwrap();
        let w = world(&db);
        queue(&db, &w, &["geography"]);
        let started = Utc::now() - Duration::minutes(30);
        let job = db.with_conn(|conn| lease_next(conn, started)).unwrap().unwrap();

        let running_now = db.with_conn(running).unwrap().unwrap();
        assert_eq!(running_now.id, job.id);
        let in_world = db.with_conn(|conn| running_for_world(conn, &w)).unwrap().unwrap();
        assert_eq!(in_world.id, job.id);
        let other = world(&db);
        assert!(db.with_conn(|conn| running_for_world(conn, &other)).unwrap().is_none());

        let stale = db
            .with_conn(|conn| running_since_before(conn, Utc::now() - Duration::minutes(10)))
            .unwrap();
        assert_eq!(stale.len(), 1);
        let fresh = db
            .with_conn(|conn| running_since_before(conn, Utc::now() - Duration::hours(1)))
            .unwrap();
        assert!(fresh.is_empty());
    }
}
