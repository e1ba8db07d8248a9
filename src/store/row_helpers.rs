use chrono::{DateTime, SecondsFormat, Utc};

use crate::store::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON text column into `T`, returning CorruptRow on parse failure.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Required RFC 3339 timestamp column.
pub fn get_time(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    let raw: String = get(row, idx, table, column)?;
    parse_time(&raw, table, column)
}

/// Optional RFC 3339 timestamp column.
pub fn get_time_opt(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    get_opt::<String>(row, idx, table, column)?
        .map(|raw| parse_time(&raw, table, column))
        .transpose()
}

pub fn parse_time(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw:?}: {e}"),
        })
}

/// Storage form of a timestamp: fixed-width UTC, so text order is time order.
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::job::JobStatus;

    #[test]
    fn parse_enum_success() {
        let result: Result<JobStatus, _> = parse_enum("RUNNING", "world_generation_jobs", "status");
        assert_eq!(result.unwrap(), JobStatus::Running);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<JobStatus, _> = parse_enum("running", "world_generation_jobs", "status");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "world_generation_jobs", column: "status", .. })
        ));
    }

    #[test]
    fn parse_json_failure() {
        let result: Result<Vec<String>, _> = parse_json("not valid json", "worlds", "themes");
        assert!(matches!(result, Err(StoreError::CorruptRow { table: "worlds", column: "themes", .. })));
    }

    #[test]
    fn time_round_trip_is_exact() {
        let t = DateTime::parse_from_rfc3339("2026-03-01T12:30:45.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let raw = format_time(&t);
        assert_eq!(raw, "2026-03-01T12:30:45.123456000Z");
        assert_eq!(parse_time(&raw, "worlds", "created_at").unwrap(), t);
    }

    #[test]
    fn bad_time_is_corrupt_row() {
        assert!(matches!(
            parse_time("yesterday", "worlds", "published_at"),
            Err(StoreError::CorruptRow { column: "published_at", .. })
        ));
    }
}
