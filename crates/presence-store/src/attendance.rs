use crate::{from_micros, to_micros, to_sql_int, Store, StoreError};
use chrono::{DateTime, Utc};
use presence_core::{AttendanceEvent, AttendanceRecord, EventKind, Stats};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;

/// Roles always present in the stats breakdown, even with no members.
const REPORTED_ROLES: [&str; 3] = ["admin", "manager", "employee"];

fn parse_kind(raw: &str) -> Result<EventKind, StoreError> {
    match raw {
        "IN" => Ok(EventKind::Entry),
        "OUT" => Ok(EventKind::Exit),
        other => Err(StoreError::InvalidDbValue(format!(
            "unknown attendance kind {other:?}"
        ))),
    }
}

fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<u64, StoreError> {
    let n: i64 = conn.query_row(sql, params, |row| row.get(0))?;
    u64::try_from(n).map_err(|_| StoreError::InvalidDbValue(format!("negative count {n}")))
}

fn grouped(conn: &Connection, column: &str) -> Result<BTreeMap<String, u64>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {column}, COUNT(*) FROM identities GROUP BY {column}"
    ))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows
        .into_iter()
        .map(|(k, n)| (k, n.max(0) as u64))
        .collect())
}

impl Store {
    /// Append one attendance event for an enrolled identity.
    ///
    /// The existence check, timestamp assignment and insert run in a single
    /// transaction: an identity deleted concurrently yields
    /// [`StoreError::NotFound`], never an orphan event. Timestamps never go
    /// backwards relative to the newest stored event.
    pub async fn record(
        &self,
        identity_id: &str,
        kind: EventKind,
    ) -> Result<AttendanceEvent, StoreError> {
        let identity_id = identity_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM identities WHERE id = ?1)",
                [&identity_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound(identity_id));
            }

            let newest: Option<i64> =
                tx.query_row("SELECT MAX(recorded_at_us) FROM attendance", [], |row| {
                    row.get(0)
                })?;
            let now = to_micros(Utc::now());
            let recorded_at_us = newest.map_or(now, |n| n.max(now));

            let event = AttendanceEvent {
                id: uuid::Uuid::new_v4().to_string(),
                identity_id,
                kind,
                timestamp: from_micros(recorded_at_us)?,
            };
            tx.execute(
                "INSERT INTO attendance (id, identity_id, kind, recorded_at_us)
                 VALUES (?1, ?2, ?3, ?4)",
                params![event.id, event.identity_id, kind.as_str(), recorded_at_us],
            )?;
            tx.commit()?;

            tracing::debug!(id = %event.id, identity = %event.identity_id, %kind, "attendance recorded");
            Ok(event)
        })
        .await
    }

    /// Attendance events, newest first, enriched with the identity's name and
    /// department when the identity still exists.
    pub async fn list_attendance(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT a.id, a.identity_id, a.kind, a.recorded_at_us, i.display_name, i.department
                 FROM attendance a
                 LEFT JOIN identities i ON i.id = a.identity_id
                 ORDER BY a.recorded_at_us DESC, a.seq DESC
                 LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt
                .query_map(params![to_sql_int(limit), to_sql_int(offset)], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(id, identity_id, kind, at, display_name, department)| {
                    Ok(AttendanceRecord {
                        event: AttendanceEvent {
                            id,
                            identity_id,
                            kind: parse_kind(&kind)?,
                            timestamp: from_micros(at)?,
                        },
                        display_name,
                        department,
                    })
                })
                .collect()
        })
        .await
    }

    /// Gallery and attendance counters. "Today" is the UTC day containing `now`.
    pub async fn stats(&self, now: DateTime<Utc>) -> Result<Stats, StoreError> {
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| to_micros(t.and_utc()))
            .ok_or_else(|| StoreError::InvalidDbValue("invalid day start".into()))?;

        self.with_conn(move |conn| {
            let mut identities_by_role = grouped(conn, "role")?;
            for role in REPORTED_ROLES {
                identities_by_role.entry(role.to_string()).or_insert(0);
            }
            Ok(Stats {
                total_identities: count(conn, "SELECT COUNT(*) FROM identities", [])?,
                total_events: count(conn, "SELECT COUNT(*) FROM attendance", [])?,
                events_today: count(
                    conn,
                    "SELECT COUNT(*) FROM attendance WHERE recorded_at_us >= ?1",
                    [day_start],
                )?,
                identities_by_role,
                identities_by_department: grouped(conn, "department")?,
            })
        })
        .await
    }
}
