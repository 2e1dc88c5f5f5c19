//! `SQLite` backend for harvest state.
//!
//! Provides persistent storage with:
//! - Write-Ahead Logging (WAL) for concurrent access from several processes
//! - `BEGIN IMMEDIATE` transactions for every coordinating update
//! - Automatic schema migration on open
//!
//! # Example
//!
//! ```rust,ignore
//! use usage_harvest::store::SqliteStore;
//!
//! let store = SqliteStore::open("./data/harvest.db").await?;
//! let claim = store.claim_next("https://sushi.example.com", &token, now).await?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tokio::task;

use super::{
    Claim, Completed, Completion, HarvestStore, ReconcileCounts, ReconcilePlan, AUTOMATIC_ACTOR,
};
use crate::config::SchedulerDefaults;
use crate::error::{HarvestError, Result};
use crate::model::{
    Automatic, AutomaticId, Credential, CredentialId, CredentialReport, ErrorCode,
    FetchIntention, Harvest, HarvestId, IntentionId, IntentionStatus, NewIntention,
    OrganizationId, Priority, ReportType, ReportTypeId, RequestKey, RetryCounters, Scheduler,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS report_types (
    id INTEGER PRIMARY KEY,
    code TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS credentials (
    id INTEGER PRIMARY KEY,
    organization_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    broken INTEGER NOT NULL,
    params TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_credentials_url ON credentials(url);

CREATE TABLE IF NOT EXISTS credential_reports (
    credential_id INTEGER NOT NULL,
    report_type_id INTEGER NOT NULL,
    enabled INTEGER NOT NULL,
    broken INTEGER NOT NULL,
    PRIMARY KEY (credential_id, report_type_id)
);

CREATE TABLE IF NOT EXISTS harvests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created INTEGER NOT NULL,
    last_updated INTEGER NOT NULL,
    last_updated_by TEXT,
    automatic_id INTEGER
);

CREATE TABLE IF NOT EXISTS automatics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    month TEXT NOT NULL,
    organization_id INTEGER NOT NULL,
    harvest_id INTEGER NOT NULL,
    UNIQUE (month, organization_id)
);

CREATE TABLE IF NOT EXISTS schedulers (
    url TEXT PRIMARY KEY,
    when_ready INTEGER NOT NULL,
    cooldown_ms INTEGER NOT NULL,
    too_many_requests_delay_ms INTEGER NOT NULL,
    service_not_available_delay_ms INTEGER NOT NULL,
    service_busy_delay_ms INTEGER NOT NULL,
    current_intention INTEGER,
    current_worker_token TEXT,
    current_start INTEGER
);

CREATE TABLE IF NOT EXISTS fetch_intentions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    harvest_id INTEGER NOT NULL,
    credential_id INTEGER NOT NULL,
    report_type_id INTEGER NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    not_before INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    scheduler TEXT,
    when_processed INTEGER,
    status TEXT NOT NULL DEFAULT 'planned',
    error_code TEXT,
    attempt_id BLOB,
    data_not_ready_retry INTEGER NOT NULL DEFAULT 0,
    service_not_available_retry INTEGER NOT NULL DEFAULT 0,
    service_busy_retry INTEGER NOT NULL DEFAULT 0,
    retry_id INTEGER,
    duplicate_of INTEGER,
    CHECK (start_date < end_date)
);
CREATE INDEX IF NOT EXISTS idx_fetch_intentions_harvest ON fetch_intentions(harvest_id);
CREATE INDEX IF NOT EXISTS idx_fetch_intentions_pending
    ON fetch_intentions(when_processed, scheduler, not_before);
CREATE INDEX IF NOT EXISTS idx_fetch_intentions_request
    ON fetch_intentions(credential_id, report_type_id, start_date, end_date);
";

const INTENTION_COLUMNS: &str = "fi.id, fi.harvest_id, fi.credential_id, fi.report_type_id, \
     fi.start_date, fi.end_date, fi.not_before, fi.priority, fi.scheduler, fi.when_processed, \
     fi.status, fi.error_code, fi.attempt_id, fi.data_not_ready_retry, \
     fi.service_not_available_retry, fi.service_busy_retry, fi.retry_id, fi.duplicate_of";

const SCHEDULER_COLUMNS: &str = "url, when_ready, cooldown_ms, too_many_requests_delay_ms, \
     service_not_available_delay_ms, service_busy_delay_ms, current_intention, \
     current_worker_token, current_start";

/// Joins and predicates selecting intentions a worker could start.
///
/// Binds `?1` to the current time in milliseconds.
const RUNNABLE: &str = "FROM fetch_intentions fi
    JOIN credentials c ON c.id = fi.credential_id
    LEFT JOIN credential_reports cr
        ON cr.credential_id = fi.credential_id AND cr.report_type_id = fi.report_type_id
    WHERE fi.when_processed IS NULL
      AND fi.scheduler IS NULL
      AND fi.duplicate_of IS NULL
      AND fi.not_before <= ?1
      AND c.broken = 0
      AND COALESCE(cr.broken, 0) = 0";

/// `SQLite`-based [`HarvestStore`].
///
/// # Thread Safety
///
/// Each operation opens its own connection on the blocking thread pool, so
/// the store holds no shared state. Several processes may open the same
/// file; WAL mode and immediate transactions serialize writers.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    /// Path to the `SQLite` database file.
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (and migrate) the database at `path`.
    ///
    /// The path must name a file; every operation opens a fresh connection,
    /// so a private `:memory:` database would not survive between calls.
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let store = Self {
            db_path: path.into(),
        };
        store
            .with_conn(|conn| {
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(store)
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || {
            let mut conn = Connection::open(&db_path)?;
            conn.busy_timeout(StdDuration::from_secs(5))?;
            op(&mut conn)
        })
        .await?
    }

    /// Run `op` inside a `BEGIN IMMEDIATE` transaction, committing on success.
    async fn with_tx<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = op(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| {
        DateTime::from_timestamp_millis(ms)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
    })
    .transpose()
}

fn duration_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Duration> {
    let ms: i64 = row.get(idx)?;
    Ok(Duration::milliseconds(ms))
}

impl FromSql for IntentionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err: HarvestError| FromSqlError::Other(Box::new(err)))
    }
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    let params: String = row.get(5)?;
    Ok(Credential {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        url: row.get(2)?,
        enabled: row.get(3)?,
        broken: row.get(4)?,
        params: serde_json::from_str(&params).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(err))
        })?,
    })
}

fn harvest_from_row(row: &Row<'_>) -> rusqlite::Result<Harvest> {
    Ok(Harvest {
        id: row.get(0)?,
        created: time_at(row, 1)?,
        last_updated: time_at(row, 2)?,
        last_updated_by: row.get(3)?,
        automatic_id: row.get(4)?,
    })
}

fn automatic_from_row(row: &Row<'_>) -> rusqlite::Result<Automatic> {
    Ok(Automatic {
        id: row.get(0)?,
        month: row.get(1)?,
        organization_id: row.get(2)?,
        harvest_id: row.get(3)?,
    })
}

fn scheduler_from_row(row: &Row<'_>) -> rusqlite::Result<Scheduler> {
    Ok(Scheduler {
        url: row.get(0)?,
        when_ready: time_at(row, 1)?,
        cooldown: duration_at(row, 2)?,
        too_many_requests_delay: duration_at(row, 3)?,
        service_not_available_delay: duration_at(row, 4)?,
        service_busy_delay: duration_at(row, 5)?,
        current_intention: row.get(6)?,
        current_worker_token: row.get(7)?,
        current_start: opt_time_at(row, 8)?,
    })
}

fn intention_from_row(row: &Row<'_>) -> rusqlite::Result<FetchIntention> {
    Ok(FetchIntention {
        id: row.get(0)?,
        harvest_id: row.get(1)?,
        credential_id: row.get(2)?,
        report_type_id: row.get(3)?,
        start_date: row.get(4)?,
        end_date: row.get(5)?,
        not_before: time_at(row, 6)?,
        priority: Priority::from_rank(row.get(7)?),
        scheduler: row.get(8)?,
        when_processed: opt_time_at(row, 9)?,
        status: row.get(10)?,
        error_code: row.get::<_, Option<String>>(11)?.map(ErrorCode),
        attempt_id: row.get(12)?,
        retry: RetryCounters {
            data_not_ready: row.get(13)?,
            service_not_available: row.get(14)?,
            service_busy: row.get(15)?,
        },
        retry_id: row.get(16)?,
        duplicate_of: row.get(17)?,
    })
}

fn load_intention(conn: &Connection, id: IntentionId) -> Result<Option<FetchIntention>> {
    Ok(conn
        .query_row(
            &format!("SELECT {INTENTION_COLUMNS} FROM fetch_intentions fi WHERE fi.id = ?1"),
            params![id],
            intention_from_row,
        )
        .optional()?)
}

fn load_scheduler(conn: &Connection, url: &str) -> Result<Option<Scheduler>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SCHEDULER_COLUMNS} FROM schedulers WHERE url = ?1"),
            params![url],
            scheduler_from_row,
        )
        .optional()?)
}

fn require_scheduler(conn: &Connection, url: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM schedulers WHERE url = ?1)",
        params![url],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(HarvestError::not_found("scheduler", url))
    }
}

fn require_intention(conn: &Connection, id: IntentionId) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM fetch_intentions WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(HarvestError::not_found("intention", id))
    }
}

/// Point unprocessed siblings of `of` at it; unclaimed ones are finalized.
fn collapse_duplicates(
    conn: &Connection,
    of: IntentionId,
    key: &RequestKey,
    now: DateTime<Utc>,
) -> Result<usize> {
    Ok(conn.execute(
        r"
        UPDATE fetch_intentions
        SET duplicate_of = ?1,
            when_processed = CASE WHEN scheduler IS NULL THEN ?6 ELSE NULL END,
            status = CASE WHEN scheduler IS NULL THEN 'duplicate' ELSE status END
        WHERE id != ?1
          AND when_processed IS NULL
          AND duplicate_of IS NULL
          AND credential_id = ?2
          AND report_type_id = ?3
          AND start_date = ?4
          AND end_date = ?5
        ",
        params![
            of,
            key.credential_id,
            key.report_type_id,
            key.start_date,
            key.end_date,
            millis(now),
        ],
    )?)
}

fn insert_harvest(
    conn: &Connection,
    actor: Option<&str>,
    now: DateTime<Utc>,
) -> Result<HarvestId> {
    conn.execute(
        "INSERT INTO harvests (created, last_updated, last_updated_by) VALUES (?1, ?1, ?2)",
        params![millis(now), actor],
    )?;
    Ok(HarvestId(conn.last_insert_rowid()))
}

fn load_harvest(conn: &Connection, id: HarvestId) -> Result<Option<Harvest>> {
    Ok(conn
        .query_row(
            "SELECT id, created, last_updated, last_updated_by, automatic_id
             FROM harvests WHERE id = ?1",
            params![id],
            harvest_from_row,
        )
        .optional()?)
}

fn load_automatic(
    conn: &Connection,
    month: NaiveDate,
    organization_id: OrganizationId,
) -> Result<Option<Automatic>> {
    Ok(conn
        .query_row(
            "SELECT id, month, organization_id, harvest_id
             FROM automatics WHERE month = ?1 AND organization_id = ?2",
            params![month, organization_id],
            automatic_from_row,
        )
        .optional()?)
}

#[async_trait]
impl HarvestStore for SqliteStore {
    async fn put_credential(&self, credential: Credential) -> Result<()> {
        let params_json = serde_json::to_string(&credential.params)?;
        self.with_conn(move |conn| {
            conn.execute(
                r"
                INSERT INTO credentials (id, organization_id, url, enabled, broken, params)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT (id) DO UPDATE SET
                    organization_id = excluded.organization_id,
                    url = excluded.url,
                    enabled = excluded.enabled,
                    broken = excluded.broken,
                    params = excluded.params
                ",
                params![
                    credential.id,
                    credential.organization_id,
                    credential.url,
                    credential.enabled,
                    credential.broken,
                    params_json,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn credential(&self, id: CredentialId) -> Result<Option<Credential>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, organization_id, url, enabled, broken, params
                     FROM credentials WHERE id = ?1",
                    params![id],
                    credential_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn credentials(&self) -> Result<Vec<Credential>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, organization_id, url, enabled, broken, params
                 FROM credentials ORDER BY id",
            )?;
            let rows = stmt.query_map([], credential_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn put_report_type(&self, report_type: ReportType) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO report_types (id, code) VALUES (?1, ?2)
                 ON CONFLICT (id) DO UPDATE SET code = excluded.code",
                params![report_type.id, report_type.code],
            )?;
            Ok(())
        })
        .await
    }

    async fn report_type(&self, id: ReportTypeId) -> Result<Option<ReportType>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, code FROM report_types WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(ReportType {
                            id: row.get(0)?,
                            code: row.get(1)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn put_credential_report(&self, mapping: CredentialReport) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                r"
                INSERT INTO credential_reports (credential_id, report_type_id, enabled, broken)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (credential_id, report_type_id) DO UPDATE SET
                    enabled = excluded.enabled,
                    broken = excluded.broken
                ",
                params![
                    mapping.credential_id,
                    mapping.report_type_id,
                    mapping.enabled,
                    mapping.broken,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn credential_report(
        &self,
        credential_id: CredentialId,
        report_type_id: ReportTypeId,
    ) -> Result<Option<CredentialReport>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT credential_id, report_type_id, enabled, broken
                     FROM credential_reports WHERE credential_id = ?1 AND report_type_id = ?2",
                    params![credential_id, report_type_id],
                    |row| {
                        Ok(CredentialReport {
                            credential_id: row.get(0)?,
                            report_type_id: row.get(1)?,
                            enabled: row.get(2)?,
                            broken: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn credential_reports(&self) -> Result<Vec<CredentialReport>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT credential_id, report_type_id, enabled, broken
                 FROM credential_reports ORDER BY credential_id, report_type_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(CredentialReport {
                    credential_id: row.get(0)?,
                    report_type_id: row.get(1)?,
                    enabled: row.get(2)?,
                    broken: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn plan_harvest(
        &self,
        existing: Option<HarvestId>,
        actor: Option<&str>,
        intentions: Vec<NewIntention>,
        now: DateTime<Utc>,
    ) -> Result<(Harvest, Vec<FetchIntention>)> {
        let actor = actor.map(str::to_string);
        self.with_tx(move |conn| {
            let harvest_id = match existing {
                Some(id) => {
                    let updated = conn.execute(
                        "UPDATE harvests SET last_updated = ?2, last_updated_by = ?3 WHERE id = ?1",
                        params![id, millis(now), actor],
                    )?;
                    if updated == 0 {
                        return Err(HarvestError::not_found("harvest", id));
                    }
                    id
                }
                None => insert_harvest(conn, actor.as_deref(), now)?,
            };

            let mut created = Vec::with_capacity(intentions.len());
            for new in &intentions {
                let id = insert_intention(conn, harvest_id, new, now)?;
                created.push(
                    load_intention(conn, id)?
                        .ok_or_else(|| HarvestError::not_found("intention", id))?,
                );
            }
            let harvest = load_harvest(conn, harvest_id)?
                .ok_or_else(|| HarvestError::not_found("harvest", harvest_id))?;
            Ok((harvest, created))
        })
        .await
    }

    async fn harvest(&self, id: HarvestId) -> Result<Option<Harvest>> {
        self.with_conn(move |conn| load_harvest(conn, id)).await
    }

    async fn delete_harvest(&self, id: HarvestId) -> Result<usize> {
        self.with_tx(move |conn| {
            if conn.execute("DELETE FROM harvests WHERE id = ?1", params![id])? == 0 {
                return Err(HarvestError::not_found("harvest", id));
            }
            Ok(conn.execute(
                "DELETE FROM fetch_intentions WHERE harvest_id = ?1",
                params![id],
            )?)
        })
        .await
    }

    async fn intention(&self, id: IntentionId) -> Result<Option<FetchIntention>> {
        self.with_conn(move |conn| load_intention(conn, id)).await
    }

    async fn harvest_intentions(&self, harvest_id: HarvestId) -> Result<Vec<FetchIntention>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INTENTION_COLUMNS} FROM fetch_intentions fi
                 WHERE fi.harvest_id = ?1 ORDER BY fi.id"
            ))?;
            let rows = stmt.query_map(params![harvest_id], intention_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn complete_intention(
        &self,
        id: IntentionId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Completed> {
        self.with_tx(move |conn| {
            let outcome = &completion.outcome;
            let updated = conn.execute(
                r"
                UPDATE fetch_intentions
                SET when_processed = ?2, status = ?3, error_code = ?4, attempt_id = ?5
                WHERE id = ?1 AND when_processed IS NULL
                ",
                params![
                    id,
                    millis(now),
                    outcome.status.as_str(),
                    outcome.error_code.as_ref().map(ErrorCode::as_str),
                    outcome.attempt_id,
                ],
            )?;
            if updated == 0 {
                require_intention(conn, id)?;
                return Ok(Completed::AlreadyProcessed);
            }
            let current =
                load_intention(conn, id)?.ok_or_else(|| HarvestError::not_found("intention", id))?;

            if let Some((url, until)) = &completion.throttle {
                let updated = conn.execute(
                    "UPDATE schedulers SET when_ready = MAX(when_ready, ?2) WHERE url = ?1",
                    params![url, millis(*until)],
                )?;
                if updated == 0 {
                    return Err(HarvestError::not_found("scheduler", url));
                }
            }

            let successor = match &completion.successor {
                Some(new) => {
                    conn.execute(
                        "UPDATE fetch_intentions SET retry_id = COALESCE(retry_id, ?2) WHERE id = ?1",
                        params![id, new.retry_id],
                    )?;
                    Some(insert_intention(conn, current.harvest_id, new, now)?)
                }
                None => None,
            };
            let duplicates = if completion.collapse_duplicates {
                collapse_duplicates(conn, id, &current.request_key(), now)?
            } else {
                0
            };
            Ok(Completed::Recorded {
                successor,
                duplicates,
            })
        })
        .await
    }

    async fn ensure_scheduler(&self, url: &str, defaults: &SchedulerDefaults) -> Result<Scheduler> {
        let url = url.to_string();
        let defaults = *defaults;
        self.with_tx(move |conn| {
            let fresh = Scheduler::new(url.as_str(), &defaults);
            conn.execute(
                r"
                INSERT OR IGNORE INTO schedulers (
                    url, when_ready, cooldown_ms, too_many_requests_delay_ms,
                    service_not_available_delay_ms, service_busy_delay_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    fresh.url,
                    millis(fresh.when_ready),
                    fresh.cooldown.num_milliseconds(),
                    fresh.too_many_requests_delay.num_milliseconds(),
                    fresh.service_not_available_delay.num_milliseconds(),
                    fresh.service_busy_delay.num_milliseconds(),
                ],
            )?;
            load_scheduler(conn, &url)?.ok_or_else(|| HarvestError::not_found("scheduler", url))
        })
        .await
    }

    async fn scheduler(&self, url: &str) -> Result<Option<Scheduler>> {
        let url = url.to_string();
        self.with_conn(move |conn| load_scheduler(conn, &url)).await
    }

    async fn set_when_ready(&self, url: &str, until: DateTime<Utc>) -> Result<()> {
        let url = url.to_string();
        self.with_tx(move |conn| {
            let updated = conn.execute(
                "UPDATE schedulers SET when_ready = MAX(when_ready, ?2) WHERE url = ?1",
                params![url, millis(until)],
            )?;
            if updated == 0 {
                return Err(HarvestError::not_found("scheduler", url));
            }
            Ok(())
        })
        .await
    }

    async fn last_request_at(&self, url: &str) -> Result<Option<DateTime<Utc>>> {
        let url = url.to_string();
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT MAX(when_processed) FROM fetch_intentions
                 WHERE scheduler = ?1 AND status IN ('success', 'error')",
                params![url],
                |row| opt_time_at(row, 0),
            )?)
        })
        .await
    }

    async fn claim_next(
        &self,
        url: &str,
        worker_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Claim> {
        let url = url.to_string();
        let worker_token = worker_token.to_string();
        self.with_tx(move |conn| {
            let scheduler = load_scheduler(conn, &url)?
                .ok_or_else(|| HarvestError::not_found("scheduler", url.as_str()))?;
            if scheduler.is_occupied() {
                return Ok(Claim::Busy);
            }

            let candidate: Option<(IntentionId, i64)> = conn
                .query_row(
                    &format!(
                        "SELECT fi.id, fi.priority {RUNNABLE} AND c.url = ?2
                         ORDER BY fi.priority DESC, fi.not_before ASC, fi.id ASC
                         LIMIT 1"
                    ),
                    params![millis(now), url],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((id, rank)) = candidate else {
                return Ok(Claim::Idle);
            };
            if scheduler.when_ready > now && Priority::from_rank(rank) != Priority::Now {
                return Ok(Claim::Idle);
            }

            conn.execute(
                r"
                UPDATE schedulers
                SET current_intention = ?2, current_worker_token = ?3, current_start = ?4
                WHERE url = ?1 AND current_intention IS NULL AND current_worker_token IS NULL
                ",
                params![url, id, worker_token, millis(now)],
            )?;
            conn.execute(
                "UPDATE fetch_intentions SET scheduler = ?2 WHERE id = ?1 AND scheduler IS NULL",
                params![id, url],
            )?;
            let intention =
                load_intention(conn, id)?.ok_or_else(|| HarvestError::not_found("intention", id))?;
            Ok(Claim::Claimed(intention))
        })
        .await
    }

    async fn finish_run(
        &self,
        url: &str,
        worker_token: &str,
        ready_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let url = url.to_string();
        let worker_token = worker_token.to_string();
        self.with_tx(move |conn| {
            let updated = conn.execute(
                r"
                UPDATE schedulers
                SET when_ready = CASE WHEN ?3 IS NULL THEN when_ready ELSE MAX(when_ready, ?3) END,
                    current_intention = NULL,
                    current_worker_token = NULL,
                    current_start = NULL
                WHERE url = ?1 AND current_worker_token = ?2
                ",
                params![url, worker_token, ready_at.map(millis)],
            )?;
            if updated == 0 {
                require_scheduler(conn, &url)?;
            }
            Ok(updated == 1)
        })
        .await
    }

    async fn occupied_schedulers(&self) -> Result<Vec<Scheduler>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULER_COLUMNS} FROM schedulers
                 WHERE current_intention IS NOT NULL OR current_worker_token IS NOT NULL
                 ORDER BY url"
            ))?;
            let rows = stmt.query_map([], scheduler_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn unassign(
        &self,
        url: &str,
        worker_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IntentionId>> {
        let url = url.to_string();
        let worker_token = worker_token.to_string();
        self.with_tx(move |conn| {
            let held: Option<Option<IntentionId>> = conn
                .query_row(
                    "SELECT current_intention FROM schedulers
                     WHERE url = ?1 AND current_worker_token = ?2",
                    params![url, worker_token],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(held) = held else {
                require_scheduler(conn, &url)?;
                return Ok(None);
            };

            if let Some(id) = held {
                conn.execute(
                    r"
                    UPDATE fetch_intentions
                    SET scheduler = NULL, not_before = MAX(not_before, ?2)
                    WHERE id = ?1 AND when_processed IS NULL
                    ",
                    params![id, millis(now)],
                )?;
            }
            conn.execute(
                r"
                UPDATE schedulers
                SET current_intention = NULL, current_worker_token = NULL, current_start = NULL
                WHERE url = ?1
                ",
                params![url],
            )?;
            Ok(held)
        })
        .await
    }

    async fn due_endpoints(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT due.url
                 FROM (SELECT c.url AS url, fi.priority AS priority {RUNNABLE}) AS due
                 LEFT JOIN schedulers s ON s.url = due.url
                 WHERE s.url IS NULL OR s.when_ready <= ?1 OR due.priority > 0
                 ORDER BY due.url"
            ))?;
            let rows = stmt.query_map(params![millis(now)], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
        })
        .await
    }

    async fn automatic(
        &self,
        month: NaiveDate,
        organization_id: OrganizationId,
    ) -> Result<Option<Automatic>> {
        self.with_conn(move |conn| load_automatic(conn, month, organization_id))
            .await
    }

    async fn apply_reconciliation(
        &self,
        month: NaiveDate,
        plans: Vec<ReconcilePlan>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileCounts> {
        self.with_tx(move |conn| {
            let mut counts = ReconcileCounts::default();
            for plan in &plans {
                let harvest_id = match load_automatic(conn, month, plan.organization_id)? {
                    Some(automatic) => automatic.harvest_id,
                    None if plan.add.is_empty() => continue,
                    None => {
                        let harvest_id = insert_harvest(conn, Some(AUTOMATIC_ACTOR), now)?;
                        conn.execute(
                            "INSERT INTO automatics (month, organization_id, harvest_id)
                             VALUES (?1, ?2, ?3)",
                            params![month, plan.organization_id, harvest_id],
                        )?;
                        let automatic_id = AutomaticId(conn.last_insert_rowid());
                        conn.execute(
                            "UPDATE harvests SET automatic_id = ?2 WHERE id = ?1",
                            params![harvest_id, automatic_id],
                        )?;
                        counts.created += 1;
                        harvest_id
                    }
                };

                let mut changed = 0;
                for new in &plan.add {
                    let exists: bool = conn.query_row(
                        r"
                        SELECT EXISTS (
                            SELECT 1 FROM fetch_intentions
                            WHERE harvest_id = ?1
                              AND credential_id = ?2 AND report_type_id = ?3
                              AND start_date = ?4 AND end_date = ?5
                        )
                        ",
                        params![
                            harvest_id,
                            new.credential_id,
                            new.report_type_id,
                            new.start_date,
                            new.end_date,
                        ],
                        |row| row.get(0),
                    )?;
                    if !exists {
                        insert_intention(conn, harvest_id, new, now)?;
                        counts.added += 1;
                        changed += 1;
                    }
                }
                for id in &plan.delete {
                    let deleted = conn.execute(
                        r"
                        DELETE FROM fetch_intentions
                        WHERE id = ?1 AND harvest_id = ?2
                          AND when_processed IS NULL AND scheduler IS NULL
                        ",
                        params![id, harvest_id],
                    )?;
                    counts.deleted += deleted;
                    changed += deleted;
                }
                if changed > 0 {
                    conn.execute(
                        "UPDATE harvests SET last_updated = ?2, last_updated_by = ?3 WHERE id = ?1",
                        params![harvest_id, millis(now), AUTOMATIC_ACTOR],
                    )?;
                }
            }
            Ok(counts)
        })
        .await
    }
}
