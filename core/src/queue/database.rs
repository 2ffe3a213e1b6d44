/*!
# Database Queue

Relational backend over `sqlx::AnyPool` (PostgreSQL and SQLite).

Every queue shares one table, partitioned by the `queue` column:

| column | type | meaning |
|---|---|---|
| `job_id` | `VARCHAR(36)` | UUIDv7, so `ORDER BY job_id` follows insertion order |
| `queue` | `VARCHAR(128)` | owning queue name |
| `create_time` | `BIGINT` | epoch seconds |
| `availability_time` | `BIGINT` | epoch seconds, gates delay and back-off |
| `attempts` | `BIGINT` | consume count |
| `lock_time` | `BIGINT NULL` | epoch seconds of the current lease |
| `payload` | `TEXT` | serialized job envelope |

Leases are taken with a select followed by an update matched on every column that
was read. When another consumer won the race the update touches no row, or the
database refuses the write lock (SQLite `SQLITE_BUSY`), and the selection is retried,
at most `lock_retries` times.
*/

use super::{chrono_interval, new_job_id, JobBackend, Purgeable, Queue};
use crate::clock::{system_clock, Clock};
use crate::delay::Delay;
use crate::error::{Result, StevedoreError};
use crate::job::{Job, JobDescriptor};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default table name
pub const DEFAULT_TABLE: &str = "queue_jobs";

/// Tuning knobs for `DatabaseQueue`
#[derive(Debug, Clone)]
pub struct DatabaseQueueOptions {
    pub table: String,
    /// How long a lease holds before the row becomes eligible again
    pub retry_time: Duration,
    pub max_attempts: u32,
    /// Bound on optimistic lease attempts per `consume`
    pub lock_retries: u32,
    pub clock: Arc<dyn Clock>,
}

impl Default for DatabaseQueueOptions {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            retry_time: Duration::from_secs(30),
            max_attempts: 5,
            lock_retries: 5,
            clock: system_clock(),
        }
    }
}

struct DatabaseBackend {
    name: String,
    pool: AnyPool,
    options: DatabaseQueueOptions,
}

impl DatabaseBackend {
    fn now(&self) -> i64 {
        self.options.clock.now().timestamp()
    }

    fn stale_before(&self, now: i64) -> i64 {
        now.saturating_sub(chrono_interval(self.options.retry_time).num_seconds())
    }

    fn table(&self) -> &str {
        &self.options.table
    }
}

#[async_trait]
impl JobBackend for DatabaseBackend {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn release(&self, job: &Job, delay: Delay) -> Result<()> {
        job.ensure_unresolved()?;

        let available_at = delay.available_at(self.options.clock.now()).timestamp();
        let sql = format!(
            "UPDATE {} SET availability_time = $1, lock_time = NULL WHERE job_id = $2 AND queue = $3",
            self.table()
        );

        sqlx::query(&sql)
            .bind(available_at)
            .bind(job.id())
            .bind(self.name.as_str())
            .execute(&self.pool)
            .await?;

        debug!(job_id = %job.id(), queue = %self.name, "Job released");
        Ok(())
    }

    async fn delete(&self, job: &Job) -> Result<()> {
        job.ensure_unresolved()?;

        let sql = format!("DELETE FROM {} WHERE job_id = $1 AND queue = $2", self.table());

        sqlx::query(&sql)
            .bind(job.id())
            .bind(self.name.as_str())
            .execute(&self.pool)
            .await?;

        debug!(job_id = %job.id(), queue = %self.name, "Job deleted");
        Ok(())
    }
}

/// Outcome of one optimistic lease attempt
enum Lease {
    Won {
        job_id: String,
        attempts: i64,
        payload: String,
    },
    Empty,
    /// Another consumer updated or write-locked the row between select and update
    Lost,
}

/// Pause before selecting again after a lost lease
const LOST_LEASE_PAUSE: Duration = Duration::from_millis(5);

/// Lock contention the lease loop retries instead of surfacing.
///
/// SQLite reports a refused lock upgrade as `SQLITE_BUSY` (5) or `SQLITE_LOCKED` (6),
/// possibly as an extended code; PostgreSQL as a serialization failure or deadlock.
fn is_contention(err: &sqlx::Error) -> bool {
    let Some(db_err) = err.as_database_error() else {
        return false;
    };

    let by_code = db_err.code().is_some_and(|code| {
        match code.parse::<i64>() {
            Ok(sqlite) => matches!(sqlite & 0xff, 5 | 6),
            Err(_) => matches!(&*code, "40001" | "40P01"),
        }
    });

    by_code || db_err.message().contains("database is locked")
}

/// Queue stored in a relational table
#[derive(Clone)]
pub struct DatabaseQueue {
    inner: Arc<DatabaseBackend>,
}

impl DatabaseQueue {
    /// Create a queue on an existing pool with default options
    pub fn new(pool: AnyPool, name: impl Into<String>) -> Result<Self> {
        Self::with_options(pool, name, DatabaseQueueOptions::default())
    }

    pub fn with_options(
        pool: AnyPool,
        name: impl Into<String>,
        options: DatabaseQueueOptions,
    ) -> Result<Self> {
        validate_table_name(&options.table)?;

        Ok(Self {
            inner: Arc::new(DatabaseBackend {
                name: name.into(),
                pool,
                options,
            }),
        })
    }

    /// Open a pool for `url` and create a queue on it
    pub async fn connect(
        url: &str,
        name: impl Into<String>,
        options: DatabaseQueueOptions,
    ) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new().connect(url).await?;

        Self::with_options(pool, name, options)
    }

    /// Create the jobs table and its lookup index when missing
    pub async fn create_table(&self) -> Result<()> {
        let table = self.inner.table();

        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                job_id VARCHAR(36) NOT NULL PRIMARY KEY,
                queue VARCHAR(128) NOT NULL,
                create_time BIGINT NOT NULL,
                availability_time BIGINT NOT NULL,
                attempts BIGINT NOT NULL DEFAULT 0,
                lock_time BIGINT NULL,
                payload TEXT NOT NULL
            )
            "#
        );
        sqlx::query(&ddl).execute(&self.inner.pool).await?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_queue_availability ON {table} (queue, availability_time)"
        );
        sqlx::query(&index).execute(&self.inner.pool).await?;

        Ok(())
    }

    pub fn pool(&self) -> &AnyPool {
        &self.inner.pool
    }

    async fn try_lease(&self) -> sqlx::Result<Lease> {
        let inner = &self.inner;
        let now = inner.now();
        let mut tx = inner.pool.begin().await?;

        let select = format!(
            r#"
            SELECT job_id, availability_time, attempts, lock_time, payload
            FROM {}
            WHERE queue = $1
              AND availability_time <= $2
              AND attempts < $3
              AND (lock_time IS NULL OR lock_time <= $4)
            ORDER BY job_id
            LIMIT 1
            "#,
            inner.table()
        );

        let row = sqlx::query(&select)
            .bind(inner.name.as_str())
            .bind(now)
            .bind(i64::from(inner.options.max_attempts))
            .bind(inner.stale_before(now))
            .fetch_optional(&mut *tx)
            .await;

        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => {
                tx.commit().await?;
                return Ok(Lease::Empty);
            }
            Err(err) if is_contention(&err) => {
                tx.rollback().await?;
                return Ok(Lease::Lost);
            }
            Err(err) => return Err(err),
        };

        let job_id: String = row.try_get("job_id")?;
        let availability_time: i64 = row.try_get("availability_time")?;
        let attempts: i64 = row.try_get("attempts")?;
        let lock_time: Option<i64> = row.try_get("lock_time")?;
        let payload: String = row.try_get("payload")?;

        let lock_clause = if lock_time.is_some() {
            "lock_time = $6"
        } else {
            "lock_time IS NULL"
        };
        let update = format!(
            r#"
            UPDATE {}
            SET attempts = attempts + 1, lock_time = $1
            WHERE job_id = $2
              AND queue = $3
              AND availability_time = $4
              AND attempts = $5
              AND {}
            "#,
            inner.table(),
            lock_clause
        );

        let mut query = sqlx::query(&update)
            .bind(now)
            .bind(job_id.as_str())
            .bind(inner.name.as_str())
            .bind(availability_time)
            .bind(attempts);
        if let Some(lock_time) = lock_time {
            query = query.bind(lock_time);
        }

        match query.execute(&mut *tx).await {
            Ok(result) if result.rows_affected() == 1 => {}
            Ok(_) => {
                tx.rollback().await?;
                return Ok(Lease::Lost);
            }
            Err(err) if is_contention(&err) => {
                tx.rollback().await?;
                return Ok(Lease::Lost);
            }
            Err(err) => return Err(err),
        }

        // A failed commit leaves the transaction open; dropping it rolls back.
        match tx.commit().await {
            Ok(()) => Ok(Lease::Won {
                job_id,
                attempts: attempts + 1,
                payload,
            }),
            Err(err) if is_contention(&err) => Ok(Lease::Lost),
            Err(err) => Err(err),
        }
    }

    fn into_job(&self, job_id: String, attempts: i64, payload: &str) -> Result<Job> {
        let descriptor = JobDescriptor::from_envelope(serde_json::from_str(payload)?)?;
        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        let backend: Arc<dyn JobBackend> = self.inner.clone();

        Ok(Job::new(job_id, descriptor, attempts, backend))
    }
}

#[async_trait]
impl Queue for DatabaseQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn size(&self) -> Result<u64> {
        let inner = &self.inner;
        let now = inner.now();
        let sql = format!(
            r#"
            SELECT COUNT(*) AS total
            FROM {}
            WHERE queue = $1
              AND availability_time <= $2
              AND attempts < $3
              AND (lock_time IS NULL OR lock_time <= $4)
            "#,
            inner.table()
        );

        let row = sqlx::query(&sql)
            .bind(inner.name.as_str())
            .bind(now)
            .bind(i64::from(inner.options.max_attempts))
            .bind(inner.stale_before(now))
            .fetch_one(&inner.pool)
            .await?;

        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn consume(&self) -> Result<Option<Job>> {
        for attempt in 1..=self.inner.options.lock_retries.max(1) {
            match self.try_lease().await? {
                Lease::Won {
                    job_id,
                    attempts,
                    payload,
                } => return self.into_job(job_id, attempts, &payload).map(Some),
                Lease::Empty => return Ok(None),
                Lease::Lost => {
                    debug!(queue = %self.inner.name, attempt, "Lost lease race, selecting again");
                    tokio::time::sleep(LOST_LEASE_PAUSE * attempt).await;
                }
            }
        }

        warn!(
            queue = %self.inner.name,
            retries = self.inner.options.lock_retries,
            "Giving up on lease after repeated contention"
        );
        Ok(None)
    }

    async fn push_raw(&self, payload: Value, delay: Delay, attempts: u32) -> Result<String> {
        let inner = &self.inner;
        let now = inner.options.clock.now();
        let id = new_job_id();
        let sql = format!(
            r#"
            INSERT INTO {} (job_id, queue, create_time, availability_time, attempts, lock_time, payload)
            VALUES ($1, $2, $3, $4, $5, NULL, $6)
            "#,
            inner.table()
        );

        sqlx::query(&sql)
            .bind(id.as_str())
            .bind(inner.name.as_str())
            .bind(now.timestamp())
            .bind(delay.available_at(now).timestamp())
            .bind(i64::from(attempts))
            .bind(serde_json::to_string(&payload)?)
            .execute(&inner.pool)
            .await?;

        debug!(job_id = %id, queue = %inner.name, "Job pushed");
        Ok(id)
    }

    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        Some(self)
    }
}

#[async_trait]
impl Purgeable for DatabaseQueue {
    async fn purge(&self) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE queue = $1", self.inner.table());

        sqlx::query(&sql)
            .bind(self.inner.name.as_str())
            .execute(&self.inner.pool)
            .await?;

        Ok(())
    }
}

/// Table names are interpolated into SQL, so only plain identifiers are accepted
fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(StevedoreError::Configuration(format!(
            "invalid table name `{}`",
            table
        )))
    }
}
