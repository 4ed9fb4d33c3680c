//! PostgreSQL implementation of the queue store.
//!
//! Jobs live in `leasework_jobs` (see the `001_initial_schema` migration). Every
//! mutation is a single statement or a single transaction:
//!
//! - enqueue deduplicates through the unique `(queue_type, definition_hash)` index
//!   and serializes with a transaction-scoped advisory lock per queue type, taken
//!   exclusively only when `force_one_active_job_group` is requested;
//! - claims use `FOR UPDATE SKIP LOCKED` inside an `UPDATE … RETURNING`;
//! - heartbeats and completions are conditional on `status = Running` and the
//!   caller's lease `version`.
//!
//! A transaction dropped before commit rolls back, so cancelling an in-flight call
//! never leaves a partial write behind.

use crate::{
    LeaseworkError, Result,
    config::DatabaseConfig,
    job::{GroupId, JobId, JobInfo, JobStatus, QueueType},
    queue::{CancelSummary, CancelTarget, ClaimRequest, EnqueuedJob, JobSelector, QueueStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Transaction, postgres::PgPoolOptions};
use tracing::debug;

/// Namespace for the per-queue-type enqueue advisory locks.
const ENQUEUE_LOCK_BASE: i64 = 0x6c65_6173_0000;

const JOB_COLUMNS: &str = "id, group_id, queue_type, definition, status, cancel_requested, \
     version, worker, create_date, start_date, end_date, heartbeat_date_time, \
     heartbeat_timeout_sec, result";

#[derive(FromRow, Clone, Debug)]
pub(crate) struct JobRow {
    pub id: i64,
    pub group_id: i64,
    pub queue_type: i16,
    pub definition: Option<String>,
    pub status: i16,
    pub cancel_requested: bool,
    pub version: i64,
    pub worker: Option<String>,
    pub create_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub heartbeat_date_time: DateTime<Utc>,
    pub heartbeat_timeout_sec: Option<i64>,
    pub result: Option<String>,
}

impl JobRow {
    pub fn into_job(self) -> Result<JobInfo> {
        let queue_type = u8::try_from(self.queue_type)
            .ok()
            .and_then(QueueType::from_u8)
            .ok_or_else(|| decode_error(format!("invalid queue_type {}", self.queue_type)))?;
        let status = JobStatus::from_i16(self.status)
            .ok_or_else(|| decode_error(format!("invalid status {}", self.status)))?;

        Ok(JobInfo {
            id: self.id,
            group_id: self.group_id,
            queue_type,
            definition: self.definition,
            status,
            cancel_requested: self.cancel_requested,
            version: self.version,
            worker: self.worker,
            create_date: self.create_date,
            start_date: self.start_date,
            end_date: self.end_date,
            heartbeat_date_time: self.heartbeat_date_time,
            heartbeat_timeout_sec: self.heartbeat_timeout_sec,
            result: self.result,
        })
    }
}

fn decode_error(message: String) -> LeaseworkError {
    LeaseworkError::Database(sqlx::Error::Decode(message.into()))
}

/// SHA-256 of the definition, hex encoded. Keeps the unique index narrow for
/// arbitrarily large definitions.
pub(crate) fn definition_hash(definition: &str) -> String {
    hex::encode(Sha256::digest(definition.as_bytes()))
}

fn queue_type_value(queue_type: QueueType) -> i16 {
    i16::from(queue_type.as_u8())
}

/// PostgreSQL-backed [`QueueStore`].
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool. The schema must already be migrated.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Connect with the pool size and acquire timeout from `config`.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let pool = pool_options(config).connect(&config.url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_by_definition(
        conn: &mut PgConnection,
        queue_type: QueueType,
        hash: &str,
    ) -> Result<Option<JobInfo>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM leasework_jobs WHERE queue_type = $1 AND definition_hash = $2"
        ))
        .bind(queue_type_value(queue_type))
        .bind(hash)
        .fetch_optional(conn)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn cancel_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        queue_type: QueueType,
        target: CancelTarget,
        now: DateTime<Utc>,
    ) -> Result<CancelSummary> {
        let (column, value) = match target {
            CancelTarget::Job(id) => ("id", id),
            CancelTarget::Group(group_id) => ("group_id", group_id),
        };

        let cancelled = sqlx::query(&format!(
            "UPDATE leasework_jobs SET status = $1, end_date = $2
             WHERE queue_type = $3 AND {column} = $4 AND status = $5"
        ))
        .bind(JobStatus::Cancelled.as_i16())
        .bind(now)
        .bind(queue_type_value(queue_type))
        .bind(value)
        .bind(JobStatus::Created.as_i16())
        .execute(&mut **tx)
        .await?
        .rows_affected();

        let cancel_requested = sqlx::query(&format!(
            "UPDATE leasework_jobs SET cancel_requested = TRUE
             WHERE queue_type = $1 AND {column} = $2 AND status = $3"
        ))
        .bind(queue_type_value(queue_type))
        .bind(value)
        .bind(JobStatus::Running.as_i16())
        .execute(&mut **tx)
        .await?
        .rows_affected();

        Ok(CancelSummary {
            cancelled,
            cancel_requested,
        })
    }
}

#[async_trait]
impl QueueStore for PostgresStore {
    async fn create_jobs(
        &self,
        queue_type: QueueType,
        definitions: &[String],
        group_id: Option<GroupId>,
        force_one_active_job_group: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<EnqueuedJob>> {
        // setval to the maximum leaves nextval with nothing to return
        if group_id == Some(GroupId::MAX) {
            return Err(LeaseworkError::invalid(format!(
                "group id {} leaves no room for further groups",
                GroupId::MAX
            )));
        }

        let qt = queue_type_value(queue_type);
        let mut tx = self.pool.begin().await?;

        let lock_key = ENQUEUE_LOCK_BASE + i64::from(qt);
        if force_one_active_job_group {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(lock_key)
                .execute(&mut *tx)
                .await?;

            let active: bool = sqlx::query_scalar(
                "SELECT EXISTS (
                    SELECT 1 FROM leasework_jobs WHERE queue_type = $1 AND status IN ($2, $3)
                )",
            )
            .bind(qt)
            .bind(JobStatus::Created.as_i16())
            .bind(JobStatus::Running.as_i16())
            .fetch_one(&mut *tx)
            .await?;

            if active {
                return Err(LeaseworkError::GroupAlreadyActive { queue_type });
            }
        } else {
            sqlx::query("SELECT pg_advisory_xact_lock_shared($1)")
                .bind(lock_key)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(id) = group_id {
            // keep minted ids clear of caller-supplied ones
            sqlx::query(
                "SELECT setval('leasework_group_id_seq', $1)
                 WHERE $1 >= (SELECT last_value FROM leasework_group_id_seq)",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        let mut group_id = group_id;
        let mut enqueued = Vec::with_capacity(definitions.len());

        for definition in definitions {
            let hash = definition_hash(definition);

            if let Some(job) = Self::find_by_definition(&mut *tx, queue_type, &hash).await? {
                enqueued.push(EnqueuedJob { job, created: false });
                continue;
            }

            let group = match group_id {
                Some(id) => id,
                None => {
                    let minted: i64 = sqlx::query_scalar("SELECT nextval('leasework_group_id_seq')")
                        .fetch_one(&mut *tx)
                        .await?;
                    group_id = Some(minted);
                    minted
                }
            };

            let inserted = sqlx::query_as::<_, JobRow>(&format!(
                "INSERT INTO leasework_jobs
                    (group_id, queue_type, definition, definition_hash, status, create_date, heartbeat_date_time)
                 VALUES ($1, $2, $3, $4, $5, $6, $6)
                 ON CONFLICT (queue_type, definition_hash) DO NOTHING
                 RETURNING {JOB_COLUMNS}"
            ))
            .bind(group)
            .bind(qt)
            .bind(definition)
            .bind(&hash)
            .bind(JobStatus::Created.as_i16())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            match inserted {
                Some(row) => enqueued.push(EnqueuedJob {
                    job: row.into_job()?,
                    created: true,
                }),
                // a concurrent producer committed the same definition first
                None => {
                    let job = Self::find_by_definition(&mut *tx, queue_type, &hash)
                        .await?
                        .ok_or_else(|| LeaseworkError::Transient {
                            message: format!(
                                "definition conflict in queue type {} could not be resolved",
                                queue_type
                            ),
                        })?;
                    enqueued.push(EnqueuedJob { job, created: false });
                }
            }
        }

        tx.commit().await?;
        Ok(enqueued)
    }

    async fn claim_job(
        &self,
        request: &ClaimRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobInfo>> {
        let expired_before = now
            .checked_sub_signed(request.heartbeat_timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE leasework_jobs
             SET status = $1,
                 heartbeat_date_time = $2,
                 version = version + 1,
                 worker = $3,
                 start_date = COALESCE(start_date, $2),
                 heartbeat_timeout_sec = $9
             WHERE id = (
                 SELECT id FROM leasework_jobs
                 WHERE queue_type = $4
                   AND ($5::BIGINT IS NULL OR id = $5)
                   AND ((status = $6 AND NOT $7) OR (status = $1 AND heartbeat_date_time <= $8))
                 ORDER BY id
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(JobStatus::Running.as_i16())
        .bind(now)
        .bind(request.worker)
        .bind(queue_type_value(request.queue_type))
        .bind(request.job_id)
        .bind(JobStatus::Created.as_i16())
        .bind(request.check_timeout_jobs_only)
        .bind(expired_before)
        .bind(request.heartbeat_timeout.num_seconds())
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn renew_lease(
        &self,
        job_id: JobId,
        version: i64,
        result: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<bool>> {
        let cancel_requested: Option<bool> = sqlx::query_scalar(
            "UPDATE leasework_jobs
             SET heartbeat_date_time = $1, result = $2
             WHERE id = $3 AND status = $4 AND version = $5
             RETURNING cancel_requested",
        )
        .bind(now)
        .bind(result)
        .bind(job_id)
        .bind(JobStatus::Running.as_i16())
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(cancel_requested)
    }

    async fn finalize_job(
        &self,
        job: &JobInfo,
        cascade: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<CancelSummary>> {
        let mut tx = self.pool.begin().await?;

        let group_id: Option<i64> = sqlx::query_scalar(
            "UPDATE leasework_jobs
             SET status = $1, result = $2, end_date = $3
             WHERE id = $4 AND status = $5 AND version = $6
             RETURNING group_id",
        )
        .bind(job.status.as_i16())
        .bind(job.result.as_deref())
        .bind(now)
        .bind(job.id)
        .bind(JobStatus::Running.as_i16())
        .bind(job.version)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(group_id) = group_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let summary = if cascade {
            Self::cancel_in_tx(&mut tx, job.queue_type, CancelTarget::Group(group_id), now).await?
        } else {
            CancelSummary::default()
        };

        tx.commit().await?;
        debug!(job_id = job.id, group_id, cascade, "Finalized job");

        Ok(Some(summary))
    }

    async fn cancel_jobs(
        &self,
        queue_type: QueueType,
        target: CancelTarget,
        now: DateTime<Utc>,
    ) -> Result<CancelSummary> {
        let mut tx = self.pool.begin().await?;
        let summary = Self::cancel_in_tx(&mut tx, queue_type, target, now).await?;
        tx.commit().await?;
        Ok(summary)
    }

    async fn fetch_jobs(
        &self,
        queue_type: QueueType,
        selector: JobSelector<'_>,
        include_definition: bool,
    ) -> Result<Vec<JobInfo>> {
        let columns = JOB_COLUMNS.replacen(
            "definition",
            "CASE WHEN $2 THEN definition END AS definition",
            1,
        );
        let filter = match selector {
            JobSelector::Id(_) => "AND id = $3",
            JobSelector::Ids(_) => "AND id = ANY($3)",
            JobSelector::Group(_) => "AND group_id = $3",
            JobSelector::All => "",
        };
        let sql = format!(
            "SELECT {columns} FROM leasework_jobs WHERE queue_type = $1 {filter} ORDER BY id"
        );

        let query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue_type_value(queue_type))
            .bind(include_definition);
        let query = match selector {
            JobSelector::Id(id) => query.bind(id),
            JobSelector::Ids(ids) => query.bind(ids),
            JobSelector::Group(group_id) => query.bind(group_id),
            JobSelector::All => query,
        };

        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(JobRow::into_job)
            .collect()
    }
}

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(config.connection_timeout())
}
