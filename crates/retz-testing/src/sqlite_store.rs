//! An in-memory implementation of `retz_core::Store` backed by SQLite,
//! used by `retz-core`'s own test suite and by any downstream crate that
//! wants to exercise the dispatcher without a live Postgres.
//!
//! SQLite has no `SERIALIZABLE` isolation level to opt into; instead this
//! store restricts its pool to a single connection, so only one logical
//! transaction can ever hold the connection at a time and no two
//! transactions can interleave at the statement level. That is sufficient
//! to make the relevant invariants hold for single-process tests — it is
//! not a substitute for a real `SERIALIZABLE` backend and must never be
//! used in production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use retz_core::{
    Application, Job, JobState, OrderKey, PendingTransition, Property, Resources, RetzError,
    Store, StoreError, Transition, User,
};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, Transaction};
use std::collections::HashSet;
use std::str::FromStr;

const TABLES: [&str; 4] = ["users", "applications", "jobs", "properties"];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// A fresh in-memory database, schema bootstrapped, ready to use.
    pub async fn new_in_memory() -> Result<Self, RetzError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::new("connect", e))?;
        bootstrap_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn begin(&self) -> Result<Transaction<'static, sqlx::Sqlite>, RetzError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::new("begin", e))
    }
}

async fn bootstrap_schema(pool: &SqlitePool) -> Result<(), RetzError> {
    let present: Vec<String> = sqlx::query_scalar(
        "SELECT lower(name) FROM sqlite_master WHERE type = 'table' AND lower(name) IN (?, ?, ?, ?)",
    )
    .bind(TABLES[0])
    .bind(TABLES[1])
    .bind(TABLES[2])
    .bind(TABLES[3])
    .fetch_all(pool)
    .await
    .map_err(|e| StoreError::new("bootstrap_probe", e))?;

    let present: HashSet<String> = present.into_iter().collect();
    match present.len() {
        4 => Ok(()),
        0 => create_schema(pool).await,
        _ => Err(RetzError::SchemaPartial),
    }
}

async fn create_schema(pool: &SqlitePool) -> Result<(), RetzError> {
    let statements = [
        r#"CREATE TABLE users (
            key_id TEXT PRIMARY KEY,
            secret TEXT NOT NULL,
            enabled BOOLEAN NOT NULL,
            json TEXT NOT NULL
        )"#,
        r#"CREATE TABLE applications (
            appid TEXT PRIMARY KEY,
            owner TEXT NOT NULL REFERENCES users(key_id),
            json TEXT NOT NULL
        )"#,
        r#"CREATE TABLE jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            appid TEXT NOT NULL REFERENCES applications(appid),
            cmd TEXT NOT NULL,
            priority INTEGER NOT NULL,
            taskid TEXT UNIQUE,
            state TEXT NOT NULL,
            finished TEXT,
            json TEXT NOT NULL
        )"#,
        r#"CREATE TABLE properties (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )"#,
    ];
    for stmt in statements {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .map_err(|e| StoreError::new("bootstrap_ddl", e))?;
    }
    Ok(())
}

fn hydrate_user(row: &SqliteRow) -> Result<User, RetzError> {
    let json: String = row
        .try_get("json")
        .map_err(|e| StoreError::new("hydrate_user", e))?;
    let user: User = serde_json::from_str(&json)
        .map_err(|e| RetzError::InvariantViolation(format!("user json decode failed: {e}")))?;
    let key_id: String = row
        .try_get("key_id")
        .map_err(|e| StoreError::new("hydrate_user", e))?;
    let enabled: bool = row
        .try_get("enabled")
        .map_err(|e| StoreError::new("hydrate_user", e))?;
    if user.key_id != key_id || user.enabled != enabled {
        return Err(RetzError::InvariantViolation(format!(
            "user {key_id} column/json divergence"
        )));
    }
    Ok(user)
}

fn hydrate_application(row: &SqliteRow) -> Result<Application, RetzError> {
    let json: String = row
        .try_get("json")
        .map_err(|e| StoreError::new("hydrate_application", e))?;
    let app: Application = serde_json::from_str(&json).map_err(|e| {
        RetzError::InvariantViolation(format!("application json decode failed: {e}"))
    })?;
    let appid: String = row
        .try_get("appid")
        .map_err(|e| StoreError::new("hydrate_application", e))?;
    if app.appid != appid {
        return Err(RetzError::InvariantViolation(format!(
            "application {appid} column/json divergence"
        )));
    }
    Ok(app)
}

fn hydrate_job(row: &SqliteRow) -> Result<Job, RetzError> {
    let json: String = row
        .try_get("json")
        .map_err(|e| StoreError::new("hydrate_job", e))?;
    let job: Job = serde_json::from_str(&json)
        .map_err(|e| RetzError::InvariantViolation(format!("job json decode failed: {e}")))?;

    let id: i64 = row
        .try_get("id")
        .map_err(|e| StoreError::new("hydrate_job", e))?;
    let appid: String = row
        .try_get("appid")
        .map_err(|e| StoreError::new("hydrate_job", e))?;
    let taskid: Option<String> = row
        .try_get("taskid")
        .map_err(|e| StoreError::new("hydrate_job", e))?;
    let state: String = row
        .try_get("state")
        .map_err(|e| StoreError::new("hydrate_job", e))?;
    let priority: i32 = row
        .try_get("priority")
        .map_err(|e| StoreError::new("hydrate_job", e))?;

    let state = JobState::from_str(&state)
        .map_err(|e| RetzError::InvariantViolation(format!("job {id} has unknown state: {e}")))?;

    if job.id != id
        || job.appid != appid
        || job.task_id != taskid
        || job.state != state
        || job.priority != priority
    {
        return Err(RetzError::InvariantViolation(format!(
            "job {id} column/json divergence"
        )));
    }
    Ok(job)
}

async fn write_job(
    tx: &mut Transaction<'_, sqlx::Sqlite>,
    job: &Job,
    insert: bool,
) -> Result<(), RetzError> {
    let json = serde_json::to_string(job)
        .map_err(|e| RetzError::InvariantViolation(format!("job serialize failed: {e}")))?;

    if insert {
        sqlx::query(
            "INSERT INTO jobs (id, name, appid, cmd, priority, taskid, state, finished, json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.appid)
        .bind(&job.cmd)
        .bind(job.priority)
        .bind(&job.task_id)
        .bind(job.state.as_str())
        .bind(job.finished)
        .bind(json)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::new("write_job_insert", e))?;
    } else {
        sqlx::query(
            "UPDATE jobs SET name = ?, appid = ?, cmd = ?, priority = ?, taskid = ?, \
             state = ?, finished = ?, json = ? WHERE id = ?",
        )
        .bind(&job.name)
        .bind(&job.appid)
        .bind(&job.cmd)
        .bind(job.priority)
        .bind(&job.task_id)
        .bind(job.state.as_str())
        .bind(job.finished)
        .bind(json)
        .bind(job.id)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::new("write_job_update", e))?;
    }
    Ok(())
}

async fn load_job_for_update(
    tx: &mut Transaction<'_, sqlx::Sqlite>,
    id: i64,
) -> Result<Option<Job>, RetzError> {
    let row = sqlx::query(
        "SELECT id, appid, taskid, state, priority, json FROM jobs WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| StoreError::new("load_job_for_update", e))?;
    row.as_ref().map(hydrate_job).transpose()
}

#[async_trait]
impl Store for SqliteStore {
    async fn all_users(&self) -> Result<Vec<User>, RetzError> {
        let rows = sqlx::query("SELECT key_id, enabled, json FROM users")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::new("all_users", e))?;
        rows.iter().map(hydrate_user).collect()
    }

    async fn add_user(&self, user: User) -> Result<(), RetzError> {
        let json = serde_json::to_string(&user)
            .map_err(|e| RetzError::InvariantViolation(format!("user serialize failed: {e}")))?;
        sqlx::query("INSERT INTO users (key_id, secret, enabled, json) VALUES (?, ?, ?, ?)")
            .bind(&user.key_id)
            .bind(&user.secret)
            .bind(user.enabled)
            .bind(json)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::new("add_user", e))?;
        Ok(())
    }

    async fn create_user(&self, info: String) -> Result<User, RetzError> {
        let key_id = uuid::Uuid::new_v4().simple().to_string();
        let secret = uuid::Uuid::new_v4().simple().to_string();
        let user = User {
            key_id,
            secret,
            enabled: true,
            info,
            extra: serde_json::Map::new(),
        };
        self.add_user(user.clone()).await?;
        Ok(user)
    }

    async fn get_user(&self, key_id: &str) -> Result<Option<User>, RetzError> {
        let row = sqlx::query("SELECT key_id, enabled, json FROM users WHERE key_id = ?")
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::new("get_user", e))?;
        row.as_ref().map(hydrate_user).transpose()
    }

    async fn enable_user(&self, key_id: &str, enabled: bool) -> Result<(), RetzError> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT key_id, enabled, json FROM users WHERE key_id = ?")
            .bind(key_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::new("enable_user_select", e))?;
        let Some(row) = row else {
            return Ok(());
        };
        let mut user = hydrate_user(&row)?;
        user.enabled = enabled;
        let json = serde_json::to_string(&user)
            .map_err(|e| RetzError::InvariantViolation(format!("user serialize failed: {e}")))?;
        sqlx::query("UPDATE users SET enabled = ?, json = ? WHERE key_id = ?")
            .bind(enabled)
            .bind(json)
            .bind(key_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::new("enable_user_update", e))?;
        tx.commit()
            .await
            .map_err(|e| StoreError::new("enable_user_commit", e))?;
        Ok(())
    }

    async fn get_all_applications(
        &self,
        owner: Option<&str>,
    ) -> Result<Vec<Application>, RetzError> {
        let rows = match owner {
            Some(owner) => sqlx::query("SELECT appid, json FROM applications WHERE owner = ?")
                .bind(owner)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::new("get_all_applications", e))?,
            None => sqlx::query("SELECT appid, json FROM applications")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::new("get_all_applications", e))?,
        };
        rows.iter().map(hydrate_application).collect()
    }

    async fn add_application(&self, app: Application) -> Result<bool, RetzError> {
        let mut tx = self.begin().await?;
        let owner_row = sqlx::query("SELECT enabled FROM users WHERE key_id = ?")
            .bind(&app.owner)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::new("add_application_owner_check", e))?;

        let enabled: bool = match owner_row {
            Some(row) => row
                .try_get("enabled")
                .map_err(|e| StoreError::new("add_application_owner_check", e))?,
            None => false,
        };
        if !enabled {
            return Ok(false);
        }

        let json = serde_json::to_string(&app).map_err(|e| {
            RetzError::InvariantViolation(format!("application serialize failed: {e}"))
        })?;

        sqlx::query("DELETE FROM applications WHERE appid = ?")
            .bind(&app.appid)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::new("add_application_delete", e))?;

        sqlx::query("INSERT INTO applications (appid, owner, json) VALUES (?, ?, ?)")
            .bind(&app.appid)
            .bind(&app.owner)
            .bind(json)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::new("add_application_insert", e))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::new("add_application_commit", e))?;
        Ok(true)
    }

    async fn get_application(&self, appid: &str) -> Result<Option<Application>, RetzError> {
        let row = sqlx::query("SELECT appid, json FROM applications WHERE appid = ?")
            .bind(appid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::new("get_application", e))?;
        row.as_ref().map(hydrate_application).transpose()
    }

    async fn delete_application(&self, appid: &str) -> Result<(), RetzError> {
        let mut tx = self.begin().await?;
        let in_use: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM jobs WHERE appid = ? AND state IN ('QUEUED', 'STARTING', 'STARTED')",
        )
        .bind(appid)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::new("delete_application_check", e))?;

        if in_use > 0 {
            return Err(RetzError::ApplicationInUse(appid.to_string()));
        }

        sqlx::query("DELETE FROM applications WHERE appid = ?")
            .bind(appid)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::new("delete_application", e))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::new("delete_application_commit", e))?;
        Ok(())
    }

    async fn safe_add_job(&self, mut job: Job) -> Result<Job, RetzError> {
        let mut tx = self.begin().await?;

        let app_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM applications WHERE appid = ?)")
                .bind(&job.appid)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::new("safe_add_job_check", e))?;
        if !app_exists {
            return Err(RetzError::ApplicationNotFound(job.appid.clone()));
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO jobs (name, appid, cmd, priority, taskid, state, finished, json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, '{}') RETURNING id",
        )
        .bind(&job.name)
        .bind(&job.appid)
        .bind(&job.cmd)
        .bind(job.priority)
        .bind(&job.task_id)
        .bind(job.state.as_str())
        .bind(job.finished)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::new("safe_add_job_insert", e))?;

        job.id = id;
        write_job(&mut tx, &job, false).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::new("safe_add_job_commit", e))?;
        Ok(job)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>, RetzError> {
        let row = sqlx::query("SELECT id, appid, taskid, state, priority, json FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::new("get_job", e))?;
        row.as_ref().map(hydrate_job).transpose()
    }

    async fn get_job_from_task_id(&self, task_id: &str) -> Result<Option<Job>, RetzError> {
        let row = sqlx::query(
            "SELECT id, appid, taskid, state, priority, json FROM jobs WHERE taskid = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::new("get_job_from_task_id", e))?;
        row.as_ref().map(hydrate_job).transpose()
    }

    async fn get_app_job(&self, id: i64) -> Result<Option<(Application, Job)>, RetzError> {
        let Some(job) = self.get_job(id).await? else {
            return Ok(None);
        };
        let Some(app) = self.get_application(&job.appid).await? else {
            return Ok(None);
        };
        Ok(Some((app, job)))
    }

    async fn list_jobs(
        &self,
        owner: &str,
        state: Option<JobState>,
        tag: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Job>, RetzError> {
        let rows = match state {
            Some(state) => sqlx::query(
                "SELECT j.id, j.appid, j.taskid, j.state, j.priority, j.json FROM jobs j \
                 JOIN applications a ON a.appid = j.appid \
                 WHERE a.owner = ? AND j.state = ? ORDER BY j.id DESC LIMIT ?",
            )
            .bind(owner)
            .bind(state.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::new("list_jobs", e))?,
            None => sqlx::query(
                "SELECT j.id, j.appid, j.taskid, j.state, j.priority, j.json FROM jobs j \
                 JOIN applications a ON a.appid = j.appid \
                 WHERE a.owner = ? ORDER BY j.id DESC LIMIT ?",
            )
            .bind(owner)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::new("list_jobs", e))?,
        };

        let jobs: Result<Vec<Job>, RetzError> = rows.iter().map(hydrate_job).collect();
        let mut jobs = jobs?;
        if let Some(tag) = tag {
            jobs.retain(|j| j.tags.contains(tag));
        }
        Ok(jobs)
    }

    async fn queued(&self, limit: i64) -> Result<Vec<Job>, RetzError> {
        let rows = sqlx::query(
            "SELECT id, appid, taskid, state, priority, json FROM jobs \
             WHERE state = 'QUEUED' ORDER BY id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::new("queued", e))?;
        rows.iter().map(hydrate_job).collect()
    }

    async fn find_fit(
        &self,
        order_by: &[OrderKey],
        cpu: i64,
        mem_mb: i64,
    ) -> Result<Vec<Job>, RetzError> {
        let order_clause = order_by
            .iter()
            .map(|k| format!("{} ASC", k.column()))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "SELECT id, appid, taskid, state, priority, json FROM jobs \
             WHERE state = 'QUEUED' ORDER BY {order_clause}, id ASC"
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::new("find_fit", e))?;
        let candidates: Result<Vec<Job>, RetzError> = rows.iter().map(hydrate_job).collect();
        let candidates = candidates?;

        let mut fit = Vec::new();
        let mut used_cpu = 0i64;
        let mut used_mem = 0i64;
        for job in candidates {
            let next_cpu = used_cpu + job.resources.cpu;
            let next_mem = used_mem + job.resources.mem_mb;
            if next_cpu > cpu || next_mem > mem_mb {
                break;
            }
            used_cpu = next_cpu;
            used_mem = next_mem;
            fit.push(job);
        }
        Ok(fit)
    }

    async fn get_running(&self) -> Result<Vec<Job>, RetzError> {
        let rows = sqlx::query(
            "SELECT id, appid, taskid, state, priority, json FROM jobs \
             WHERE state IN ('STARTING', 'STARTED') ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::new("get_running", e))?;
        rows.iter().map(hydrate_job).collect()
    }

    async fn sum_running_resources(&self) -> Result<Resources, RetzError> {
        let row = sqlx::query(
            "SELECT \
                COALESCE(SUM(json_extract(json, '$.resources.cpu')), 0) AS cpu, \
                COALESCE(SUM(json_extract(json, '$.resources.mem_mb')), 0) AS mem_mb, \
                COALESCE(SUM(json_extract(json, '$.resources.gpu')), 0) AS gpu, \
                COALESCE(SUM(json_extract(json, '$.resources.ports')), 0) AS ports \
             FROM jobs WHERE state IN ('STARTING', 'STARTED')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::new("sum_running_resources", e))?;
        Ok(Resources {
            cpu: row.try_get("cpu").map_err(|e| StoreError::new("sum_running_resources", e))?,
            mem_mb: row
                .try_get("mem_mb")
                .map_err(|e| StoreError::new("sum_running_resources", e))?,
            gpu: row.try_get("gpu").map_err(|e| StoreError::new("sum_running_resources", e))?,
            ports: row
                .try_get("ports")
                .map_err(|e| StoreError::new("sum_running_resources", e))?,
        })
    }

    async fn finished_jobs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Job>, RetzError> {
        let rows = sqlx::query(
            "SELECT id, appid, taskid, state, priority, json FROM jobs \
             WHERE finished >= ? AND finished < ? ORDER BY id ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::new("finished_jobs", e))?;
        rows.iter().map(hydrate_job).collect()
    }

    async fn apply_transition(&self, job_id: i64, transition: Transition) -> Result<Job, RetzError> {
        let mut tx = self.begin().await?;
        let Some(job) = load_job_for_update(&mut tx, job_id).await? else {
            return Err(RetzError::JobNotFound(job_id));
        };
        let next = retz_core::state_machine::apply(&job, transition)?;
        write_job(&mut tx, &next, false).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::new("apply_transition_commit", e))?;
        Ok(next)
    }

    async fn apply_transitions(
        &self,
        pending: Vec<PendingTransition>,
    ) -> Result<Vec<Job>, RetzError> {
        let mut tx = self.begin().await?;
        let mut results = Vec::with_capacity(pending.len());
        for item in pending {
            let Some(job) = load_job_for_update(&mut tx, item.job_id).await? else {
                return Err(RetzError::JobNotFound(item.job_id));
            };
            let next = retz_core::state_machine::apply(&job, item.transition)?;
            write_job(&mut tx, &next, false).await?;
            results.push(next);
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::new("apply_transitions_commit", e))?;
        Ok(results)
    }

    async fn count_jobs(&self) -> Result<i64, RetzError> {
        sqlx::query_scalar::<_, i64>("SELECT count(*) FROM jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::new("count_jobs", e).into())
    }

    async fn count_queued(&self) -> Result<i64, RetzError> {
        sqlx::query_scalar::<_, i64>("SELECT count(*) FROM jobs WHERE state = 'QUEUED'")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::new("count_queued", e).into())
    }

    async fn count_running(&self) -> Result<i64, RetzError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM jobs WHERE state IN ('STARTING', 'STARTED')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::new("count_running", e).into())
    }

    async fn get_latest_job_id(&self) -> Result<Option<i64>, RetzError> {
        sqlx::query_scalar::<_, Option<i64>>("SELECT max(id) FROM jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::new("get_latest_job_id", e).into())
    }

    async fn set_framework_id(&self, id: &str) -> Result<bool, RetzError> {
        sqlx::query(
            "INSERT INTO properties (key, value) VALUES ('frameworkId', ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::new("set_framework_id", e))?;
        Ok(true)
    }

    async fn get_framework_id(&self) -> Result<Option<String>, RetzError> {
        sqlx::query_scalar::<_, String>("SELECT value FROM properties WHERE key = 'frameworkId'")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::new("get_framework_id", e).into())
    }

    async fn delete_all_properties(&self) -> Result<(), RetzError> {
        sqlx::query("DELETE FROM properties")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::new("delete_all_properties", e))?;
        Ok(())
    }

    async fn get_property(&self, key: &str) -> Result<Option<Property>, RetzError> {
        let row = sqlx::query("SELECT key, value FROM properties WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::new("get_property", e))?;
        row.map(|r| {
            Ok(Property {
                key: r.try_get("key").map_err(|e| StoreError::new("get_property", e))?,
                value: r
                    .try_get("value")
                    .map_err(|e| StoreError::new("get_property", e))?,
            })
        })
        .transpose()
    }

    async fn delete_old_jobs(&self, leeway: chrono::Duration) -> Result<u64, RetzError> {
        let cutoff = Utc::now() - leeway;
        let result = sqlx::query(
            "DELETE FROM jobs WHERE state IN ('FINISHED', 'KILLED') AND finished < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::new("delete_old_jobs", e))?;
        Ok(result.rows_affected())
    }

    async fn stop(&self) {
        self.pool.close().await;
    }
}
