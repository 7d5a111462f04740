//! PostgreSQL backend for the `Database` trait.
//!
//! One `PgBackend` owns the deadpool connection pool. Multi-table writes
//! (registration bootstrap, cascading deletes, heading moves, tag
//! reconciliation) run inside a single transaction; single-row writes go
//! straight through a pooled connection.

use chrono::{DateTime, NaiveDate, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use secrecy::ExposeSecret as _;
use tokio_postgres::config::SslMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use ulid::Ulid;

use crate::config::DatabaseConfig;
use crate::db::{
    BootstrapOutcome, CreateTaskParams, Database, DeleteListOutcome, DeviceStore,
    EmailUpdateOutcome, GroupKey, HeadingRecord, HeadingStore, ListRecord, ListStore,
    RawTaskGroup, SessionRecord, SessionStore, StatusRecord, StatusStore, TagRecord, TagStore,
    TaskRecord, TaskStatus, TaskStore, TaskViewStore, TaskWriteOutcome, UpdateTaskParams,
    UserRecord, UserStore,
};
use crate::error::DatabaseError;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("src/db/migrations");
}

/// PostgreSQL database backend.
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    /// Build the pool from configuration. `DB_CONN_URL` wins over the
    /// discrete host/port/name fields when set.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut pg_config = match &config.conn_url {
            Some(url) => url
                .parse::<tokio_postgres::Config>()
                .map_err(|e| DatabaseError::Pool(format!("invalid DB_CONN_URL: {e}")))?,
            None => {
                let mut c = tokio_postgres::Config::new();
                c.host(&config.host)
                    .port(config.port)
                    .dbname(&config.name)
                    .user(&config.user)
                    .password(config.password.expose_secret())
                    .ssl_mode(match config.ssl_mode.as_str() {
                        "require" => SslMode::Require,
                        "prefer" => SslMode::Prefer,
                        _ => SslMode::Disable,
                    });
                c
            }
        };
        pg_config.connect_timeout(config.dial_timeout);
        // Server-side cap on any single statement.
        pg_config.options(&format!(
            "-c statement_timeout={}",
            config.write_timeout.as_millis()
        ));

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.conn_pool_size)
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(config.read_timeout))
            .create_timeout(Some(config.dial_timeout))
            .recycle_timeout(Some(config.idle_timeout))
            .build()
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

fn new_id() -> String {
    Ulid::new().to_string()
}

fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

// Task projection shared by every task-returning query. `overdue` is derived
// here; tags come from the aggregate view.
const TASK_COLUMNS: &str = "t.id, t.title, t.description, t.start_date, t.deadline, \
     t.start_time, t.end_time, t.status_id, t.list_id, t.heading_id, t.user_id, \
     COALESCE(v.tags, ARRAY[]::text[]) AS tags, \
     (t.deadline IS NOT NULL AND t.deadline <= CURRENT_DATE) AS overdue, \
     t.created_at, t.updated_at";

// Same projection as a JSON object, for the grouped views.
const TASK_JSON: &str = "json_build_object(\
     'id', t.id, 'title', t.title, 'description', t.description, \
     'start_date', t.start_date, 'deadline', t.deadline, \
     'start_time', t.start_time, 'end_time', t.end_time, \
     'status_id', t.status_id, 'list_id', t.list_id, 'heading_id', t.heading_id, \
     'user_id', t.user_id, 'tags', COALESCE(v.tags, ARRAY[]::text[]), \
     'overdue', (t.deadline IS NOT NULL AND t.deadline <= CURRENT_DATE), \
     'created_at', t.created_at, 'updated_at', t.updated_at)";

fn row_to_user(row: &tokio_postgres::Row) -> UserRecord {
    UserRecord {
        id: row.get("id"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_list(row: &tokio_postgres::Row) -> ListRecord {
    ListRecord {
        id: row.get("id"),
        title: row.get("title"),
        user_id: row.get("user_id"),
        is_default: row.get("is_default"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_heading(row: &tokio_postgres::Row) -> HeadingRecord {
    HeadingRecord {
        id: row.get("id"),
        title: row.get("title"),
        list_id: row.get("list_id"),
        user_id: row.get("user_id"),
        is_default: row.get("is_default"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_task(row: &tokio_postgres::Row) -> TaskRecord {
    TaskRecord {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        start_date: row.get("start_date"),
        deadline: row.get("deadline"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        status_id: row.get("status_id"),
        list_id: row.get("list_id"),
        heading_id: row.get("heading_id"),
        user_id: row.get("user_id"),
        tags: row.get("tags"),
        overdue: row.get("overdue"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_session(row: &tokio_postgres::Row) -> SessionRecord {
    SessionRecord {
        user_id: row.get("user_id"),
        device_id: row.get("device_id"),
        refresh_token: row.get("refresh_token"),
        last_visit_at: row.get("last_visit_at"),
        expires_at: row.get("expires_at"),
    }
}

/// Ensure every title has a tag row for this user; returns the tag ids in
/// input order. Conflicting inserts resolve to the existing row.
async fn ensure_tags(
    tx: &tokio_postgres::Transaction<'_>,
    user_id: &str,
    titles: &[String],
) -> Result<Vec<String>, DatabaseError> {
    let mut ids = Vec::with_capacity(titles.len());
    for title in titles {
        let title = title.trim();
        if title.is_empty() {
            continue;
        }
        let row = tx
            .query_one(
                "INSERT INTO tags (id, title, user_id) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (user_id, title) DO UPDATE SET title = EXCLUDED.title \
                 RETURNING id",
                &[&new_id(), &title, &user_id],
            )
            .await?;
        ids.push(row.get::<_, String>(0));
    }
    Ok(ids)
}

/// Reconcile a task's links to exactly `tag_ids`: removed titles are
/// unlinked, kept and new ones are (re)linked live.
async fn reconcile_task_tags(
    tx: &tokio_postgres::Transaction<'_>,
    task_id: &str,
    tag_ids: &[String],
) -> Result<(), DatabaseError> {
    let ids: Vec<&str> = tag_ids.iter().map(String::as_str).collect();
    tx.execute(
        "DELETE FROM tasks_tags WHERE task_id = $1 AND tag_id <> ALL($2)",
        &[&task_id, &ids],
    )
    .await?;
    for tag_id in &ids {
        tx.execute(
            "INSERT INTO tasks_tags (task_id, tag_id) \
             VALUES ($1, $2) \
             ON CONFLICT (task_id, tag_id) DO UPDATE SET deleted_at = NULL",
            &[&task_id, tag_id],
        )
        .await?;
    }
    Ok(())
}

// ==================== Database (supertrait) ====================

#[async_trait::async_trait]
impl Database for PgBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        embedded::migrations::runner()
            .run_async(&mut **conn)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.simple_query("SELECT 1").await?;
        Ok(())
    }
}

// ==================== UserStore ====================

#[async_trait::async_trait]
impl UserStore for PgBackend {
    async fn bootstrap_user(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<BootstrapOutcome, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        // Lock the email candidate so two concurrent registrations of the
        // same address serialize on this row.
        let existing = tx
            .query_opt(
                "SELECT id, deleted_at FROM users WHERE email = $1 FOR UPDATE",
                &[&email],
            )
            .await?;

        let outcome = match existing {
            Some(row) => {
                let deleted_at: Option<DateTime<Utc>> = row.get("deleted_at");
                if deleted_at.is_none() {
                    return Ok(BootstrapOutcome::AlreadyExists);
                }
                // Resurrection: the identity fields are overwritten; the
                // children follow via ON UPDATE CASCADE but stay
                // soft-deleted.
                tx.execute(
                    "UPDATE users SET id = $2, password_hash = '', \
                        deleted_at = NULL, updated_at = NOW() \
                     WHERE email = $1",
                    &[&email, &user_id],
                )
                .await?;
                BootstrapOutcome::Resurrected
            }
            None => {
                tx.execute(
                    "INSERT INTO users (id, email) VALUES ($1, $2)",
                    &[&user_id, &email],
                )
                .await?;
                BootstrapOutcome::Created
            }
        };

        let list_id = new_id();
        tx.execute(
            "INSERT INTO lists (id, title, user_id, is_default) \
             VALUES ($1, 'Inbox', $2, TRUE)",
            &[&list_id, &user_id],
        )
        .await?;
        tx.execute(
            "INSERT INTO headings (id, title, list_id, user_id, is_default) \
             VALUES ($1, 'Default', $2, $3, TRUE)",
            &[&new_id(), &list_id, &user_id],
        )
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, email, password_hash, updated_at \
                 FROM users WHERE id = $1 AND deleted_at IS NULL",
                &[&user_id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_user))
    }

    async fn update_user_email(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<EmailUpdateOutcome, DatabaseError> {
        let conn = self.conn().await?;
        let result = conn
            .query_opt(
                "UPDATE users SET email = $2, updated_at = NOW() \
                 WHERE id = $1 AND deleted_at IS NULL \
                 RETURNING id, email, password_hash, updated_at",
                &[&user_id, &email],
            )
            .await;

        match result {
            Ok(Some(row)) => Ok(EmailUpdateOutcome::Updated(row_to_user(&row))),
            Ok(None) => Ok(EmailUpdateOutcome::NotFound),
            Err(err) if is_unique_violation(&err) => Ok(EmailUpdateOutcome::Taken),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_user_related_data(&self, user_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one("SELECT delete_user_related_data($1)", &[&user_id])
            .await?;
        Ok(row.get::<_, bool>(0))
    }
}

// ==================== DeviceStore ====================

#[async_trait::async_trait]
impl DeviceStore for PgBackend {
    async fn register_device(
        &self,
        user_id: &str,
        user_agent: &str,
        ip: &str,
    ) -> Result<String, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO user_devices (id, user_id, user_agent, ip, latest_login_at) \
                 VALUES ($1, $2, $3, $4, NOW()) \
                 ON CONFLICT (user_id, user_agent) WHERE NOT detached \
                 DO UPDATE SET ip = EXCLUDED.ip, latest_login_at = NOW() \
                 RETURNING id",
                &[&new_id(), &user_id, &user_agent, &ip],
            )
            .await?;
        Ok(row.get(0))
    }
}

// ==================== SessionStore ====================

#[async_trait::async_trait]
impl SessionStore for PgBackend {
    async fn save_session(&self, session: &SessionRecord) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO refresh_sessions \
             (user_id, device_id, refresh_token, last_visit_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id, device_id) DO UPDATE SET \
                refresh_token = EXCLUDED.refresh_token, \
                last_visit_at = EXCLUDED.last_visit_at, \
                expires_at = EXCLUDED.expires_at",
            &[
                &session.user_id,
                &session.device_id,
                &session.refresh_token,
                &session.last_visit_at,
                &session.expires_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT user_id, device_id, refresh_token, last_visit_at, expires_at \
                 FROM refresh_sessions WHERE refresh_token = $1",
                &[&refresh_token],
            )
            .await?;
        Ok(row.as_ref().map(row_to_session))
    }

    async fn delete_session(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute(
                "DELETE FROM refresh_sessions WHERE user_id = $1 AND device_id = $2",
                &[&user_id, &device_id],
            )
            .await?;
        Ok(deleted > 0)
    }
}

// ==================== ListStore ====================

#[async_trait::async_trait]
impl ListStore for PgBackend {
    async fn create_list(&self, user_id: &str, title: &str) -> Result<ListRecord, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let list_id = new_id();
        let row = tx
            .query_one(
                "INSERT INTO lists (id, title, user_id, is_default) \
                 VALUES ($1, $2, $3, FALSE) \
                 RETURNING id, title, user_id, is_default, updated_at",
                &[&list_id, &title, &user_id],
            )
            .await?;
        tx.execute(
            "INSERT INTO headings (id, title, list_id, user_id, is_default) \
             VALUES ($1, 'Default', $2, $3, TRUE)",
            &[&new_id(), &list_id, &user_id],
        )
        .await?;

        tx.commit().await?;
        Ok(row_to_list(&row))
    }

    async fn get_list(
        &self,
        user_id: &str,
        list_id: &str,
    ) -> Result<Option<ListRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, title, user_id, is_default, updated_at \
                 FROM lists WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL",
                &[&user_id, &list_id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_list))
    }

    async fn get_default_list(&self, user_id: &str) -> Result<Option<ListRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, title, user_id, is_default, updated_at \
                 FROM lists WHERE user_id = $1 AND is_default AND deleted_at IS NULL",
                &[&user_id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_list))
    }

    async fn list_lists(&self, user_id: &str) -> Result<Vec<ListRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, title, user_id, is_default, updated_at \
                 FROM lists WHERE user_id = $1 AND deleted_at IS NULL \
                 ORDER BY id",
                &[&user_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_list).collect())
    }

    async fn update_list(
        &self,
        user_id: &str,
        list_id: &str,
        title: &str,
    ) -> Result<Option<ListRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "UPDATE lists SET title = $3, updated_at = NOW() \
                 WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL \
                 RETURNING id, title, user_id, is_default, updated_at",
                &[&user_id, &list_id, &title],
            )
            .await?;
        Ok(row.as_ref().map(row_to_list))
    }

    async fn delete_list(
        &self,
        user_id: &str,
        list_id: &str,
    ) -> Result<DeleteListOutcome, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let Some(row) = tx
            .query_opt(
                "SELECT is_default FROM lists \
                 WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL \
                 FOR UPDATE",
                &[&user_id, &list_id],
            )
            .await?
        else {
            return Ok(DeleteListOutcome::NotFound);
        };
        if row.get::<_, bool>("is_default") {
            return Ok(DeleteListOutcome::Default);
        }

        tx.execute(
            "UPDATE tasks SET deleted_at = NOW(), updated_at = NOW() \
             WHERE user_id = $1 AND list_id = $2 AND deleted_at IS NULL",
            &[&user_id, &list_id],
        )
        .await?;
        tx.execute(
            "UPDATE headings SET deleted_at = NOW(), updated_at = NOW() \
             WHERE user_id = $1 AND list_id = $2 AND deleted_at IS NULL",
            &[&user_id, &list_id],
        )
        .await?;
        tx.execute(
            "UPDATE lists SET deleted_at = NOW(), updated_at = NOW() \
             WHERE user_id = $1 AND id = $2",
            &[&user_id, &list_id],
        )
        .await?;

        tx.commit().await?;
        Ok(DeleteListOutcome::Deleted)
    }
}

// ==================== HeadingStore ====================

#[async_trait::async_trait]
impl HeadingStore for PgBackend {
    async fn create_heading(
        &self,
        user_id: &str,
        list_id: &str,
        title: &str,
    ) -> Result<Option<HeadingRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let list = conn
            .query_opt(
                "SELECT 1 FROM lists WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL",
                &[&user_id, &list_id],
            )
            .await?;
        if list.is_none() {
            return Ok(None);
        }

        let row = conn
            .query_one(
                "INSERT INTO headings (id, title, list_id, user_id, is_default) \
                 VALUES ($1, $2, $3, $4, FALSE) \
                 RETURNING id, title, list_id, user_id, is_default, updated_at",
                &[&new_id(), &title, &list_id, &user_id],
            )
            .await?;
        Ok(Some(row_to_heading(&row)))
    }

    async fn get_heading(
        &self,
        user_id: &str,
        list_id: &str,
        heading_id: &str,
    ) -> Result<Option<HeadingRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, title, list_id, user_id, is_default, updated_at \
                 FROM headings \
                 WHERE user_id = $1 AND list_id = $2 AND id = $3 AND deleted_at IS NULL",
                &[&user_id, &list_id, &heading_id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_heading))
    }

    async fn list_headings(
        &self,
        user_id: &str,
        list_id: &str,
    ) -> Result<Vec<HeadingRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, title, list_id, user_id, is_default, updated_at \
                 FROM headings \
                 WHERE user_id = $1 AND list_id = $2 AND deleted_at IS NULL \
                 ORDER BY id",
                &[&user_id, &list_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_heading).collect())
    }

    async fn update_heading(
        &self,
        user_id: &str,
        list_id: &str,
        heading_id: &str,
        title: &str,
    ) -> Result<Option<HeadingRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "UPDATE headings SET title = $4, updated_at = NOW() \
                 WHERE user_id = $1 AND list_id = $2 AND id = $3 AND deleted_at IS NULL \
                 RETURNING id, title, list_id, user_id, is_default, updated_at",
                &[&user_id, &list_id, &heading_id, &title],
            )
            .await?;
        Ok(row.as_ref().map(row_to_heading))
    }

    async fn delete_heading(
        &self,
        user_id: &str,
        list_id: &str,
        heading_id: &str,
    ) -> Result<bool, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        // The default heading is never directly addressable, so it reads
        // as absent here.
        let heading = tx
            .query_opt(
                "SELECT 1 FROM headings \
                 WHERE user_id = $1 AND list_id = $2 AND id = $3 \
                   AND NOT is_default AND deleted_at IS NULL \
                 FOR UPDATE",
                &[&user_id, &list_id, &heading_id],
            )
            .await?;
        if heading.is_none() {
            return Ok(false);
        }

        tx.execute(
            "UPDATE tasks SET deleted_at = NOW(), updated_at = NOW() \
             WHERE user_id = $1 AND heading_id = $2 AND deleted_at IS NULL",
            &[&user_id, &heading_id],
        )
        .await?;
        tx.execute(
            "UPDATE headings SET deleted_at = NOW(), updated_at = NOW() \
             WHERE user_id = $1 AND id = $2",
            &[&user_id, &heading_id],
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn move_heading(
        &self,
        user_id: &str,
        heading_id: &str,
        new_list_id: &str,
    ) -> Result<bool, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let heading = tx
            .query_opt(
                "SELECT 1 FROM headings \
                 WHERE user_id = $1 AND id = $2 AND NOT is_default AND deleted_at IS NULL \
                 FOR UPDATE",
                &[&user_id, &heading_id],
            )
            .await?;
        if heading.is_none() {
            return Ok(false);
        }
        let list = tx
            .query_opt(
                "SELECT 1 FROM lists WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL",
                &[&user_id, &new_list_id],
            )
            .await?;
        if list.is_none() {
            return Ok(false);
        }

        tx.execute(
            "UPDATE headings SET list_id = $3, updated_at = NOW() \
             WHERE user_id = $1 AND id = $2",
            &[&user_id, &heading_id, &new_list_id],
        )
        .await?;
        tx.execute(
            "UPDATE tasks SET list_id = $3, updated_at = NOW() \
             WHERE user_id = $1 AND heading_id = $2 AND deleted_at IS NULL",
            &[&user_id, &heading_id, &new_list_id],
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

// ==================== TaskStore ====================

impl PgBackend {
    /// Task lookup that ignores `deleted_at`, for reading back a row that
    /// was just archived.
    async fn fetch_task_any(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             LEFT JOIN task_tags_view v ON v.task_id = t.id \
             WHERE t.user_id = $1 AND t.id = $2"
        );
        let row = conn.query_opt(&query, &[&user_id, &task_id]).await?;
        Ok(row.as_ref().map(row_to_task))
    }
}

#[async_trait::async_trait]
impl TaskStore for PgBackend {
    async fn create_task(
        &self,
        user_id: &str,
        input: &CreateTaskParams,
    ) -> Result<TaskWriteOutcome, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        // Placement resolution: explicit heading wins, then explicit list's
        // default heading, then the default list's default heading.
        let (list_id, heading_id) = if let Some(heading_id) = &input.heading_id {
            let Some(row) = tx
                .query_opt(
                    "SELECT id, list_id FROM headings \
                     WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL",
                    &[&user_id, heading_id],
                )
                .await?
            else {
                return Ok(TaskWriteOutcome::HeadingNotFound);
            };
            (row.get::<_, String>("list_id"), row.get::<_, String>("id"))
        } else if let Some(list_id) = &input.list_id {
            let list = tx
                .query_opt(
                    "SELECT 1 FROM lists WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL",
                    &[&user_id, list_id],
                )
                .await?;
            if list.is_none() {
                return Ok(TaskWriteOutcome::ListNotFound);
            }
            let Some(row) = tx
                .query_opt(
                    "SELECT id FROM headings \
                     WHERE user_id = $1 AND list_id = $2 AND is_default AND deleted_at IS NULL",
                    &[&user_id, list_id],
                )
                .await?
            else {
                return Ok(TaskWriteOutcome::DefaultHeadingNotFound);
            };
            (list_id.clone(), row.get::<_, String>("id"))
        } else {
            let Some(list) = tx
                .query_opt(
                    "SELECT id FROM lists \
                     WHERE user_id = $1 AND is_default AND deleted_at IS NULL",
                    &[&user_id],
                )
                .await?
            else {
                return Ok(TaskWriteOutcome::DefaultListNotFound);
            };
            let list_id: String = list.get("id");
            let Some(row) = tx
                .query_opt(
                    "SELECT id FROM headings \
                     WHERE user_id = $1 AND list_id = $2 AND is_default AND deleted_at IS NULL",
                    &[&user_id, &list_id],
                )
                .await?
            else {
                return Ok(TaskWriteOutcome::DefaultHeadingNotFound);
            };
            (list_id, row.get::<_, String>("id"))
        };

        let task_id = new_id();
        tx.execute(
            "INSERT INTO tasks \
             (id, title, description, start_date, deadline, start_time, end_time, \
              status_id, list_id, heading_id, user_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            &[
                &task_id,
                &input.title,
                &input.description,
                &input.start_date,
                &input.deadline,
                &input.start_time,
                &input.end_time,
                &TaskStatus::NotStarted.as_id(),
                &list_id,
                &heading_id,
                &user_id,
            ],
        )
        .await?;

        if !input.tags.is_empty() {
            let tag_ids = ensure_tags(&tx, user_id, &input.tags).await?;
            reconcile_task_tags(&tx, &task_id, &tag_ids).await?;
        }

        tx.commit().await?;

        match self.get_task(user_id, &task_id).await? {
            Some(task) => Ok(TaskWriteOutcome::Done(task)),
            None => Ok(TaskWriteOutcome::TaskNotFound),
        }
    }

    async fn get_task(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             LEFT JOIN task_tags_view v ON v.task_id = t.id \
             WHERE t.user_id = $1 AND t.id = $2 AND t.deleted_at IS NULL"
        );
        let row = conn.query_opt(&query, &[&user_id, &task_id]).await?;
        Ok(row.as_ref().map(row_to_task))
    }

    async fn update_task(
        &self,
        user_id: &str,
        task_id: &str,
        input: &UpdateTaskParams,
    ) -> Result<TaskWriteOutcome, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let existing = tx
            .query_opt(
                "SELECT 1 FROM tasks \
                 WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL \
                 FOR UPDATE",
                &[&user_id, &task_id],
            )
            .await?;
        if existing.is_none() {
            return Ok(TaskWriteOutcome::TaskNotFound);
        }

        // The statement is built from the provided fields only; clearing a
        // nullable column is an inline NULL so it takes no placeholder.
        let status_id = input.status.map(TaskStatus::as_id);
        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&user_id, &task_id];

        if let Some(title) = &input.title {
            params.push(title);
            sets.push(format!("title = ${}", params.len()));
        }
        if let Some(description) = &input.description {
            params.push(description);
            sets.push(format!("description = ${}", params.len()));
        }
        match &input.start_date {
            Some(Some(date)) => {
                params.push(date);
                sets.push(format!("start_date = ${}", params.len()));
            }
            Some(None) => sets.push("start_date = NULL".to_string()),
            None => {}
        }
        match &input.deadline {
            Some(Some(date)) => {
                params.push(date);
                sets.push(format!("deadline = ${}", params.len()));
            }
            Some(None) => sets.push("deadline = NULL".to_string()),
            None => {}
        }
        if let Some(status_id) = &status_id {
            params.push(status_id);
            sets.push(format!("status_id = ${}", params.len()));
        }
        sets.push("updated_at = NOW()".to_string());

        let query = format!(
            "UPDATE tasks SET {} WHERE user_id = $1 AND id = $2",
            sets.join(", ")
        );
        tx.execute(&query, &params).await?;

        if let Some(tags) = &input.tags {
            let tag_ids = ensure_tags(&tx, user_id, tags).await?;
            reconcile_task_tags(&tx, task_id, &tag_ids).await?;
        }

        tx.commit().await?;

        match self.get_task(user_id, task_id).await? {
            Some(task) => Ok(TaskWriteOutcome::Done(task)),
            None => Ok(TaskWriteOutcome::TaskNotFound),
        }
    }

    async fn update_task_time(
        &self,
        user_id: &str,
        task_id: &str,
        time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let updated = match time_range {
            Some((start, end)) => {
                conn.execute(
                    "UPDATE tasks SET start_time = $3, end_time = $4, updated_at = NOW() \
                     WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL",
                    &[&user_id, &task_id, &start, &end],
                )
                .await?
            }
            None => {
                conn.execute(
                    "UPDATE tasks SET start_time = NULL, end_time = NULL, updated_at = NOW() \
                     WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL",
                    &[&user_id, &task_id],
                )
                .await?
            }
        };
        if updated == 0 {
            return Ok(None);
        }
        self.get_task(user_id, task_id).await
    }

    async fn move_task_to_list(
        &self,
        user_id: &str,
        task_id: &str,
        list_id: &str,
    ) -> Result<TaskWriteOutcome, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let task = tx
            .query_opt(
                "SELECT 1 FROM tasks \
                 WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL FOR UPDATE",
                &[&user_id, &task_id],
            )
            .await?;
        if task.is_none() {
            return Ok(TaskWriteOutcome::TaskNotFound);
        }
        let list = tx
            .query_opt(
                "SELECT 1 FROM lists WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL",
                &[&user_id, &list_id],
            )
            .await?;
        if list.is_none() {
            return Ok(TaskWriteOutcome::ListNotFound);
        }
        let Some(heading) = tx
            .query_opt(
                "SELECT id FROM headings \
                 WHERE user_id = $1 AND list_id = $2 AND is_default AND deleted_at IS NULL",
                &[&user_id, &list_id],
            )
            .await?
        else {
            return Ok(TaskWriteOutcome::DefaultHeadingNotFound);
        };
        let heading_id: String = heading.get("id");

        tx.execute(
            "UPDATE tasks SET list_id = $3, heading_id = $4, updated_at = NOW() \
             WHERE user_id = $1 AND id = $2",
            &[&user_id, &task_id, &list_id, &heading_id],
        )
        .await?;
        tx.commit().await?;

        match self.get_task(user_id, task_id).await? {
            Some(task) => Ok(TaskWriteOutcome::Done(task)),
            None => Ok(TaskWriteOutcome::TaskNotFound),
        }
    }

    async fn move_task_to_heading(
        &self,
        user_id: &str,
        task_id: &str,
        heading_id: &str,
    ) -> Result<TaskWriteOutcome, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let task = tx
            .query_opt(
                "SELECT 1 FROM tasks \
                 WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL FOR UPDATE",
                &[&user_id, &task_id],
            )
            .await?;
        if task.is_none() {
            return Ok(TaskWriteOutcome::TaskNotFound);
        }
        let Some(heading) = tx
            .query_opt(
                "SELECT id, list_id FROM headings \
                 WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL",
                &[&user_id, &heading_id],
            )
            .await?
        else {
            return Ok(TaskWriteOutcome::HeadingNotFound);
        };
        let list_id: String = heading.get("list_id");

        tx.execute(
            "UPDATE tasks SET heading_id = $3, list_id = $4, updated_at = NOW() \
             WHERE user_id = $1 AND id = $2",
            &[&user_id, &task_id, &heading_id, &list_id],
        )
        .await?;
        tx.commit().await?;

        match self.get_task(user_id, task_id).await? {
            Some(task) => Ok(TaskWriteOutcome::Done(task)),
            None => Ok(TaskWriteOutcome::TaskNotFound),
        }
    }

    async fn complete_task(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE tasks SET status_id = $3, updated_at = NOW() \
                 WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL",
                &[&user_id, &task_id, &TaskStatus::Completed.as_id()],
            )
            .await?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_task(user_id, task_id).await
    }

    async fn archive_task(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE tasks SET status_id = $3, deleted_at = NOW(), updated_at = NOW() \
                 WHERE user_id = $1 AND id = $2 AND deleted_at IS NULL",
                &[&user_id, &task_id, &TaskStatus::Archived.as_id()],
            )
            .await?;
        if updated == 0 {
            return Ok(None);
        }
        self.fetch_task_any(user_id, task_id).await
    }
}

// ==================== TaskViewStore ====================

#[async_trait::async_trait]
impl TaskViewStore for PgBackend {
    async fn tasks_by_user(
        &self,
        user_id: &str,
        after_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             LEFT JOIN task_tags_view v ON v.task_id = t.id \
             WHERE t.user_id = $1 AND t.deleted_at IS NULL \
               AND ($2::text IS NULL OR t.id > $2) \
             ORDER BY t.id \
             LIMIT $3"
        );
        let rows = conn.query(&query, &[&user_id, &after_id, &limit]).await?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    async fn tasks_by_list(
        &self,
        user_id: &str,
        list_id: &str,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             LEFT JOIN task_tags_view v ON v.task_id = t.id \
             WHERE t.user_id = $1 AND t.list_id = $2 AND t.deleted_at IS NULL \
             ORDER BY t.id \
             LIMIT $3"
        );
        let rows = conn
            .query(&query, &[&user_id, &list_id, &limit])
            .await?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    async fn groups_by_heading(
        &self,
        user_id: &str,
        list_id: &str,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT h.id, h.title, \
                    COALESCE(json_agg({TASK_JSON} ORDER BY t.id) \
                             FILTER (WHERE t.id IS NOT NULL), '[]'::json) AS tasks \
             FROM headings h \
             LEFT JOIN tasks t ON t.heading_id = h.id AND t.deleted_at IS NULL \
             LEFT JOIN task_tags_view v ON v.task_id = t.id \
             WHERE h.user_id = $1 AND h.list_id = $2 AND h.deleted_at IS NULL \
             GROUP BY h.id, h.title \
             ORDER BY h.id \
             LIMIT $3"
        );
        let rows = conn
            .query(&query, &[&user_id, &list_id, &limit])
            .await?;
        Ok(rows
            .iter()
            .map(|row| RawTaskGroup {
                key: GroupKey::Heading {
                    id: row.get("id"),
                    title: row.get("title"),
                },
                tasks: row.get("tasks"),
            })
            .collect())
    }

    async fn today_groups(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT l.id, l.title, \
                    COALESCE(json_agg({TASK_JSON} ORDER BY t.id) \
                             FILTER (WHERE t.id IS NOT NULL), '[]'::json) AS tasks \
             FROM lists l \
             LEFT JOIN tasks t ON t.list_id = l.id AND t.deleted_at IS NULL \
                               AND t.start_date = CURRENT_DATE \
             LEFT JOIN task_tags_view v ON v.task_id = t.id \
             WHERE l.user_id = $1 AND l.deleted_at IS NULL \
             GROUP BY l.id, l.title \
             ORDER BY l.id \
             LIMIT $2"
        );
        let rows = conn.query(&query, &[&user_id, &limit]).await?;
        Ok(rows
            .iter()
            .map(|row| RawTaskGroup {
                key: GroupKey::List {
                    id: row.get("id"),
                    title: row.get("title"),
                },
                tasks: row.get("tasks"),
            })
            .collect())
    }

    async fn upcoming_groups(
        &self,
        user_id: &str,
        after: NaiveDate,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT t.start_date AS group_date, \
                    json_agg({TASK_JSON} ORDER BY t.id) AS tasks \
             FROM tasks t \
             LEFT JOIN task_tags_view v ON v.task_id = t.id \
             WHERE t.user_id = $1 AND t.deleted_at IS NULL AND t.start_date > $2 \
             GROUP BY t.start_date \
             ORDER BY t.start_date \
             LIMIT $3"
        );
        let rows = conn.query(&query, &[&user_id, &after, &limit]).await?;
        Ok(rows
            .iter()
            .map(|row| RawTaskGroup {
                key: GroupKey::Date(row.get("group_date")),
                tasks: row.get("tasks"),
            })
            .collect())
    }

    async fn overdue_groups(
        &self,
        user_id: &str,
        after_list_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT l.id, l.title, \
                    COALESCE(json_agg({TASK_JSON} ORDER BY t.id) \
                             FILTER (WHERE t.id IS NOT NULL), '[]'::json) AS tasks \
             FROM lists l \
             LEFT JOIN tasks t ON t.list_id = l.id AND t.deleted_at IS NULL \
                               AND t.deadline IS NOT NULL AND t.deadline <= CURRENT_DATE \
             LEFT JOIN task_tags_view v ON v.task_id = t.id \
             WHERE l.user_id = $1 AND l.deleted_at IS NULL \
               AND ($2::text IS NULL OR l.id > $2) \
             GROUP BY l.id, l.title \
             ORDER BY l.id \
             LIMIT $3"
        );
        let rows = conn
            .query(&query, &[&user_id, &after_list_id, &limit])
            .await?;
        Ok(rows
            .iter()
            .map(|row| RawTaskGroup {
                key: GroupKey::List {
                    id: row.get("id"),
                    title: row.get("title"),
                },
                tasks: row.get("tasks"),
            })
            .collect())
    }

    async fn someday_groups(
        &self,
        user_id: &str,
        after_list_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT l.id, l.title, \
                    COALESCE(json_agg({TASK_JSON} ORDER BY t.id) \
                             FILTER (WHERE t.id IS NOT NULL), '[]'::json) AS tasks \
             FROM lists l \
             LEFT JOIN tasks t ON t.list_id = l.id AND t.deleted_at IS NULL \
                               AND t.start_date IS NULL AND t.deadline > CURRENT_DATE \
             LEFT JOIN task_tags_view v ON v.task_id = t.id \
             WHERE l.user_id = $1 AND l.deleted_at IS NULL \
               AND ($2::text IS NULL OR l.id > $2) \
             GROUP BY l.id, l.title \
             ORDER BY l.id \
             LIMIT $3"
        );
        let rows = conn
            .query(&query, &[&user_id, &after_list_id, &limit])
            .await?;
        Ok(rows
            .iter()
            .map(|row| RawTaskGroup {
                key: GroupKey::List {
                    id: row.get("id"),
                    title: row.get("title"),
                },
                tasks: row.get("tasks"),
            })
            .collect())
    }

    async fn completed_groups(
        &self,
        user_id: &str,
        after: Option<NaiveDate>,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT date_trunc('month', t.updated_at)::date AS group_month, \
                    json_agg({TASK_JSON} ORDER BY t.id) AS tasks \
             FROM tasks t \
             LEFT JOIN task_tags_view v ON v.task_id = t.id \
             WHERE t.user_id = $1 AND t.deleted_at IS NULL AND t.status_id = $2 \
               AND ($3::date IS NULL \
                    OR date_trunc('month', t.updated_at)::date > date_trunc('month', $3::date)::date) \
             GROUP BY 1 \
             ORDER BY 1 \
             LIMIT $4"
        );
        let rows = conn
            .query(
                &query,
                &[&user_id, &TaskStatus::Completed.as_id(), &after, &limit],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| RawTaskGroup {
                key: GroupKey::Month(row.get("group_month")),
                tasks: row.get("tasks"),
            })
            .collect())
    }

    async fn archived_groups(
        &self,
        user_id: &str,
        before: Option<NaiveDate>,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let conn = self.conn().await?;
        // No deleted_at filter: archived rows are always soft-deleted.
        let query = format!(
            "SELECT date_trunc('month', t.updated_at)::date AS group_month, \
                    json_agg({TASK_JSON} ORDER BY t.id) AS tasks \
             FROM tasks t \
             LEFT JOIN task_tags_view v ON v.task_id = t.id \
             WHERE t.user_id = $1 AND t.status_id = $2 \
               AND ($3::date IS NULL \
                    OR date_trunc('month', t.updated_at)::date < date_trunc('month', $3::date)::date) \
             GROUP BY 1 \
             ORDER BY 1 DESC \
             LIMIT $4"
        );
        let rows = conn
            .query(
                &query,
                &[&user_id, &TaskStatus::Archived.as_id(), &before, &limit],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| RawTaskGroup {
                key: GroupKey::Month(row.get("group_month")),
                tasks: row.get("tasks"),
            })
            .collect())
    }
}

// ==================== TagStore ====================

#[async_trait::async_trait]
impl TagStore for PgBackend {
    async fn list_tags(&self, user_id: &str) -> Result<Vec<TagRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, title, user_id, updated_at \
                 FROM tags WHERE user_id = $1 \
                 ORDER BY title",
                &[&user_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| TagRecord {
                id: row.get("id"),
                title: row.get("title"),
                user_id: row.get("user_id"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }
}

// ==================== StatusStore ====================

#[async_trait::async_trait]
impl StatusStore for PgBackend {
    async fn list_statuses(&self) -> Result<Vec<StatusRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query("SELECT id, title FROM statuses ORDER BY id", &[])
            .await?;
        Ok(rows
            .iter()
            .map(|row| StatusRecord {
                id: row.get("id"),
                title: row.get("title"),
            })
            .collect())
    }

    async fn get_status(&self, status_id: i32) -> Result<Option<StatusRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT id, title FROM statuses WHERE id = $1", &[&status_id])
            .await?;
        Ok(row.map(|row| StatusRecord {
            id: row.get("id"),
            title: row.get("title"),
        }))
    }
}
