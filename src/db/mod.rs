//! Database abstraction layer.
//!
//! A backend-agnostic `Database` trait unifies all persistence operations;
//! `postgres` holds the only implementation. Sub-traits group related
//! methods so leaf consumers can depend on just the slice they use.
//!
//! Records are the live projection of a row: `deleted_at` never appears
//! here because soft-deleted rows are filtered out at the query layer.

pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// Create the database backend, run migrations, and return it.
pub async fn connect_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    let pg = postgres::PgBackend::new(config).await?;
    pg.run_migrations().await?;
    Ok(Arc::new(pg))
}

/// Task lifecycle state. Mirrors the seeded `statuses` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Planned,
    Completed,
    Archived,
}

impl TaskStatus {
    pub fn as_id(self) -> i32 {
        match self {
            Self::NotStarted => 1,
            Self::Planned => 2,
            Self::Completed => 3,
            Self::Archived => 4,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(Self::NotStarted),
            2 => Some(Self::Planned),
            3 => Some(Self::Completed),
            4 => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Planned => "Planned",
            Self::Completed => "Completed",
            Self::Archived => "Archived",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub user_id: String,
    pub device_id: String,
    pub refresh_token: String,
    pub last_visit_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListRecord {
    pub id: String,
    pub title: String,
    pub user_id: String,
    pub is_default: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeadingRecord {
    pub id: String,
    pub title: String,
    pub list_id: String,
    pub user_id: String,
    pub is_default: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub start_date: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status_id: i32,
    pub list_id: String,
    pub heading_id: String,
    pub user_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Derived on read: `deadline IS NOT NULL AND deadline <= CURRENT_DATE`.
    pub overdue: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub id: i32,
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagRecord {
    pub id: String,
    pub title: String,
    pub user_id: String,
    pub updated_at: DateTime<Utc>,
}

// ==================== Write params ====================

#[derive(Debug, Clone)]
pub struct CreateTaskParams {
    pub title: String,
    pub description: String,
    pub start_date: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub list_id: Option<String>,
    pub heading_id: Option<String>,
    pub tags: Vec<String>,
}

/// Partial update. Outer `Option` = "field present in the request";
/// inner `Option` = nullable columns that can be cleared.
#[derive(Debug, Clone, Default)]
pub struct UpdateTaskParams {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_date: Option<Option<NaiveDate>>,
    pub deadline: Option<Option<NaiveDate>>,
    pub status: Option<TaskStatus>,
    pub tags: Option<Vec<String>>,
}

impl UpdateTaskParams {
    /// True when the request carried no field at all.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.start_date.is_none()
            && self.deadline.is_none()
            && self.status.is_none()
            && self.tags.is_none()
    }
}

// ==================== Operation outcomes ====================

/// Result of the registration bootstrap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Created,
    Resurrected,
    /// A live user already owns this email.
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteListOutcome {
    Deleted,
    NotFound,
    /// The default list is not deletable.
    Default,
}

#[derive(Debug)]
pub enum EmailUpdateOutcome {
    Updated(UserRecord),
    NotFound,
    /// Another live user owns the requested email.
    Taken,
}

#[derive(Debug)]
pub enum TaskWriteOutcome {
    Done(TaskRecord),
    TaskNotFound,
    ListNotFound,
    HeadingNotFound,
    DefaultListNotFound,
    DefaultHeadingNotFound,
}

// ==================== Grouped views ====================

/// Key of one group in a grouped view response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKey {
    List { id: String, title: String },
    Heading { id: String, title: String },
    Date(NaiveDate),
    Month(NaiveDate),
}

/// One group as the persistence layer returns it: a key plus the member
/// tasks as an opaque JSON array, decoded by `views::decode_groups`.
#[derive(Debug, Clone)]
pub struct RawTaskGroup {
    pub key: GroupKey,
    pub tasks: serde_json::Value,
}

// ==================== Sub-traits ====================

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Registration bootstrap: in one transaction, insert (or resurrect)
    /// the user row and create the default list and heading. Locks the
    /// email candidate with `FOR UPDATE` to close the re-registration race.
    async fn bootstrap_user(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<BootstrapOutcome, DatabaseError>;

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, DatabaseError>;

    async fn update_user_email(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<EmailUpdateOutcome, DatabaseError>;

    /// Full purge: soft-deletes the user, sessions, devices, lists,
    /// headings, tasks, and task-tag links in one transaction. Tags stay.
    async fn delete_user_related_data(&self, user_id: &str) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert or revisit the `(user_id, user_agent)` device; refreshes
    /// `ip` and `latest_login_at`. Returns the device id.
    async fn register_device(
        &self,
        user_id: &str,
        user_agent: &str,
        ip: &str,
    ) -> Result<String, DatabaseError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Upsert the single session for a device.
    async fn save_session(&self, session: &SessionRecord) -> Result<(), DatabaseError>;

    async fn get_session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError>;

    async fn delete_session(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait ListStore: Send + Sync {
    /// Create a list and its default heading in one transaction.
    async fn create_list(&self, user_id: &str, title: &str) -> Result<ListRecord, DatabaseError>;

    async fn get_list(
        &self,
        user_id: &str,
        list_id: &str,
    ) -> Result<Option<ListRecord>, DatabaseError>;

    async fn get_default_list(&self, user_id: &str) -> Result<Option<ListRecord>, DatabaseError>;

    async fn list_lists(&self, user_id: &str) -> Result<Vec<ListRecord>, DatabaseError>;

    async fn update_list(
        &self,
        user_id: &str,
        list_id: &str,
        title: &str,
    ) -> Result<Option<ListRecord>, DatabaseError>;

    /// Soft-delete a non-default list with its headings and tasks.
    async fn delete_list(
        &self,
        user_id: &str,
        list_id: &str,
    ) -> Result<DeleteListOutcome, DatabaseError>;
}

#[async_trait]
pub trait HeadingStore: Send + Sync {
    /// Returns `None` when the list is absent for this user.
    async fn create_heading(
        &self,
        user_id: &str,
        list_id: &str,
        title: &str,
    ) -> Result<Option<HeadingRecord>, DatabaseError>;

    async fn get_heading(
        &self,
        user_id: &str,
        list_id: &str,
        heading_id: &str,
    ) -> Result<Option<HeadingRecord>, DatabaseError>;

    async fn list_headings(
        &self,
        user_id: &str,
        list_id: &str,
    ) -> Result<Vec<HeadingRecord>, DatabaseError>;

    async fn update_heading(
        &self,
        user_id: &str,
        list_id: &str,
        heading_id: &str,
        title: &str,
    ) -> Result<Option<HeadingRecord>, DatabaseError>;

    /// Soft-delete a non-default heading and its tasks. The default heading
    /// is excluded by the query, so it reads as absent.
    async fn delete_heading(
        &self,
        user_id: &str,
        list_id: &str,
        heading_id: &str,
    ) -> Result<bool, DatabaseError>;

    /// Re-point a heading and every task under it to another list, in one
    /// transaction. `false` when the heading or the target list is absent.
    async fn move_heading(
        &self,
        user_id: &str,
        heading_id: &str,
        new_list_id: &str,
    ) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(
        &self,
        user_id: &str,
        input: &CreateTaskParams,
    ) -> Result<TaskWriteOutcome, DatabaseError>;

    async fn get_task(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, DatabaseError>;

    /// Dynamic partial update; tags, when present, reconcile to exactly
    /// the provided set. The caller rejects empty param sets beforehand.
    async fn update_task(
        &self,
        user_id: &str,
        task_id: &str,
        input: &UpdateTaskParams,
    ) -> Result<TaskWriteOutcome, DatabaseError>;

    /// `Some` pair sets both columns, `None` clears both.
    async fn update_task_time(
        &self,
        user_id: &str,
        task_id: &str,
        time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Option<TaskRecord>, DatabaseError>;

    async fn move_task_to_list(
        &self,
        user_id: &str,
        task_id: &str,
        list_id: &str,
    ) -> Result<TaskWriteOutcome, DatabaseError>;

    async fn move_task_to_heading(
        &self,
        user_id: &str,
        task_id: &str,
        heading_id: &str,
    ) -> Result<TaskWriteOutcome, DatabaseError>;

    async fn complete_task(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, DatabaseError>;

    /// Sets status Archived and `deleted_at` together; the row stays
    /// reachable only through the archived view.
    async fn archive_task(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, DatabaseError>;
}

#[async_trait]
pub trait TaskViewStore: Send + Sync {
    async fn tasks_by_user(
        &self,
        user_id: &str,
        after_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, DatabaseError>;

    async fn tasks_by_list(
        &self,
        user_id: &str,
        list_id: &str,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, DatabaseError>;

    async fn groups_by_heading(
        &self,
        user_id: &str,
        list_id: &str,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError>;

    async fn today_groups(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError>;

    /// Groups keyed by start date, strictly after `after`.
    async fn upcoming_groups(
        &self,
        user_id: &str,
        after: NaiveDate,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError>;

    async fn overdue_groups(
        &self,
        user_id: &str,
        after_list_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError>;

    async fn someday_groups(
        &self,
        user_id: &str,
        after_list_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError>;

    /// Month groups of completed tasks, ascending, strictly after the
    /// month of `after` when given.
    async fn completed_groups(
        &self,
        user_id: &str,
        after: Option<NaiveDate>,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError>;

    /// Month groups of archived tasks, descending, strictly before the
    /// month of `before` when given. Opts in to soft-deleted rows.
    async fn archived_groups(
        &self,
        user_id: &str,
        before: Option<NaiveDate>,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError>;
}

#[async_trait]
pub trait TagStore: Send + Sync {
    async fn list_tags(&self, user_id: &str) -> Result<Vec<TagRecord>, DatabaseError>;
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn list_statuses(&self) -> Result<Vec<StatusRecord>, DatabaseError>;

    async fn get_status(&self, status_id: i32) -> Result<Option<StatusRecord>, DatabaseError>;
}

/// Backend-agnostic database supertrait combining all sub-traits.
#[async_trait]
pub trait Database:
    UserStore
    + DeviceStore
    + SessionStore
    + ListStore
    + HeadingStore
    + TaskStore
    + TaskViewStore
    + TagStore
    + StatusStore
    + Send
    + Sync
{
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Cheap liveness probe for the health endpoint.
    async fn ping(&self) -> Result<(), DatabaseError>;
}
