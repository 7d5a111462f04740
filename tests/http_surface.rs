//! End-to-end tests for the HTTP surface.
//!
//! These start a real server on a random port with an in-memory database
//! and a stub SSO, then drive the full request pipeline with reqwest:
//! envelopes, auth rejection, validation, cursor typing, default-list
//! protection, archive visibility, and cross-user isolation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use tower::Layer;
use tower_http::normalize_path::NormalizePathLayer;
use ulid::Ulid;

use taskdeck::auth::TokenVerifier;
use taskdeck::config::Config;
use taskdeck::db::{
    BootstrapOutcome, CreateTaskParams, Database, DeleteListOutcome, DeviceStore,
    EmailUpdateOutcome, GroupKey, HeadingRecord, HeadingStore, ListRecord, ListStore,
    RawTaskGroup, SessionRecord, SessionStore, StatusRecord, StatusStore, TagRecord, TagStore,
    TaskRecord, TaskStatus, TaskStore, TaskViewStore, TaskWriteOutcome, UpdateTaskParams,
    UserRecord, UserStore,
};
use taskdeck::error::{DatabaseError, SsoError};
use taskdeck::http::AppState;
use taskdeck::sso::{AuthenticatedUser, SsoClient, TokenData};

const SIGNING_KEY: &str = "test-signing-key";

fn issue_token(user_id: &str) -> String {
    encode(
        &Header::default(),
        &serde_json::json!({"uid": user_id, "exp": Utc::now().timestamp() + 3600}),
        &EncodingKey::from_secret(SIGNING_KEY.as_bytes()),
    )
    .unwrap()
}

// ==================== Stub SSO ====================

struct StubSso {
    counter: AtomicU64,
    known: Mutex<HashMap<String, String>>, // email -> user_id
}

impl StubSso {
    fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            known: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SsoClient for StubSso {
    async fn register(
        &self,
        email: &str,
        _password: &str,
        _app_id: i32,
    ) -> Result<AuthenticatedUser, SsoError> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        let user_id = Ulid::new().to_string();
        self.known
            .lock()
            .unwrap()
            .insert(email.to_string(), user_id.clone());
        Ok(AuthenticatedUser {
            token: TokenData {
                access_token: issue_token(&user_id),
                refresh_token: Ulid::new().to_string(),
            },
            user_id,
        })
    }

    async fn login(
        &self,
        email: &str,
        _password: &str,
        _app_id: i32,
    ) -> Result<AuthenticatedUser, SsoError> {
        let known = self.known.lock().unwrap();
        let user_id = known.get(email).cloned().ok_or(SsoError::InvalidCredentials)?;
        Ok(AuthenticatedUser {
            token: TokenData {
                access_token: issue_token(&user_id),
                refresh_token: Ulid::new().to_string(),
            },
            user_id,
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenData, SsoError> {
        Ok(TokenData {
            access_token: "refreshed-access".to_string(),
            refresh_token: Ulid::new().to_string(),
        })
    }

    async fn logout(&self, _refresh_token: &str) -> Result<(), SsoError> {
        Ok(())
    }

    async fn verify_email(&self, _token: &str) -> Result<(), SsoError> {
        Ok(())
    }

    async fn reset_password(&self, _email: &str) -> Result<(), SsoError> {
        Ok(())
    }

    async fn change_password(
        &self,
        _email: &str,
        _current_password: &str,
        _new_password: &str,
    ) -> Result<(), SsoError> {
        Ok(())
    }

    async fn get_jwks(&self) -> Result<jsonwebtoken::jwk::JwkSet, SsoError> {
        Err(SsoError::Transport("not implemented".to_string()))
    }
}

// ==================== In-memory database ====================

#[derive(Default)]
struct MemDb {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    users: Vec<UserRecord>,
    deleted_emails: Vec<String>,
    sessions: Vec<SessionRecord>,
    lists: Vec<ListRecord>,
    headings: Vec<HeadingRecord>,
    tasks: Vec<TaskRecord>,
    /// Archived tasks are soft-deleted; kept aside so live queries skip
    /// them and the archived view still sees them.
    archived: Vec<TaskRecord>,
    tags: Vec<TagRecord>,
}

fn new_id() -> String {
    Ulid::new().to_string()
}

impl Inner {
    fn create_defaults(&mut self, user_id: &str) {
        let list_id = new_id();
        self.lists.push(ListRecord {
            id: list_id.clone(),
            title: "Inbox".to_string(),
            user_id: user_id.to_string(),
            is_default: true,
            updated_at: Utc::now(),
        });
        self.headings.push(HeadingRecord {
            id: new_id(),
            title: "Default".to_string(),
            list_id,
            user_id: user_id.to_string(),
            is_default: true,
            updated_at: Utc::now(),
        });
    }

    fn default_heading_of(&self, user_id: &str, list_id: &str) -> Option<HeadingRecord> {
        self.headings
            .iter()
            .find(|h| h.user_id == user_id && h.list_id == list_id && h.is_default)
            .cloned()
    }
}

#[async_trait]
impl UserStore for MemDb {
    async fn bootstrap_user(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<BootstrapOutcome, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.users.iter().any(|u| u.email == email) {
            return Ok(BootstrapOutcome::AlreadyExists);
        }
        let resurrected = inner.deleted_emails.iter().any(|e| e == email);
        inner.deleted_emails.retain(|e| e != email);
        inner.users.push(UserRecord {
            id: user_id.to_string(),
            email: email.to_string(),
            password_hash: String::new(),
            updated_at: Utc::now(),
        });
        inner.create_defaults(user_id);
        Ok(if resurrected {
            BootstrapOutcome::Resurrected
        } else {
            BootstrapOutcome::Created
        })
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.users.iter().find(|u| u.id == user_id).cloned())
    }

    async fn update_user_email(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<EmailUpdateOutcome, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.users.iter().any(|u| u.id != user_id && u.email == email) {
            return Ok(EmailUpdateOutcome::Taken);
        }
        let Some(user) = inner.users.iter_mut().find(|u| u.id == user_id) else {
            return Ok(EmailUpdateOutcome::NotFound);
        };
        user.email = email.to_string();
        user.updated_at = Utc::now();
        Ok(EmailUpdateOutcome::Updated(user.clone()))
    }

    async fn delete_user_related_data(&self, user_id: &str) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner.users.iter().position(|u| u.id == user_id) else {
            return Ok(false);
        };
        let user = inner.users.remove(pos);
        inner.deleted_emails.push(user.email);
        inner.sessions.retain(|s| s.user_id != user_id);
        inner.lists.retain(|l| l.user_id != user_id);
        inner.headings.retain(|h| h.user_id != user_id);
        inner.tasks.retain(|t| t.user_id != user_id);
        inner.archived.retain(|t| t.user_id != user_id);
        Ok(true)
    }
}

#[async_trait]
impl DeviceStore for MemDb {
    async fn register_device(
        &self,
        _user_id: &str,
        _user_agent: &str,
        _ip: &str,
    ) -> Result<String, DatabaseError> {
        Ok(new_id())
    }
}

#[async_trait]
impl SessionStore for MemDb {
    async fn save_session(&self, session: &SessionRecord) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sessions
            .retain(|s| !(s.user_id == session.user_id && s.device_id == session.device_id));
        inner.sessions.push(session.clone());
        Ok(())
    }

    async fn get_session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .iter()
            .find(|s| s.refresh_token == refresh_token)
            .cloned())
    }

    async fn delete_session(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.sessions.len();
        inner
            .sessions
            .retain(|s| !(s.user_id == user_id && s.device_id == device_id));
        Ok(inner.sessions.len() < before)
    }
}

#[async_trait]
impl ListStore for MemDb {
    async fn create_list(&self, user_id: &str, title: &str) -> Result<ListRecord, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        let list = ListRecord {
            id: new_id(),
            title: title.to_string(),
            user_id: user_id.to_string(),
            is_default: false,
            updated_at: Utc::now(),
        };
        let heading = HeadingRecord {
            id: new_id(),
            title: "Default".to_string(),
            list_id: list.id.clone(),
            user_id: user_id.to_string(),
            is_default: true,
            updated_at: Utc::now(),
        };
        inner.lists.push(list.clone());
        inner.headings.push(heading);
        Ok(list)
    }

    async fn get_list(
        &self,
        user_id: &str,
        list_id: &str,
    ) -> Result<Option<ListRecord>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .lists
            .iter()
            .find(|l| l.user_id == user_id && l.id == list_id)
            .cloned())
    }

    async fn get_default_list(&self, user_id: &str) -> Result<Option<ListRecord>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .lists
            .iter()
            .find(|l| l.user_id == user_id && l.is_default)
            .cloned())
    }

    async fn list_lists(&self, user_id: &str) -> Result<Vec<ListRecord>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        let mut lists: Vec<_> = inner
            .lists
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        lists.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(lists)
    }

    async fn update_list(
        &self,
        user_id: &str,
        list_id: &str,
        title: &str,
    ) -> Result<Option<ListRecord>, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(list) = inner
            .lists
            .iter_mut()
            .find(|l| l.user_id == user_id && l.id == list_id)
        else {
            return Ok(None);
        };
        list.title = title.to_string();
        list.updated_at = Utc::now();
        Ok(Some(list.clone()))
    }

    async fn delete_list(
        &self,
        user_id: &str,
        list_id: &str,
    ) -> Result<DeleteListOutcome, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(list) = inner
            .lists
            .iter()
            .find(|l| l.user_id == user_id && l.id == list_id)
            .cloned()
        else {
            return Ok(DeleteListOutcome::NotFound);
        };
        if list.is_default {
            return Ok(DeleteListOutcome::Default);
        }
        inner.lists.retain(|l| l.id != list_id);
        inner.headings.retain(|h| h.list_id != list_id);
        inner.tasks.retain(|t| t.list_id != list_id);
        Ok(DeleteListOutcome::Deleted)
    }
}

#[async_trait]
impl HeadingStore for MemDb {
    async fn create_heading(
        &self,
        user_id: &str,
        list_id: &str,
        title: &str,
    ) -> Result<Option<HeadingRecord>, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner
            .lists
            .iter()
            .any(|l| l.user_id == user_id && l.id == list_id)
        {
            return Ok(None);
        }
        let heading = HeadingRecord {
            id: new_id(),
            title: title.to_string(),
            list_id: list_id.to_string(),
            user_id: user_id.to_string(),
            is_default: false,
            updated_at: Utc::now(),
        };
        inner.headings.push(heading.clone());
        Ok(Some(heading))
    }

    async fn get_heading(
        &self,
        user_id: &str,
        list_id: &str,
        heading_id: &str,
    ) -> Result<Option<HeadingRecord>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .headings
            .iter()
            .find(|h| h.user_id == user_id && h.list_id == list_id && h.id == heading_id)
            .cloned())
    }

    async fn list_headings(
        &self,
        user_id: &str,
        list_id: &str,
    ) -> Result<Vec<HeadingRecord>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .headings
            .iter()
            .filter(|h| h.user_id == user_id && h.list_id == list_id)
            .cloned()
            .collect())
    }

    async fn update_heading(
        &self,
        user_id: &str,
        list_id: &str,
        heading_id: &str,
        title: &str,
    ) -> Result<Option<HeadingRecord>, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(heading) = inner
            .headings
            .iter_mut()
            .find(|h| h.user_id == user_id && h.list_id == list_id && h.id == heading_id)
        else {
            return Ok(None);
        };
        heading.title = title.to_string();
        heading.updated_at = Utc::now();
        Ok(Some(heading.clone()))
    }

    async fn delete_heading(
        &self,
        user_id: &str,
        list_id: &str,
        heading_id: &str,
    ) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        let exists = inner.headings.iter().any(|h| {
            h.user_id == user_id && h.list_id == list_id && h.id == heading_id && !h.is_default
        });
        if !exists {
            return Ok(false);
        }
        inner.headings.retain(|h| h.id != heading_id);
        inner.tasks.retain(|t| t.heading_id != heading_id);
        Ok(true)
    }

    async fn move_heading(
        &self,
        user_id: &str,
        heading_id: &str,
        new_list_id: &str,
    ) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner
            .lists
            .iter()
            .any(|l| l.user_id == user_id && l.id == new_list_id)
        {
            return Ok(false);
        }
        let moved = inner
            .headings
            .iter_mut()
            .find(|h| h.user_id == user_id && h.id == heading_id && !h.is_default)
            .map(|h| {
                h.list_id = new_list_id.to_string();
                h.updated_at = Utc::now();
            })
            .is_some();
        if moved {
            for task in inner
                .tasks
                .iter_mut()
                .filter(|t| t.user_id == user_id && t.heading_id == heading_id)
            {
                task.list_id = new_list_id.to_string();
                task.updated_at = Utc::now();
            }
        }
        Ok(moved)
    }
}

#[async_trait]
impl TaskStore for MemDb {
    async fn create_task(
        &self,
        user_id: &str,
        input: &CreateTaskParams,
    ) -> Result<TaskWriteOutcome, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();

        let (list_id, heading_id) = if let Some(heading_id) = &input.heading_id {
            let Some(heading) = inner
                .headings
                .iter()
                .find(|h| h.user_id == user_id && h.id == *heading_id)
            else {
                return Ok(TaskWriteOutcome::HeadingNotFound);
            };
            (heading.list_id.clone(), heading.id.clone())
        } else if let Some(list_id) = &input.list_id {
            if !inner
                .lists
                .iter()
                .any(|l| l.user_id == user_id && l.id == *list_id)
            {
                return Ok(TaskWriteOutcome::ListNotFound);
            }
            let Some(heading) = inner.default_heading_of(user_id, list_id) else {
                return Ok(TaskWriteOutcome::DefaultHeadingNotFound);
            };
            (list_id.clone(), heading.id)
        } else {
            let Some(list) = inner
                .lists
                .iter()
                .find(|l| l.user_id == user_id && l.is_default)
                .cloned()
            else {
                return Ok(TaskWriteOutcome::DefaultListNotFound);
            };
            let Some(heading) = inner.default_heading_of(user_id, &list.id) else {
                return Ok(TaskWriteOutcome::DefaultHeadingNotFound);
            };
            (list.id, heading.id)
        };

        let task = TaskRecord {
            id: new_id(),
            title: input.title.clone(),
            description: input.description.clone(),
            start_date: input.start_date,
            deadline: input.deadline,
            start_time: input.start_time,
            end_time: input.end_time,
            status_id: TaskStatus::NotStarted.as_id(),
            list_id,
            heading_id,
            user_id: user_id.to_string(),
            tags: input.tags.clone(),
            overdue: input
                .deadline
                .map(|d| d <= Utc::now().date_naive())
                .unwrap_or(false),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        inner.tasks.push(task.clone());
        Ok(TaskWriteOutcome::Done(task))
    }

    async fn get_task(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tasks
            .iter()
            .find(|t| t.user_id == user_id && t.id == task_id)
            .cloned())
    }

    async fn update_task(
        &self,
        user_id: &str,
        task_id: &str,
        input: &UpdateTaskParams,
    ) -> Result<TaskWriteOutcome, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner
            .tasks
            .iter_mut()
            .find(|t| t.user_id == user_id && t.id == task_id)
        else {
            return Ok(TaskWriteOutcome::TaskNotFound);
        };
        if let Some(title) = &input.title {
            task.title = title.clone();
        }
        if let Some(description) = &input.description {
            task.description = description.clone();
        }
        if let Some(start_date) = &input.start_date {
            task.start_date = *start_date;
        }
        if let Some(deadline) = &input.deadline {
            task.deadline = *deadline;
        }
        if let Some(status) = input.status {
            task.status_id = status.as_id();
        }
        if let Some(tags) = &input.tags {
            task.tags = tags.clone();
        }
        task.updated_at = Utc::now();
        Ok(TaskWriteOutcome::Done(task.clone()))
    }

    async fn update_task_time(
        &self,
        user_id: &str,
        task_id: &str,
        time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner
            .tasks
            .iter_mut()
            .find(|t| t.user_id == user_id && t.id == task_id)
        else {
            return Ok(None);
        };
        match time_range {
            Some((start, end)) => {
                task.start_time = Some(start);
                task.end_time = Some(end);
            }
            None => {
                task.start_time = None;
                task.end_time = None;
            }
        }
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn move_task_to_list(
        &self,
        user_id: &str,
        task_id: &str,
        list_id: &str,
    ) -> Result<TaskWriteOutcome, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.tasks.iter().any(|t| t.user_id == user_id && t.id == task_id) {
            return Ok(TaskWriteOutcome::TaskNotFound);
        }
        if !inner.lists.iter().any(|l| l.user_id == user_id && l.id == list_id) {
            return Ok(TaskWriteOutcome::ListNotFound);
        }
        let Some(heading) = inner.default_heading_of(user_id, list_id) else {
            return Ok(TaskWriteOutcome::DefaultHeadingNotFound);
        };
        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.user_id == user_id && t.id == task_id)
            .unwrap();
        task.list_id = list_id.to_string();
        task.heading_id = heading.id;
        task.updated_at = Utc::now();
        Ok(TaskWriteOutcome::Done(task.clone()))
    }

    async fn move_task_to_heading(
        &self,
        user_id: &str,
        task_id: &str,
        heading_id: &str,
    ) -> Result<TaskWriteOutcome, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(heading) = inner
            .headings
            .iter()
            .find(|h| h.user_id == user_id && h.id == heading_id)
            .cloned()
        else {
            return Ok(TaskWriteOutcome::HeadingNotFound);
        };
        let Some(task) = inner
            .tasks
            .iter_mut()
            .find(|t| t.user_id == user_id && t.id == task_id)
        else {
            return Ok(TaskWriteOutcome::TaskNotFound);
        };
        task.heading_id = heading.id;
        task.list_id = heading.list_id;
        task.updated_at = Utc::now();
        Ok(TaskWriteOutcome::Done(task.clone()))
    }

    async fn complete_task(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner
            .tasks
            .iter_mut()
            .find(|t| t.user_id == user_id && t.id == task_id)
        else {
            return Ok(None);
        };
        task.status_id = TaskStatus::Completed.as_id();
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn archive_task(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner
            .tasks
            .iter()
            .position(|t| t.user_id == user_id && t.id == task_id)
        else {
            return Ok(None);
        };
        let mut task = inner.tasks.remove(pos);
        task.status_id = TaskStatus::Archived.as_id();
        task.updated_at = Utc::now();
        inner.archived.push(task.clone());
        Ok(Some(task))
    }
}

fn tasks_json(tasks: &[TaskRecord]) -> serde_json::Value {
    serde_json::to_value(tasks).unwrap()
}

#[async_trait]
impl TaskViewStore for MemDb {
    async fn tasks_by_user(
        &self,
        user_id: &str,
        after_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<_> = inner
            .tasks
            .iter()
            .filter(|t| t.user_id == user_id)
            .filter(|t| after_id.map(|c| t.id.as_str() > c).unwrap_or(true))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks.truncate(limit as usize);
        Ok(tasks)
    }

    async fn tasks_by_list(
        &self,
        user_id: &str,
        list_id: &str,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<_> = inner
            .tasks
            .iter()
            .filter(|t| t.user_id == user_id && t.list_id == list_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks.truncate(limit as usize);
        Ok(tasks)
    }

    async fn groups_by_heading(
        &self,
        user_id: &str,
        list_id: &str,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        let mut groups: Vec<_> = inner
            .headings
            .iter()
            .filter(|h| h.user_id == user_id && h.list_id == list_id)
            .map(|h| {
                let tasks: Vec<_> = inner
                    .tasks
                    .iter()
                    .filter(|t| t.heading_id == h.id)
                    .cloned()
                    .collect();
                RawTaskGroup {
                    key: GroupKey::Heading {
                        id: h.id.clone(),
                        title: h.title.clone(),
                    },
                    tasks: tasks_json(&tasks),
                }
            })
            .collect();
        groups.truncate(limit as usize);
        Ok(groups)
    }

    async fn today_groups(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let today = Utc::now().date_naive();
        let inner = self.inner.lock().unwrap();
        let mut groups: Vec<_> = inner
            .lists
            .iter()
            .filter(|l| l.user_id == user_id)
            .map(|l| {
                let tasks: Vec<_> = inner
                    .tasks
                    .iter()
                    .filter(|t| t.list_id == l.id && t.start_date == Some(today))
                    .cloned()
                    .collect();
                RawTaskGroup {
                    key: GroupKey::List {
                        id: l.id.clone(),
                        title: l.title.clone(),
                    },
                    tasks: tasks_json(&tasks),
                }
            })
            .collect();
        groups.sort_by(|a, b| group_id(a).cmp(&group_id(b)));
        groups.truncate(limit as usize);
        Ok(groups)
    }

    async fn upcoming_groups(
        &self,
        user_id: &str,
        after: NaiveDate,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        let mut dates: Vec<NaiveDate> = inner
            .tasks
            .iter()
            .filter(|t| t.user_id == user_id)
            .filter_map(|t| t.start_date)
            .filter(|d| *d > after)
            .collect();
        dates.sort();
        dates.dedup();
        dates.truncate(limit as usize);
        Ok(dates
            .into_iter()
            .map(|date| {
                let tasks: Vec<_> = inner
                    .tasks
                    .iter()
                    .filter(|t| t.user_id == user_id && t.start_date == Some(date))
                    .cloned()
                    .collect();
                RawTaskGroup {
                    key: GroupKey::Date(date),
                    tasks: tasks_json(&tasks),
                }
            })
            .collect())
    }

    async fn overdue_groups(
        &self,
        user_id: &str,
        after_list_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let today = Utc::now().date_naive();
        let inner = self.inner.lock().unwrap();
        let mut lists: Vec<_> = inner
            .lists
            .iter()
            .filter(|l| l.user_id == user_id)
            .filter(|l| after_list_id.map(|c| l.id.as_str() > c).unwrap_or(true))
            .cloned()
            .collect();
        lists.sort_by(|a, b| a.id.cmp(&b.id));
        lists.truncate(limit as usize);
        Ok(lists
            .into_iter()
            .map(|l| {
                let tasks: Vec<_> = inner
                    .tasks
                    .iter()
                    .filter(|t| {
                        t.list_id == l.id && t.deadline.map(|d| d <= today).unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                RawTaskGroup {
                    key: GroupKey::List {
                        id: l.id,
                        title: l.title,
                    },
                    tasks: tasks_json(&tasks),
                }
            })
            .collect())
    }

    async fn someday_groups(
        &self,
        user_id: &str,
        after_list_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let today = Utc::now().date_naive();
        let inner = self.inner.lock().unwrap();
        let mut lists: Vec<_> = inner
            .lists
            .iter()
            .filter(|l| l.user_id == user_id)
            .filter(|l| after_list_id.map(|c| l.id.as_str() > c).unwrap_or(true))
            .cloned()
            .collect();
        lists.sort_by(|a, b| a.id.cmp(&b.id));
        lists.truncate(limit as usize);
        Ok(lists
            .into_iter()
            .map(|l| {
                let tasks: Vec<_> = inner
                    .tasks
                    .iter()
                    .filter(|t| {
                        t.list_id == l.id
                            && t.start_date.is_none()
                            && t.deadline.map(|d| d > today).unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                RawTaskGroup {
                    key: GroupKey::List {
                        id: l.id,
                        title: l.title,
                    },
                    tasks: tasks_json(&tasks),
                }
            })
            .collect())
    }

    async fn completed_groups(
        &self,
        user_id: &str,
        _after: Option<NaiveDate>,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        let tasks: Vec<_> = inner
            .tasks
            .iter()
            .filter(|t| t.user_id == user_id && t.status_id == TaskStatus::Completed.as_id())
            .cloned()
            .collect();
        let mut groups = month_groups(tasks);
        groups.truncate(limit as usize);
        Ok(groups)
    }

    async fn archived_groups(
        &self,
        user_id: &str,
        _before: Option<NaiveDate>,
        limit: i64,
    ) -> Result<Vec<RawTaskGroup>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        let tasks: Vec<_> = inner
            .archived
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        let mut groups = month_groups(tasks);
        groups.reverse();
        groups.truncate(limit as usize);
        Ok(groups)
    }
}

fn group_id(group: &RawTaskGroup) -> String {
    match &group.key {
        GroupKey::List { id, .. } | GroupKey::Heading { id, .. } => id.clone(),
        GroupKey::Date(d) | GroupKey::Month(d) => d.to_string(),
    }
}

fn month_groups(tasks: Vec<TaskRecord>) -> Vec<RawTaskGroup> {
    let mut months: Vec<NaiveDate> = tasks
        .iter()
        .map(|t| t.updated_at.date_naive().with_day(1).unwrap())
        .collect();
    months.sort();
    months.dedup();
    months
        .into_iter()
        .map(|month| {
            let member: Vec<_> = tasks
                .iter()
                .filter(|t| t.updated_at.date_naive().with_day(1).unwrap() == month)
                .cloned()
                .collect();
            RawTaskGroup {
                key: GroupKey::Month(month),
                tasks: tasks_json(&member),
            }
        })
        .collect()
}

#[async_trait]
impl TagStore for MemDb {
    async fn list_tags(&self, user_id: &str) -> Result<Vec<TagRecord>, DatabaseError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tags
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StatusStore for MemDb {
    async fn list_statuses(&self) -> Result<Vec<StatusRecord>, DatabaseError> {
        Ok([
            TaskStatus::NotStarted,
            TaskStatus::Planned,
            TaskStatus::Completed,
            TaskStatus::Archived,
        ]
        .into_iter()
        .map(|s| StatusRecord {
            id: s.as_id(),
            title: s.title().to_string(),
        })
        .collect())
    }

    async fn get_status(&self, status_id: i32) -> Result<Option<StatusRecord>, DatabaseError> {
        Ok(TaskStatus::from_id(status_id).map(|s| StatusRecord {
            id: s.as_id(),
            title: s.title().to_string(),
        }))
    }
}

#[async_trait]
impl Database for MemDb {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

// ==================== Harness ====================

fn test_config() -> Config {
    let kv = HashMap::from([
        ("DB_NAME".to_string(), "taskdeck".to_string()),
        ("DB_USER".to_string(), "taskdeck".to_string()),
        ("SSO_CLIENT_ADDRESS".to_string(), "http://127.0.0.1:1".to_string()),
        ("JWT_SIGNING_KEY".to_string(), SIGNING_KEY.to_string()),
    ]);
    Config::from_kv(&kv).unwrap()
}

async fn spawn_server() -> SocketAddr {
    let config = Arc::new(test_config());
    let state = AppState::new(
        config,
        Arc::new(MemDb::default()),
        Arc::new(StubSso::new()),
        Arc::new(TokenVerifier::hs256(SIGNING_KEY)),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = taskdeck::http::router(state);
    let app = NormalizePathLayer::trim_trailing_slash().layer(app);
    tokio::spawn(async move {
        use axum::ServiceExt;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

struct Client {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl Client {
    async fn new() -> Self {
        let addr = spawn_server().await;
        Self {
            http: reqwest::Client::new(),
            base: format!("http://{addr}"),
            token: None,
        }
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.authed(self.http.get(format!("{}{}", self.base, path)))
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.authed(self.http.post(format!("{}{}", self.base, path)))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn patch(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.authed(self.http.patch(format!("{}{}", self.base, path)))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn delete(&self, path: &str) -> reqwest::Response {
        self.authed(self.http.delete(format!("{}{}", self.base, path)))
            .send()
            .await
            .unwrap()
    }

    /// Register a user and keep their access token for later calls.
    async fn register(&mut self, email: &str) -> serde_json::Value {
        let response = self
            .post(
                "/register",
                serde_json::json!({"email": email, "password": "pw12345678", "app_id": 1}),
            )
            .await;
        assert_eq!(response.status(), 201);
        let cookies: Vec<_> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .collect();
        assert!(!cookies.is_empty(), "register must set the refresh cookie");
        let body: serde_json::Value = response.json().await.unwrap();
        self.token = Some(body["data"]["access_token"].as_str().unwrap().to_string());
        body
    }
}

// ==================== Tests ====================

#[tokio::test]
async fn health_reports_ok_envelope() {
    let client = Client::new().await;
    let response = client.get("/health").await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], 200);
    assert_eq!(body["status_text"], "OK");
    assert_eq!(body["data"]["database"], "ok");
}

#[tokio::test]
async fn protected_route_requires_token() {
    let client = Client::new().await;
    let response = client.get("/user/tasks").await;
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "missing_auth_token");
    assert_eq!(body["status_code"], 401);
    assert!(body["time"].is_string());
}

#[tokio::test]
async fn garbage_token_rejected() {
    let mut client = Client::new().await;
    client.token = Some("not-a-jwt".to_string());
    let response = client.get("/user/tasks").await;
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_auth_token");
}

#[tokio::test]
async fn register_bootstraps_default_list_and_heading() {
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let response = client.get("/user/lists/default").await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data"]["title"], "Inbox");
    assert_eq!(body["data"]["is_default"], true);

    let list_id = body["data"]["id"].as_str().unwrap().to_string();
    let response = client
        .get(&format!("/user/lists/{list_id}/headings/"))
        .await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    let headings = body["data"].as_array().unwrap();
    assert_eq!(headings.len(), 1);
    assert_eq!(headings[0]["title"], "Default");
    assert_eq!(headings[0]["is_default"], true);
}

#[tokio::test]
async fn create_task_in_default_list() {
    // S1: register, post a task to the default list, get a task id back.
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let response = client
        .post("/user/lists/default", serde_json::json!({"title": "buy milk"}))
        .await;
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    let task_id = body["data"]["task_id"].as_str().unwrap();
    assert!(!task_id.is_empty());

    let response = client.get(&format!("/user/tasks/{task_id}")).await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data"]["title"], "buy milk");
    assert_eq!(body["data"]["status_id"], 1);
}

#[tokio::test]
async fn default_list_delete_rejected() {
    // S2: deleting the default list is a 400.
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let response = client.get("/user/lists/default").await;
    let body: serde_json::Value = response.json().await.unwrap();
    let list_id = body["data"]["id"].as_str().unwrap().to_string();

    let response = client.delete(&format!("/user/lists/{list_id}")).await;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "cannot_delete_default_list");

    // Everything is still there.
    let response = client.get("/user/lists/default").await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn heading_move_cascades_task_list() {
    // S3: moving a heading re-points its tasks to the target list.
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let a: serde_json::Value = client
        .post("/user/lists/", serde_json::json!({"title": "A"}))
        .await
        .json()
        .await
        .unwrap();
    let b: serde_json::Value = client
        .post("/user/lists/", serde_json::json!({"title": "B"}))
        .await
        .json()
        .await
        .unwrap();
    let list_a = a["data"]["id"].as_str().unwrap().to_string();
    let list_b = b["data"]["id"].as_str().unwrap().to_string();

    let h: serde_json::Value = client
        .post(
            &format!("/user/lists/{list_a}/headings/"),
            serde_json::json!({"title": "H"}),
        )
        .await
        .json()
        .await
        .unwrap();
    let heading = h["data"]["id"].as_str().unwrap().to_string();

    let t: serde_json::Value = client
        .post(
            &format!("/user/lists/{list_a}/headings/{heading}/"),
            serde_json::json!({"title": "T"}),
        )
        .await
        .json()
        .await
        .unwrap();
    let task = t["data"]["task_id"].as_str().unwrap().to_string();

    let response = client
        .patch(
            &format!("/user/lists/{list_a}/headings/{heading}/move?list_id={list_b}"),
            serde_json::json!({}),
        )
        .await;
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = client
        .get(&format!("/user/tasks/{task}"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"]["list_id"].as_str().unwrap(), list_b);
}

#[tokio::test]
async fn archive_removes_from_today_and_shows_in_archived() {
    // S4.
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let today = Utc::now().date_naive().to_string();
    let t: serde_json::Value = client
        .post(
            "/user/lists/default",
            serde_json::json!({"title": "T", "start_date": today}),
        )
        .await
        .json()
        .await
        .unwrap();
    let task = t["data"]["task_id"].as_str().unwrap().to_string();

    let body: serde_json::Value = client.get("/user/tasks/today").await.json().await.unwrap();
    let count_before: usize = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|g| g["tasks"].as_array().unwrap().len())
        .sum();
    assert_eq!(count_before, 1);

    let response = client
        .patch(&format!("/user/tasks/{task}/archive"), serde_json::json!({}))
        .await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data"]["status_id"], 4);

    let body: serde_json::Value = client.get("/user/tasks/today").await.json().await.unwrap();
    let count_after: usize = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|g| g["tasks"].as_array().unwrap().len())
        .sum();
    assert_eq!(count_after, 0);

    let body: serde_json::Value = client
        .get("/user/tasks/archived")
        .await
        .json()
        .await
        .unwrap();
    let archived: usize = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|g| g["tasks"].as_array().unwrap().len())
        .sum();
    assert_eq!(archived, 1);

    // Archived task is gone from direct reads too.
    let response = client.get(&format!("/user/tasks/{task}")).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn invalid_cursor_rejected() {
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let response = client.get("/user/tasks?cursor=definitely-not-a-cursor").await;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_cursor");

    // A date cursor on an ID-ordered view is also a type error.
    let response = client.get("/user/tasks?cursor=2024-03-01").await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn invalid_time_range_rejected() {
    // S6.
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let t: serde_json::Value = client
        .post("/user/lists/default", serde_json::json!({"title": "T"}))
        .await
        .json()
        .await
        .unwrap();
    let task = t["data"]["task_id"].as_str().unwrap().to_string();

    let response = client
        .patch(
            &format!("/user/tasks/{task}/time"),
            serde_json::json!({"start_time": "", "end_time": "2024-01-01 09:00:00"}),
        )
        .await;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_task_time_range");

    // The valid pair round-trips.
    let response = client
        .patch(
            &format!("/user/tasks/{task}/time"),
            serde_json::json!({
                "start_time": "2024-01-01 09:00:00",
                "end_time": "2024-01-01 10:00:00",
            }),
        )
        .await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn empty_update_is_no_changes_detected() {
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let t: serde_json::Value = client
        .post("/user/lists/default", serde_json::json!({"title": "T"}))
        .await
        .json()
        .await
        .unwrap();
    let task = t["data"]["task_id"].as_str().unwrap().to_string();

    let response = client
        .patch(&format!("/user/tasks/{task}"), serde_json::json!({}))
        .await;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "no_changes_detected");
}

#[tokio::test]
async fn complete_is_idempotent() {
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let t: serde_json::Value = client
        .post("/user/lists/default", serde_json::json!({"title": "T"}))
        .await
        .json()
        .await
        .unwrap();
    let task = t["data"]["task_id"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let response = client
            .patch(&format!("/user/tasks/{task}/complete"), serde_json::json!({}))
            .await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["data"]["status_id"], 3);
    }
}

#[tokio::test]
async fn double_delete_heading_and_orphaned_task() {
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let list: serde_json::Value = client
        .post("/user/lists/", serde_json::json!({"title": "A"}))
        .await
        .json()
        .await
        .unwrap();
    let list_id = list["data"]["id"].as_str().unwrap().to_string();
    let h: serde_json::Value = client
        .post(
            &format!("/user/lists/{list_id}/headings/"),
            serde_json::json!({"title": "H"}),
        )
        .await
        .json()
        .await
        .unwrap();
    let heading = h["data"]["id"].as_str().unwrap().to_string();
    let t: serde_json::Value = client
        .post(
            &format!("/user/lists/{list_id}/headings/{heading}/"),
            serde_json::json!({"title": "T"}),
        )
        .await
        .json()
        .await
        .unwrap();
    let task = t["data"]["task_id"].as_str().unwrap().to_string();

    let response = client
        .delete(&format!("/user/lists/{list_id}/headings/{heading}"))
        .await;
    assert_eq!(response.status(), 200);

    let response = client
        .delete(&format!("/user/lists/{list_id}/headings/{heading}"))
        .await;
    assert_eq!(response.status(), 404);

    let response = client.get(&format!("/user/tasks/{task}")).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn cross_user_access_is_not_found() {
    let mut alice = Client::new().await;
    alice.register("alice@x").await;
    let t: serde_json::Value = alice
        .post("/user/lists/default", serde_json::json!({"title": "secret"}))
        .await
        .json()
        .await
        .unwrap();
    let task = t["data"]["task_id"].as_str().unwrap().to_string();

    // Bob lives on the same server; reuse Alice's base URL.
    let mut bob = Client {
        http: reqwest::Client::new(),
        base: alice.base.clone(),
        token: None,
    };
    bob.register("bob@x").await;

    let response = bob.get(&format!("/user/tasks/{task}")).await;
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "task_not_found");
}

#[tokio::test]
async fn registering_taken_email_conflicts() {
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let response = client
        .post(
            "/register",
            serde_json::json!({"email": "alice@x", "password": "pw12345678"}),
        )
        .await;
    assert_eq!(response.status(), 409);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "user_already_exists");
}

#[tokio::test]
async fn trailing_slash_and_json_extension_are_normalized() {
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let response = client.get("/user/lists/").await;
    assert_eq!(response.status(), 200);
    let response = client.get("/user/lists.json").await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn update_reconciles_tags() {
    let mut client = Client::new().await;
    client.register("alice@x").await;

    let t: serde_json::Value = client
        .post(
            "/user/lists/default",
            serde_json::json!({"title": "T", "tags": ["home", "errand"]}),
        )
        .await
        .json()
        .await
        .unwrap();
    let task = t["data"]["task_id"].as_str().unwrap().to_string();

    let response = client
        .patch(
            &format!("/user/tasks/{task}"),
            serde_json::json!({"tags": ["errand", "urgent"]}),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    let tags: Vec<&str> = body["data"]["tags"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(tags, vec!["errand", "urgent"]);
}

#[tokio::test]
async fn response_content_type_is_json() {
    let client = Client::new().await;
    let response = client.get("/health").await;
    assert_eq!(
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .unwrap(),
        "application/json"
    );
}
