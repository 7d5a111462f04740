//! Typed grouped-view records.
//!
//! The persistence layer hands back groups whose member tasks are an opaque
//! JSON array (built by `json_agg` in a single round trip); this module
//! decodes them into typed records before they are served.

use chrono::NaiveDate;
use serde::Serialize;

use crate::db::{GroupKey, RawTaskGroup, TaskRecord};
use crate::error::DatabaseError;

#[derive(Debug, Clone, Serialize)]
pub struct GroupRef {
    pub id: String,
    pub title: String,
}

/// One group of a grouped view. Exactly one key field is set, matching the
/// view that produced it.
#[derive(Debug, Serialize)]
pub struct TaskGroup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list: Option<GroupRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<GroupRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<NaiveDate>,
    pub tasks: Vec<TaskRecord>,
}

pub fn decode_groups(raw: Vec<RawTaskGroup>) -> Result<Vec<TaskGroup>, DatabaseError> {
    raw.into_iter().map(decode_group).collect()
}

fn decode_group(raw: RawTaskGroup) -> Result<TaskGroup, DatabaseError> {
    let tasks: Vec<TaskRecord> = serde_json::from_value(raw.tasks)
        .map_err(|e| DatabaseError::Serialization(format!("task group payload: {e}")))?;

    let mut group = TaskGroup {
        list: None,
        heading: None,
        date: None,
        month: None,
        tasks,
    };
    match raw.key {
        GroupKey::List { id, title } => group.list = Some(GroupRef { id, title }),
        GroupKey::Heading { id, title } => group.heading = Some(GroupRef { id, title }),
        GroupKey::Date(date) => group.date = Some(date),
        GroupKey::Month(month) => group.month = Some(month),
    }
    Ok(group)
}
