//! taskdeck: a multi-user task-organizer backend.
//!
//! Users own lists, lists own headings, headings own tasks; tags attach to
//! tasks by title. Identity is delegated to an external SSO; this crate
//! verifies the tokens it issues and anchors every row to the `uid` claim.
//! Reads are served flat or as grouped views (per list, per heading, today,
//! upcoming, overdue, someday, completed, archived) with ID- or date-typed
//! cursors.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod pagination;
pub mod sso;
pub mod views;
