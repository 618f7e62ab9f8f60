//! Persisted entities and the JSON shapes of the HTTP surface
//!
//! Ids are SQLite rowids; timestamps are UTC instants.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::time::resolve_time_zone;

/// A user's OAuth connection to the calendar provider
#[derive(Debug, Clone, Serialize)]
pub struct CalendarConnection {
    pub user_id: i64,
    #[serde(skip)]
    pub encrypted_access_token: String,
    #[serde(skip)]
    pub encrypted_refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub scopes: Option<String>,
    pub account_email: Option<String>,
    pub requires_reauth: bool,
    pub connected_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// A provider calendar known to a user
#[derive(Debug, Clone, Serialize)]
pub struct Calendar {
    pub id: i64,
    pub user_id: i64,
    pub provider_id: String,
    pub name: String,
    pub description: Option<String>,
    pub time_zone: Option<String>,
    pub access_role: Option<String>,
    pub is_primary: bool,
    pub selected: bool,
    pub is_managed: bool,
    pub color_id: Option<String>,
    #[serde(skip)]
    pub sync_token: Option<String>,
    #[serde(skip)]
    pub channel_id: Option<String>,
    #[serde(skip)]
    pub channel_resource_id: Option<String>,
    #[serde(skip)]
    pub channel_expiration: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Calendar {
    pub fn zone(&self) -> Tz {
        resolve_time_zone(self.time_zone.as_deref())
    }
}

/// Local copy of one provider event in one calendar
#[derive(Debug, Clone, Serialize)]
pub struct CachedEvent {
    pub id: i64,
    pub user_id: i64,
    pub calendar_id: i64,
    pub provider_event_id: String,
    pub recurring_event_id: Option<String>,
    pub ical_uid: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub is_all_day: bool,
    pub status: String,
    pub visibility: Option<String>,
    pub transparency: Option<String>,
    pub provider_updated_at: Option<DateTime<Utc>>,
    pub html_link: Option<String>,
    pub hangout_link: Option<String>,
    pub conference_link: Option<String>,
    pub organizer: Option<Value>,
    pub attendees: Option<Value>,
    pub raw_payload: Value,
}

impl CachedEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status == "cancelled"
    }

    /// Whether the organizer entry is the connected account
    pub fn organized_by_self(&self) -> bool {
        self.organizer
            .as_ref()
            .and_then(|o| o.get("self"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn declined_by_self(&self) -> bool {
        self.attendees
            .as_ref()
            .and_then(Value::as_array)
            .is_some_and(|attendees| {
                attendees.iter().any(|a| {
                    a.get("self").and_then(Value::as_bool) == Some(true)
                        && a.get("responseStatus").and_then(Value::as_str) == Some("declined")
                })
            })
    }
}

/// Application-owned task
#[derive(Debug, Clone, Serialize)]
pub struct TodoItem {
    pub id: i64,
    pub user_id: i64,
    pub text: String,
    pub completed: bool,
    pub deadline: Option<DateTime<Utc>>,
    pub deadline_is_date_only: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TodoItem {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.completed && self.deadline.is_some_and(|deadline| deadline < now)
    }
}

/// The shadow-event link of one todo
#[derive(Debug, Clone, Serialize)]
pub struct TodoEventLink {
    pub id: i64,
    pub user_id: i64,
    pub todo_id: i64,
    pub calendar_id: i64,
    pub provider_event_id: String,
    pub ical_uid: Option<String>,
    pub event_start: Option<DateTime<Utc>>,
    pub event_end: Option<DateTime<Utc>>,
    pub todo_text_hash: Option<String>,
    /// Provider `updated` stamp of the last event version written or applied
    pub event_updated_at: Option<DateTime<Utc>>,
    pub last_synced_at: DateTime<Utc>,
}

/// Event as handed to a reader, with the owning calendar's flags attached
#[derive(Debug, Clone, Serialize)]
pub struct PresentedEvent {
    #[serde(flatten)]
    pub event: CachedEvent,
    pub calendar_provider_id: String,
    pub calendar_name: String,
    pub calendar_color_id: Option<String>,
    pub calendar_is_primary: bool,
    pub calendar_is_managed: bool,
    /// Todo this event shadows, when linked
    pub todo_id: Option<i64>,
}

// --- HTTP request/response bodies ---

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub account_email: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub requires_reauth: bool,
}

impl From<Option<CalendarConnection>> for ConnectionStatus {
    fn from(connection: Option<CalendarConnection>) -> Self {
        match connection {
            Some(c) => Self {
                connected: true,
                account_email: c.account_email,
                connected_at: Some(c.connected_at),
                last_sync_at: c.last_sync_at,
                requires_reauth: c.requires_reauth,
            },
            None => Self {
                connected: false,
                account_email: None,
                connected_at: None,
                last_sync_at: None,
                requires_reauth: false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OAuthStartResponse {
    pub authorization_url: String,
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarSelectionRequest {
    pub provider_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventListQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub include_todos: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventUpdateRequest {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: crate::editor::EditScope,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub is_all_day: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTodoRequest {
    pub text: String,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deadline_is_date_only: bool,
    /// Zone the deadline is meant in; defaults to UTC
    #[serde(default)]
    pub time_zone: Option<String>,
}

/// Partial todo update.
///
/// `deadline` distinguishes "absent" (leave alone) from `null` (clear).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTodoRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub completed: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    pub deadline: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub deadline_is_date_only: Option<bool>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Serialize)]
pub struct TodoResponse {
    #[serde(flatten)]
    pub todo: TodoItem,
    pub is_overdue: bool,
}

impl TodoResponse {
    pub fn new(todo: TodoItem, now: DateTime<Utc>) -> Self {
        let is_overdue = todo.is_overdue(now);
        Self { todo, is_overdue }
    }
}
