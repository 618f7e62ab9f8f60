//! Calendar provider seam
//!
//! The engine only talks to the provider through [`CalendarProvider`]; the
//! production implementation is [`google::GoogleCalendarClient`]. Wire types
//! mirror the subset of the Google Calendar v3 schema that sync needs; any
//! other field is kept in `extra` so payloads survive a round trip.

pub mod google;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProviderResult;

pub use google::GoogleCalendarClient;

/// Private extended-property key marking an event as a todo shadow
pub const TODO_MARKER_KEY: &str = "calbridge_todo";
/// Private extended-property key carrying the owning todo id
pub const TODO_ID_KEY: &str = "todo_id";

/// Entry from the account's calendar list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarListEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_role: Option<String>,
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_id: Option<String>,
}

impl CalendarListEntry {
    /// Name shown to the user: the override, then the summary
    pub fn display_name(&self) -> String {
        self.summary_override
            .as_deref()
            .or(self.summary.as_deref())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("Untitled")
            .to_string()
    }
}

/// Start or end of an event: either a whole date or a zoned instant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDateTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl EventDateTime {
    pub fn all_day(date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..Self::default()
        }
    }

    pub fn timed(instant: DateTime<FixedOffset>, time_zone: impl Into<String>) -> Self {
        Self {
            date_time: Some(instant),
            time_zone: Some(time_zone.into()),
            ..Self::default()
        }
    }

    pub fn is_date_only(&self) -> bool {
        self.date.is_some() && self.date_time.is_none()
    }
}

/// Event lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Tentative => "tentative",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Organizer or attendee
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "self", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_self: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub organizer: bool,
}

/// Key/value metadata attached to an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedProperties {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub private: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub shared: Map<String, Value>,
}

/// An event resource as returned by list/get/insert/patch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<EventDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<EventDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_start_time: Option<EventDateTime>,
    #[serde(rename = "iCalUID", default, skip_serializing_if = "Option::is_none")]
    pub ical_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hangout_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conference_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<Person>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attendees: Option<Vec<Person>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<ExtendedProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProviderEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status == Some(EventStatus::Cancelled)
    }

    /// The connected account is an attendee and said no
    pub fn declined_by_self(&self) -> bool {
        self.attendees.iter().flatten().any(|attendee| {
            attendee.is_self && attendee.response_status.as_deref() == Some("declined")
        })
    }

    /// First conferencing entry point, if any
    pub fn conference_link(&self) -> Option<String> {
        self.conference_data
            .as_ref()?
            .get("entryPoints")?
            .as_array()?
            .iter()
            .find_map(|entry| entry.get("uri").and_then(Value::as_str))
            .map(str::to_string)
    }

    fn private_property(&self, key: &str) -> Option<&str> {
        self.extended_properties
            .as_ref()?
            .private
            .get(key)?
            .as_str()
    }

    /// Todo id recorded on an application-created event.
    ///
    /// Only events carrying the ownership marker and a parsable id match;
    /// anything malformed is treated as not owned.
    pub fn todo_marker(&self) -> Option<i64> {
        if self.private_property(TODO_MARKER_KEY) != Some("true") {
            return None;
        }
        self.private_property(TODO_ID_KEY)?.trim().parse().ok()
    }

    /// Raw JSON form, stored alongside the cached row
    pub fn to_raw(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Partial update; absent fields are left unchanged by the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<EventDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<EventDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<ExtendedProperties>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overlay the patch onto a full event
    pub fn apply_to(&self, event: &mut ProviderEvent) {
        if let Some(summary) = &self.summary {
            event.summary = Some(summary.clone());
        }
        if let Some(description) = &self.description {
            event.description = Some(description.clone());
        }
        if let Some(start) = &self.start {
            event.start = Some(start.clone());
        }
        if let Some(end) = &self.end {
            event.end = Some(end.clone());
        }
        if let Some(recurrence) = &self.recurrence {
            event.recurrence = Some(recurrence.clone());
        }
        if let Some(color_id) = &self.color_id {
            event.color_id = Some(color_id.clone());
        }
        if let Some(props) = &self.extended_properties {
            event.extended_properties = Some(props.clone());
        }
    }
}

/// How to select events when listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventQuery {
    /// Everything overlapping the window
    Window {
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    },
    /// Only changes since the cursor was issued
    Incremental { sync_token: String },
}

/// All pages of a list call, flattened
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub items: Vec<ProviderEvent>,
    pub next_sync_token: Option<String>,
}

/// Body of a watch (push channel) registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Channel returned by a watch registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchChannel {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    /// Milliseconds since the epoch; the API sends it as a string
    #[serde(default)]
    pub expiration: Option<Value>,
}

impl WatchChannel {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let millis = match self.expiration.as_ref()? {
            Value::String(s) => s.trim().parse::<i64>().ok()?,
            Value::Number(n) => n.as_i64()?,
            _ => return None,
        };
        DateTime::from_timestamp_millis(millis)
    }
}

/// The provider's calendar/event API
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn list_calendars(&self, access_token: &str) -> ProviderResult<Vec<CalendarListEntry>>;

    async fn create_calendar(
        &self,
        access_token: &str,
        summary: &str,
        description: Option<&str>,
    ) -> ProviderResult<CalendarListEntry>;

    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        query: &EventQuery,
    ) -> ProviderResult<EventPage>;

    async fn insert_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &ProviderEvent,
    ) -> ProviderResult<ProviderEvent>;

    async fn patch_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> ProviderResult<ProviderEvent>;

    async fn get_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> ProviderResult<ProviderEvent>;

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> ProviderResult<()>;

    async fn watch_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: &WatchRequest,
    ) -> ProviderResult<WatchChannel>;
}
