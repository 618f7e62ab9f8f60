//! Edits to cached events, including recurring-series splits

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::EngineResult;
use crate::models::{CachedEvent, Calendar};
use crate::provider::{CalendarProvider, EventDateTime, EventPatch, ProviderEvent};
use crate::recurrence::Recurrence;
use crate::sync::{EventSyncEngine, SyncWindow, instant_of};
use crate::time::{local_date, resolve_time_zone};
use crate::tokens::TokenStore;

const REFRESH_LOOKBACK_DAYS: i64 = 7;
const REFRESH_LOOKAHEAD_DAYS: i64 = 30;

/// Which instances of a recurring event an edit touches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditScope {
    /// Just this event
    #[default]
    Occurrence,
    /// This and every later instance
    Future,
    /// The whole series
    Series,
}

/// Fields to change; `None` leaves a field alone
#[derive(Debug, Clone, Default)]
pub struct EventEdit {
    pub summary: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub scope: EditScope,
    pub time_zone: Option<String>,
    pub is_all_day: Option<bool>,
}

fn time_payload(instant: DateTime<Utc>, zone: Tz, all_day: bool) -> EventDateTime {
    if all_day {
        EventDateTime::all_day(local_date(instant, zone))
    } else {
        EventDateTime::timed(instant.with_timezone(&zone).fixed_offset(), zone.name())
    }
}

/// Patch holding only the fields the edit supplies
pub fn build_patch(edit: &EventEdit, zone: Tz, all_day: bool) -> EventPatch {
    EventPatch {
        summary: edit.summary.clone(),
        start: edit.start.map(|start| time_payload(start, zone, all_day)),
        end: edit.end.map(|end| time_payload(end, zone, all_day)),
        ..EventPatch::default()
    }
}

/// First instance of a split-off series: the master with the edit applied,
/// provider-assigned identity removed and no COUNT/UNTIL.
pub fn split_series_event(
    master: &ProviderEvent,
    patch: &EventPatch,
    recurrence: &Recurrence,
    start: EventDateTime,
    end: EventDateTime,
) -> ProviderEvent {
    let mut event = master.clone();
    patch.apply_to(&mut event);
    event.recurrence = Some(recurrence.unbounded().to_wire());
    event.start = Some(patch.start.clone().unwrap_or(start));
    event.end = Some(patch.end.clone().unwrap_or(end));
    event.id = None;
    event.updated = None;
    event.ical_uid = None;
    event.recurring_event_id = None;
    event.original_start_time = None;
    event.html_link = None;
    event.extra.remove("etag");
    event.extra.remove("sequence");
    event
}

pub struct EventEditor {
    db: Arc<Database>,
    provider: Arc<dyn CalendarProvider>,
    tokens: Arc<TokenStore>,
    sync: Arc<EventSyncEngine>,
}

impl EventEditor {
    pub fn new(
        db: Arc<Database>,
        provider: Arc<dyn CalendarProvider>,
        tokens: Arc<TokenStore>,
        sync: Arc<EventSyncEngine>,
    ) -> Self {
        Self {
            db,
            provider,
            tokens,
            sync,
        }
    }

    /// Apply an edit on the provider, then refresh the calendar's cache.
    ///
    /// Returns the event's cached row afterwards, if it still exists (a
    /// `future` split can move the instance to the new series).
    pub async fn update_event(
        &self,
        event: &CachedEvent,
        calendar: &Calendar,
        edit: EventEdit,
    ) -> EngineResult<Option<CachedEvent>> {
        let user_id = event.user_id;
        let zone = resolve_time_zone(edit.time_zone.as_deref().or(calendar.time_zone.as_deref()));
        let all_day = edit.is_all_day.unwrap_or(event.is_all_day);
        let patch = build_patch(&edit, zone, all_day);
        if patch.is_empty() {
            return Ok(Some(event.clone()));
        }

        let token = self.tokens.require_access_token(user_id).await?;
        let master_id = event.recurring_event_id.as_deref();

        let handled = match (edit.scope, master_id) {
            (EditScope::Series, Some(master_id)) => {
                self.patch(user_id, &token, calendar, master_id, &patch).await?;
                true
            }
            (EditScope::Future, Some(master_id)) => {
                self.split_future(&token, event, calendar, master_id, &patch, zone, all_day)
                    .await?
            }
            _ => false,
        };

        if !handled {
            let written = self
                .patch(user_id, &token, calendar, &event.provider_event_id, &patch)
                .await?;
            self.sync.cache_event(calendar, &written)?;
        }

        self.refresh(calendar, edit.start).await;
        Ok(self
            .db
            .read(|store| store.event_by_provider_id(calendar.id, &event.provider_event_id))?)
    }

    async fn patch(
        &self,
        user_id: i64,
        token: &str,
        calendar: &Calendar,
        event_id: &str,
        patch: &EventPatch,
    ) -> EngineResult<ProviderEvent> {
        let result = self
            .provider
            .patch_event(token, &calendar.provider_id, event_id, patch)
            .await;
        if let Err(err) = &result {
            tracing::warn!(event_id, error = %err, "Failed to update calendar event");
        }
        self.tokens.check_provider(user_id, result)
    }

    /// Split the series at this occurrence. Returns false when the edit
    /// should fall back to a plain occurrence patch.
    #[allow(clippy::too_many_arguments)]
    async fn split_future(
        &self,
        token: &str,
        event: &CachedEvent,
        calendar: &Calendar,
        master_id: &str,
        patch: &EventPatch,
        zone: Tz,
        all_day: bool,
    ) -> EngineResult<bool> {
        let user_id = event.user_id;
        let master = self.tokens.check_provider(
            user_id,
            self.provider
                .get_event(token, &calendar.provider_id, master_id)
                .await,
        )?;

        let recurrence = match Recurrence::parse(master.recurrence.as_deref().unwrap_or_default()) {
            Ok(recurrence) if recurrence.has_rules() => recurrence,
            Ok(_) => return Ok(false),
            Err(err) => {
                tracing::warn!(
                    master_id,
                    error = %err,
                    "Unreadable recurrence; editing whole series"
                );
                self.patch(user_id, token, calendar, master_id, patch).await?;
                return Ok(true);
            }
        };

        if recurrence.is_bounded() {
            tracing::info!(
                master_id,
                "Series has COUNT/UNTIL; applying series-wide edit instead of a split"
            );
            self.patch(user_id, token, calendar, master_id, patch).await?;
            return Ok(true);
        }

        let original_start = serde_json::from_value::<ProviderEvent>(event.raw_payload.clone())
            .ok()
            .and_then(|raw| raw.original_start_time)
            .and_then(|value| instant_of(&value, calendar))
            .unwrap_or(event.start);

        let truncate = EventPatch {
            recurrence: Some(recurrence.truncated_before(original_start).to_wire()),
            ..EventPatch::default()
        };
        self.patch(user_id, token, calendar, master_id, &truncate).await?;

        let new_series = split_series_event(
            &master,
            patch,
            &recurrence,
            time_payload(event.start, zone, all_day),
            time_payload(event.end, zone, all_day),
        );
        let inserted = self.tokens.check_provider(
            user_id,
            self.provider
                .insert_event(token, &calendar.provider_id, &new_series)
                .await,
        )?;
        tracing::info!(
            master_id,
            new_series_id = ?inserted.id,
            "Split recurring series at occurrence"
        );
        Ok(true)
    }

    /// Resync the calendar around the edit so the cache shows it now.
    /// Failures are logged; the next tick catches up.
    async fn refresh(&self, calendar: &Calendar, anchor: Option<DateTime<Utc>>) {
        let window = SyncWindow::around(
            anchor.unwrap_or_else(Utc::now),
            REFRESH_LOOKBACK_DAYS,
            REFRESH_LOOKAHEAD_DAYS,
        );
        let calendar = match self.db.read(|store| store.get_calendar(calendar.id)) {
            Ok(Some(fresh)) => fresh,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "Could not reload calendar for refresh");
                return;
            }
        };
        if let Err(err) = self
            .sync
            .sync_calendar(calendar.user_id, &calendar, window, false)
            .await
        {
            tracing::warn!(calendar_id = calendar.id, error = %err, "Post-edit refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use serde_json::json;

    #[test]
    fn patch_omits_unsupplied_fields() {
        let edit = EventEdit {
            summary: Some("Retro".into()),
            ..EventEdit::default()
        };
        let patch = build_patch(&edit, Tz::UTC, false);
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({ "summary": "Retro" }));
    }

    #[test]
    fn all_day_patch_uses_local_date() {
        let edit = EventEdit {
            start: Some(Utc.with_ymd_and_hms(2025, 3, 11, 2, 0, 0).unwrap()),
            ..EventEdit::default()
        };
        let patch = build_patch(&edit, Tz::America__Chicago, true);
        assert_eq!(
            patch.start,
            Some(EventDateTime::all_day(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()))
        );
        assert_eq!(patch.end, None);
    }

    #[test]
    fn timed_patch_carries_zone() {
        let edit = EventEdit {
            end: Some(Utc.with_ymd_and_hms(2025, 1, 10, 15, 0, 0).unwrap()),
            ..EventEdit::default()
        };
        let patch = build_patch(&edit, Tz::Europe__Paris, false);
        let end = patch.end.unwrap();
        assert_eq!(end.date_time.unwrap().to_rfc3339(), "2025-01-10T16:00:00+01:00");
        assert_eq!(end.time_zone.as_deref(), Some("Europe/Paris"));
    }

    #[test]
    fn split_event_drops_identity() {
        let master: ProviderEvent = serde_json::from_value(json!({
            "id": "master",
            "etag": "\"1\"",
            "sequence": 3,
            "iCalUID": "master@google.com",
            "htmlLink": "https://calendar.example/master",
            "updated": "2025-01-01T00:00:00Z",
            "summary": "Standup",
            "location": "Room 4",
            "recurrence": ["RRULE:FREQ=DAILY"],
            "start": { "dateTime": "2025-01-01T09:00:00Z" },
            "end": { "dateTime": "2025-01-01T09:15:00Z" },
        }))
        .unwrap();
        let patch = EventPatch {
            summary: Some("Daily sync".into()),
            ..EventPatch::default()
        };
        let recurrence = Recurrence::parse(master.recurrence.as_deref().unwrap()).unwrap();
        let start = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();
        let event = split_series_event(
            &master,
            &patch,
            &recurrence,
            time_payload(start, Tz::UTC, false),
            time_payload(start + Duration::minutes(15), Tz::UTC, false),
        );

        let raw = serde_json::to_value(&event).unwrap();
        for key in ["id", "etag", "sequence", "iCalUID", "htmlLink", "updated"] {
            assert!(raw.get(key).is_none(), "{key} should be dropped");
        }
        assert_eq!(raw["summary"], json!("Daily sync"));
        assert_eq!(raw["location"], json!("Room 4"));
        assert_eq!(raw["recurrence"], json!(["RRULE:FREQ=DAILY"]));
        assert_eq!(event.start.unwrap().date_time.unwrap(), start);
    }
}
