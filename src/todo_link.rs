//! Keeps each todo with a deadline paired to one event in the managed calendar

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};

use crate::calendars::CalendarRegistry;
use crate::db::{Database, Store};
use crate::error::{EngineError, EngineResult, ProviderError};
use crate::models::{CachedEvent, Calendar, TodoEventLink, TodoItem};
use crate::provider::{
    CalendarProvider, EventDateTime, EventPatch, ExtendedProperties, ProviderEvent,
    TODO_ID_KEY, TODO_MARKER_KEY,
};
use crate::sync::cached_event_from_provider;
use crate::time::{local_date, local_instant, local_midnight, resolve_time_zone};
use crate::title::{TitleGenerator, build_title, text_hash};
use crate::tokens::TokenStore;

/// Marks the description of every shadow event
pub const TODO_DESCRIPTION_TAG: &str = "Calbridge todo";
/// Provider colour of shadow events
pub const TODO_COLOR_ID: &str = "3";

const TIMED_LEAD_MINUTES: i64 = 30;

/// Result of reconciling one todo with its shadow event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// No deadline or completed; any shadow event was removed
    Unlinked,
    /// No usable credentials, nothing written
    Paused,
    /// Link already reflects the todo
    Unchanged,
    Created,
    Updated,
}

/// Event window a todo deadline occupies
#[derive(Debug, Clone, PartialEq)]
pub struct TodoEventTimes {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub start_payload: EventDateTime,
    pub end_payload: EventDateTime,
}

/// Timed deadlines get a half-hour block ending at the deadline; date-only
/// deadlines cover their whole local day.
pub fn todo_event_times(deadline: DateTime<Utc>, date_only: bool, zone: Tz) -> TodoEventTimes {
    if date_only {
        let day = local_date(deadline, zone);
        let next = day.succ_opt().unwrap_or(day);
        return TodoEventTimes {
            start: local_midnight(day, zone),
            end: local_midnight(next, zone),
            start_payload: EventDateTime::all_day(day),
            end_payload: EventDateTime::all_day(next),
        };
    }
    let start = deadline - Duration::minutes(TIMED_LEAD_MINUTES);
    TodoEventTimes {
        start,
        end: deadline,
        start_payload: EventDateTime::timed(
            start.with_timezone(&zone).fixed_offset(),
            zone.name(),
        ),
        end_payload: EventDateTime::timed(
            deadline.with_timezone(&zone).fixed_offset(),
            zone.name(),
        ),
    }
}

/// Deadline implied by a shadow event: 23:59 local on an all-day event's
/// start date, otherwise the event's end.
pub fn deadline_from_event(event: &CachedEvent, zone: Tz) -> (DateTime<Utc>, bool) {
    if event.is_all_day {
        let day = local_date(event.start, zone);
        let due = NaiveTime::from_hms_opt(23, 59, 0).unwrap_or_default();
        return (local_instant(day, due, zone), true);
    }
    (event.end, false)
}

/// Existing description with the tag line appended once
pub fn tagged_description(existing: Option<&str>, details: Option<&str>) -> String {
    let existing = existing.map(str::trim).filter(|d| !d.is_empty());
    if let Some(text) = existing
        && text.contains(TODO_DESCRIPTION_TAG)
    {
        return text.to_string();
    }
    let mut lines: Vec<&str> = Vec::new();
    lines.extend(existing);
    lines.extend(details.filter(|d| existing.is_none_or(|e| !e.contains(*d))));
    lines.push(TODO_DESCRIPTION_TAG);
    lines.join("\n")
}

fn todo_properties(todo_id: i64) -> ExtendedProperties {
    let mut private = Map::new();
    private.insert(TODO_MARKER_KEY.to_string(), Value::String("true".into()));
    private.insert(TODO_ID_KEY.to_string(), Value::String(todo_id.to_string()));
    ExtendedProperties {
        private,
        ..ExtendedProperties::default()
    }
}

pub struct TodoLinkManager {
    db: Arc<Database>,
    provider: Arc<dyn CalendarProvider>,
    tokens: Arc<TokenStore>,
    registry: Arc<CalendarRegistry>,
    titles: Arc<dyn TitleGenerator>,
}

impl TodoLinkManager {
    pub fn new(
        db: Arc<Database>,
        provider: Arc<dyn CalendarProvider>,
        tokens: Arc<TokenStore>,
        registry: Arc<CalendarRegistry>,
        titles: Arc<dyn TitleGenerator>,
    ) -> Self {
        Self {
            db,
            provider,
            tokens,
            registry,
            titles,
        }
    }

    /// Bring the todo's shadow event in line with its text and deadline.
    ///
    /// `time_zone` is the zone the deadline was entered in; blank means UTC.
    pub async fn upsert_event_for_todo(
        &self,
        todo: &TodoItem,
        time_zone: Option<&str>,
    ) -> EngineResult<LinkOutcome> {
        let deadline = match todo.deadline {
            Some(deadline) if !todo.completed => deadline,
            _ => {
                self.unlink_todo(todo, true).await?;
                return Ok(LinkOutcome::Unlinked);
            }
        };
        let Some(token) = self.tokens.access_token(todo.user_id).await? else {
            tracing::debug!(todo_id = todo.id, "No calendar credentials; todo event sync paused");
            return Ok(LinkOutcome::Paused);
        };

        let calendar = self.registry.ensure_managed_calendar(todo.user_id).await?;
        let zone = resolve_time_zone(time_zone);
        let times = todo_event_times(deadline, todo.deadline_is_date_only, zone);
        let hash = text_hash(&todo.text);

        let (link, cached) = self.db.read(|store| {
            let link = store
                .link_for_todo(todo.id)?
                .filter(|link| link.calendar_id == calendar.id);
            let cached = match &link {
                Some(link) => store.event_by_provider_id(calendar.id, &link.provider_event_id)?,
                None => None,
            };
            Ok((link, cached))
        })?;

        let same_text = link
            .as_ref()
            .is_some_and(|l| l.todo_text_hash.as_deref() == Some(hash.as_str()));
        if same_text
            && link.as_ref().is_some_and(|l| {
                l.event_start == Some(times.start) && l.event_end == Some(times.end)
            })
        {
            return Ok(LinkOutcome::Unchanged);
        }

        let existing_description = cached.as_ref().and_then(|e| e.description.as_deref());
        let title = if same_text {
            None
        } else {
            Some(build_title(self.titles.as_ref(), &todo.text).await)
        };

        let mut patch = EventPatch {
            summary: title.as_ref().map(|t| t.title.clone()),
            description: Some(tagged_description(
                existing_description,
                title.as_ref().and_then(|t| t.details.as_deref()),
            )),
            start: Some(times.start_payload.clone()),
            end: Some(times.end_payload.clone()),
            color_id: Some(TODO_COLOR_ID.to_string()),
            extended_properties: Some(todo_properties(todo.id)),
            ..EventPatch::default()
        };

        let mut written = None;
        if let Some(link) = &link {
            match self
                .provider
                .patch_event(&token, &calendar.provider_id, &link.provider_event_id, &patch)
                .await
            {
                Ok(event) => written = Some((event, LinkOutcome::Updated)),
                Err(err) if err.is_gone() => {
                    tracing::info!(
                        todo_id = todo.id,
                        event_id = %link.provider_event_id,
                        "Linked event is gone; inserting a new one"
                    );
                }
                Err(err) => return Err(self.write_failed(todo, err)),
            }
        }

        let (event, outcome) = match written {
            Some(written) => written,
            None => {
                if patch.summary.is_none() {
                    patch.summary = Some(build_title(self.titles.as_ref(), &todo.text).await.title);
                }
                let mut event = ProviderEvent::default();
                patch.apply_to(&mut event);
                let inserted = self
                    .provider
                    .insert_event(&token, &calendar.provider_id, &event)
                    .await
                    .map_err(|err| self.write_failed(todo, err))?;
                (inserted, LinkOutcome::Created)
            }
        };

        let event_id = event
            .id
            .clone()
            .context("Provider returned an event without an id")?;
        let now = Utc::now();
        self.db.transaction(|store| {
            if let Some(row) = cached_event_from_provider(&calendar, &event) {
                store.upsert_event(&row)?;
            }
            store.upsert_link(&TodoEventLink {
                id: 0,
                user_id: todo.user_id,
                todo_id: todo.id,
                calendar_id: calendar.id,
                provider_event_id: event_id.clone(),
                ical_uid: event.ical_uid.clone(),
                event_start: Some(times.start),
                event_end: Some(times.end),
                todo_text_hash: Some(hash.clone()),
                event_updated_at: event.updated,
                last_synced_at: now,
            })
        })?;

        tracing::info!(todo_id = todo.id, event_id = %event_id, ?outcome, "Todo event synced");
        Ok(outcome)
    }

    fn write_failed(&self, todo: &TodoItem, err: ProviderError) -> EngineError {
        tracing::warn!(todo_id = todo.id, error = %err, "Failed to write todo event");
        if err.status() != Some(401) {
            return err.into();
        }
        match self.tokens.mark_reauth_required(todo.user_id) {
            Ok(()) => EngineError::ReauthRequired {
                user_id: todo.user_id,
            },
            Err(mark_err) => mark_err,
        }
    }

    /// Reflect a synced provider event onto its todo, last write wins.
    ///
    /// Runs inside the calendar's sync transaction.
    pub fn handle_event_updated(
        &self,
        store: &Store<'_>,
        calendar: &Calendar,
        event: &ProviderEvent,
        cached: &CachedEvent,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let link = match store.link_for_event(calendar.id, &cached.provider_event_id)? {
            Some(link) => link,
            None => {
                let Some(todo_id) = event.todo_marker() else {
                    return Ok(());
                };
                if !self.may_adopt(store, calendar, todo_id)? {
                    tracing::debug!(
                        todo_id,
                        event_id = %cached.provider_event_id,
                        "Tagged event not adopted; leaving it as a stray"
                    );
                    return Ok(());
                }
                let link = TodoEventLink {
                    id: 0,
                    user_id: calendar.user_id,
                    todo_id,
                    calendar_id: calendar.id,
                    provider_event_id: cached.provider_event_id.clone(),
                    ical_uid: cached.ical_uid.clone(),
                    event_start: Some(cached.start),
                    event_end: Some(cached.end),
                    todo_text_hash: None,
                    event_updated_at: None,
                    last_synced_at: now,
                };
                store.upsert_link(&link)?;
                tracing::info!(
                    todo_id,
                    event_id = %cached.provider_event_id,
                    "Recovered todo link"
                );
                link
            }
        };

        let Some(updated) = event.updated else {
            return Ok(());
        };
        if link.event_updated_at.is_some_and(|seen| updated <= seen) {
            return Ok(());
        }
        let Some(mut todo) = store.get_todo(link.todo_id)? else {
            return Ok(());
        };
        if updated <= todo.updated_at {
            tracing::debug!(todo_id = todo.id, "Todo is newer than its event; keeping todo");
            return Ok(());
        }

        if let Some(summary) = event.summary.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            todo.text = summary.to_string();
        }
        let (deadline, date_only) = deadline_from_event(cached, calendar.zone());
        todo.deadline = Some(deadline);
        todo.deadline_is_date_only = date_only;
        todo.updated_at = updated;
        store.update_todo(&todo)?;

        store.upsert_link(&TodoEventLink {
            todo_text_hash: Some(text_hash(&todo.text)),
            event_start: Some(cached.start),
            event_end: Some(cached.end),
            ical_uid: cached.ical_uid.clone(),
            event_updated_at: Some(updated),
            last_synced_at: now,
            ..link
        })?;
        tracing::info!(todo_id = todo.id, "Applied calendar edit to todo");
        Ok(())
    }

    /// A tagged event without a link may only claim an open todo of the same
    /// user that has a deadline and is not already linked elsewhere.
    fn may_adopt(
        &self,
        store: &Store<'_>,
        calendar: &Calendar,
        todo_id: i64,
    ) -> anyhow::Result<bool> {
        let adoptable = store.get_todo(todo_id)?.is_some_and(|todo| {
            todo.user_id == calendar.user_id && !todo.completed && todo.deadline.is_some()
        });
        Ok(adoptable && store.link_for_todo(todo_id)?.is_none())
    }

    /// A shadow event vanished from the provider: the todo loses its deadline
    pub fn handle_event_deleted(
        &self,
        store: &Store<'_>,
        calendar_id: i64,
        provider_event_id: &str,
    ) -> anyhow::Result<()> {
        let Some(link) = store.link_for_event(calendar_id, provider_event_id)? else {
            return Ok(());
        };
        if let Some(mut todo) = store.get_todo(link.todo_id)? {
            todo.deadline = None;
            todo.deadline_is_date_only = false;
            todo.updated_at = Utc::now();
            store.update_todo(&todo)?;
        }
        store.delete_link_for_todo(link.todo_id)?;
        tracing::info!(todo_id = link.todo_id, "Shadow event deleted; cleared todo deadline");
        Ok(())
    }

    /// Drop the todo's link; with `delete_event` also try to remove the
    /// provider event. Returns whether a link existed.
    pub async fn unlink_todo(&self, todo: &TodoItem, delete_event: bool) -> EngineResult<bool> {
        let Some(link) = self.db.read(|store| store.link_for_todo(todo.id))? else {
            return Ok(false);
        };

        let mut event_removed = false;
        if delete_event {
            event_removed = self.delete_provider_event(todo.user_id, &link).await;
        }

        self.db.transaction(|store| {
            store.delete_link_for_todo(todo.id)?;
            if event_removed {
                store.delete_event(link.calendar_id, &link.provider_event_id)?;
            }
            Ok(())
        })?;
        tracing::info!(todo_id = todo.id, event_removed, "Todo unlinked");
        Ok(true)
    }

    async fn delete_provider_event(&self, user_id: i64, link: &TodoEventLink) -> bool {
        let token = match self.tokens.access_token(user_id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                tracing::warn!(user_id, "No calendar credentials; shadow event left in place");
                return false;
            }
            Err(err) => {
                tracing::warn!(user_id, error = %err, "Could not load calendar credentials");
                return false;
            }
        };
        let calendar = match self.db.read(|store| store.get_calendar(link.calendar_id)) {
            Ok(Some(calendar)) => calendar,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(error = %err, "Could not load linked calendar");
                return false;
            }
        };

        match self
            .provider
            .delete_event(&token, &calendar.provider_id, &link.provider_event_id)
            .await
        {
            Ok(()) => true,
            Err(err) if err.is_gone() => true,
            Err(err) => {
                if err.status() == Some(401)
                    && let Err(mark_err) = self.tokens.mark_reauth_required(user_id)
                {
                    tracing::warn!(error = %mark_err, "Failed to flag connection for re-auth");
                }
                tracing::warn!(
                    event_id = %link.provider_event_id,
                    error = %err,
                    "Failed to delete shadow event"
                );
                false
            }
        }
    }
}
