//! Per-calendar event sync: incremental via sync tokens, full over a window

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::db::Database;
use crate::error::{EngineError, EngineResult, ProviderError, ProviderOutcome};
use crate::models::{CachedEvent, Calendar};
use crate::provider::{CalendarProvider, EventDateTime, EventQuery, EventStatus, ProviderEvent};
use crate::time::local_midnight;
use crate::todo_link::TodoLinkManager;
use crate::tokens::TokenStore;
use crate::webhook::WebhookChannelManager;

/// Time range fetched by a full sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SyncWindow {
    pub fn around(anchor: DateTime<Utc>, lookback_days: i64, lookahead_days: i64) -> Self {
        Self {
            start: anchor - Duration::days(lookback_days),
            end: anchor + Duration::days(lookahead_days),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CalendarSyncStats {
    pub upserted: usize,
    pub deleted: usize,
    /// The stored sync token was rejected and a window sync ran instead
    pub full_resync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarSyncOutcome {
    Synced(CalendarSyncStats),
    /// 403/404: not accessible this tick; state untouched
    Skipped { status: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CalendarSyncStatus {
    Synced,
    Skipped,
    Failed,
}

/// One calendar's line in a sync report
#[derive(Debug, Clone, Serialize)]
pub struct CalendarReport {
    pub calendar_id: i64,
    pub provider_id: String,
    pub name: String,
    pub status: CalendarSyncStatus,
    #[serde(flatten)]
    pub stats: CalendarSyncStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CalendarReport {
    fn new(calendar: &Calendar, status: CalendarSyncStatus) -> Self {
        Self {
            calendar_id: calendar.id,
            provider_id: calendar.provider_id.clone(),
            name: calendar.name.clone(),
            status,
            stats: CalendarSyncStats::default(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub calendars: Vec<CalendarReport>,
}

impl SyncReport {
    pub fn failed(&self) -> usize {
        self.calendars
            .iter()
            .filter(|c| c.status == CalendarSyncStatus::Failed)
            .count()
    }
}

/// The instant a provider start/end denotes; dates are midnight in the calendar's zone
pub fn instant_of(value: &EventDateTime, calendar: &Calendar) -> Option<DateTime<Utc>> {
    if let Some(instant) = value.date_time {
        return Some(instant.with_timezone(&Utc));
    }
    value.date.map(|date| local_midnight(date, calendar.zone()))
}

/// Cache row for a provider event.
///
/// Date-only start/end are midnights in the calendar's zone. `None` when the
/// event has no id or no usable start.
pub fn cached_event_from_provider(
    calendar: &Calendar,
    event: &ProviderEvent,
) -> Option<CachedEvent> {
    let provider_event_id = event.id.clone()?;
    let start_value = event.start.as_ref()?;
    let start = instant_of(start_value, calendar)?;
    let is_all_day = start_value.is_date_only();
    let end = event
        .end
        .as_ref()
        .and_then(|end| instant_of(end, calendar))
        .unwrap_or(if is_all_day { start + Duration::days(1) } else { start });

    Some(CachedEvent {
        id: 0,
        user_id: calendar.user_id,
        calendar_id: calendar.id,
        provider_event_id,
        recurring_event_id: event.recurring_event_id.clone(),
        ical_uid: event.ical_uid.clone(),
        summary: event.summary.clone(),
        description: event.description.clone(),
        location: event.location.clone(),
        start,
        end,
        is_all_day,
        status: event.status.unwrap_or(EventStatus::Confirmed).as_str().to_string(),
        visibility: event.visibility.clone(),
        transparency: event.transparency.clone(),
        provider_updated_at: event.updated,
        html_link: event.html_link.clone(),
        hangout_link: event.hangout_link.clone(),
        conference_link: event.conference_link(),
        organizer: event
            .organizer
            .as_ref()
            .and_then(|o| serde_json::to_value(o).ok()),
        attendees: event
            .attendees
            .as_ref()
            .and_then(|a| serde_json::to_value(a).ok()),
        raw_payload: event.to_raw(),
    })
}

pub struct EventSyncEngine {
    db: Arc<Database>,
    provider: Arc<dyn CalendarProvider>,
    tokens: Arc<TokenStore>,
    links: Arc<TodoLinkManager>,
    webhooks: Arc<WebhookChannelManager>,
    lookback_days: i64,
    lookahead_days: i64,
}

impl EventSyncEngine {
    pub fn new(
        db: Arc<Database>,
        provider: Arc<dyn CalendarProvider>,
        tokens: Arc<TokenStore>,
        links: Arc<TodoLinkManager>,
        webhooks: Arc<WebhookChannelManager>,
        lookback_days: i64,
        lookahead_days: i64,
    ) -> Self {
        Self {
            db,
            provider,
            tokens,
            links,
            webhooks,
            lookback_days,
            lookahead_days,
        }
    }

    /// The configured look-back/look-ahead window around `now`
    pub fn default_window(&self, now: DateTime<Utc>) -> SyncWindow {
        SyncWindow::around(now, self.lookback_days, self.lookahead_days)
    }

    /// Pull one calendar's changes into the cache.
    ///
    /// With a stored sync token only the delta is fetched; a 410 on that
    /// token drops it and a window sync runs in the same call. On any error
    /// the stored token and `last_synced_at` stay as they were.
    pub async fn sync_calendar(
        &self,
        user_id: i64,
        calendar: &Calendar,
        window: SyncWindow,
        force_full: bool,
    ) -> EngineResult<CalendarSyncOutcome> {
        let token = self.tokens.require_access_token(user_id).await?;
        let mut sync_token = calendar.sync_token.clone().filter(|_| !force_full);
        let mut full_resync = false;

        let page = loop {
            let query = match &sync_token {
                Some(sync_token) => EventQuery::Incremental {
                    sync_token: sync_token.clone(),
                },
                None => EventQuery::Window {
                    time_min: window.start,
                    time_max: window.end,
                },
            };
            let result = self
                .provider
                .list_events(&token, &calendar.provider_id, &query)
                .await;

            match ProviderOutcome::from(result) {
                ProviderOutcome::Ok(page) => break page,
                ProviderOutcome::Stale if sync_token.is_some() => {
                    tracing::info!(
                        calendar_id = calendar.id,
                        "Sync token expired; running full sync"
                    );
                    self.db.read(|store| store.clear_sync_token(calendar.id))?;
                    sync_token = None;
                    full_resync = true;
                }
                ProviderOutcome::Stale => {
                    return Err(ProviderError::Status {
                        status: 410,
                        body: "window listing reported an expired sync token".into(),
                    }
                    .into());
                }
                outcome @ (ProviderOutcome::Forbidden | ProviderOutcome::NotFound) => {
                    let status = match outcome {
                        ProviderOutcome::Forbidden => 403,
                        _ => 404,
                    };
                    tracing::warn!(
                        status,
                        calendar_id = calendar.id,
                        provider_id = %calendar.provider_id,
                        "Calendar not accessible; skipping"
                    );
                    return Ok(CalendarSyncOutcome::Skipped { status });
                }
                ProviderOutcome::Unauthorized => {
                    self.tokens.mark_reauth_required(user_id)?;
                    return Err(EngineError::ReauthRequired { user_id });
                }
                ProviderOutcome::Transient(err) => return Err(err.into()),
            }
        };

        let now = Utc::now();
        let stats = self.db.transaction(|store| {
            let mut stats = CalendarSyncStats {
                full_resync,
                ..CalendarSyncStats::default()
            };
            for item in &page.items {
                let Some(event_id) = item.id.as_deref() else {
                    continue;
                };
                if item.is_cancelled() || item.declined_by_self() {
                    if store.delete_event(calendar.id, event_id)? {
                        stats.deleted += 1;
                    }
                    if let Err(err) =
                        self.links.handle_event_deleted(store, calendar.id, event_id)
                    {
                        tracing::warn!(event_id, error = %err, "Failed to unlink deleted event");
                    }
                    continue;
                }
                let Some(row) = cached_event_from_provider(calendar, item) else {
                    tracing::debug!(event_id, "Skipping event without a start");
                    continue;
                };
                store.upsert_event(&row)?;
                stats.upserted += 1;
                if let Err(err) = self.links.handle_event_updated(store, calendar, item, &row) {
                    tracing::warn!(event_id, error = %err, "Failed to reconcile linked todo");
                }
            }
            store.save_sync_state(calendar.id, page.next_sync_token.as_deref(), now)?;
            store.touch_last_sync(user_id, now)?;
            Ok(stats)
        })?;

        tracing::info!(
            calendar_id = calendar.id,
            upserted = stats.upserted,
            deleted = stats.deleted,
            full_resync = stats.full_resync,
            "Calendar synced"
        );
        Ok(CalendarSyncOutcome::Synced(stats))
    }

    /// Store one event we just wrote and reconcile its todo link
    pub fn cache_event(
        &self,
        calendar: &Calendar,
        event: &ProviderEvent,
    ) -> EngineResult<Option<CachedEvent>> {
        let Some(mut row) = cached_event_from_provider(calendar, event) else {
            return Ok(None);
        };
        let row = self.db.transaction(|store| {
            row.id = store.upsert_event(&row)?;
            if let Err(err) = self.links.handle_event_updated(store, calendar, event, &row) {
                tracing::warn!(
                    event_id = %row.provider_event_id,
                    error = %err,
                    "Failed to reconcile linked todo"
                );
            }
            Ok(row)
        })?;
        Ok(Some(row))
    }

    /// Sync every selected calendar, then make sure each has a push channel.
    ///
    /// One failing calendar is recorded and the batch goes on; credential
    /// problems end the batch because every calendar would hit them.
    pub async fn sync_selected_events(
        &self,
        user_id: i64,
        window: SyncWindow,
    ) -> EngineResult<SyncReport> {
        let calendars = self.db.read(|store| store.list_selected_calendars(user_id))?;
        let mut report = SyncReport::default();

        for calendar in calendars {
            let line = match self.sync_calendar(user_id, &calendar, window, false).await {
                Ok(CalendarSyncOutcome::Synced(stats)) => {
                    self.webhooks.ensure_watch(&calendar).await;
                    CalendarReport {
                        stats,
                        ..CalendarReport::new(&calendar, CalendarSyncStatus::Synced)
                    }
                }
                Ok(CalendarSyncOutcome::Skipped { .. }) => {
                    CalendarReport::new(&calendar, CalendarSyncStatus::Skipped)
                }
                Err(
                    err @ (EngineError::ReauthRequired { .. }
                    | EngineError::NotConnected { .. }
                    | EngineError::TokenUnavailable { .. }),
                ) => return Err(err),
                Err(err) => {
                    tracing::warn!(calendar_id = calendar.id, error = %err, "Calendar sync failed");
                    CalendarReport {
                        error: Some(err.to_string()),
                        ..CalendarReport::new(&calendar, CalendarSyncStatus::Failed)
                    }
                }
            };
            report.calendars.push(line);
        }
        Ok(report)
    }
}
