//! In-memory provider and OAuth fakes shared by the integration tests
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use calbridge::config::Config;
use calbridge::crypto::TokenCipher;
use calbridge::db::Database;
use calbridge::engine::Engine;
use calbridge::error::{OAuthError, ProviderError, ProviderResult};
use calbridge::models::Calendar;
use calbridge::oauth::{OAuthClient, TokenResponse};
use calbridge::provider::{
    CalendarListEntry, CalendarProvider, EventPage, EventPatch, EventQuery, ProviderEvent,
    WatchChannel, WatchRequest,
};
use calbridge::title::HeuristicTitler;

pub const USER: i64 = 1;
pub const PRIMARY: &str = "me@example.com";

pub fn status(code: u16) -> ProviderError {
    ProviderError::Status {
        status: code,
        body: format!("fake {code}"),
    }
}

pub fn event(value: Value) -> ProviderEvent {
    serde_json::from_value(value).expect("valid event json")
}

pub fn calendar_entry(id: &str, name: &str, primary: bool) -> CalendarListEntry {
    CalendarListEntry {
        id: id.into(),
        summary: Some(name.into()),
        time_zone: Some("UTC".into()),
        access_role: Some("owner".into()),
        primary,
        ..CalendarListEntry::default()
    }
}

/// A provider call, recorded in order
#[derive(Debug, Clone)]
pub enum Call {
    ListCalendars,
    CreateCalendar(String),
    ListEvents { calendar: String, query: EventQuery },
    Insert { calendar: String, event: ProviderEvent },
    Patch { calendar: String, event_id: String, patch: EventPatch },
    Get { calendar: String, event_id: String },
    Delete { calendar: String, event_id: String },
    Watch { calendar: String, request: WatchRequest },
}

#[derive(Default)]
pub struct FakeState {
    pub calendars: Vec<CalendarListEntry>,
    pub events: HashMap<String, Vec<ProviderEvent>>,
    /// Responses handed out before falling back to the stored events
    pub scripted: HashMap<String, VecDeque<ProviderResult<EventPage>>>,
    pub calls: Vec<Call>,
    pub fail_deletes: bool,
    pub fail_patches: Option<u16>,
    pub fail_list_calendars: Option<u16>,
    next_id: u64,
    last_updated: Option<DateTime<Utc>>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Strictly increasing modification stamps
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_updated {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_updated = Some(stamp);
        stamp
    }

    fn find_mut(&mut self, calendar: &str, event_id: &str) -> Option<&mut ProviderEvent> {
        self.events
            .get_mut(calendar)?
            .iter_mut()
            .find(|e| e.id.as_deref() == Some(event_id))
    }
}

#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake provider lock")
    }

    pub fn add_calendar(&self, entry: CalendarListEntry) {
        self.state().calendars.push(entry);
    }

    pub fn put_event(&self, calendar: &str, event: ProviderEvent) {
        let mut state = self.state();
        let events = state.events.entry(calendar.to_string()).or_default();
        events.retain(|e| e.id != event.id);
        events.push(event);
    }

    pub fn edit_event(&self, calendar: &str, event_id: &str, f: impl FnOnce(&mut ProviderEvent)) {
        let mut state = self.state();
        let event = state
            .find_mut(calendar, event_id)
            .expect("event to edit exists");
        f(event);
    }

    pub fn remove_event(&self, calendar: &str, event_id: &str) {
        if let Some(events) = self.state().events.get_mut(calendar) {
            events.retain(|e| e.id.as_deref() != Some(event_id));
        }
    }

    pub fn stored_event(&self, calendar: &str, event_id: &str) -> Option<ProviderEvent> {
        self.state().find_mut(calendar, event_id).cloned()
    }

    pub fn script(&self, calendar: &str, response: ProviderResult<EventPage>) {
        self.state()
            .scripted
            .entry(calendar.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn list_queries(&self, calendar: &str) -> Vec<EventQuery> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::ListEvents { calendar: c, query } if c == calendar => Some(query),
                _ => None,
            })
            .collect()
    }

    pub fn inserts(&self) -> Vec<(String, ProviderEvent)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Insert { calendar, event } => Some((calendar, event)),
                _ => None,
            })
            .collect()
    }

    pub fn patches(&self) -> Vec<(String, EventPatch)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Patch { event_id, patch, .. } => Some((event_id, patch)),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Delete { event_id, .. } => Some(event_id),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl CalendarProvider for FakeProvider {
    async fn list_calendars(&self, _access_token: &str) -> ProviderResult<Vec<CalendarListEntry>> {
        let mut state = self.state();
        state.calls.push(Call::ListCalendars);
        if let Some(code) = state.fail_list_calendars {
            return Err(status(code));
        }
        Ok(state.calendars.clone())
    }

    async fn create_calendar(
        &self,
        _access_token: &str,
        summary: &str,
        description: Option<&str>,
    ) -> ProviderResult<CalendarListEntry> {
        let mut state = self.state();
        state.calls.push(Call::CreateCalendar(summary.to_string()));
        let id = format!("{}@group.calendar.google.com", state.next_id("managed"));
        let entry = CalendarListEntry {
            description: description.map(str::to_string),
            ..calendar_entry(&id, summary, false)
        };
        state.calendars.push(entry.clone());
        Ok(entry)
    }

    async fn list_events(
        &self,
        _access_token: &str,
        calendar_id: &str,
        query: &EventQuery,
    ) -> ProviderResult<EventPage> {
        let mut state = self.state();
        state.calls.push(Call::ListEvents {
            calendar: calendar_id.to_string(),
            query: query.clone(),
        });
        if let Some(response) = state
            .scripted
            .get_mut(calendar_id)
            .and_then(VecDeque::pop_front)
        {
            return response;
        }
        // Expanded instances only, like singleEvents=true
        let items = state
            .events
            .get(calendar_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.recurrence.is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let next_sync_token = Some(state.next_id("sync"));
        Ok(EventPage {
            items,
            next_sync_token,
        })
    }

    async fn insert_event(
        &self,
        _access_token: &str,
        calendar_id: &str,
        event: &ProviderEvent,
    ) -> ProviderResult<ProviderEvent> {
        let mut state = self.state();
        state.calls.push(Call::Insert {
            calendar: calendar_id.to_string(),
            event: event.clone(),
        });
        let mut stored = event.clone();
        let id = state.next_id("evt");
        stored.ical_uid = Some(format!("{id}@google.com"));
        stored.id = Some(id);
        stored.updated = Some(state.tick());
        state
            .events
            .entry(calendar_id.to_string())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn patch_event(
        &self,
        _access_token: &str,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> ProviderResult<ProviderEvent> {
        let mut state = self.state();
        state.calls.push(Call::Patch {
            calendar: calendar_id.to_string(),
            event_id: event_id.to_string(),
            patch: patch.clone(),
        });
        if let Some(code) = state.fail_patches {
            return Err(status(code));
        }
        let stamp = state.tick();
        let event = state.find_mut(calendar_id, event_id).ok_or_else(|| status(404))?;
        patch.apply_to(event);
        event.updated = Some(stamp);
        Ok(event.clone())
    }

    async fn get_event(
        &self,
        _access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> ProviderResult<ProviderEvent> {
        let mut state = self.state();
        state.calls.push(Call::Get {
            calendar: calendar_id.to_string(),
            event_id: event_id.to_string(),
        });
        state
            .find_mut(calendar_id, event_id)
            .cloned()
            .ok_or_else(|| status(404))
    }

    async fn delete_event(
        &self,
        _access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> ProviderResult<()> {
        let mut state = self.state();
        state.calls.push(Call::Delete {
            calendar: calendar_id.to_string(),
            event_id: event_id.to_string(),
        });
        if state.fail_deletes {
            return Err(status(500));
        }
        let events = state.events.entry(calendar_id.to_string()).or_default();
        let before = events.len();
        events.retain(|e| e.id.as_deref() != Some(event_id));
        if events.len() == before {
            return Err(status(410));
        }
        Ok(())
    }

    async fn watch_events(
        &self,
        _access_token: &str,
        calendar_id: &str,
        request: &WatchRequest,
    ) -> ProviderResult<WatchChannel> {
        let mut state = self.state();
        state.calls.push(Call::Watch {
            calendar: calendar_id.to_string(),
            request: request.clone(),
        });
        let expiration = (Utc::now() + Duration::days(7)).timestamp_millis();
        Ok(WatchChannel {
            id: Some(request.id.clone()),
            resource_id: Some(format!("res-{calendar_id}")),
            expiration: Some(Value::String(expiration.to_string())),
        })
    }
}

/// What the fake token endpoint does on refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshBehavior {
    Succeed,
    Reject,
}

pub struct FakeOAuth {
    pub refresh_behavior: Mutex<RefreshBehavior>,
    pub refresh_calls: Mutex<u32>,
}

impl Default for FakeOAuth {
    fn default() -> Self {
        Self {
            refresh_behavior: Mutex::new(RefreshBehavior::Succeed),
            refresh_calls: Mutex::new(0),
        }
    }
}

impl FakeOAuth {
    pub fn set_refresh(&self, behavior: RefreshBehavior) {
        *self.refresh_behavior.lock().expect("oauth lock") = behavior;
    }

    pub fn refresh_count(&self) -> u32 {
        *self.refresh_calls.lock().expect("oauth lock")
    }
}

pub fn grant(access_token: &str, expires_in: i64) -> TokenResponse {
    TokenResponse {
        access_token: access_token.into(),
        refresh_token: Some("refresh-1".into()),
        expires_in: Some(expires_in),
        scope: Some("https://www.googleapis.com/auth/calendar".into()),
        token_type: Some("Bearer".into()),
    }
}

#[async_trait]
impl OAuthClient for FakeOAuth {
    fn authorization_url(&self, state: &str) -> String {
        format!("https://accounts.example/consent?state={state}")
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, OAuthError> {
        if code == "bad-code" {
            return Err(OAuthError::Rejected {
                status: 400,
                body: "invalid_grant".into(),
            });
        }
        Ok(grant("access-from-code", 3600))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse, OAuthError> {
        *self.refresh_calls.lock().expect("oauth lock") += 1;
        match *self.refresh_behavior.lock().expect("oauth lock") {
            RefreshBehavior::Succeed => Ok(TokenResponse {
                refresh_token: None,
                ..grant("access-refreshed", 3600)
            }),
            RefreshBehavior::Reject => Err(OAuthError::Rejected {
                status: 400,
                body: "invalid_grant".into(),
            }),
        }
    }

    async fn fetch_account_email(&self, _access_token: &str) -> Result<Option<String>, OAuthError> {
        Ok(Some(PRIMARY.into()))
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub provider: Arc<FakeProvider>,
    pub oauth: Arc<FakeOAuth>,
    pub config: Config,
}

impl Harness {
    /// Engine over an in-memory database with the primary calendar on the provider
    pub fn new(config: Config) -> Self {
        let provider = Arc::new(FakeProvider::default());
        provider.add_calendar(CalendarListEntry {
            time_zone: Some("America/New_York".into()),
            ..calendar_entry(PRIMARY, "Me", true)
        });
        let oauth = Arc::new(FakeOAuth::default());
        let db = Arc::new(Database::open_in_memory().expect("in-memory database"));
        let engine = Arc::new(Engine::new(
            db,
            provider.clone(),
            oauth.clone(),
            Arc::new(HeuristicTitler),
            TokenCipher::from_key([7u8; 32]),
            &config,
        ));
        Self {
            engine,
            provider,
            oauth,
            config,
        }
    }

    /// Harness with user [`USER`] already connected
    pub async fn connected() -> Self {
        Self::connected_with(Config::default()).await
    }

    pub async fn connected_with(config: Config) -> Self {
        let harness = Self::new(config);
        harness.connect(3600).await;
        harness
    }

    pub async fn connect(&self, expires_in: i64) {
        self.engine
            .tokens()
            .store_tokens(USER, &grant("access-1", expires_in))
            .await
            .expect("store tokens");
    }

    pub fn calendar(&self, provider_id: &str) -> Calendar {
        self.engine
            .db()
            .read(|store| store.calendar_by_provider_id(USER, provider_id))
            .expect("calendar lookup")
            .expect("calendar exists")
    }

    pub fn managed_calendar(&self) -> Calendar {
        self.engine
            .db()
            .read(|store| store.managed_calendar(USER))
            .expect("managed lookup")
            .expect("managed calendar exists")
    }
}
