//! Wires the sync components together and exposes the operations the HTTP
//! layer, the scheduler and the CLI drive.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};

use crate::calendars::{CalendarRegistry, ManagedCalendarSpec};
use crate::config::Config;
use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::dedupe::dedupe_events;
use crate::editor::{EventEdit, EventEditor};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    CachedEvent, Calendar, ConnectionStatus, CreateTodoRequest, OAuthStartResponse,
    PresentedEvent, TodoItem, UpdateTodoRequest,
};
use crate::oauth::{GoogleOAuthClient, OAuthClient, generate_state};
use crate::provider::{CalendarProvider, GoogleCalendarClient};
use crate::sync::{EventSyncEngine, SyncReport};
use crate::title::{HeuristicTitler, TitleGenerator};
use crate::todo_link::TodoLinkManager;
use crate::tokens::TokenStore;
use crate::webhook::{Notification, NotificationAction, WebhookChannelManager};

/// How long an OAuth `state` value stays redeemable
const OAUTH_STATE_TTL_MINUTES: i64 = 10;

pub struct Engine {
    db: Arc<Database>,
    tokens: Arc<TokenStore>,
    registry: Arc<CalendarRegistry>,
    links: Arc<TodoLinkManager>,
    webhooks: Arc<WebhookChannelManager>,
    sync: Arc<EventSyncEngine>,
    editor: EventEditor,
}

impl Engine {
    /// Assemble the engine around explicit collaborators
    pub fn new(
        db: Arc<Database>,
        provider: Arc<dyn CalendarProvider>,
        oauth: Arc<dyn OAuthClient>,
        titles: Arc<dyn TitleGenerator>,
        cipher: TokenCipher,
        config: &Config,
    ) -> Self {
        let tokens = Arc::new(TokenStore::new(db.clone(), oauth, cipher));
        let registry = Arc::new(CalendarRegistry::new(
            db.clone(),
            provider.clone(),
            tokens.clone(),
            ManagedCalendarSpec {
                name: config.sync.managed_calendar_name.clone(),
                description: config.sync.managed_calendar_description.clone(),
            },
        ));
        let links = Arc::new(TodoLinkManager::new(
            db.clone(),
            provider.clone(),
            tokens.clone(),
            registry.clone(),
            titles,
        ));
        let webhooks = Arc::new(WebhookChannelManager::new(
            db.clone(),
            provider.clone(),
            tokens.clone(),
            config.google.https_webhook_url().map(str::to_string),
            config.google.webhook_token.clone(),
        ));
        let sync = Arc::new(EventSyncEngine::new(
            db.clone(),
            provider.clone(),
            tokens.clone(),
            links.clone(),
            webhooks.clone(),
            config.sync.lookback_days,
            config.sync.lookahead_days,
        ));
        let editor = EventEditor::new(db.clone(), provider, tokens.clone(), sync.clone());

        Self {
            db,
            tokens,
            registry,
            links,
            webhooks,
            sync,
            editor,
        }
    }

    /// Production wiring: SQLite at the configured path, Google endpoints
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let db = Database::open(&config.database.path).context("Failed to open database")?;
        let timeout = StdDuration::from_secs(config.google.request_timeout_secs);
        let provider = GoogleCalendarClient::new(&config.google.api_base_url, timeout)?;
        let oauth = GoogleOAuthClient::new(&config.google)?;
        let cipher = TokenCipher::from_secret(&config.security.token_secret)
            .context("security.token_secret must be set to store calendar credentials")?;

        Ok(Self::new(
            Arc::new(db),
            Arc::new(provider),
            Arc::new(oauth),
            Arc::new(HeuristicTitler),
            cipher,
            config,
        ))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn registry(&self) -> &CalendarRegistry {
        &self.registry
    }

    pub fn links(&self) -> &TodoLinkManager {
        &self.links
    }

    pub fn sync(&self) -> &EventSyncEngine {
        &self.sync
    }

    // --- connection ---

    pub fn connection_status(&self, user_id: i64) -> EngineResult<ConnectionStatus> {
        Ok(self.db.read(|store| store.get_connection(user_id))?.into())
    }

    /// Begin consent: persist a fresh `state` and build the consent URL
    pub fn start_oauth(&self, user_id: i64) -> EngineResult<OAuthStartResponse> {
        let state = generate_state();
        let expires_at = Utc::now() + Duration::minutes(OAUTH_STATE_TTL_MINUTES);
        self.db
            .read(|store| store.insert_oauth_state(&state, user_id, expires_at))?;
        Ok(OAuthStartResponse {
            authorization_url: self.tokens.oauth().authorization_url(&state),
            state,
        })
    }

    /// Finish consent. The initial calendar sync is best effort.
    pub async fn complete_oauth(&self, code: &str, state: &str) -> EngineResult<i64> {
        let user_id = self
            .db
            .read(|store| store.take_oauth_state(state, Utc::now()))?
            .ok_or_else(|| EngineError::NotFound("OAuth state".into()))?;

        let tokens = self
            .tokens
            .oauth()
            .exchange_code(code)
            .await
            .map_err(|err| anyhow::Error::new(err).context("Authorization code exchange failed"))?;
        self.tokens.store_tokens(user_id, &tokens).await?;
        tracing::info!(user_id, "Calendar connected");

        if let Err(err) = self.registry.sync_calendar_list(user_id).await {
            tracing::warn!(user_id, error = %err, "Initial calendar list sync failed");
        } else if let Err(err) = self.registry.ensure_managed_calendar(user_id).await {
            tracing::warn!(user_id, error = %err, "Could not set up managed calendar");
        }
        Ok(user_id)
    }

    // --- sync ---

    /// Calendar list, managed calendar, then every selected calendar's events
    pub async fn sync_user(&self, user_id: i64) -> EngineResult<SyncReport> {
        self.registry.sync_calendar_list(user_id).await?;
        self.registry.ensure_managed_calendar(user_id).await?;
        let window = self.sync.default_window(Utc::now());
        self.sync.sync_selected_events(user_id, window).await
    }

    pub async fn handle_notification(&self, notification: &Notification) -> NotificationAction {
        self.webhooks
            .handle_notification(&self.sync, notification)
            .await
    }

    // --- calendars and events ---

    pub fn list_calendars(&self, user_id: i64) -> EngineResult<Vec<Calendar>> {
        Ok(self.db.read(|store| store.list_calendars(user_id))?)
    }

    pub fn set_selection(
        &self,
        user_id: i64,
        provider_ids: &[String],
    ) -> EngineResult<Vec<Calendar>> {
        self.registry.set_selection(user_id, provider_ids)
    }

    /// Deduplicated events overlapping `[start, end)`.
    ///
    /// Declined invitations are dropped; todo shadows only with `include_todos`.
    pub fn list_events(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_todos: bool,
    ) -> EngineResult<Vec<PresentedEvent>> {
        let events = self
            .db
            .read(|store| store.list_presented_events(user_id, start, end))?
            .into_iter()
            .filter(|e| !e.event.declined_by_self())
            .filter(|e| include_todos || e.todo_id.is_none())
            .collect();
        Ok(dedupe_events(events))
    }

    pub async fn edit_event(
        &self,
        user_id: i64,
        event_id: i64,
        edit: EventEdit,
    ) -> EngineResult<Option<CachedEvent>> {
        let (event, calendar) = self.db.read(|store| {
            let Some(event) = store.get_event(user_id, event_id)? else {
                return Ok(None);
            };
            Ok(store
                .get_calendar(event.calendar_id)?
                .map(|calendar| (event, calendar)))
        })?
        .ok_or_else(|| EngineError::NotFound(format!("event {event_id}")))?;

        self.editor.update_event(&event, &calendar, edit).await
    }

    // --- todos ---

    pub fn list_todos(&self, user_id: i64) -> EngineResult<Vec<TodoItem>> {
        Ok(self.db.read(|store| store.list_todos(user_id))?)
    }

    pub async fn create_todo(
        &self,
        user_id: i64,
        request: CreateTodoRequest,
    ) -> EngineResult<TodoItem> {
        let text = request.text.trim();
        let todo = self.db.read(|store| {
            store.insert_todo(
                user_id,
                text,
                request.deadline,
                request.deadline.is_some() && request.deadline_is_date_only,
                Utc::now(),
            )
        })?;
        if todo.deadline.is_some() {
            self.sync_todo_event(&todo, request.time_zone.as_deref()).await;
        }
        Ok(todo)
    }

    pub async fn update_todo(
        &self,
        user_id: i64,
        todo_id: i64,
        request: UpdateTodoRequest,
    ) -> EngineResult<TodoItem> {
        let mut todo = self.get_todo(user_id, todo_id)?;
        let now = Utc::now();

        if let Some(text) = request.text {
            todo.text = text.trim().to_string();
        }
        if let Some(completed) = request.completed
            && completed != todo.completed
        {
            todo.completed = completed;
            todo.completed_at = completed.then_some(now);
        }
        if let Some(deadline) = request.deadline {
            todo.deadline = deadline;
        }
        if let Some(date_only) = request.deadline_is_date_only {
            todo.deadline_is_date_only = date_only;
        }
        if todo.deadline.is_none() {
            todo.deadline_is_date_only = false;
        }
        todo.updated_at = now;
        self.db.read(|store| store.update_todo(&todo))?;

        self.sync_todo_event(&todo, request.time_zone.as_deref()).await;
        Ok(todo)
    }

    /// Remove the todo; its shadow event is deleted first, best effort
    pub async fn delete_todo(&self, user_id: i64, todo_id: i64) -> EngineResult<()> {
        let todo = self.get_todo(user_id, todo_id)?;
        if let Err(err) = self.links.unlink_todo(&todo, true).await {
            tracing::warn!(todo_id, error = %err, "Failed to unlink todo before delete");
        }
        self.db.read(|store| store.delete_todo(todo_id))?;
        Ok(())
    }

    fn get_todo(&self, user_id: i64, todo_id: i64) -> EngineResult<TodoItem> {
        self.db
            .read(|store| store.get_user_todo(user_id, todo_id))?
            .ok_or_else(|| EngineError::NotFound(format!("todo {todo_id}")))
    }

    /// Link failures never fail the todo request
    async fn sync_todo_event(&self, todo: &TodoItem, time_zone: Option<&str>) {
        match self.links.upsert_event_for_todo(todo, time_zone).await {
            Ok(outcome) => tracing::debug!(todo_id = todo.id, ?outcome, "Todo event reconciled"),
            Err(err) => tracing::warn!(todo_id = todo.id, error = %err, "Todo event sync failed"),
        }
    }
}
