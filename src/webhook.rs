//! Push-notification channels and inbound notification handling

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::db::Database;
use crate::models::Calendar;
use crate::provider::{CalendarProvider, WatchRequest};
use crate::sync::EventSyncEngine;
use crate::tokens::TokenStore;

/// Channels expiring within this many hours are replaced
const RENEWAL_MARGIN_HOURS: i64 = 6;

const CHANNEL_KIND: &str = "web_hook";

/// Whether the calendar's channel is missing or close to expiry
pub fn needs_renewal(calendar: &Calendar, now: DateTime<Utc>) -> bool {
    calendar
        .channel_expiration
        .is_none_or(|expires| expires <= now + Duration::hours(RENEWAL_MARGIN_HOURS))
}

/// A provider push notification, read from its headers
#[derive(Debug, Clone, Default)]
pub struct Notification {
    pub channel_id: Option<String>,
    pub resource_id: Option<String>,
    pub resource_state: Option<String>,
    pub channel_token: Option<String>,
}

/// What receiving a notification led to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationAction {
    /// Channel handshake; nothing to do
    Acknowledged,
    /// Unknown channel or bad token
    Ignored,
    Resynced { calendar_id: i64 },
    /// Resync attempted and failed; logged
    Failed,
}

pub struct WebhookChannelManager {
    db: Arc<Database>,
    provider: Arc<dyn CalendarProvider>,
    tokens: Arc<TokenStore>,
    webhook_url: Option<String>,
    channel_token: Option<String>,
}

impl WebhookChannelManager {
    /// `webhook_url` is only used when it is https
    pub fn new(
        db: Arc<Database>,
        provider: Arc<dyn CalendarProvider>,
        tokens: Arc<TokenStore>,
        webhook_url: Option<String>,
        channel_token: Option<String>,
    ) -> Self {
        let webhook_url = webhook_url.filter(|url| url.starts_with("https://"));
        Self {
            db,
            provider,
            tokens,
            webhook_url,
            channel_token: channel_token.filter(|t| !t.is_empty()),
        }
    }

    /// Register or renew the calendar's push channel.
    ///
    /// Best effort: a failed registration leaves the previous channel state
    /// alone. Returns whether a new channel was stored.
    pub async fn ensure_watch(&self, calendar: &Calendar) -> bool {
        let Some(address) = self.webhook_url.as_deref() else {
            return false;
        };
        if !needs_renewal(calendar, Utc::now()) {
            return false;
        }
        let user_id = calendar.user_id;
        let token = match self.tokens.access_token(user_id).await {
            Ok(Some(token)) => token,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(user_id, error = %err, "Could not load credentials for watch");
                return false;
            }
        };

        let request = WatchRequest {
            id: format!("cb-{user_id}-{}", Uuid::new_v4()),
            kind: CHANNEL_KIND.to_string(),
            address: address.to_string(),
            token: self.channel_token.clone(),
        };
        let channel = match self
            .provider
            .watch_events(&token, &calendar.provider_id, &request)
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                if err.status() == Some(401)
                    && let Err(mark_err) = self.tokens.mark_reauth_required(user_id)
                {
                    tracing::warn!(error = %mark_err, "Failed to flag connection for re-auth");
                }
                tracing::warn!(
                    calendar_id = calendar.id,
                    error = %err,
                    "Watch registration failed; polling continues"
                );
                return false;
            }
        };

        let channel_id = channel.id.clone().unwrap_or(request.id);
        let stored = self.db.read(|store| {
            store.save_channel(
                calendar.id,
                Some(&channel_id),
                channel.resource_id.as_deref(),
                channel.expires_at(),
            )
        });
        match stored {
            Ok(()) => {
                tracing::info!(
                    calendar_id = calendar.id,
                    channel_id = %channel_id,
                    "Watch channel registered"
                );
                true
            }
            Err(err) => {
                tracing::warn!(
                    calendar_id = calendar.id,
                    error = %err,
                    "Failed to store watch channel"
                );
                false
            }
        }
    }

    /// React to a push notification. Never fails: the provider disables
    /// channels that see errors, so problems are only logged.
    pub async fn handle_notification(
        &self,
        sync: &EventSyncEngine,
        notification: &Notification,
    ) -> NotificationAction {
        if notification.resource_state.as_deref() == Some("sync") {
            return NotificationAction::Acknowledged;
        }
        if let Some(expected) = &self.channel_token
            && notification.channel_token.as_deref() != Some(expected.as_str())
        {
            tracing::warn!(channel_id = ?notification.channel_id, "Webhook token mismatch");
            return NotificationAction::Ignored;
        }
        let Some(channel_id) = notification.channel_id.as_deref() else {
            return NotificationAction::Ignored;
        };

        let calendar = match self.db.read(|store| store.calendar_by_channel(channel_id)) {
            Ok(Some(calendar)) => calendar,
            Ok(None) => {
                tracing::debug!(channel_id, "Notification for unknown channel");
                return NotificationAction::Ignored;
            }
            Err(err) => {
                tracing::error!(error = %err, "Channel lookup failed");
                return NotificationAction::Failed;
            }
        };

        let window = sync.default_window(Utc::now());
        match sync
            .sync_calendar(calendar.user_id, &calendar, window, false)
            .await
        {
            Ok(_) => NotificationAction::Resynced {
                calendar_id: calendar.id,
            },
            Err(err) => {
                tracing::warn!(
                    calendar_id = calendar.id,
                    error = %err,
                    "Webhook-triggered sync failed"
                );
                NotificationAction::Failed
            }
        }
    }
}
