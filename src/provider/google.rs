//! Google Calendar v3 REST client

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use url::Url;

use super::{
    CalendarListEntry, CalendarProvider, EventPage, EventPatch, EventQuery, ProviderEvent,
    WatchChannel, WatchRequest,
};
use crate::error::{ProviderError, ProviderResult};

pub const GOOGLE_CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";

const MAX_RESULTS: &str = "2500";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListResponse {
    #[serde(default)]
    items: Vec<CalendarListEntry>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsResponse {
    /// Decoded one by one so a single odd event cannot sink the page
    #[serde(default)]
    items: Vec<serde_json::Value>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

/// Stateless HTTP wrapper; the bearer token is supplied per call.
#[derive(Debug, Clone)]
pub struct GoogleCalendarClient {
    http: reqwest::Client,
    base_url: Url,
}

impl GoogleCalendarClient {
    /// Build a client against `base_url` with a fixed per-request timeout
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).context("Invalid calendar API base URL")?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Calendar API base URL cannot carry a path: {}", base_url);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    /// Base URL joined with path segments, each one percent-escaped
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, access_token: &str, segments: &[&str]) -> RequestBuilder {
        self.http
            .request(method, self.url(segments))
            .bearer_auth(access_token)
    }

    async fn execute(&self, request: RequestBuilder) -> ProviderResult<String> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> ProviderResult<T> {
        let body = self.execute(request).await?;
        serde_json::from_str(&body).map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendarClient {
    async fn list_calendars(&self, access_token: &str) -> ProviderResult<Vec<CalendarListEntry>> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.request(
                Method::GET,
                access_token,
                &["users", "me", "calendarList"],
            );
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: CalendarListResponse = self.execute_json(request).await?;
            items.extend(page.items);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(items)
    }

    async fn create_calendar(
        &self,
        access_token: &str,
        summary: &str,
        description: Option<&str>,
    ) -> ProviderResult<CalendarListEntry> {
        let mut body = json!({ "summary": summary });
        if let Some(description) = description {
            body["description"] = json!(description);
        }
        let request = self
            .request(Method::POST, access_token, &["calendars"])
            .json(&body);
        self.execute_json(request).await
    }

    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        query: &EventQuery,
    ) -> ProviderResult<EventPage> {
        let mut params: Vec<(&str, String)> = vec![
            ("singleEvents", "true".to_string()),
            ("showDeleted", "true".to_string()),
            ("maxResults", MAX_RESULTS.to_string()),
        ];
        match query {
            EventQuery::Incremental { sync_token } => {
                params.push(("syncToken", sync_token.clone()));
            }
            EventQuery::Window { time_min, time_max } => {
                params.push(("orderBy", "startTime".to_string()));
                params.push(("timeMin", time_min.to_rfc3339_opts(SecondsFormat::Secs, true)));
                params.push(("timeMax", time_max.to_rfc3339_opts(SecondsFormat::Secs, true)));
            }
        }

        let mut result = EventPage::default();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .request(
                    Method::GET,
                    access_token,
                    &["calendars", calendar_id, "events"],
                )
                .query(&params);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: EventsResponse = self.execute_json(request).await?;
            for item in page.items {
                let event_id = item.get("id").and_then(|id| id.as_str()).map(str::to_owned);
                match serde_json::from_value::<ProviderEvent>(item) {
                    Ok(event) => result.items.push(event),
                    Err(err) => tracing::warn!(
                        calendar_id,
                        event_id = event_id.as_deref().unwrap_or("<none>"),
                        error = %err,
                        "Skipping undecodable event"
                    ),
                }
            }
            if page.next_sync_token.is_some() {
                result.next_sync_token = page.next_sync_token;
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(result)
    }

    async fn insert_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &ProviderEvent,
    ) -> ProviderResult<ProviderEvent> {
        let request = self
            .request(
                Method::POST,
                access_token,
                &["calendars", calendar_id, "events"],
            )
            .json(event);
        self.execute_json(request).await
    }

    async fn patch_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> ProviderResult<ProviderEvent> {
        let request = self
            .request(
                Method::PATCH,
                access_token,
                &["calendars", calendar_id, "events", event_id],
            )
            .json(patch);
        self.execute_json(request).await
    }

    async fn get_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> ProviderResult<ProviderEvent> {
        let request = self.request(
            Method::GET,
            access_token,
            &["calendars", calendar_id, "events", event_id],
        );
        self.execute_json(request).await
    }

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> ProviderResult<()> {
        let request = self.request(
            Method::DELETE,
            access_token,
            &["calendars", calendar_id, "events", event_id],
        );
        self.execute(request).await.map(|_| ())
    }

    async fn watch_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        watch: &WatchRequest,
    ) -> ProviderResult<WatchChannel> {
        let request = self
            .request(
                Method::POST,
                access_token,
                &["calendars", calendar_id, "events", "watch"],
            )
            .json(watch);
        self.execute_json(request).await
    }
}
