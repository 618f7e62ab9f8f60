//! The set of provider calendars known for each user

use std::sync::Arc;

use crate::db::Database;
use crate::error::EngineResult;
use crate::models::Calendar;
use crate::provider::{CalendarListEntry, CalendarProvider};
use crate::tokens::TokenStore;

/// Name and description of the application-owned calendar
#[derive(Debug, Clone)]
pub struct ManagedCalendarSpec {
    pub name: String,
    pub description: String,
}

pub struct CalendarRegistry {
    db: Arc<Database>,
    provider: Arc<dyn CalendarProvider>,
    tokens: Arc<TokenStore>,
    managed: ManagedCalendarSpec,
}

impl CalendarRegistry {
    pub fn new(
        db: Arc<Database>,
        provider: Arc<dyn CalendarProvider>,
        tokens: Arc<TokenStore>,
        managed: ManagedCalendarSpec,
    ) -> Self {
        Self {
            db,
            provider,
            tokens,
            managed,
        }
    }

    fn is_managed_name(&self, entry: &CalendarListEntry) -> bool {
        entry.summary.as_deref() == Some(self.managed.name.as_str())
    }

    /// Pull the account's calendar list into the local table.
    ///
    /// New calendars start selected only if primary or managed; a user's
    /// selection on existing rows is left as it is.
    pub async fn sync_calendar_list(&self, user_id: i64) -> EngineResult<Vec<Calendar>> {
        let token = self.tokens.require_access_token(user_id).await?;
        let entries = self
            .tokens
            .check_provider(user_id, self.provider.list_calendars(&token).await)?;

        let calendars = self.db.transaction(|store| {
            let mut has_managed = store.managed_calendar(user_id)?.is_some();
            for entry in &entries {
                let claims_managed = self.is_managed_name(entry) && !has_managed;
                match store.calendar_by_provider_id(user_id, &entry.id)? {
                    Some(existing) => {
                        store.update_calendar_metadata(existing.id, entry)?;
                        if claims_managed {
                            store.mark_calendar_managed(existing.id)?;
                        }
                    }
                    None => {
                        store.insert_calendar(
                            user_id,
                            entry,
                            entry.primary || claims_managed,
                            claims_managed,
                        )?;
                    }
                }
                has_managed |= claims_managed;
            }
            store.list_calendars(user_id)
        })?;

        tracing::info!(user_id, calendars = calendars.len(), "Calendar list synced");
        Ok(calendars)
    }

    /// The user's managed calendar, created on the provider if missing.
    ///
    /// Always leaves it selected.
    pub async fn ensure_managed_calendar(&self, user_id: i64) -> EngineResult<Calendar> {
        if let Some(existing) = self.db.read(|store| store.managed_calendar(user_id))? {
            if existing.selected {
                return Ok(existing);
            }
            return Ok(self.db.transaction(|store| {
                store.mark_calendar_managed(existing.id)?;
                store
                    .get_calendar(existing.id)?
                    .ok_or_else(|| anyhow::anyhow!("Managed calendar {} vanished", existing.id))
            })?);
        }

        let token = self.tokens.require_access_token(user_id).await?;
        let created = self.tokens.check_provider(
            user_id,
            self.provider
                .create_calendar(&token, &self.managed.name, Some(&self.managed.description))
                .await,
        )?;
        tracing::info!(user_id, calendar_id = %created.id, "Created managed calendar");

        let calendar = self.db.transaction(|store| {
            let id = match store.calendar_by_provider_id(user_id, &created.id)? {
                Some(existing) => {
                    store.update_calendar_metadata(existing.id, &created)?;
                    store.mark_calendar_managed(existing.id)?;
                    existing.id
                }
                None => store.insert_calendar(user_id, &created, true, true)?.id,
            };
            store
                .get_calendar(id)?
                .ok_or_else(|| anyhow::anyhow!("Managed calendar {id} vanished"))
        })?;
        Ok(calendar)
    }

    /// Set `selected` to membership in `provider_ids`; the managed calendar stays selected
    pub fn set_selection(
        &self,
        user_id: i64,
        provider_ids: &[String],
    ) -> EngineResult<Vec<Calendar>> {
        Ok(self.db.transaction(|store| {
            for calendar in store.list_calendars(user_id)? {
                let selected = calendar.is_managed || provider_ids.contains(&calendar.provider_id);
                if selected != calendar.selected {
                    store.set_calendar_selected(calendar.id, selected)?;
                }
            }
            store.list_calendars(user_id)
        })?)
    }
}
