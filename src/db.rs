//! Database module for the calbridge server
//!
//! All row access goes through [`Store`], a view over a borrowed connection.
//! [`Database::read`] hands one out for standalone statements and
//! [`Database::transaction`] for a unit of work that commits only when the
//! closure returns `Ok`.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::models::{
    CachedEvent, Calendar, CalendarConnection, PresentedEvent, TodoEventLink, TodoItem,
};
use crate::provider::CalendarListEntry;

/// Thread-safe database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        Self::with_connection(conn)
    }

    /// Throwaway database, used by tests and one-shot tooling
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))
    }

    /// Initialize the database schema
    fn init(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- One provider connection per user
            CREATE TABLE IF NOT EXISTS calendar_connections (
                user_id INTEGER PRIMARY KEY,
                encrypted_access_token TEXT NOT NULL,
                encrypted_refresh_token TEXT,
                token_expiry TEXT,
                scopes TEXT,
                account_email TEXT,
                requires_reauth INTEGER NOT NULL DEFAULT 0,
                connected_at TEXT NOT NULL,
                last_sync_at TEXT
            );

            -- Pending OAuth consent round trips
            CREATE TABLE IF NOT EXISTS oauth_states (
                state TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS calendars (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                provider_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                time_zone TEXT,
                access_role TEXT,
                is_primary INTEGER NOT NULL DEFAULT 0,
                selected INTEGER NOT NULL DEFAULT 0,
                is_managed INTEGER NOT NULL DEFAULT 0,
                color_id TEXT,
                sync_token TEXT,
                channel_id TEXT,
                channel_resource_id TEXT,
                channel_expiration TEXT,
                last_synced_at TEXT,
                UNIQUE (user_id, provider_id)
            );

            CREATE TABLE IF NOT EXISTS calendar_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                calendar_id INTEGER NOT NULL,
                provider_event_id TEXT NOT NULL,
                recurring_event_id TEXT,
                ical_uid TEXT,
                summary TEXT,
                description TEXT,
                location TEXT,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                is_all_day INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                visibility TEXT,
                transparency TEXT,
                provider_updated_at TEXT,
                html_link TEXT,
                hangout_link TEXT,
                conference_link TEXT,
                organizer TEXT,
                attendees TEXT,
                raw_payload TEXT NOT NULL,
                UNIQUE (calendar_id, provider_event_id),
                FOREIGN KEY (calendar_id) REFERENCES calendars(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS todos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                deadline TEXT,
                deadline_is_date_only INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS todo_event_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                todo_id INTEGER NOT NULL UNIQUE,
                calendar_id INTEGER NOT NULL,
                provider_event_id TEXT NOT NULL,
                ical_uid TEXT,
                event_start TEXT,
                event_end TEXT,
                todo_text_hash TEXT,
                event_updated_at TEXT,
                last_synced_at TEXT NOT NULL,
                UNIQUE (calendar_id, provider_event_id),
                FOREIGN KEY (todo_id) REFERENCES todos(id) ON DELETE CASCADE,
                FOREIGN KEY (calendar_id) REFERENCES calendars(id) ON DELETE CASCADE
            );

            -- Indexes
            CREATE UNIQUE INDEX IF NOT EXISTS idx_calendars_managed
                ON calendars(user_id) WHERE is_managed = 1;
            CREATE INDEX IF NOT EXISTS idx_calendars_channel ON calendars(channel_id);
            CREATE INDEX IF NOT EXISTS idx_events_window ON calendar_events(user_id, start_time);
            CREATE INDEX IF NOT EXISTS idx_todos_user ON todos(user_id);
            "#,
        )?;

        Ok(())
    }

    /// Run statements outside an explicit transaction
    pub fn read<T>(&self, f: impl FnOnce(&Store<'_>) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&Store { conn: &conn })
    }

    /// Run `f` as one unit of work; rolled back if it returns an error
    pub fn transaction<T>(&self, f: impl FnOnce(&Store<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let out = f(&Store { conn: &tx })?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(out)
    }
}

/// Entity operations over a borrowed connection
pub struct Store<'c> {
    conn: &'c Connection,
}

const CONNECTION_COLUMNS: &str = "user_id, encrypted_access_token, encrypted_refresh_token, \
     token_expiry, scopes, account_email, requires_reauth, connected_at, last_sync_at";

const CALENDAR_COLUMNS: &str = "id, user_id, provider_id, name, description, time_zone, \
     access_role, is_primary, selected, is_managed, color_id, sync_token, channel_id, \
     channel_resource_id, channel_expiration, last_synced_at";

const EVENT_COLUMNS: &str = "e.id, e.user_id, e.calendar_id, e.provider_event_id, \
     e.recurring_event_id, e.ical_uid, e.summary, e.description, e.location, e.start_time, \
     e.end_time, e.is_all_day, e.status, e.visibility, e.transparency, e.provider_updated_at, \
     e.html_link, e.hangout_link, e.conference_link, e.organizer, e.attendees, e.raw_payload";

const TODO_COLUMNS: &str = "id, user_id, text, completed, deadline, deadline_is_date_only, \
     created_at, updated_at, completed_at";

const LINK_COLUMNS: &str = "id, user_id, todo_id, calendar_id, provider_event_id, ical_uid, \
     event_start, event_end, todo_text_hash, event_updated_at, last_synced_at";

fn connection_from_row(row: &Row) -> rusqlite::Result<CalendarConnection> {
    Ok(CalendarConnection {
        user_id: row.get(0)?,
        encrypted_access_token: row.get(1)?,
        encrypted_refresh_token: row.get(2)?,
        token_expiry: row.get(3)?,
        scopes: row.get(4)?,
        account_email: row.get(5)?,
        requires_reauth: row.get::<_, i32>(6)? != 0,
        connected_at: row.get(7)?,
        last_sync_at: row.get(8)?,
    })
}

fn calendar_from_row(row: &Row) -> rusqlite::Result<Calendar> {
    Ok(Calendar {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        time_zone: row.get(5)?,
        access_role: row.get(6)?,
        is_primary: row.get::<_, i32>(7)? != 0,
        selected: row.get::<_, i32>(8)? != 0,
        is_managed: row.get::<_, i32>(9)? != 0,
        color_id: row.get(10)?,
        sync_token: row.get(11)?,
        channel_id: row.get(12)?,
        channel_resource_id: row.get(13)?,
        channel_expiration: row.get(14)?,
        last_synced_at: row.get(15)?,
    })
}

fn event_from_row(row: &Row) -> rusqlite::Result<CachedEvent> {
    Ok(CachedEvent {
        id: row.get(0)?,
        user_id: row.get(1)?,
        calendar_id: row.get(2)?,
        provider_event_id: row.get(3)?,
        recurring_event_id: row.get(4)?,
        ical_uid: row.get(5)?,
        summary: row.get(6)?,
        description: row.get(7)?,
        location: row.get(8)?,
        start: row.get(9)?,
        end: row.get(10)?,
        is_all_day: row.get::<_, i32>(11)? != 0,
        status: row.get(12)?,
        visibility: row.get(13)?,
        transparency: row.get(14)?,
        provider_updated_at: row.get(15)?,
        html_link: row.get(16)?,
        hangout_link: row.get(17)?,
        conference_link: row.get(18)?,
        organizer: row.get(19)?,
        attendees: row.get(20)?,
        raw_payload: row.get(21)?,
    })
}

fn todo_from_row(row: &Row) -> rusqlite::Result<TodoItem> {
    Ok(TodoItem {
        id: row.get(0)?,
        user_id: row.get(1)?,
        text: row.get(2)?,
        completed: row.get::<_, i32>(3)? != 0,
        deadline: row.get(4)?,
        deadline_is_date_only: row.get::<_, i32>(5)? != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

fn link_from_row(row: &Row) -> rusqlite::Result<TodoEventLink> {
    Ok(TodoEventLink {
        id: row.get(0)?,
        user_id: row.get(1)?,
        todo_id: row.get(2)?,
        calendar_id: row.get(3)?,
        provider_event_id: row.get(4)?,
        ical_uid: row.get(5)?,
        event_start: row.get(6)?,
        event_end: row.get(7)?,
        todo_text_hash: row.get(8)?,
        event_updated_at: row.get(9)?,
        last_synced_at: row.get(10)?,
    })
}

impl Store<'_> {
    fn query_one<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        map: fn(&Row) -> rusqlite::Result<T>,
    ) -> Result<Option<T>> {
        self.conn
            .query_row(sql, params, map)
            .optional()
            .map_err(Into::into)
    }

    fn query_all<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        map: fn(&Row) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, map)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // --- connections ---

    pub fn get_connection(&self, user_id: i64) -> Result<Option<CalendarConnection>> {
        self.query_one(
            &format!("SELECT {CONNECTION_COLUMNS} FROM calendar_connections WHERE user_id = ?1"),
            params![user_id],
            connection_from_row,
        )
    }

    /// Persist freshly issued credentials and clear the re-auth flag.
    ///
    /// A `None` refresh token keeps whatever was stored before.
    pub fn save_credentials(
        &self,
        user_id: i64,
        encrypted_access_token: &str,
        encrypted_refresh_token: Option<&str>,
        token_expiry: Option<DateTime<Utc>>,
        scopes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            r#"INSERT INTO calendar_connections
                   (user_id, encrypted_access_token, encrypted_refresh_token, token_expiry,
                    scopes, requires_reauth, connected_at)
               VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
               ON CONFLICT(user_id) DO UPDATE SET
                   encrypted_access_token = excluded.encrypted_access_token,
                   encrypted_refresh_token = COALESCE(excluded.encrypted_refresh_token,
                                                      encrypted_refresh_token),
                   token_expiry = excluded.token_expiry,
                   scopes = excluded.scopes,
                   requires_reauth = 0"#,
            params![
                user_id,
                encrypted_access_token,
                encrypted_refresh_token,
                token_expiry,
                scopes,
                now
            ],
        )?;
        Ok(())
    }

    pub fn set_account_email(&self, user_id: i64, email: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE calendar_connections SET account_email = ?2 WHERE user_id = ?1",
            params![user_id, email],
        )?;
        Ok(())
    }

    /// Returns false when the user has no connection
    pub fn set_requires_reauth(&self, user_id: i64, required: bool) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE calendar_connections SET requires_reauth = ?2 WHERE user_id = ?1",
            params![user_id, required as i32],
        )?;
        Ok(changed > 0)
    }

    pub fn touch_last_sync(&self, user_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE calendar_connections SET last_sync_at = ?2 WHERE user_id = ?1",
            params![user_id, at],
        )?;
        Ok(())
    }

    /// Users whose connection is usable by the scheduler
    pub fn list_active_users(&self) -> Result<Vec<i64>> {
        self.query_all(
            "SELECT user_id FROM calendar_connections WHERE requires_reauth = 0 ORDER BY user_id",
            [],
            |row| row.get(0),
        )
    }

    // --- oauth states ---

    pub fn insert_oauth_state(
        &self,
        state: &str,
        user_id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO oauth_states (state, user_id, expires_at) VALUES (?1, ?2, ?3)",
            params![state, user_id, expires_at],
        )?;
        Ok(())
    }

    /// Consume a state value; yields the user id only if it has not expired
    pub fn take_oauth_state(&self, state: &str, now: DateTime<Utc>) -> Result<Option<i64>> {
        let found: Option<(i64, DateTime<Utc>)> = self
            .conn
            .query_row(
                "DELETE FROM oauth_states WHERE state = ?1 RETURNING user_id, expires_at",
                params![state],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        self.conn.execute(
            "DELETE FROM oauth_states WHERE expires_at < ?1",
            params![now],
        )?;
        Ok(found.and_then(|(user_id, expires_at)| (expires_at > now).then_some(user_id)))
    }

    // --- calendars ---

    pub fn get_calendar(&self, id: i64) -> Result<Option<Calendar>> {
        self.query_one(
            &format!("SELECT {CALENDAR_COLUMNS} FROM calendars WHERE id = ?1"),
            params![id],
            calendar_from_row,
        )
    }

    pub fn calendar_by_provider_id(
        &self,
        user_id: i64,
        provider_id: &str,
    ) -> Result<Option<Calendar>> {
        self.query_one(
            &format!(
                "SELECT {CALENDAR_COLUMNS} FROM calendars WHERE user_id = ?1 AND provider_id = ?2"
            ),
            params![user_id, provider_id],
            calendar_from_row,
        )
    }

    pub fn calendar_by_channel(&self, channel_id: &str) -> Result<Option<Calendar>> {
        self.query_one(
            &format!("SELECT {CALENDAR_COLUMNS} FROM calendars WHERE channel_id = ?1"),
            params![channel_id],
            calendar_from_row,
        )
    }

    pub fn managed_calendar(&self, user_id: i64) -> Result<Option<Calendar>> {
        self.query_one(
            &format!(
                "SELECT {CALENDAR_COLUMNS} FROM calendars WHERE user_id = ?1 AND is_managed = 1"
            ),
            params![user_id],
            calendar_from_row,
        )
    }

    /// All calendars, primary first then by name
    pub fn list_calendars(&self, user_id: i64) -> Result<Vec<Calendar>> {
        self.query_all(
            &format!(
                "SELECT {CALENDAR_COLUMNS} FROM calendars WHERE user_id = ?1 \
                 ORDER BY is_primary DESC, name COLLATE NOCASE, id"
            ),
            params![user_id],
            calendar_from_row,
        )
    }

    /// Calendars opted into sync, managed and primary first
    pub fn list_selected_calendars(&self, user_id: i64) -> Result<Vec<Calendar>> {
        self.query_all(
            &format!(
                "SELECT {CALENDAR_COLUMNS} FROM calendars WHERE user_id = ?1 AND selected = 1 \
                 ORDER BY is_managed DESC, is_primary DESC, id"
            ),
            params![user_id],
            calendar_from_row,
        )
    }

    pub fn insert_calendar(
        &self,
        user_id: i64,
        entry: &CalendarListEntry,
        selected: bool,
        is_managed: bool,
    ) -> Result<Calendar> {
        let id: i64 = self.conn.query_row(
            r#"INSERT INTO calendars (user_id, provider_id, name, description, time_zone,
                   access_role, is_primary, selected, is_managed, color_id)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
               RETURNING id"#,
            params![
                user_id,
                &entry.id,
                entry.display_name(),
                &entry.description,
                &entry.time_zone,
                &entry.access_role,
                entry.primary as i32,
                selected as i32,
                is_managed as i32,
                &entry.color_id,
            ],
            |row| row.get(0),
        )?;
        self.get_calendar(id)?
            .context("Inserted calendar row vanished")
    }

    /// Refresh provider-owned metadata; `selected` is never touched here
    pub fn update_calendar_metadata(&self, id: i64, entry: &CalendarListEntry) -> Result<()> {
        self.conn.execute(
            r#"UPDATE calendars SET name = ?2, description = ?3, time_zone = ?4,
                   access_role = ?5, is_primary = ?6, color_id = ?7
               WHERE id = ?1"#,
            params![
                id,
                entry.display_name(),
                &entry.description,
                &entry.time_zone,
                &entry.access_role,
                entry.primary as i32,
                &entry.color_id,
            ],
        )?;
        Ok(())
    }

    pub fn set_calendar_selected(&self, id: i64, selected: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE calendars SET selected = ?2 WHERE id = ?1",
            params![id, selected as i32],
        )?;
        Ok(())
    }

    /// Flag as the user's managed calendar; always selected
    pub fn mark_calendar_managed(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE calendars SET is_managed = 1, selected = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Record a finished sync; a missing token keeps the stored one
    pub fn save_sync_state(
        &self,
        id: i64,
        sync_token: Option<&str>,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            r#"UPDATE calendars SET sync_token = COALESCE(?2, sync_token), last_synced_at = ?3
               WHERE id = ?1"#,
            params![id, sync_token, synced_at],
        )?;
        Ok(())
    }

    pub fn clear_sync_token(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE calendars SET sync_token = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn save_channel(
        &self,
        id: i64,
        channel_id: Option<&str>,
        resource_id: Option<&str>,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn.execute(
            r#"UPDATE calendars SET channel_id = ?2, channel_resource_id = ?3,
                   channel_expiration = ?4
               WHERE id = ?1"#,
            params![id, channel_id, resource_id, expiration],
        )?;
        Ok(())
    }

    // --- cached events ---

    /// Insert or overwrite by (calendar, provider event id); returns the row id
    pub fn upsert_event(&self, event: &CachedEvent) -> Result<i64> {
        let id = self.conn.query_row(
            r#"INSERT INTO calendar_events (user_id, calendar_id, provider_event_id,
                   recurring_event_id, ical_uid, summary, description, location, start_time,
                   end_time, is_all_day, status, visibility, transparency, provider_updated_at,
                   html_link, hangout_link, conference_link, organizer, attendees, raw_payload)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                       ?17, ?18, ?19, ?20, ?21)
               ON CONFLICT(calendar_id, provider_event_id) DO UPDATE SET
                   recurring_event_id = excluded.recurring_event_id,
                   ical_uid = excluded.ical_uid,
                   summary = excluded.summary,
                   description = excluded.description,
                   location = excluded.location,
                   start_time = excluded.start_time,
                   end_time = excluded.end_time,
                   is_all_day = excluded.is_all_day,
                   status = excluded.status,
                   visibility = excluded.visibility,
                   transparency = excluded.transparency,
                   provider_updated_at = excluded.provider_updated_at,
                   html_link = excluded.html_link,
                   hangout_link = excluded.hangout_link,
                   conference_link = excluded.conference_link,
                   organizer = excluded.organizer,
                   attendees = excluded.attendees,
                   raw_payload = excluded.raw_payload
               RETURNING id"#,
            params![
                event.user_id,
                event.calendar_id,
                &event.provider_event_id,
                &event.recurring_event_id,
                &event.ical_uid,
                &event.summary,
                &event.description,
                &event.location,
                event.start,
                event.end,
                event.is_all_day as i32,
                &event.status,
                &event.visibility,
                &event.transparency,
                event.provider_updated_at,
                &event.html_link,
                &event.hangout_link,
                &event.conference_link,
                &event.organizer,
                &event.attendees,
                &event.raw_payload,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_event(&self, user_id: i64, id: i64) -> Result<Option<CachedEvent>> {
        self.query_one(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM calendar_events e WHERE e.user_id = ?1 AND e.id = ?2"
            ),
            params![user_id, id],
            event_from_row,
        )
    }

    pub fn event_by_provider_id(
        &self,
        calendar_id: i64,
        provider_event_id: &str,
    ) -> Result<Option<CachedEvent>> {
        self.query_one(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM calendar_events e \
                 WHERE e.calendar_id = ?1 AND e.provider_event_id = ?2"
            ),
            params![calendar_id, provider_event_id],
            event_from_row,
        )
    }

    pub fn count_events(&self, calendar_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM calendar_events WHERE calendar_id = ?1",
                params![calendar_id],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    /// Returns whether a row was removed
    pub fn delete_event(&self, calendar_id: i64, provider_event_id: &str) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM calendar_events WHERE calendar_id = ?1 AND provider_event_id = ?2",
            params![calendar_id, provider_event_id],
        )?;
        Ok(removed > 0)
    }

    /// Non-cancelled events of selected calendars overlapping `[start, end)`
    pub fn list_presented_events(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PresentedEvent>> {
        let sql = format!(
            r#"SELECT {EVENT_COLUMNS}, c.provider_id, c.name, c.color_id, c.is_primary,
                   c.is_managed, l.todo_id
               FROM calendar_events e
               JOIN calendars c ON c.id = e.calendar_id
               LEFT JOIN todo_event_links l
                   ON l.calendar_id = e.calendar_id AND l.provider_event_id = e.provider_event_id
               WHERE e.user_id = ?1 AND c.selected = 1 AND e.status != 'cancelled'
                   AND e.start_time < ?3 AND e.end_time > ?2
               ORDER BY e.start_time, e.id"#
        );
        self.query_all(&sql, params![user_id, start, end], |row| {
            Ok(PresentedEvent {
                event: event_from_row(row)?,
                calendar_provider_id: row.get(22)?,
                calendar_name: row.get(23)?,
                calendar_color_id: row.get(24)?,
                calendar_is_primary: row.get::<_, i32>(25)? != 0,
                calendar_is_managed: row.get::<_, i32>(26)? != 0,
                todo_id: row.get(27)?,
            })
        })
    }

    // --- todos ---

    pub fn insert_todo(
        &self,
        user_id: i64,
        text: &str,
        deadline: Option<DateTime<Utc>>,
        deadline_is_date_only: bool,
        now: DateTime<Utc>,
    ) -> Result<TodoItem> {
        let id: i64 = self.conn.query_row(
            r#"INSERT INTO todos (user_id, text, completed, deadline, deadline_is_date_only,
                   created_at, updated_at)
               VALUES (?1, ?2, 0, ?3, ?4, ?5, ?5)
               RETURNING id"#,
            params![user_id, text, deadline, deadline_is_date_only as i32, now],
            |row| row.get(0),
        )?;
        self.get_todo(id)?.context("Inserted todo row vanished")
    }

    pub fn get_todo(&self, id: i64) -> Result<Option<TodoItem>> {
        self.query_one(
            &format!("SELECT {TODO_COLUMNS} FROM todos WHERE id = ?1"),
            params![id],
            todo_from_row,
        )
    }

    pub fn get_user_todo(&self, user_id: i64, id: i64) -> Result<Option<TodoItem>> {
        self.query_one(
            &format!("SELECT {TODO_COLUMNS} FROM todos WHERE user_id = ?1 AND id = ?2"),
            params![user_id, id],
            todo_from_row,
        )
    }

    /// Open todos first, soonest deadline first
    pub fn list_todos(&self, user_id: i64) -> Result<Vec<TodoItem>> {
        self.query_all(
            &format!(
                "SELECT {TODO_COLUMNS} FROM todos WHERE user_id = ?1 \
                 ORDER BY completed, deadline IS NULL, deadline, id"
            ),
            params![user_id],
            todo_from_row,
        )
    }

    /// Write every mutable field of the todo
    pub fn update_todo(&self, todo: &TodoItem) -> Result<()> {
        self.conn.execute(
            r#"UPDATE todos SET text = ?2, completed = ?3, deadline = ?4,
                   deadline_is_date_only = ?5, updated_at = ?6, completed_at = ?7
               WHERE id = ?1"#,
            params![
                todo.id,
                &todo.text,
                todo.completed as i32,
                todo.deadline,
                todo.deadline_is_date_only as i32,
                todo.updated_at,
                todo.completed_at,
            ],
        )?;
        Ok(())
    }

    pub fn delete_todo(&self, id: i64) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM todos WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    // --- todo/event links ---

    pub fn link_for_todo(&self, todo_id: i64) -> Result<Option<TodoEventLink>> {
        self.query_one(
            &format!("SELECT {LINK_COLUMNS} FROM todo_event_links WHERE todo_id = ?1"),
            params![todo_id],
            link_from_row,
        )
    }

    pub fn link_for_event(
        &self,
        calendar_id: i64,
        provider_event_id: &str,
    ) -> Result<Option<TodoEventLink>> {
        self.query_one(
            &format!(
                "SELECT {LINK_COLUMNS} FROM todo_event_links \
                 WHERE calendar_id = ?1 AND provider_event_id = ?2"
            ),
            params![calendar_id, provider_event_id],
            link_from_row,
        )
    }

    /// Insert or replace the todo's link.
    ///
    /// Any other todo's claim on the same event is dropped first so both
    /// uniqueness rules keep holding.
    pub fn upsert_link(&self, link: &TodoEventLink) -> Result<()> {
        self.conn.execute(
            r#"DELETE FROM todo_event_links
               WHERE calendar_id = ?1 AND provider_event_id = ?2 AND todo_id != ?3"#,
            params![link.calendar_id, &link.provider_event_id, link.todo_id],
        )?;
        self.conn.execute(
            r#"INSERT INTO todo_event_links (user_id, todo_id, calendar_id, provider_event_id,
                   ical_uid, event_start, event_end, todo_text_hash, event_updated_at,
                   last_synced_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
               ON CONFLICT(todo_id) DO UPDATE SET
                   calendar_id = excluded.calendar_id,
                   provider_event_id = excluded.provider_event_id,
                   ical_uid = excluded.ical_uid,
                   event_start = excluded.event_start,
                   event_end = excluded.event_end,
                   todo_text_hash = excluded.todo_text_hash,
                   event_updated_at = excluded.event_updated_at,
                   last_synced_at = excluded.last_synced_at"#,
            params![
                link.user_id,
                link.todo_id,
                link.calendar_id,
                &link.provider_event_id,
                &link.ical_uid,
                link.event_start,
                link.event_end,
                &link.todo_text_hash,
                link.event_updated_at,
                link.last_synced_at,
            ],
        )?;
        Ok(())
    }

    pub fn delete_link_for_todo(&self, todo_id: i64) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM todo_event_links WHERE todo_id = ?1",
            params![todo_id],
        )?;
        Ok(removed > 0)
    }
}
