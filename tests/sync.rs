mod common;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use calbridge::EngineError;
use calbridge::provider::{EventPage, EventQuery};
use calbridge::scheduler::run_tick;
use calbridge::sync::{CalendarSyncOutcome, CalendarSyncStatus};

use common::{Harness, PRIMARY, USER, calendar_entry, event, status};

fn standup(id: &str) -> calbridge::provider::ProviderEvent {
    event(json!({
        "id": id,
        "iCalUID": format!("{id}@google.com"),
        "summary": "Standup",
        "updated": "2025-03-01T10:00:00Z",
        "start": { "dateTime": "2025-03-10T09:00:00-04:00" },
        "end": { "dateTime": "2025-03-10T09:15:00-04:00" },
    }))
}

#[tokio::test]
async fn repeated_sync_keeps_one_row_per_event() {
    let h = Harness::connected().await;
    h.provider.put_event(PRIMARY, standup("e1"));

    h.engine.sync_user(USER).await.unwrap();
    h.engine.sync_user(USER).await.unwrap();

    let primary = h.calendar(PRIMARY);
    let count = h.engine.db().read(|s| s.count_events(primary.id)).unwrap();
    assert_eq!(count, 1);

    let row = h
        .engine
        .db()
        .read(|s| s.event_by_provider_id(primary.id, "e1"))
        .unwrap()
        .unwrap();
    assert_eq!(row.start, Utc.with_ymd_and_hms(2025, 3, 10, 13, 0, 0).unwrap());
    assert_eq!(row.summary.as_deref(), Some("Standup"));
}

#[tokio::test]
async fn first_sync_selects_primary_and_managed_only() {
    let h = Harness::connected().await;
    h.provider.add_calendar(calendar_entry("team@example.com", "Team", false));

    h.engine.sync_user(USER).await.unwrap();

    assert!(h.calendar(PRIMARY).selected);
    assert!(!h.calendar("team@example.com").selected);
    let managed = h.managed_calendar();
    assert!(managed.selected);
    assert_eq!(managed.name, "Calbridge Todos");

    // A second sync must not create another managed calendar
    h.engine.sync_user(USER).await.unwrap();
    let created = h
        .provider
        .calls()
        .into_iter()
        .filter(|c| matches!(c, common::Call::CreateCalendar(_)))
        .count();
    assert_eq!(created, 1);
}

#[tokio::test]
async fn expired_sync_token_falls_back_to_one_full_sync() {
    let h = Harness::connected().await;
    h.provider.put_event(PRIMARY, standup("e1"));
    h.engine.sync_user(USER).await.unwrap();

    let old_token = h.calendar(PRIMARY).sync_token.clone();
    assert!(old_token.is_some());

    h.provider.clear_calls();
    h.provider.script(PRIMARY, Err(status(410)));
    let report = h.engine.sync_user(USER).await.unwrap();

    let line = report
        .calendars
        .iter()
        .find(|c| c.provider_id == PRIMARY)
        .unwrap();
    assert_eq!(line.status, CalendarSyncStatus::Synced);
    assert!(line.stats.full_resync);
    assert!(line.error.is_none());

    let queries = h.provider.list_queries(PRIMARY);
    assert_eq!(queries.len(), 2);
    assert!(matches!(
        &queries[0],
        EventQuery::Incremental { sync_token } if Some(sync_token) == old_token.as_ref()
    ));
    assert!(matches!(queries[1], EventQuery::Window { .. }));

    let new_token = h.calendar(PRIMARY).sync_token.clone();
    assert!(new_token.is_some());
    assert_ne!(new_token, old_token);
}

#[tokio::test]
async fn inaccessible_calendar_is_skipped_and_batch_continues() {
    let h = Harness::connected().await;
    h.provider.add_calendar(calendar_entry("gone@example.com", "Gone", false));
    h.provider.add_calendar(calendar_entry("broken@example.com", "Broken", false));
    h.engine.registry().sync_calendar_list(USER).await.unwrap();
    h.engine
        .set_selection(
            USER,
            &[
                PRIMARY.to_string(),
                "gone@example.com".to_string(),
                "broken@example.com".to_string(),
            ],
        )
        .unwrap();

    h.provider.put_event(PRIMARY, standup("e1"));
    h.provider.script("gone@example.com", Err(status(403)));
    h.provider.script("broken@example.com", Err(status(503)));

    let report = h.engine.sync_user(USER).await.unwrap();
    let by_id = |id: &str| {
        report
            .calendars
            .iter()
            .find(|c| c.provider_id == id)
            .unwrap()
            .status
    };
    assert_eq!(by_id("gone@example.com"), CalendarSyncStatus::Skipped);
    assert_eq!(by_id("broken@example.com"), CalendarSyncStatus::Failed);
    assert_eq!(by_id(PRIMARY), CalendarSyncStatus::Synced);
    assert_eq!(report.failed(), 1);

    let gone = h.calendar("gone@example.com");
    assert!(gone.sync_token.is_none());
    assert!(gone.last_synced_at.is_none());
    let primary_id = h.calendar(PRIMARY).id;
    let count = h.engine.db().read(|s| s.count_events(primary_id)).unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn not_found_calendar_reports_status() {
    let h = Harness::connected().await;
    h.engine.registry().sync_calendar_list(USER).await.unwrap();
    let primary = h.calendar(PRIMARY);
    h.provider.script(PRIMARY, Err(status(404)));

    let window = h.engine.sync().default_window(Utc::now());
    let outcome = h
        .engine
        .sync()
        .sync_calendar(USER, &primary, window, false)
        .await
        .unwrap();
    assert_eq!(outcome, CalendarSyncOutcome::Skipped { status: 404 });
}

#[tokio::test]
async fn cancelled_and_declined_events_leave_the_cache() {
    let h = Harness::connected().await;
    h.provider.put_event(PRIMARY, standup("e1"));
    h.provider.put_event(
        PRIMARY,
        event(json!({
            "id": "e2",
            "summary": "Offsite",
            "start": { "dateTime": "2025-03-11T09:00:00Z" },
            "end": { "dateTime": "2025-03-11T17:00:00Z" },
        })),
    );
    h.engine.sync_user(USER).await.unwrap();
    let primary = h.calendar(PRIMARY);
    assert_eq!(h.engine.db().read(|s| s.count_events(primary.id)).unwrap(), 2);

    h.provider.edit_event(PRIMARY, "e1", |e| {
        e.status = Some(calbridge::provider::EventStatus::Cancelled)
    });
    h.provider.edit_event(PRIMARY, "e2", |e| {
        e.attendees = Some(vec![calbridge::provider::Person {
            email: Some(PRIMARY.into()),
            is_self: true,
            response_status: Some("declined".into()),
            ..Default::default()
        }]);
    });

    let report = h.engine.sync_user(USER).await.unwrap();
    let line = report
        .calendars
        .iter()
        .find(|c| c.provider_id == PRIMARY)
        .unwrap();
    assert_eq!(line.stats.deleted, 2);
    assert_eq!(h.engine.db().read(|s| s.count_events(primary.id)).unwrap(), 0);
}

#[tokio::test]
async fn unauthorized_marks_reauth_and_stops_the_batch() {
    let h = Harness::connected().await;
    h.engine.sync_user(USER).await.unwrap();
    h.provider.script(PRIMARY, Err(status(401)));

    let err = h.engine.sync_user(USER).await.unwrap_err();
    assert!(matches!(err, EngineError::ReauthRequired { user_id: USER }));
    assert!(h.engine.connection_status(USER).unwrap().requires_reauth);

    // The scheduler leaves flagged users alone
    let summary = run_tick(&h.engine).await;
    assert_eq!(summary.synced + summary.failed, 0);
}

#[tokio::test]
async fn sync_stamps_connection_last_sync() {
    let h = Harness::connected().await;
    assert!(h.engine.connection_status(USER).unwrap().last_sync_at.is_none());

    h.engine.sync_user(USER).await.unwrap();

    let status = h.engine.connection_status(USER).unwrap();
    assert!(status.connected);
    assert_eq!(status.account_email.as_deref(), Some(PRIMARY));
    assert!(status.last_sync_at.is_some());
    assert!(h.calendar(PRIMARY).last_synced_at.is_some());
}

#[tokio::test]
async fn scripted_empty_page_keeps_existing_rows() {
    let h = Harness::connected().await;
    h.provider.put_event(PRIMARY, standup("e1"));
    h.engine.sync_user(USER).await.unwrap();

    h.provider.script(
        PRIMARY,
        Ok(EventPage {
            items: Vec::new(),
            next_sync_token: Some("after-empty".into()),
        }),
    );
    h.engine.sync_user(USER).await.unwrap();

    let primary = h.calendar(PRIMARY);
    assert_eq!(primary.sync_token.as_deref(), Some("after-empty"));
    assert_eq!(h.engine.db().read(|s| s.count_events(primary.id)).unwrap(), 1);
}

#[tokio::test]
async fn listing_prefers_the_primary_copy_of_shared_events() {
    let h = Harness::connected().await;
    h.provider.add_calendar(calendar_entry("team@example.com", "Team", false));
    h.engine.registry().sync_calendar_list(USER).await.unwrap();
    h.engine
        .set_selection(USER, &[PRIMARY.to_string(), "team@example.com".to_string()])
        .unwrap();

    let shared = |id: &str| {
        event(json!({
            "id": id,
            "iCalUID": "planning@example.com",
            "summary": "Planning",
            "start": { "dateTime": "2025-03-12T15:00:00Z" },
            "end": { "dateTime": "2025-03-12T16:00:00Z" },
        }))
    };
    h.provider.put_event("team@example.com", shared("team-copy"));
    h.provider.put_event(PRIMARY, shared("my-copy"));
    h.engine.sync_user(USER).await.unwrap();

    let start = Utc.with_ymd_and_hms(2025, 3, 12, 0, 0, 0).unwrap();
    let events = h
        .engine
        .list_events(USER, start, start + Duration::days(1), false)
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.provider_event_id, "my-copy");
    assert!(events[0].calendar_is_primary);
}

#[tokio::test]
async fn scheduler_tick_syncs_connected_users() {
    let h = Harness::connected().await;
    h.provider.put_event(PRIMARY, standup("e1"));

    let summary = run_tick(&h.engine).await;
    assert_eq!(summary.synced, 1);
    assert_eq!(summary.failed, 0);
    let primary = h.calendar(PRIMARY);
    assert_eq!(h.engine.db().read(|s| s.count_events(primary.id)).unwrap(), 1);
}
