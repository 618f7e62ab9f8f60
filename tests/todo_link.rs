mod common;

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};
use serde_json::json;

use calbridge::models::{CreateTodoRequest, TodoItem, UpdateTodoRequest};
use calbridge::provider::{EventStatus, ProviderEvent};
use calbridge::title::text_hash;
use calbridge::todo_link::{LinkOutcome, TODO_COLOR_ID, TODO_DESCRIPTION_TAG};

use common::{Harness, USER, event};

fn deadline(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

fn new_todo(text: &str, due: Option<DateTime<Utc>>, zone: &str) -> CreateTodoRequest {
    CreateTodoRequest {
        text: text.into(),
        deadline: due,
        deadline_is_date_only: false,
        time_zone: Some(zone.into()),
    }
}

fn local(value: &calbridge::provider::EventDateTime) -> DateTime<FixedOffset> {
    value.date_time.expect("timed event")
}

/// Create a todo with a deadline and return it with its shadow event
async fn todo_with_event(h: &Harness, text: &str, due: &str) -> (TodoItem, ProviderEvent) {
    let todo = h
        .engine
        .create_todo(USER, new_todo(text, Some(deadline(due)), "America/New_York"))
        .await
        .unwrap();
    let link = h
        .engine
        .db()
        .read(|s| s.link_for_todo(todo.id))
        .unwrap()
        .expect("todo linked");
    let managed = h.managed_calendar();
    let event = h
        .provider
        .stored_event(&managed.provider_id, &link.provider_event_id)
        .expect("shadow event on provider");
    (todo, event)
}

#[tokio::test]
async fn new_deadline_creates_linked_event_in_managed_calendar() {
    let h = Harness::connected().await;
    let text = "Submit quarterly report";
    let (todo, _) = todo_with_event(&h, text, "2025-03-10T17:00:00-05:00").await;

    let managed = h.managed_calendar();
    let inserts = h.provider.inserts();
    assert_eq!(inserts.len(), 1);
    let (calendar, payload) = &inserts[0];
    assert_eq!(calendar, &managed.provider_id);

    // March 10 2025 is already on daylight time in New York
    let start = local(payload.start.as_ref().unwrap());
    let end = local(payload.end.as_ref().unwrap());
    assert_eq!(start.with_timezone(&Utc), Utc.with_ymd_and_hms(2025, 3, 10, 21, 30, 0).unwrap());
    assert_eq!(end.with_timezone(&Utc), Utc.with_ymd_and_hms(2025, 3, 10, 22, 0, 0).unwrap());
    assert_eq!(
        payload.start.as_ref().unwrap().time_zone.as_deref(),
        Some("America/New_York")
    );

    assert_eq!(payload.summary.as_deref(), Some(text));
    assert_eq!(payload.color_id.as_deref(), Some(TODO_COLOR_ID));
    assert!(payload.description.as_deref().unwrap().contains(TODO_DESCRIPTION_TAG));
    assert_eq!(payload.todo_marker(), Some(todo.id));

    let link = h.engine.db().read(|s| s.link_for_todo(todo.id)).unwrap().unwrap();
    assert_eq!(link.calendar_id, managed.id);
    assert_eq!(link.todo_text_hash.as_deref(), Some(text_hash(text).as_str()));
    assert_eq!(link.event_end, Some(deadline("2025-03-10T17:00:00-05:00")));
    assert!(link.event_updated_at.is_some());

    let cached = h
        .engine
        .db()
        .read(|s| s.event_by_provider_id(managed.id, &link.provider_event_id))
        .unwrap();
    assert!(cached.is_some());
}

#[tokio::test]
async fn standard_time_deadline_is_half_hour_before_local_due_time() {
    let h = Harness::connected().await;
    todo_with_event(&h, "Pay rent", "2025-01-15T17:00:00-05:00").await;

    let (_, payload) = h.provider.inserts().remove(0);
    let start = local(payload.start.as_ref().unwrap());
    let end = local(payload.end.as_ref().unwrap());
    assert_eq!(start.time(), NaiveTime::from_hms_opt(16, 30, 0).unwrap());
    assert_eq!(end.time(), NaiveTime::from_hms_opt(17, 0, 0).unwrap());
    assert_eq!(start.offset().local_minus_utc(), -5 * 3600);
}

#[tokio::test]
async fn date_only_deadline_spans_the_local_day() {
    let h = Harness::connected().await;
    let todo = h
        .engine
        .create_todo(
            USER,
            CreateTodoRequest {
                deadline_is_date_only: true,
                ..new_todo("Dentist", Some(deadline("2025-04-02T12:00:00Z")), "Europe/Berlin")
            },
        )
        .await
        .unwrap();
    assert!(todo.deadline_is_date_only);

    let (_, payload) = h.provider.inserts().remove(0);
    let start = payload.start.unwrap();
    let end = payload.end.unwrap();
    assert!(start.is_date_only());
    assert_eq!(start.date.unwrap().to_string(), "2025-04-02");
    assert_eq!(end.date.unwrap().to_string(), "2025-04-03");
}

#[tokio::test]
async fn unchanged_todo_makes_no_provider_write() {
    let h = Harness::connected().await;
    let (todo, _) = todo_with_event(&h, "Water plants", "2025-03-10T17:00:00-05:00").await;
    h.provider.clear_calls();

    let outcome = h
        .engine
        .links()
        .upsert_event_for_todo(&todo, Some("America/New_York"))
        .await
        .unwrap();
    assert_eq!(outcome, LinkOutcome::Unchanged);
    assert!(h.provider.patches().is_empty());
    assert!(h.provider.inserts().is_empty());
}

#[tokio::test]
async fn edited_todo_patches_its_event() {
    let h = Harness::connected().await;
    let (todo, original) = todo_with_event(&h, "Water plants", "2025-03-10T17:00:00-05:00").await;
    h.provider.clear_calls();

    h.engine
        .update_todo(
            USER,
            todo.id,
            UpdateTodoRequest {
                text: Some("Water the ferns".into()),
                time_zone: Some("America/New_York".into()),
                ..UpdateTodoRequest::default()
            },
        )
        .await
        .unwrap();

    let patches = h.provider.patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(Some(&patches[0].0), original.id.as_ref());
    assert_eq!(patches[0].1.summary.as_deref(), Some("Water the ferns"));
    assert!(h.provider.inserts().is_empty());

    let link = h.engine.db().read(|s| s.link_for_todo(todo.id)).unwrap().unwrap();
    assert_eq!(link.todo_text_hash.as_deref(), Some(text_hash("Water the ferns").as_str()));
}

#[tokio::test]
async fn externally_deleted_event_is_recreated_on_next_write() {
    let h = Harness::connected().await;
    let (todo, original) = todo_with_event(&h, "Renew passport", "2025-03-10T17:00:00-05:00").await;
    let managed = h.managed_calendar();
    let original_id = original.id.clone().unwrap();
    h.provider.remove_event(&managed.provider_id, &original_id);
    h.provider.clear_calls();

    h.engine
        .update_todo(
            USER,
            todo.id,
            UpdateTodoRequest {
                deadline: Some(Some(deadline("2025-03-11T17:00:00-04:00"))),
                time_zone: Some("America/New_York".into()),
                ..UpdateTodoRequest::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(h.provider.patches().len(), 1);
    let inserts = h.provider.inserts();
    assert_eq!(inserts.len(), 1);
    // Title comes back even though the text hash did not change
    assert_eq!(inserts[0].1.summary.as_deref(), Some("Renew passport"));

    let link = h.engine.db().read(|s| s.link_for_todo(todo.id)).unwrap().unwrap();
    assert_ne!(link.provider_event_id, original_id);
}

#[tokio::test]
async fn clearing_deadline_unlinks_and_deletes_event() {
    let h = Harness::connected().await;
    let (todo, original) = todo_with_event(&h, "Book flights", "2025-03-10T17:00:00-05:00").await;
    let managed = h.managed_calendar();
    let event_id = original.id.clone().unwrap();

    let updated = h
        .engine
        .update_todo(
            USER,
            todo.id,
            UpdateTodoRequest {
                deadline: Some(None),
                ..UpdateTodoRequest::default()
            },
        )
        .await
        .unwrap();

    assert!(updated.deadline.is_none());
    assert_eq!(h.provider.deletes(), vec![event_id.clone()]);
    assert!(h.engine.db().read(|s| s.link_for_todo(todo.id)).unwrap().is_none());
    let cached = h
        .engine
        .db()
        .read(|s| s.event_by_provider_id(managed.id, &event_id))
        .unwrap();
    assert!(cached.is_none());
}

#[tokio::test]
async fn failed_provider_delete_still_unlinks() {
    let h = Harness::connected().await;
    let (todo, original) = todo_with_event(&h, "Book flights", "2025-03-10T17:00:00-05:00").await;
    let managed = h.managed_calendar();
    let event_id = original.id.clone().unwrap();
    h.provider.state().fail_deletes = true;

    h.engine
        .update_todo(
            USER,
            todo.id,
            UpdateTodoRequest {
                completed: Some(true),
                ..UpdateTodoRequest::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(h.provider.deletes().len(), 1);
    assert!(h.engine.db().read(|s| s.link_for_todo(todo.id)).unwrap().is_none());
    // The event is still on the provider, so the cached row stays too
    let cached = h
        .engine
        .db()
        .read(|s| s.event_by_provider_id(managed.id, &event_id))
        .unwrap();
    assert!(cached.is_some());
}

#[tokio::test]
async fn deleting_todo_removes_event_and_row() {
    let h = Harness::connected().await;
    let (todo, _) = todo_with_event(&h, "Book flights", "2025-03-10T17:00:00-05:00").await;

    h.engine.delete_todo(USER, todo.id).await.unwrap();

    assert_eq!(h.provider.deletes().len(), 1);
    assert!(h.engine.list_todos(USER).unwrap().is_empty());
    assert!(h.engine.delete_todo(USER, todo.id).await.is_err());
}

#[tokio::test]
async fn own_write_is_not_applied_back() {
    let h = Harness::connected().await;
    let (todo, _) = todo_with_event(&h, "Call plumber", "2025-03-10T17:00:00-05:00").await;

    h.engine.sync_user(USER).await.unwrap();

    let after = h.engine.list_todos(USER).unwrap().remove(0);
    assert_eq!(after.text, "Call plumber");
    assert_eq!(after.updated_at, todo.updated_at);
    assert_eq!(after.deadline, todo.deadline);
}

#[tokio::test]
async fn newer_side_wins_between_todo_and_event() {
    let h = Harness::connected().await;
    let (todo, shadow) = todo_with_event(&h, "Call plumber", "2025-03-10T17:00:00-05:00").await;
    let managed = h.managed_calendar();
    let event_id = shadow.id.clone().unwrap();
    let written_at = shadow.updated.unwrap();

    // The todo changed at T1, after our own write
    let t1 = written_at + Duration::minutes(10);
    h.engine
        .db()
        .read(|s| {
            s.update_todo(&TodoItem {
                updated_at: t1,
                ..todo.clone()
            })
        })
        .unwrap();

    // Calendar edit stamped T0 < T1: the todo keeps its values
    let t0 = written_at + Duration::minutes(5);
    h.provider.edit_event(&managed.provider_id, &event_id, |e| {
        e.summary = Some("Call the plumber".into());
        e.updated = Some(t0);
    });
    h.engine.sync_user(USER).await.unwrap();
    let kept = h.engine.list_todos(USER).unwrap().remove(0);
    assert_eq!(kept.text, "Call plumber");
    assert_eq!(kept.updated_at, t1);

    // Calendar edit stamped T2 > T1: the event wins
    let t2 = written_at + Duration::minutes(20);
    let new_end = Utc.with_ymd_and_hms(2025, 3, 12, 15, 0, 0).unwrap();
    h.provider.edit_event(&managed.provider_id, &event_id, |e| {
        e.summary = Some("Call the plumber today".into());
        e.end = Some(calbridge::provider::EventDateTime::timed(
            new_end.fixed_offset(),
            "UTC",
        ));
        e.updated = Some(t2);
    });
    h.engine.sync_user(USER).await.unwrap();

    let applied = h.engine.list_todos(USER).unwrap().remove(0);
    assert_eq!(applied.text, "Call the plumber today");
    assert_eq!(applied.deadline, Some(new_end));
    assert!(!applied.deadline_is_date_only);
    assert_eq!(applied.updated_at, t2);

    let link = h.engine.db().read(|s| s.link_for_todo(todo.id)).unwrap().unwrap();
    assert_eq!(link.event_updated_at, Some(t2));
    assert_eq!(
        link.todo_text_hash.as_deref(),
        Some(text_hash("Call the plumber today").as_str())
    );

    // Delivering the same version again changes nothing
    h.engine.sync_user(USER).await.unwrap();
    assert_eq!(h.engine.list_todos(USER).unwrap().remove(0).updated_at, t2);
}

#[tokio::test]
async fn all_day_event_sets_end_of_day_deadline() {
    let h = Harness::connected().await;
    let (todo, shadow) = todo_with_event(&h, "File taxes", "2025-03-10T17:00:00-05:00").await;
    let managed = h.managed_calendar();
    let later = shadow.updated.unwrap() + Duration::hours(1);

    h.provider
        .edit_event(&managed.provider_id, shadow.id.as_deref().unwrap(), |e| {
            e.start = Some(calbridge::provider::EventDateTime::all_day(
                chrono::NaiveDate::from_ymd_opt(2025, 4, 15).unwrap(),
            ));
            e.end = Some(calbridge::provider::EventDateTime::all_day(
                chrono::NaiveDate::from_ymd_opt(2025, 4, 16).unwrap(),
            ));
            e.updated = Some(later);
        });
    h.engine.sync_user(USER).await.unwrap();

    let updated = h.engine.list_todos(USER).unwrap().remove(0);
    assert_eq!(updated.id, todo.id);
    assert!(updated.deadline_is_date_only);
    // Managed calendar is UTC in the fake
    assert_eq!(updated.deadline, Some(Utc.with_ymd_and_hms(2025, 4, 15, 23, 59, 0).unwrap()));
}

#[tokio::test]
async fn cancelled_shadow_event_clears_deadline() {
    let h = Harness::connected().await;
    let (todo, shadow) = todo_with_event(&h, "Send invoice", "2025-03-10T17:00:00-05:00").await;
    let managed = h.managed_calendar();

    h.provider
        .edit_event(&managed.provider_id, shadow.id.as_deref().unwrap(), |e| {
            e.status = Some(EventStatus::Cancelled);
        });
    h.engine.sync_user(USER).await.unwrap();

    let updated = h.engine.list_todos(USER).unwrap().remove(0);
    assert!(updated.deadline.is_none());
    assert!(!updated.deadline_is_date_only);
    assert!(h.engine.db().read(|s| s.link_for_todo(todo.id)).unwrap().is_none());
}

fn tagged_event(id: &str, todo_id: i64, start: &str, end: &str) -> ProviderEvent {
    event(json!({
        "id": id,
        "summary": "Tagged",
        "updated": (Utc::now() + Duration::hours(1)).to_rfc3339(),
        "start": { "dateTime": start },
        "end": { "dateTime": end },
        "extendedProperties": {
            "private": { "calbridge_todo": "true", "todo_id": todo_id.to_string() }
        },
    }))
}

#[tokio::test]
async fn tagged_event_without_link_is_adopted() {
    // Created while disconnected: deadline set, no event written
    let h = Harness::new(calbridge::Config::default());
    let todo = h
        .engine
        .create_todo(
            USER,
            new_todo("Plan trip", Some(deadline("2025-04-30T12:00:00Z")), "UTC"),
        )
        .await
        .unwrap();
    h.connect(3600).await;
    h.engine.sync_user(USER).await.unwrap();
    assert!(h.provider.inserts().is_empty());

    let managed = h.managed_calendar();
    h.provider.put_event(
        &managed.provider_id,
        tagged_event("restored", todo.id, "2025-05-01T09:00:00Z", "2025-05-01T09:30:00Z"),
    );
    h.engine.sync_user(USER).await.unwrap();

    let link = h.engine.db().read(|s| s.link_for_todo(todo.id)).unwrap().unwrap();
    assert_eq!(link.provider_event_id, "restored");
    let adopted = h.engine.list_todos(USER).unwrap().remove(0);
    assert_eq!(adopted.deadline, Some(Utc.with_ymd_and_hms(2025, 5, 1, 9, 30, 0).unwrap()));
}

#[tokio::test]
async fn orphan_of_completed_todo_is_not_relinked() {
    let h = Harness::connected().await;
    let (todo, _) = todo_with_event(&h, "Renew passport", "2025-03-10T17:00:00-05:00").await;
    h.provider.state().fail_deletes = true;

    h.engine
        .update_todo(
            USER,
            todo.id,
            UpdateTodoRequest {
                completed: Some(true),
                ..UpdateTodoRequest::default()
            },
        )
        .await
        .unwrap();
    assert!(h.engine.db().read(|s| s.link_for_todo(todo.id)).unwrap().is_none());

    // The undeleted event comes back through sync
    h.engine.sync_user(USER).await.unwrap();

    assert!(h.engine.db().read(|s| s.link_for_todo(todo.id)).unwrap().is_none());
    let after = h.engine.list_todos(USER).unwrap().remove(0);
    assert!(after.completed);
}

#[tokio::test]
async fn orphan_of_cleared_deadline_is_not_relinked() {
    let h = Harness::connected().await;
    let (todo, _) = todo_with_event(&h, "Renew passport", "2025-03-10T17:00:00-05:00").await;
    h.provider.state().fail_deletes = true;

    h.engine
        .update_todo(
            USER,
            todo.id,
            UpdateTodoRequest {
                deadline: Some(None),
                ..UpdateTodoRequest::default()
            },
        )
        .await
        .unwrap();
    h.engine.sync_user(USER).await.unwrap();

    assert!(h.engine.db().read(|s| s.link_for_todo(todo.id)).unwrap().is_none());
    let after = h.engine.list_todos(USER).unwrap().remove(0);
    assert!(after.deadline.is_none());
}

#[tokio::test]
async fn stray_tagged_event_does_not_steal_a_live_link() {
    let h = Harness::connected().await;
    let (todo, shadow) = todo_with_event(&h, "Renew passport", "2025-03-10T17:00:00-05:00").await;
    let live_id = shadow.id.clone().unwrap();
    let managed = h.managed_calendar();

    h.provider.put_event(
        &managed.provider_id,
        tagged_event("stray", todo.id, "2025-06-01T09:00:00Z", "2025-06-01T09:30:00Z"),
    );
    h.engine.sync_user(USER).await.unwrap();

    let link = h.engine.db().read(|s| s.link_for_todo(todo.id)).unwrap().unwrap();
    assert_eq!(link.provider_event_id, live_id);
    let after = h.engine.list_todos(USER).unwrap().remove(0);
    assert_eq!(after.deadline, todo.deadline);
}

#[tokio::test]
async fn todo_shadows_only_listed_on_request() {
    let h = Harness::connected().await;
    todo_with_event(&h, "Submit quarterly report", "2025-03-10T17:00:00-05:00").await;

    let day = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
    let hidden = h
        .engine
        .list_events(USER, day, day + Duration::days(1), false)
        .unwrap();
    assert!(hidden.is_empty());

    let shown = h
        .engine
        .list_events(USER, day, day + Duration::days(1), true)
        .unwrap();
    assert_eq!(shown.len(), 1);
    assert!(shown[0].calendar_is_managed);
    assert!(shown[0].todo_id.is_some());
}

#[tokio::test]
async fn disconnected_user_keeps_todo_without_event() {
    let h = Harness::new(calbridge::Config::default());
    let todo = h
        .engine
        .create_todo(
            USER,
            new_todo("Offline task", Some(deadline("2025-03-10T17:00:00Z")), "UTC"),
        )
        .await
        .unwrap();
    assert!(todo.deadline.is_some());
    assert!(h.provider.inserts().is_empty());

    let outcome = h
        .engine
        .links()
        .upsert_event_for_todo(&todo, None)
        .await
        .unwrap();
    assert_eq!(outcome, LinkOutcome::Paused);
}
