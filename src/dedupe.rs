//! Collapse copies of one event that show up in several calendars

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use chrono::{DateTime, Utc};

use crate::models::PresentedEvent;

/// Lower wins: the managed calendar, then the user's own copy, then the rest
pub fn priority(event: &PresentedEvent) -> u8 {
    if event.calendar_is_managed {
        0
    } else if event.calendar_is_primary || event.event.organized_by_self() {
        1
    } else {
        2
    }
}

fn identity(event: &PresentedEvent) -> (String, DateTime<Utc>) {
    let uid = event
        .event
        .ical_uid
        .as_deref()
        .filter(|uid| !uid.is_empty())
        .unwrap_or(&event.event.provider_event_id);
    (uid.to_string(), event.event.start)
}

/// Keep one event per (iCalUID or event id, start); the result is ordered by start.
///
/// Among equal priorities the earliest input wins.
pub fn dedupe_events(events: Vec<PresentedEvent>) -> Vec<PresentedEvent> {
    let mut slots: Vec<PresentedEvent> = Vec::with_capacity(events.len());
    let mut index: HashMap<(String, DateTime<Utc>), usize> = HashMap::new();

    for event in events {
        match index.entry(identity(&event)) {
            Entry::Occupied(slot) => {
                let kept = &mut slots[*slot.get()];
                if priority(&event) < priority(kept) {
                    *kept = event;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(slots.len());
                slots.push(event);
            }
        }
    }

    slots.sort_by_key(|e| e.event.start);
    slots
}
