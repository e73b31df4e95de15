//! Integration tests for lifecycle hooks and cascade deletion.

mod common;

use chrono::NaiveDate;
use common::{
    TrackedCalendar, TrackedEvent, calendar_row, entries, event_row, hook_log, make_calendar,
    make_event, open, setup,
};
use unitwork_db::SessionFactory;
use unitwork_shared::PersistError;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
}

/// Calendar 1 with events 10 through 13.
async fn seeded() -> SessionFactory {
    let factory = setup().await;
    let mut session = open(&factory).await;

    session.save(&mut make_calendar(1, "Work")).await.unwrap();
    for id in 10..14 {
        session.save(&mut make_event(id, 1, "meeting", day())).await.unwrap();
    }
    session.close().await.unwrap();

    factory
}

#[tokio::test]
async fn test_delete_cascades_to_reported_entities_after_primary() {
    let factory = seeded().await;
    let log = hook_log();
    let mut session = open(&factory).await;

    let first = session.get::<common::event::Entity>(10).await.unwrap().unwrap();
    let second = session.get::<common::event::Entity>(11).await.unwrap().unwrap();
    let first = common::event::ActiveModel::from(first);
    let second = common::event::ActiveModel::from(second);
    assert!(session.contains(&first));
    assert!(session.contains(&second));

    let mut aggregate = TrackedCalendar {
        model: make_calendar(1, "Work"),
        doomed: vec![TrackedEvent::new(10, &log), TrackedEvent::new(11, &log)],
        log: log.clone(),
    };
    session.delete(&mut aggregate).await.unwrap();

    assert_eq!(
        entries(&log),
        vec!["delete calendar 1", "delete event 10", "delete event 11"]
    );
    assert!(!session.contains(&first));
    assert!(!session.contains(&second));
    assert!(aggregate.doomed.is_empty());
    session.close().await.unwrap();

    assert!(calendar_row(&factory, 1).await.is_none());
    assert!(event_row(&factory, 10).await.is_none());
    assert!(event_row(&factory, 11).await.is_none());
    assert!(event_row(&factory, 12).await.is_some());
}

#[tokio::test]
async fn test_cascade_is_depth_first() {
    let factory = seeded().await;
    let log = hook_log();
    let mut session = open(&factory).await;

    let mut aggregate = TrackedCalendar {
        model: make_calendar(1, "Work"),
        doomed: vec![
            TrackedEvent::new(10, &log).with_dependents(vec![
                TrackedEvent::new(11, &log),
                TrackedEvent::new(12, &log),
            ]),
            TrackedEvent::new(13, &log),
        ],
        log: log.clone(),
    };
    session.delete(&mut aggregate).await.unwrap();
    session.close().await.unwrap();

    assert_eq!(
        entries(&log),
        vec![
            "delete calendar 1",
            "delete event 10",
            "delete event 11",
            "delete event 12",
            "delete event 13",
        ]
    );
    for id in 10..14 {
        assert!(event_row(&factory, id).await.is_none());
    }
}

#[tokio::test]
async fn test_update_deletes_reported_entities() {
    let factory = seeded().await;
    let log = hook_log();
    let mut session = open(&factory).await;

    let mut aggregate = TrackedCalendar {
        model: make_calendar(1, "Office"),
        doomed: vec![TrackedEvent::new(12, &log)],
        log: log.clone(),
    };
    let updated = session.update(&mut aggregate).await.unwrap();

    assert_eq!(updated.name, "Office");
    assert!(session.contains(&aggregate));
    assert_eq!(entries(&log), vec!["save calendar 1", "delete event 12"]);
    session.close().await.unwrap();

    assert_eq!(calendar_row(&factory, 1).await.unwrap().name, "Office");
    assert!(event_row(&factory, 12).await.is_none());
    assert!(event_row(&factory, 13).await.is_some());
}

#[tokio::test]
async fn test_save_runs_hook_before_insert() {
    let factory = setup().await;
    let log = hook_log();
    let mut session = open(&factory).await;

    let mut aggregate = TrackedCalendar {
        model: make_calendar(7, "Travel"),
        doomed: Vec::new(),
        log: log.clone(),
    };
    session.save(&mut aggregate).await.unwrap();
    session.close().await.unwrap();

    assert_eq!(entries(&log), vec!["save calendar 7"]);
    assert!(calendar_row(&factory, 7).await.is_some());
}

#[tokio::test]
async fn test_cascade_to_missing_row_is_stale_state() {
    let factory = seeded().await;
    let log = hook_log();
    let mut session = open(&factory).await;

    let mut aggregate = TrackedCalendar {
        model: make_calendar(1, "Work"),
        doomed: vec![TrackedEvent::new(99, &log)],
        log: log.clone(),
    };
    let err = session.delete(&mut aggregate).await.unwrap_err();

    assert!(matches!(err, PersistError::StaleState(_)));
    assert_eq!(session.failure(), Some(&err));
    session.close().await.unwrap();

    // The whole unit of work was rolled back.
    assert!(calendar_row(&factory, 1).await.is_some());
}

#[tokio::test]
async fn test_keyless_dependent_fails_the_unit_of_work() {
    let factory = seeded().await;
    let log = hook_log();
    let mut session = open(&factory).await;

    let mut aggregate = TrackedCalendar {
        model: make_calendar(2, "Home"),
        doomed: vec![TrackedEvent::new(10, &log), TrackedEvent::keyless(&log)],
        log: log.clone(),
    };
    let err = session.save(&mut aggregate).await.unwrap_err();

    assert!(matches!(err, PersistError::IllegalState(_)));
    assert_eq!(session.failure(), Some(&err));
    assert_eq!(entries(&log), vec!["save calendar 2", "delete event 10"]);
    session.close().await.unwrap();

    assert!(calendar_row(&factory, 2).await.is_none());
    assert!(event_row(&factory, 10).await.is_some());
}
