use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use edgebuf::models::{format_timestamp, now_utc, parse_timestamp};
use edgebuf::{
    CapacitySettings, Command, Config, DeleteMethod, Field, ForwardMethod, ForwardingGate,
    ForwardingSettings, LocationFix, Payload, Publication, RecordStatus, RecordStore, Status,
};

/// Create a test configuration backed by a database in a temporary directory.
fn test_config(dir: &TempDir) -> Config {
    let url = format!("sqlite://{}", dir.path().join("buffer.db").display());
    let mut config = Config::with_database(url);
    config.deletion.method = DeleteMethod::AfterDays;
    config.deletion.after_days = 30;
    config
}

fn at(secs: i64) -> DateTime<Utc> {
    parse_timestamp("2024-05-01T10:00:00.000000Z").unwrap() + chrono::Duration::seconds(secs)
}

fn telemetry(name: &str, value: f64, ts: DateTime<Utc>) -> Publication {
    Publication::at(
        Payload::Telemetry {
            name: name.to_string(),
            value,
        },
        ts,
    )
}

// ============================================================================
// Replay flow
// ============================================================================

#[tokio::test]
async fn test_transport_replay_flow() {
    let dir = tempfile::tempdir().unwrap();
    let store = RecordStore::connect(&test_config(&dir)).await.unwrap();

    for i in 0..3 {
        let status = store.add(&telemetry("temp", 20.0 + i as f64, at(i))).await;
        assert_eq!(status, Status::Success);
    }

    // Transport picks up the replay batch and stamps it.
    let unsent = store.unsent_publications().await;
    assert_eq!(unsent.len(), 3);
    let first = format_timestamp(&unsent[0].timestamp);
    let last = format_timestamp(&unsent[2].timestamp);
    assert_eq!(
        store
            .reassign_topic("0042", Command::PublishTelemetry, &first, &last)
            .await,
        Status::Success
    );

    assert_eq!(
        store.update("0042", Field::Status, "pending", None).await,
        Status::Success
    );
    assert_eq!(store.count_by_status(RecordStatus::Pending).await, 3);

    assert_eq!(
        store.update("0042", Field::Status, "sent", None).await,
        Status::Success
    );
    assert_eq!(store.count_by_status(RecordStatus::Sent).await, 3);
    assert!(store.unsent_publications().await.is_empty());

    store.close().await;
}

#[tokio::test]
async fn test_wire_command_names_narrow_updates() {
    let dir = tempfile::tempdir().unwrap();
    let store = RecordStore::connect(&test_config(&dir)).await.unwrap();

    store.add(&telemetry("temp", 1.0, at(0))).await;
    store
        .add(&Publication::at(
            Payload::Attribute {
                name: "firmware".to_string(),
                value: "1.2.3".to_string(),
            },
            at(1),
        ))
        .await;

    let command: Command = "attribute.publish".parse().unwrap();
    store
        .update("0000", Field::Status, "pending", Some(command))
        .await;

    let pending = store.list_by_status(RecordStatus::Pending).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].command, Command::PublishAttribute);
}

// ============================================================================
// Status monotonicity
// ============================================================================

#[tokio::test]
async fn test_sent_records_never_return_to_unsent() {
    let dir = tempfile::tempdir().unwrap();
    let store = RecordStore::connect(&test_config(&dir)).await.unwrap();

    store.add(&telemetry("temp", 1.0, at(0))).await;
    store.update("0000", Field::Status, "pending", None).await;
    store.update("0000", Field::Status, "unsent", None).await;
    assert_eq!(store.count_by_status(RecordStatus::Pending).await, 1);

    store.update("0000", Field::Status, "sent", None).await;
    store.update("0000", Field::Status, "pending", None).await;
    store.update("0000", Field::Status, "unsent", None).await;
    assert_eq!(store.count_by_status(RecordStatus::Sent).await, 1);
}

// ============================================================================
// Durability
// ============================================================================

#[tokio::test]
async fn test_records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    // The fixed timestamp below would age out under an age-based policy.
    config.deletion.method = DeleteMethod::AfterSent;

    let fix = LocationFix {
        lat: -33.868820,
        lng: 151.209296,
        heading: Some(90.25),
        altitude: Some(58.0),
        speed: Some(1.5),
        accuracy: Some(3.0),
        fix_type: Some("2d".to_string()),
    };
    let location = Publication::at(Payload::Location(fix), at(5));

    {
        let store = RecordStore::connect(&config).await.unwrap();
        assert_eq!(store.add(&location).await, Status::Success);
        assert_eq!(store.close().await, 1);
    }

    let store = RecordStore::connect(&config).await.unwrap();
    assert_eq!(store.unsent_publications().await, vec![location]);
}

#[tokio::test]
async fn test_close_runs_one_final_pass_and_keeps_unsent() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let store = RecordStore::connect(&config).await.unwrap();
    for i in 0..4 {
        store.add(&telemetry("temp", i as f64, now_utc())).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(store.retention_passes(), 0);

    let remaining = store.close().await;
    assert_eq!(remaining, 4);
    assert_eq!(store.retention_passes(), 1);

    let reopened = RecordStore::connect(&config).await.unwrap();
    assert_eq!(reopened.count_by_status(RecordStatus::Unsent).await, 4);
}

// ============================================================================
// Background retention
// ============================================================================

#[tokio::test]
async fn test_sweeper_removes_aged_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.deletion.after_days = 2;

    let store = RecordStore::open(&config).await.unwrap();
    store
        .add(&telemetry(
            "temp",
            1.0,
            now_utc() - chrono::Duration::days(3),
        ))
        .await;
    store
        .add(&telemetry(
            "temp",
            2.0,
            now_utc() - chrono::Duration::days(1),
        ))
        .await;

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let left = store.list_all().await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].value.as_deref(), Some("2"));

    store.close().await;
}

#[tokio::test]
async fn test_sweeper_removes_sent_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.deletion.method = DeleteMethod::AfterSent;

    let store = RecordStore::open(&config).await.unwrap();
    store.add(&telemetry("temp", 1.0, at(0))).await;
    store.add(&telemetry("temp", 2.0, at(1))).await;
    store
        .reassign_topic(
            "0001",
            Command::PublishTelemetry,
            &format_timestamp(&at(0)),
            &format_timestamp(&at(0)),
        )
        .await;
    store.update("0001", Field::Status, "pending", None).await;
    store.update("0001", Field::Status, "sent", None).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let left = store.list_all().await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].status, RecordStatus::Unsent);

    store.close().await;
}

#[tokio::test]
async fn test_dropping_opened_store_stops_sweeper() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.deletion.method = DeleteMethod::AfterSent;

    let opened = RecordStore::open(&config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(opened);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let store = RecordStore::connect(&config).await.unwrap();
    store.add(&telemetry("temp", 1.0, at(0))).await;
    store.update("0000", Field::Status, "pending", None).await;
    store.update("0000", Field::Status, "sent", None).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(store.count_by_status(RecordStatus::Sent).await, 1);
}

// ============================================================================
// Capacity
// ============================================================================

#[tokio::test]
async fn test_concurrent_producers_respect_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.capacity = CapacitySettings {
        unlimited: false,
        max_samples: 10,
        oldest_first: true,
    };
    let store = RecordStore::connect(&config).await.unwrap();

    let mut tasks = Vec::new();
    for producer in 0..4 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let mut statuses = Vec::new();
            for i in 0..10 {
                let ts = at(producer * 100 + i);
                statuses.push(store.add(&telemetry("temp", i as f64, ts)).await);
            }
            statuses
        }));
    }

    let mut statuses = Vec::new();
    for task in tasks {
        statuses.extend(task.await.unwrap());
    }

    // Adds are serialized: ten fit, then the remaining thirty alternate
    // between hitting the limit and filling the freed slot.
    let full = statuses.iter().filter(|s| **s == Status::Full).count();
    let success = statuses.iter().filter(|s| **s == Status::Success).count();
    assert_eq!(full, 15);
    assert_eq!(success, 25);
    assert_eq!(store.list_all().await.len(), 10);
}

#[tokio::test]
async fn test_unlimited_store_keeps_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.capacity = CapacitySettings {
        unlimited: true,
        max_samples: 2,
        oldest_first: true,
    };
    let store = RecordStore::connect(&config).await.unwrap();

    for i in 0..5 {
        store.add(&telemetry("temp", i as f64, at(i))).await;
    }
    assert_eq!(store.list_all().await.len(), 5);
}

// ============================================================================
// Forwarding
// ============================================================================

#[tokio::test]
async fn test_on_change_batches() {
    let dir = tempfile::tempdir().unwrap();
    let store = RecordStore::connect(&test_config(&dir)).await.unwrap();
    let gate = ForwardingGate::new(
        store.clone(),
        ForwardingSettings {
            method: ForwardMethod::OnChange,
            ..ForwardingSettings::default()
        },
    );

    let batches = [("0001", 5.0), ("0002", 5.0), ("0003", 6.0)];
    let mut outcomes = Vec::new();
    for (i, (topic, value)) in batches.iter().enumerate() {
        let publication = telemetry("temp", *value, at(i as i64));
        store.add(&publication).await;
        let ts = format_timestamp(&publication.timestamp);
        store
            .reassign_topic(topic, Command::PublishTelemetry, &ts, &ts)
            .await;

        let decision = gate.check(topic, std::slice::from_ref(&publication)).await;
        outcomes.push(decision.status);
    }

    assert_eq!(
        outcomes,
        vec![Status::Success, Status::Exists, Status::Success]
    );
    let topics: Vec<String> = store
        .list_all()
        .await
        .into_iter()
        .map(|r| r.topic_num)
        .collect();
    assert_eq!(topics, vec!["0001", "0003"]);
}
