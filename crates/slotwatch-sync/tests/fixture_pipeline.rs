// End-to-end passes over the saved booking page with two watched activities.

use std::path::Path;

use chrono::{TimeZone, Utc};
use slotwatch_feed::parse_entries;
use slotwatch_sync::{status_report, WatchConfig, WatchPipeline};
use tempfile::tempdir;

fn fixture() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/padel-yard/page.html")
}

#[tokio::test]
async fn two_targets_announce_once_then_stay_quiet() {
    let dir = tempdir().expect("tempdir");
    let yaml = format!(
        r#"source_url: https://booking.example/facilities/padel-yard
targets:
  - label: Master Class
    keywords: [Master Class, Intermediate]
  - label: Beginner Clinic
    keywords: [Beginner Clinic]
feed:
  title: Padel Yard Slots
state_file: {:?}
feed_file: {:?}
fixture_path: {:?}
"#,
        dir.path().join("seen_dates.json"),
        dir.path().join("feed.xml"),
        fixture(),
    );
    let config = WatchConfig::from_yaml_str(&yaml).expect("config");
    config.validate().expect("valid");
    let pipeline = WatchPipeline::new(config.clone()).expect("pipeline");

    let first_at = Utc.with_ymd_and_hms(2025, 3, 1, 7, 0, 0).single().unwrap();
    let first = pipeline.run_at(first_at).await.expect("first run");
    assert!(!first.fetch_failed);
    assert_eq!(first.current_slots, 5);
    assert_eq!(first.new_slots.len(), 5);
    assert!(first.new_slots.contains(&"2025-03-04 @ 18:00 [Beginner Clinic]".to_string()));
    assert!(first.new_slots.contains(&"2025-03-04 @ 18:00 [Master Class]".to_string()));

    let doc = std::fs::read_to_string(&config.feed_file).expect("feed");
    assert!(doc.contains("<title>Padel Yard Slots</title>"));
    let parsed = parse_entries(&doc);
    assert_eq!(parsed.entries.len(), 1);
    assert_eq!(parsed.entries[0].title().as_deref(), Some("5 New Slots Found!"));

    let second = pipeline
        .run_at(first_at + chrono::Duration::minutes(30))
        .await
        .expect("second run");
    assert!(second.new_slots.is_empty());
    assert!(!second.feed_written);
    assert_eq!(std::fs::read_to_string(&config.feed_file).expect("feed"), doc);

    let report = status_report(&config).await.expect("status");
    assert!(report.contains("## Seen slots (5)"));
    assert!(report.contains("5 New Slots Found!"));
}

#[tokio::test]
async fn missing_section_counts_as_fetch_failure() {
    let dir = tempdir().expect("tempdir");
    let yaml = format!(
        "source_url: https://booking.example\ntargets:\n  - label: Squash\n    keywords: [Squash Ladder]\nstate_file: {:?}\nfeed_file: {:?}\nfixture_path: {:?}\n",
        dir.path().join("seen.json"),
        dir.path().join("feed.xml"),
        fixture(),
    );
    let config = WatchConfig::from_yaml_str(&yaml).expect("config");
    let summary = WatchPipeline::new(config.clone())
        .expect("pipeline")
        .run_once()
        .await
        .expect("run");

    assert!(summary.fetch_failed);
    assert!(!config.state_file.exists());
    assert!(summary.feed_written);
    assert!(parse_entries(&std::fs::read_to_string(&config.feed_file).expect("feed"))
        .entries
        .is_empty());
}
