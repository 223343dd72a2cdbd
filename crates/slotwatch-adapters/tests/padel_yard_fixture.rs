// Date-only identity over the saved booking page.

use slotwatch_adapters::{FixtureExtractor, IdentityMode, SlotExtractor, WatchTarget};

#[tokio::test]
async fn padel_yard_fixture_yields_date_only_records() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let page = root.join("fixtures/padel-yard/page.html");
    assert!(page.exists());

    let extractor = FixtureExtractor::new(page);
    let target = WatchTarget {
        label: "Master Class".into(),
        keywords: vec!["Master Class".into(), "Intermediate".into()],
    };
    let records = extractor
        .fetch_current_records(&target, IdentityMode::DateOnly)
        .await
        .expect("records");

    assert_eq!(
        records.to_strings(),
        vec!["2025-03-04 @ 18:00", "2025-03-11 @ 18:00", "2025-03-18 @ 19:30"]
    );
}
