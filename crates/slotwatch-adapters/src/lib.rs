//! Slot extractor contracts + keyword-section HTML extraction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use slotwatch_core::{normalize, Record, RecordSet, SlotContext};
use slotwatch_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "slotwatch-adapters";

const SECTION_SELECTOR: &str = "h3, h4, div";
const CONTAINER_CLASSES: [&str; 2] = ["panel", "row"];

/// One monitored activity on the booking page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub label: String,
    pub keywords: Vec<String>,
}

/// Whether records carry the activity label in their identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    DateOnly,
    WithActivity,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no section matched keywords {keywords:?}")]
    SectionNotFound { keywords: Vec<String> },
    #[error("section matching {keywords:?} has no panel or row container")]
    ContainerNotFound { keywords: Vec<String> },
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("reading fixture {}: {source}", path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait SlotExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Slots currently advertised for `target`. Any error means the page
    /// could not be read, not that the slots disappeared.
    async fn fetch_current_records(
        &self,
        target: &WatchTarget,
        identity: IdentityMode,
    ) -> Result<RecordSet, ExtractError>;

    /// Union of every target's slots; the first failing target fails the
    /// whole pass.
    async fn fetch_all(
        &self,
        targets: &[WatchTarget],
        identity: IdentityMode,
    ) -> Result<RecordSet, ExtractError> {
        let mut current = RecordSet::new();
        for target in targets {
            current.extend(self.fetch_current_records(target, identity).await?);
        }
        Ok(current)
    }
}

/// Fetches the live booking page and reads slots from the target's section.
#[derive(Debug, Clone)]
pub struct KeywordSectionExtractor {
    http: HttpFetcher,
    url: String,
}

impl KeywordSectionExtractor {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SlotExtractor for KeywordSectionExtractor {
    fn name(&self) -> &'static str {
        "keyword-section"
    }

    async fn fetch_current_records(
        &self,
        target: &WatchTarget,
        identity: IdentityMode,
    ) -> Result<RecordSet, ExtractError> {
        self.fetch_all(std::slice::from_ref(target), identity).await
    }

    async fn fetch_all(
        &self,
        targets: &[WatchTarget],
        identity: IdentityMode,
    ) -> Result<RecordSet, ExtractError> {
        let page = self.http.fetch_bytes(&self.url).await?;
        info!(url = %page.final_url, bytes = page.body.len(), "page loaded");
        records_from_page(&page.text(), targets, identity)
    }
}

/// Reads a saved copy of the booking page; used for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureExtractor {
    path: PathBuf,
}

impl FixtureExtractor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SlotExtractor for FixtureExtractor {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_current_records(
        &self,
        target: &WatchTarget,
        identity: IdentityMode,
    ) -> Result<RecordSet, ExtractError> {
        self.fetch_all(std::slice::from_ref(target), identity).await
    }

    async fn fetch_all(
        &self,
        targets: &[WatchTarget],
        identity: IdentityMode,
    ) -> Result<RecordSet, ExtractError> {
        let html = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ExtractError::Fixture {
                path: self.path.clone(),
                source,
            })?;
        records_from_page(&html, targets, identity)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn element_text(element: &ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

fn has_class(element: &ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

/// Text fragments carrying an ISO date inside the section whose heading
/// mentions every keyword.
///
/// The innermost `h3`/`h4`/`div` containing all keywords is the heading; the
/// nearest ancestor with class `panel` (else `row`) bounds the section.
pub fn extract_slot_lines(html: &str, keywords: &[String]) -> Result<Vec<String>, ExtractError> {
    let document = Html::parse_document(html);
    let sel = parse_selector(SECTION_SELECTOR)?;
    let matching: Vec<ElementRef<'_>> = document
        .select(&sel)
        .filter(|el| {
            let text = element_text(el);
            keywords.iter().all(|k| text.contains(k.as_str()))
        })
        .collect();

    // A match enclosing another match is not the innermost heading.
    let matched: HashSet<_> = matching.iter().map(|el| el.id()).collect();
    let enclosing: HashSet<_> = matching
        .iter()
        .flat_map(|el| el.ancestors().map(|node| node.id()))
        .filter(|id| matched.contains(id))
        .collect();

    let heading = matching
        .into_iter()
        .find(|el| !enclosing.contains(&el.id()))
        .ok_or_else(|| ExtractError::SectionNotFound {
            keywords: keywords.to_vec(),
        })?;
    debug!(heading = %element_text(&heading).trim(), "found target section");

    let container = CONTAINER_CLASSES
        .iter()
        .find_map(|class| {
            heading
                .ancestors()
                .filter_map(ElementRef::wrap)
                .find(|el| has_class(el, class))
        })
        .ok_or_else(|| ExtractError::ContainerNotFound {
            keywords: keywords.to_vec(),
        })?;

    Ok(container
        .text()
        .map(str::trim)
        .filter(|line| find_iso_date(line).is_some())
        .map(str::to_string)
        .collect())
}

/// Slots of every target found in one page.
pub fn records_from_page(
    html: &str,
    targets: &[WatchTarget],
    identity: IdentityMode,
) -> Result<RecordSet, ExtractError> {
    let mut current = RecordSet::new();
    for target in targets {
        let lines = extract_slot_lines(html, &target.keywords)?;
        current.extend(records_from_lines(&lines, target, identity));
    }
    Ok(current)
}

/// Normalize extracted lines, composing `date @ time` when both are present.
pub fn records_from_lines(lines: &[String], target: &WatchTarget, identity: IdentityMode) -> RecordSet {
    let activity = match identity {
        IdentityMode::DateOnly => None,
        IdentityMode::WithActivity => Some(target.label.clone()),
    };
    lines
        .iter()
        .filter_map(|line| line_to_record(line, activity.clone()))
        .collect()
}

fn line_to_record(line: &str, activity: Option<String>) -> Option<Record> {
    let date = find_iso_date(line);
    let time = date.and_then(|_| find_clock_time(line));
    let context = SlotContext {
        date: time.and(date).map(str::to_string),
        time: time.map(str::to_string),
        activity,
    };
    normalize(line, Some(&context))
}

/// First `YYYY-MM-DD` token not embedded in a longer digit run.
pub fn find_iso_date(text: &str) -> Option<&str> {
    let b = text.as_bytes();
    if b.len() < 10 {
        return None;
    }
    (0..=b.len() - 10).find_map(|i| {
        let shaped = b[i..i + 10].iter().enumerate().all(|(j, c)| {
            if j == 4 || j == 7 {
                *c == b'-'
            } else {
                c.is_ascii_digit()
            }
        });
        let bounded = (i == 0 || !b[i - 1].is_ascii_digit())
            && !b.get(i + 10).is_some_and(u8::is_ascii_digit);
        (shaped && bounded).then(|| &text[i..i + 10])
    })
}

/// First `H:MM` or `HH:MM` token.
pub fn find_clock_time(text: &str) -> Option<&str> {
    let b = text.as_bytes();
    for colon in 0..b.len() {
        if b[colon] != b':' {
            continue;
        }
        let mut start = colon;
        while start > 0 && colon - start < 2 && b[start - 1].is_ascii_digit() {
            start -= 1;
        }
        if start == colon || (start > 0 && b[start - 1].is_ascii_digit()) {
            continue;
        }
        let end = colon + 3;
        if end > b.len() || !b[colon + 1].is_ascii_digit() || !b[colon + 2].is_ascii_digit() {
            continue;
        }
        if b.get(end).is_some_and(u8::is_ascii_digit) {
            continue;
        }
        return Some(&text[start..end]);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(label: &str, keywords: &[&str]) -> WatchTarget {
        WatchTarget {
            label: label.into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn fixture_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/padel-yard/page.html")
    }

    #[test]
    fn iso_date_detection() {
        assert_eq!(find_iso_date("Tue 2025-03-18 19:30"), Some("2025-03-18"));
        assert_eq!(find_iso_date("ref 12025-03-18"), None);
        assert_eq!(find_iso_date("2025-3-18"), None);
        assert_eq!(find_iso_date("short"), None);
    }

    #[test]
    fn clock_time_detection() {
        assert_eq!(find_clock_time("2025-03-18 19:30"), Some("19:30"));
        assert_eq!(find_clock_time("at 9:05 sharp"), Some("9:05"));
        assert_eq!(find_clock_time("ratio 123:45"), None);
        assert_eq!(find_clock_time("10:5"), None);
        assert_eq!(find_clock_time("no time"), None);
    }

    #[test]
    fn lines_compose_date_and_time() {
        let t = target("Master Class", &["Master"]);
        let lines = vec![
            "Tue 2025-03-18   19:30".to_string(),
            "2025-03-20 all day".to_string(),
        ];
        let records = records_from_lines(&lines, &t, IdentityMode::DateOnly);
        assert_eq!(records.to_strings(), vec!["2025-03-18 @ 19:30", "2025-03-20 all day"]);

        let labelled = records_from_lines(&lines, &t, IdentityMode::WithActivity);
        assert_eq!(
            labelled.to_strings(),
            vec!["2025-03-18 @ 19:30 [Master Class]", "2025-03-20 all day [Master Class]"]
        );
    }

    #[test]
    fn innermost_heading_bounds_the_section() {
        let html = std::fs::read_to_string(fixture_path()).expect("fixture");
        let keywords = target("x", &["Master Class", "Oscar Marhuenda", "Intermediate"]).keywords;
        let lines = extract_slot_lines(&html, &keywords).expect("lines");
        assert_eq!(
            lines,
            vec!["2025-03-04 18:00", "2025-03-11   18:00", "Tue 2025-03-18 19:30"]
        );
    }

    #[test]
    fn missing_section_is_an_error() {
        let html = "<html><body><div class=\"panel\"><h3>Yoga</h3>2025-01-01</div></body></html>";
        let err = extract_slot_lines(html, &["Padel".to_string()]).unwrap_err();
        assert!(matches!(err, ExtractError::SectionNotFound { .. }));
    }

    #[test]
    fn falls_back_to_row_then_fails_without_container() {
        let row = "<div class=\"row\"><h4>Padel Camp</h4><span>2025-02-02</span></div>";
        let lines = extract_slot_lines(row, &["Padel Camp".to_string()]).expect("row container");
        assert_eq!(lines, vec!["2025-02-02"]);

        let bare = "<section><h4>Padel Camp</h4><span>2025-02-02</span></section>";
        let err = extract_slot_lines(bare, &["Padel Camp".to_string()]).unwrap_err();
        assert!(matches!(err, ExtractError::ContainerNotFound { .. }));
    }

    #[test]
    fn innermost_match_wins_inside_deeply_nested_wrappers() {
        let depth = 300;
        let html = format!(
            "{}<div class=\"panel\"><div><h4>Padel Camp</h4></div><span>2025-02-02 10:00</span></div>{}",
            "<div>".repeat(depth),
            "</div>".repeat(depth),
        );
        let lines = extract_slot_lines(&html, &["Padel Camp".to_string()]).expect("section");
        assert_eq!(lines, vec!["2025-02-02 10:00"]);
    }

    #[tokio::test]
    async fn fixture_extractor_keeps_same_date_activities_apart() {
        let extractor = FixtureExtractor::new(fixture_path());
        let master = target("Master Class", &["Master Class", "Oscar Marhuenda", "Intermediate"]);
        let clinic = target("Beginner Clinic", &["Beginner Clinic"]);

        let a = extractor
            .fetch_current_records(&master, IdentityMode::WithActivity)
            .await
            .expect("master");
        let b = extractor
            .fetch_current_records(&clinic, IdentityMode::WithActivity)
            .await
            .expect("clinic");

        assert_eq!(
            a.to_strings(),
            vec![
                "2025-03-04 @ 18:00 [Master Class]",
                "2025-03-11 @ 18:00 [Master Class]",
                "2025-03-18 @ 19:30 [Master Class]",
            ]
        );
        assert_eq!(
            b.to_strings(),
            vec!["2025-03-04 @ 18:00 [Beginner Clinic]", "2025-03-12 @ 09:00 [Beginner Clinic]"]
        );
        assert!(a.union(&b).len() == 5);
    }

    #[tokio::test]
    async fn missing_fixture_file_is_an_extract_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let extractor = FixtureExtractor::new(dir.path().join("absent.html"));
        let err = extractor
            .fetch_current_records(&target("x", &["x"]), IdentityMode::DateOnly)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Fixture { .. }));
    }

    #[tokio::test]
    async fn fetch_all_unions_targets_and_fails_as_a_whole() {
        let extractor = FixtureExtractor::new(fixture_path());
        let targets = vec![
            target("Master Class", &["Master Class", "Intermediate"]),
            target("Beginner Clinic", &["Beginner Clinic"]),
        ];
        let all = extractor
            .fetch_all(&targets, IdentityMode::WithActivity)
            .await
            .expect("all targets");
        assert_eq!(all.len(), 5);

        let mut with_missing = targets.clone();
        with_missing.push(target("Yoga", &["Sunrise Yoga"]));
        let err = extractor
            .fetch_all(&with_missing, IdentityMode::WithActivity)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::SectionNotFound { .. }));
    }
}
