use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::MigrationConfig;
use crate::convert;
use crate::engine::{ConversionResult, ConvertEngine, PandocEngine};
use crate::export::DirStore;
use crate::ledger;
use crate::mediawiki::{MediaWikiSource, MediaWikiSourceConfig, PageRevision, RevisionSource};
use crate::wikijs::{NewPage, PageStore, WikiJsClient, WikiJsClientConfig};

pub const LAST_MIGRATE_KEY: &str = "last_migrate_unix";

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    pub dry_run: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageOutcome {
    pub path: String,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevisionFailure {
    pub page_path: String,
    pub timestamp: String,
    pub diagnostics: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub success: bool,
    pub dry_run: bool,
    pub pages_total: usize,
    pub pages_migrated: usize,
    pub pages_failed: usize,
    pub revisions_converted: usize,
    pub revisions_repaired: usize,
    pub revisions_skipped: usize,
    pub errors: Vec<String>,
    pub pages: Vec<PageOutcome>,
    pub failures: Vec<RevisionFailure>,
    pub source_request_count: usize,
    pub store_request_count: usize,
}

/// Destination path for a source title. Pseudo-namespace colons become
/// directory levels; spaces and dots are not safe in destination paths.
pub fn page_path(title: &str) -> String {
    title.replace(':', "/").replace([' ', '.'], "_")
}

/// Display title for a page: the last pseudo-namespace segment.
pub fn display_title(title: &str) -> String {
    title.rsplit(':').next().unwrap_or(title).trim().to_string()
}

pub fn run_migration(config: &MigrationConfig, options: &MigrateOptions) -> Result<MigrationReport> {
    let mut source = connect_source(config)?;
    let engine = PandocEngine::from_config(config);
    let mut store = WikiJsClient::new(WikiJsClientConfig::from_config(config))?;
    let connection = ledger::open_ledger(&config.ledger_path())?;
    migrate_all(
        &mut source,
        &mut store,
        &engine,
        &config.locale(),
        Some(&connection),
        options,
    )
}

pub fn run_export(
    config: &MigrationConfig,
    out_dir: &Path,
    options: &MigrateOptions,
) -> Result<MigrationReport> {
    let mut source = connect_source(config)?;
    let engine = PandocEngine::from_config(config);
    let mut store = DirStore::new(out_dir.to_path_buf());
    migrate_all(
        &mut source,
        &mut store,
        &engine,
        &config.locale(),
        None,
        options,
    )
}

fn connect_source(config: &MigrationConfig) -> Result<MediaWikiSource> {
    let mut source = MediaWikiSource::new(MediaWikiSourceConfig::from_config(config))?;
    if let Some((username, password)) = config.source_credentials() {
        source
            .login(&username, &password)
            .context("MediaWiki login failed")?;
    }
    Ok(source)
}

/// Migrate every main-namespace page from `source` into `store`, oldest
/// revision first so the destination ends up with the full edit history.
///
/// Per-page and per-revision problems are recorded in the report and the
/// run keeps going; only a failure to list the source pages or to launch
/// the conversion engine aborts it.
pub fn migrate_all<S: RevisionSource, D: PageStore, E: ConvertEngine>(
    source: &mut S,
    store: &mut D,
    engine: &E,
    locale: &str,
    ledger: Option<&Connection>,
    options: &MigrateOptions,
) -> Result<MigrationReport> {
    let mut report = MigrationReport {
        dry_run: options.dry_run,
        ..MigrationReport::default()
    };

    let titles = source.page_titles()?;
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for title in titles {
        let path = page_path(&title);
        if path.is_empty() {
            continue;
        }
        groups.entry(path).or_default().push(title);
    }

    let limit = options.limit.unwrap_or(usize::MAX);
    let selected: Vec<(String, Vec<String>)> = groups.into_iter().take(limit).collect();
    report.pages_total = selected.len();

    if options.dry_run {
        for (path, group_titles) in selected {
            report.pages.push(PageOutcome {
                path,
                action: "planned".to_string(),
                detail: Some(group_titles.join(", ")),
            });
        }
        report.source_request_count = source.request_count();
        report.store_request_count = store.request_count();
        report.success = true;
        return Ok(report);
    }

    for (path, group_titles) in selected {
        let title = display_title(&group_titles[0]);

        let mut revisions: Vec<PageRevision> = Vec::new();
        let mut fetch_error = None;
        for source_title in &group_titles {
            match source.page_revisions(source_title) {
                Ok(mut batch) => revisions.append(&mut batch),
                Err(error) => {
                    fetch_error = Some(error);
                    break;
                }
            }
        }
        if let Some(error) = fetch_error {
            report.errors.push(format!("{path}: {error:#}"));
            report.pages.push(PageOutcome {
                path,
                action: "error".to_string(),
                detail: Some("failed to fetch revisions".to_string()),
            });
            report.pages_failed += 1;
            continue;
        }

        if revisions.is_empty() {
            report.pages.push(PageOutcome {
                path,
                action: "skipped".to_string(),
                detail: Some("no revisions".to_string()),
            });
            continue;
        }
        // Merged titles interleave; per-title batches are already oldest first.
        revisions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        migrate_page(
            &path,
            &title,
            &revisions,
            store,
            engine,
            locale,
            ledger,
            &mut report,
        )?;
    }

    if let Some(connection) = ledger {
        let now = ledger::unix_timestamp()?;
        if let Err(error) = ledger::set_ledger_config(connection, LAST_MIGRATE_KEY, &now.to_string())
        {
            report.errors.push(format!("ledger: {error:#}"));
        }
    }

    report.source_request_count = source.request_count();
    report.store_request_count = store.request_count();
    report.success = report.errors.is_empty();
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn migrate_page<D: PageStore, E: ConvertEngine>(
    path: &str,
    title: &str,
    revisions: &[PageRevision],
    store: &mut D,
    engine: &E,
    locale: &str,
    ledger: Option<&Connection>,
    report: &mut MigrationReport,
) -> Result<()> {
    // Recreate from scratch so a rerun does not stack revisions on top of
    // a previous run's history.
    let mut page_id = match store.find_page(path) {
        Ok(existing) => existing,
        Err(error) => {
            report.errors.push(format!("{path}: {error:#}"));
            report.pages.push(PageOutcome {
                path: path.to_string(),
                action: "error".to_string(),
                detail: Some("destination lookup failed".to_string()),
            });
            report.pages_failed += 1;
            return Ok(());
        }
    };
    if let Some(id) = page_id {
        if let Err(error) = store.delete_page(id) {
            report.errors.push(format!("{path}: {error:#}"));
            report.pages.push(PageOutcome {
                path: path.to_string(),
                action: "error".to_string(),
                detail: Some("failed to delete stale page".to_string()),
            });
            report.pages_failed += 1;
            return Ok(());
        }
        page_id = None;
    }

    let mut pushed = 0usize;
    let mut last_content: Option<String> = None;
    let mut last_timestamp: Option<&str> = None;
    let mut store_failed = false;

    for revision in revisions {
        let outcome = convert::convert_document(engine, &revision.content)
            .with_context(|| format!("while migrating {path}"))?;
        match outcome.result {
            ConversionResult::Converted { output } => {
                if outcome.repaired {
                    report.revisions_repaired += 1;
                }
                let written = match page_id {
                    None => match store.create_page(&NewPage {
                        path,
                        title,
                        content: &output,
                        locale,
                    }) {
                        Ok(id) => {
                            page_id = Some(id);
                            Ok(())
                        }
                        Err(error) => Err(error),
                    },
                    Some(id) => store.update_page(id, &output),
                };
                match written {
                    Ok(()) => {
                        report.revisions_converted += 1;
                        pushed += 1;
                        last_content = Some(output);
                        last_timestamp = Some(&revision.timestamp);
                    }
                    Err(error) => {
                        report.errors.push(format!("{path}: {error:#}"));
                        store_failed = true;
                        break;
                    }
                }
            }
            ConversionResult::Failed { diagnostics } => {
                report.revisions_skipped += 1;
                if let Some(connection) = ledger
                    && let Err(error) = ledger::record_failed_revision(
                        connection,
                        path,
                        &revision.timestamp,
                        &diagnostics,
                    )
                {
                    report.errors.push(format!("{path}: {error:#}"));
                }
                report.failures.push(RevisionFailure {
                    page_path: path.to_string(),
                    timestamp: revision.timestamp.clone(),
                    diagnostics,
                });
            }
        }
    }

    if store_failed {
        report.pages.push(PageOutcome {
            path: path.to_string(),
            action: "error".to_string(),
            detail: Some("destination write failed".to_string()),
        });
        report.pages_failed += 1;
        return Ok(());
    }
    if pushed == 0 {
        report.pages.push(PageOutcome {
            path: path.to_string(),
            action: "failed".to_string(),
            detail: Some("no revision converted".to_string()),
        });
        report.pages_failed += 1;
        return Ok(());
    }

    report.pages_migrated += 1;
    report.pages.push(PageOutcome {
        path: path.to_string(),
        action: "migrated".to_string(),
        detail: Some(format!("{pushed} of {} revisions", revisions.len())),
    });
    if let Some(connection) = ledger {
        let hash = last_content
            .as_deref()
            .map(ledger::compute_hash)
            .unwrap_or_default();
        if let Err(error) =
            ledger::record_page(connection, path, title, pushed, &hash, last_timestamp)
        {
            report.errors.push(format!("{path}: {error:#}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    use anyhow::bail;
    use tempfile::tempdir;

    use super::*;

    fn revision(timestamp: &str, content: &str) -> PageRevision {
        PageRevision {
            contributor: "tester".to_string(),
            timestamp: timestamp.to_string(),
            content: content.to_string(),
        }
    }

    struct FakeSource {
        pages: BTreeMap<String, Vec<PageRevision>>,
        failing: BTreeSet<String>,
        requests: usize,
    }

    impl FakeSource {
        fn new(pages: BTreeMap<String, Vec<PageRevision>>) -> Self {
            Self {
                pages,
                failing: BTreeSet::new(),
                requests: 0,
            }
        }
    }

    impl RevisionSource for FakeSource {
        fn page_titles(&mut self) -> Result<Vec<String>> {
            self.requests += 1;
            Ok(self.pages.keys().cloned().collect())
        }

        fn page_revisions(&mut self, title: &str) -> Result<Vec<PageRevision>> {
            self.requests += 1;
            if self.failing.contains(title) {
                bail!("revision query refused");
            }
            Ok(self.pages.get(title).cloned().unwrap_or_default())
        }

        fn request_count(&self) -> usize {
            self.requests
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        next_id: i64,
        pages: BTreeMap<i64, (String, String)>,
        deleted: Vec<String>,
        requests: usize,
    }

    impl MemoryStore {
        fn content(&self, path: &str) -> Option<&str> {
            self.pages
                .values()
                .find(|(page_path, _)| page_path == path)
                .map(|(_, content)| content.as_str())
        }

        fn seed(&mut self, path: &str, content: &str) -> i64 {
            self.next_id += 1;
            self.pages
                .insert(self.next_id, (path.to_string(), content.to_string()));
            self.next_id
        }
    }

    impl PageStore for MemoryStore {
        fn find_page(&mut self, path: &str) -> Result<Option<i64>> {
            self.requests += 1;
            Ok(self
                .pages
                .iter()
                .find(|(_, (page_path, _))| page_path == path)
                .map(|(id, _)| *id))
        }

        fn delete_page(&mut self, id: i64) -> Result<()> {
            self.requests += 1;
            match self.pages.remove(&id) {
                Some((path, _)) => {
                    self.deleted.push(path);
                    Ok(())
                }
                None => bail!("no page with id {id}"),
            }
        }

        fn create_page(&mut self, page: &NewPage<'_>) -> Result<i64> {
            self.requests += 1;
            self.next_id += 1;
            self.pages.insert(
                self.next_id,
                (page.path.to_string(), page.content.to_string()),
            );
            Ok(self.next_id)
        }

        fn update_page(&mut self, id: i64, content: &str) -> Result<()> {
            self.requests += 1;
            match self.pages.get_mut(&id) {
                Some((_, existing)) => {
                    *existing = content.to_string();
                    Ok(())
                }
                None => bail!("no page with id {id}"),
            }
        }

        fn request_count(&self) -> usize {
            self.requests
        }
    }

    /// Converts everything except content marked STUCK, which fails with
    /// diagnostics no repair rule recognizes.
    struct RecordingEngine {
        invocations: RefCell<usize>,
    }

    impl RecordingEngine {
        fn new() -> Self {
            Self {
                invocations: RefCell::new(0),
            }
        }

        fn invocations(&self) -> usize {
            *self.invocations.borrow()
        }
    }

    impl ConvertEngine for RecordingEngine {
        fn invoke(&self, source: &str) -> Result<ConversionResult> {
            *self.invocations.borrow_mut() += 1;
            if source.contains("STUCK") {
                return Ok(ConversionResult::Failed {
                    diagnostics: "Error at (line 1, column 1):\nunexpected token".to_string(),
                });
            }
            Ok(ConversionResult::Converted {
                output: source.to_string(),
            })
        }
    }

    fn options() -> MigrateOptions {
        MigrateOptions::default()
    }

    #[test]
    fn title_mapping_builds_destination_paths() {
        assert_eq!(page_path("Company"), "Company");
        assert_eq!(
            page_path("Customers:DA:OP7000 Flash.Cfg"),
            "Customers/DA/OP7000_Flash_Cfg"
        );
        assert_eq!(display_title("Company"), "Company");
        assert_eq!(display_title("Customers:DA:OP7000"), "OP7000");
    }

    #[test]
    fn migrates_pages_oldest_revision_first() {
        let mut pages = BTreeMap::new();
        pages.insert("Company".to_string(), vec![revision("2021", "about us")]);
        pages.insert(
            "Customers:DA:OP7000".to_string(),
            vec![
                revision("2023-05-01T00:00:00Z", "newer text"),
                revision("2021-01-01T00:00:00Z", "older text"),
            ],
        );
        let mut source = FakeSource::new(pages);
        let mut store = MemoryStore::default();
        let engine = RecordingEngine::new();

        let report =
            migrate_all(&mut source, &mut store, &engine, "en", None, &options()).expect("run");

        assert!(report.success);
        assert_eq!(report.pages_total, 2);
        assert_eq!(report.pages_migrated, 2);
        assert_eq!(report.pages_failed, 0);
        assert_eq!(report.revisions_converted, 3);
        assert_eq!(report.revisions_skipped, 0);
        assert_eq!(store.content("Company"), Some("about us"));
        assert_eq!(store.content("Customers/DA/OP7000"), Some("newer text"));
        assert_eq!(engine.invocations(), 3);
        assert_eq!(report.source_request_count, source.request_count());
    }

    #[test]
    fn existing_page_is_recreated_from_scratch() {
        let mut pages = BTreeMap::new();
        pages.insert("Company".to_string(), vec![revision("2021", "fresh")]);
        let mut source = FakeSource::new(pages);
        let mut store = MemoryStore::default();
        store.seed("Company", "stale history");
        let engine = RecordingEngine::new();

        let report =
            migrate_all(&mut source, &mut store, &engine, "en", None, &options()).expect("run");

        assert!(report.success);
        assert_eq!(store.deleted, vec!["Company".to_string()]);
        assert_eq!(store.content("Company"), Some("fresh"));
    }

    #[test]
    fn colliding_titles_merge_into_one_page() {
        // "A B" and "A.B" map to the same destination path.
        let mut pages = BTreeMap::new();
        pages.insert(
            "A B".to_string(),
            vec![revision("2020-01-01T00:00:00Z", "from the spaced title")],
        );
        pages.insert(
            "A.B".to_string(),
            vec![revision("2022-01-01T00:00:00Z", "from the dotted title")],
        );
        let mut source = FakeSource::new(pages);
        let mut store = MemoryStore::default();
        let engine = RecordingEngine::new();

        let report =
            migrate_all(&mut source, &mut store, &engine, "en", None, &options()).expect("run");

        assert_eq!(report.pages_total, 1);
        assert_eq!(report.pages_migrated, 1);
        assert_eq!(report.revisions_converted, 2);
        assert_eq!(store.content("A_B"), Some("from the dotted title"));
        assert_eq!(report.pages[0].detail.as_deref(), Some("2 of 2 revisions"));
    }

    #[test]
    fn unconvertible_revision_is_skipped_but_page_survives() {
        let mut pages = BTreeMap::new();
        pages.insert(
            "Manual".to_string(),
            vec![
                revision("2020", "first draft"),
                revision("2021", "STUCK markup"),
                revision("2022", "final draft"),
            ],
        );
        let mut source = FakeSource::new(pages);
        let mut store = MemoryStore::default();
        let engine = RecordingEngine::new();

        let report =
            migrate_all(&mut source, &mut store, &engine, "en", None, &options()).expect("run");

        assert!(report.success);
        assert_eq!(report.pages_migrated, 1);
        assert_eq!(report.revisions_converted, 2);
        assert_eq!(report.revisions_skipped, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].page_path, "Manual");
        assert_eq!(report.failures[0].timestamp, "2021");
        assert_eq!(store.content("Manual"), Some("final draft"));
        assert_eq!(report.pages[0].detail.as_deref(), Some("2 of 3 revisions"));
        // Two clean conversions plus the full budget for the stuck one:
        // the original attempt, the repaired attempt, and the blind retries.
        assert_eq!(engine.invocations(), 2 + 2 + convert::MAX_BLIND_RETRIES);
    }

    #[test]
    fn page_with_no_convertible_revision_is_failed() {
        let mut pages = BTreeMap::new();
        pages.insert("Broken".to_string(), vec![revision("2020", "STUCK")]);
        let mut source = FakeSource::new(pages);
        let mut store = MemoryStore::default();
        let engine = RecordingEngine::new();

        let report =
            migrate_all(&mut source, &mut store, &engine, "en", None, &options()).expect("run");

        assert!(report.success);
        assert_eq!(report.pages_migrated, 0);
        assert_eq!(report.pages_failed, 1);
        assert_eq!(report.pages[0].action, "failed");
        assert_eq!(store.content("Broken"), None);
    }

    #[test]
    fn fetch_errors_fail_only_the_affected_page() {
        let mut pages = BTreeMap::new();
        pages.insert("Good".to_string(), vec![revision("2020", "text")]);
        pages.insert("Refused".to_string(), vec![revision("2020", "text")]);
        let mut source = FakeSource::new(pages);
        source.failing.insert("Refused".to_string());
        let mut store = MemoryStore::default();
        let engine = RecordingEngine::new();

        let report =
            migrate_all(&mut source, &mut store, &engine, "en", None, &options()).expect("run");

        assert!(!report.success);
        assert_eq!(report.pages_migrated, 1);
        assert_eq!(report.pages_failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("Refused:"));
        assert_eq!(store.content("Good"), Some("text"));
    }

    #[test]
    fn dry_run_plans_without_converting_or_writing() {
        let mut pages = BTreeMap::new();
        pages.insert("Company".to_string(), vec![revision("2021", "text")]);
        pages.insert("Customers:DA".to_string(), vec![revision("2021", "text")]);
        let mut source = FakeSource::new(pages);
        let mut store = MemoryStore::default();
        let engine = RecordingEngine::new();
        let options = MigrateOptions {
            dry_run: true,
            limit: None,
        };

        let report =
            migrate_all(&mut source, &mut store, &engine, "en", None, &options).expect("run");

        assert!(report.success);
        assert!(report.dry_run);
        assert_eq!(report.pages_total, 2);
        assert_eq!(report.pages.len(), 2);
        assert!(report.pages.iter().all(|page| page.action == "planned"));
        assert_eq!(engine.invocations(), 0);
        assert_eq!(store.request_count(), 0);
        // Only the title listing hit the source.
        assert_eq!(source.request_count(), 1);
    }

    #[test]
    fn limit_caps_the_number_of_pages() {
        let mut pages = BTreeMap::new();
        for name in ["Alpha", "Beta", "Gamma"] {
            pages.insert(name.to_string(), vec![revision("2021", "text")]);
        }
        let mut source = FakeSource::new(pages);
        let mut store = MemoryStore::default();
        let engine = RecordingEngine::new();
        let options = MigrateOptions {
            dry_run: false,
            limit: Some(2),
        };

        let report =
            migrate_all(&mut source, &mut store, &engine, "en", None, &options).expect("run");

        assert_eq!(report.pages_total, 2);
        assert_eq!(report.pages_migrated, 2);
        assert_eq!(store.content("Alpha"), Some("text"));
        assert_eq!(store.content("Beta"), Some("text"));
        assert_eq!(store.content("Gamma"), None);
    }

    #[test]
    fn ledger_records_pages_and_failures() {
        let temp = tempdir().expect("tempdir");
        let connection = ledger::open_ledger(&temp.path().join("ledger.db")).expect("ledger");

        let mut pages = BTreeMap::new();
        pages.insert(
            "Manual".to_string(),
            vec![revision("2020", "good text"), revision("2021", "STUCK")],
        );
        let mut source = FakeSource::new(pages);
        let mut store = MemoryStore::default();
        let engine = RecordingEngine::new();

        let report = migrate_all(
            &mut source,
            &mut store,
            &engine,
            "en",
            Some(&connection),
            &options(),
        )
        .expect("run");

        assert!(report.success);
        assert_eq!(ledger::page_count(&connection).expect("count"), 1);
        assert_eq!(ledger::failure_count(&connection).expect("count"), 1);
        let failures = ledger::recent_failures(&connection, 10).expect("failures");
        assert_eq!(failures[0].page_path, "Manual");
        assert_eq!(failures[0].timestamp, "2021");
        assert!(
            ledger::get_ledger_config(&connection, LAST_MIGRATE_KEY)
                .expect("config")
                .is_some()
        );
    }

    #[test]
    fn engine_launch_failure_aborts_the_run() {
        struct BrokenEngine;
        impl ConvertEngine for BrokenEngine {
            fn invoke(&self, _source: &str) -> Result<ConversionResult> {
                bail!("failed to launch conversion engine `missing`");
            }
        }

        let mut pages = BTreeMap::new();
        pages.insert("Company".to_string(), vec![revision("2021", "text")]);
        let mut source = FakeSource::new(pages);
        let mut store = MemoryStore::default();

        let error = migrate_all(&mut source, &mut store, &BrokenEngine, "en", None, &options())
            .expect_err("launch failures abort");
        assert!(format!("{error:#}").contains("failed to launch"));
    }
}
