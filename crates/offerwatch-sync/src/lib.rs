//! Run coordination: query every source, dedupe against the dated store,
//! persist the delta.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use offerwatch_adapters::{source_for_id, RecordSource, JUSTJOIN_SOURCE_ID};
use offerwatch_core::{Offer, SearchQuery};
use offerwatch_storage::{
    append_offers, dedupe, ensure_offer_columns, read_offers, write_offers, HttpClientConfig,
    HttpFetcher, RecordStore, StoreError, StoreReadError,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "offerwatch-sync";

/// Keywords, location and sources for a run, usually read from `search.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub keywords: Vec<String>,
    pub location: String,
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub listing_url: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_sources() -> Vec<SourceConfig> {
    vec![SourceConfig {
        source_id: JUSTJOIN_SOURCE_ID.to_string(),
        enabled: true,
        listing_url: None,
    }]
}

impl SearchConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing search config")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn query(&self) -> SearchQuery {
        SearchQuery::new(self.keywords.iter().cloned(), self.location.clone())
    }
}

/// How new offers reach the dated store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Existing rows are kept and new offers follow them.
    #[default]
    Append,
    /// The file is replaced by the new offers of this run only.
    Overwrite,
}

impl FromStr for WriteMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "overwrite" => Ok(Self::Overwrite),
            other => anyhow::bail!("unknown write mode `{other}` (expected append or overwrite)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub search_config_path: PathBuf,
    pub offers_dir: PathBuf,
    pub write_mode: WriteMode,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            search_config_path: std::env::var("OFFERWATCH_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./search.yaml")),
            offers_dir: std::env::var("OFFERS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            write_mode: std::env::var("OFFERWATCH_WRITE_MODE")
                .ok()
                .and_then(|v| match v.parse::<WriteMode>() {
                    Ok(mode) => Some(mode),
                    Err(err) => {
                        warn!(error = %err, "ignoring OFFERWATCH_WRITE_MODE");
                        None
                    }
                })
                .unwrap_or_default(),
            user_agent: std::env::var("OFFERWATCH_USER_AGENT")
                .unwrap_or_else(|_| "offerwatch-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("OFFERWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Result of asking one source for offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Fetched { source_id: String, offers: usize },
    Failed { source_id: String, error: String },
}

impl SourceOutcome {
    pub fn source_id(&self) -> &str {
        match self {
            Self::Fetched { source_id, .. } | Self::Failed { source_id, .. } => source_id,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store_path: PathBuf,
    pub write_mode: WriteMode,
    pub sources: Vec<SourceOutcome>,
    pub candidates: usize,
    pub new_offers: usize,
    pub written: bool,
}

impl RunSummary {
    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.is_failed()).count()
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("dedup stage failed for {}", path.display())]
    Dedup {
        path: PathBuf,
        #[source]
        source: StoreReadError,
    },
    #[error(
        "write stage failed for {} ({} new offers not persisted)",
        path.display(),
        new_offers.len()
    )]
    Write {
        path: PathBuf,
        new_offers: Vec<Offer>,
        #[source]
        source: StoreError,
    },
}

impl RunError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Dedup { .. } => "dedup",
            Self::Write { .. } => "write",
        }
    }
}

pub struct RunCoordinator {
    query: SearchQuery,
    store: RecordStore,
    write_mode: WriteMode,
    http: HttpFetcher,
    sources: Vec<Box<dyn RecordSource>>,
}

impl RunCoordinator {
    pub fn new(
        query: SearchQuery,
        store: RecordStore,
        http: HttpFetcher,
        sources: Vec<Box<dyn RecordSource>>,
    ) -> Self {
        Self {
            query,
            store,
            write_mode: WriteMode::default(),
            http,
            sources,
        }
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn from_config(config: &SyncConfig, search: &SearchConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;

        let mut sources = Vec::new();
        for source in search.sources.iter().filter(|s| s.enabled) {
            let adapter = source_for_id(&source.source_id, source.listing_url.as_deref())
                .with_context(|| format!("configuring source {}", source.source_id))?
                .with_context(|| format!("no source registered for {}", source.source_id))?;
            sources.push(adapter);
        }

        Ok(Self::new(
            search.query(),
            RecordStore::new(config.offers_dir.clone()),
            http,
            sources,
        )
        .with_write_mode(config.write_mode))
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Query every source in order. A failing source is logged and recorded,
    /// never propagated.
    pub async fn collect(&self) -> (Vec<Offer>, Vec<SourceOutcome>) {
        let mut combined = Vec::new();
        let mut outcomes = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            let source_id = source.source_id().to_string();
            match source.fetch_offers(&self.http, &self.query).await {
                Ok(offers) => {
                    info!(source_id = %source_id, offers = offers.len(), "source fetched");
                    outcomes.push(SourceOutcome::Fetched {
                        source_id,
                        offers: offers.len(),
                    });
                    combined.extend(offers);
                }
                Err(err) => {
                    warn!(source_id = %source_id, error = %err, "source failed; continuing");
                    outcomes.push(SourceOutcome::Failed {
                        source_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        (combined, outcomes)
    }

    pub async fn run_once(&self, run_date: NaiveDate) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let store_path = self.store.path_for(run_date);

        let (candidates, sources) = self.collect().await;
        let candidate_count = candidates.len();

        let dedup_failed = |source: StoreReadError| RunError::Dedup {
            path: store_path.clone(),
            source,
        };
        // Appending rewrites the existing rows, so they must be readable as offers.
        if self.write_mode == WriteMode::Append {
            ensure_offer_columns(&store_path).map_err(dedup_failed)?;
        }
        let new_offers = dedupe(candidates, &store_path).map_err(dedup_failed)?;
        let new_count = new_offers.len();

        let written = if new_offers.is_empty() {
            info!(%run_id, path = %store_path.display(), "no new offers");
            false
        } else {
            if let Err(source) = self.persist(&new_offers, &store_path) {
                return Err(RunError::Write {
                    path: store_path,
                    new_offers,
                    source,
                });
            }
            true
        };

        info!(
            %run_id,
            candidates = candidate_count,
            new_offers = new_count,
            written,
            path = %store_path.display(),
            "run complete"
        );

        Ok(RunSummary {
            run_id,
            run_date,
            started_at,
            finished_at: Utc::now(),
            store_path,
            write_mode: self.write_mode,
            sources,
            candidates: candidate_count,
            new_offers: new_count,
            written,
        })
    }

    fn persist(&self, new_offers: &[Offer], store_path: &Path) -> Result<(), StoreError> {
        match self.write_mode {
            WriteMode::Append => append_offers(new_offers, store_path).map(|_| ()),
            WriteMode::Overwrite => write_offers(new_offers, store_path).map_err(StoreError::from),
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let search = SearchConfig::load(&config.search_config_path).await?;
    let coordinator = RunCoordinator::from_config(&config, &search)?;
    let summary = coordinator.run_once(Local::now().date_naive()).await?;
    Ok(summary)
}

/// Markdown overview of the newest `days` store files under `offers_dir`.
pub fn report_store_markdown(days: usize, offers_dir: Option<PathBuf>) -> Result<String> {
    let root = offers_dir.unwrap_or_else(|| PathBuf::from("."));
    let store = RecordStore::new(root);
    let files = store.list_store_files()?;

    let mut lines = vec!["# Offer Store Report".to_string(), String::new()];
    if files.is_empty() {
        lines.push(format!("No store files under `{}`.", store.root().display()));
        lines.push(String::new());
    }

    for file in files.into_iter().take(days) {
        lines.push(format!("## {}", file.date));
        lines.push(format!("- file: `{}`", file.path.display()));
        match read_offers(&file.path) {
            Ok(offers) => {
                let companies = offers
                    .iter()
                    .map(|o| o.company.as_str())
                    .collect::<std::collections::BTreeSet<_>>();
                lines.push(format!("- offers: {}", offers.len()));
                lines.push(format!("- companies: {}", companies.len()));
            }
            Err(err) => lines.push(format!("- unreadable: {err}")),
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use offerwatch_adapters::SourceError;
    use tempfile::tempdir;

    struct StaticSource {
        id: &'static str,
        offers: Vec<Offer>,
    }

    #[async_trait]
    impl RecordSource for StaticSource {
        fn source_id(&self) -> &str {
            self.id
        }

        async fn fetch_offers(
            &self,
            _http: &HttpFetcher,
            query: &SearchQuery,
        ) -> Result<Vec<Offer>, SourceError> {
            Ok(self
                .offers
                .iter()
                .filter(|o| query.matches_title(&o.title))
                .cloned()
                .collect())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl RecordSource for FailingSource {
        fn source_id(&self) -> &str {
            "broken"
        }

        async fn fetch_offers(
            &self,
            _http: &HttpFetcher,
            _query: &SearchQuery,
        ) -> Result<Vec<Offer>, SourceError> {
            Err(SourceError::Message("listing page changed".into()))
        }
    }

    fn offer(url: &str) -> Offer {
        Offer::new("Python Developer", "Acme", "Remote", url)
    }

    fn static_source(urls: &[&str]) -> Box<dyn RecordSource> {
        Box::new(StaticSource {
            id: "static",
            offers: urls.iter().map(|u| offer(u)).collect(),
        })
    }

    fn failing_source() -> Box<dyn RecordSource> {
        Box::new(FailingSource)
    }

    fn coordinator(root: &Path, sources: Vec<Box<dyn RecordSource>>) -> RunCoordinator {
        RunCoordinator::new(
            SearchQuery::new(["python"], "Remote"),
            RecordStore::new(root),
            HttpFetcher::new(HttpClientConfig::default()).expect("http client"),
            sources,
        )
    }

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).expect("date")
    }

    fn stored_urls(path: &Path) -> Vec<String> {
        read_offers(path)
            .expect("read store")
            .into_iter()
            .map(|o| o.url)
            .collect()
    }

    #[tokio::test]
    async fn failing_source_does_not_abort_run() {
        let dir = tempdir().expect("tempdir");
        let coordinator = coordinator(
            dir.path(),
            vec![failing_source(), static_source(&["https://a/1", "https://a/2"])],
        );

        let summary = coordinator.run_once(run_date()).await.expect("run");
        assert_eq!(summary.failed_sources(), 1);
        assert_eq!(
            summary.sources,
            vec![
                SourceOutcome::Failed {
                    source_id: "broken".into(),
                    error: "listing page changed".into(),
                },
                SourceOutcome::Fetched {
                    source_id: "static".into(),
                    offers: 2,
                },
            ]
        );
        assert_eq!(summary.new_offers, 2);
        assert!(summary.written);
        assert_eq!(summary.store_path, dir.path().join("offers_2024-06-01.csv"));
        assert_eq!(stored_urls(&summary.store_path), vec!["https://a/1", "https://a/2"]);
    }

    #[tokio::test]
    async fn append_mode_accumulates_runs_on_the_same_day() {
        let dir = tempdir().expect("tempdir");
        let first = coordinator(dir.path(), vec![static_source(&["a", "b"])]);
        first.run_once(run_date()).await.expect("first run");

        let second = coordinator(dir.path(), vec![static_source(&["b", "c"])]);
        let summary = second.run_once(run_date()).await.expect("second run");

        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.new_offers, 1);
        assert_eq!(stored_urls(&summary.store_path), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn overwrite_mode_keeps_only_the_latest_delta() {
        let dir = tempdir().expect("tempdir");
        coordinator(dir.path(), vec![static_source(&["a", "b"])])
            .with_write_mode(WriteMode::Overwrite)
            .run_once(run_date())
            .await
            .expect("first run");

        let summary = coordinator(dir.path(), vec![static_source(&["b", "c"])])
            .with_write_mode(WriteMode::Overwrite)
            .run_once(run_date())
            .await
            .expect("second run");

        assert_eq!(summary.write_mode, WriteMode::Overwrite);
        assert_eq!(stored_urls(&summary.store_path), vec!["c"]);
    }

    #[tokio::test]
    async fn empty_delta_skips_the_write() {
        let dir = tempdir().expect("tempdir");
        let coordinator = coordinator(dir.path(), vec![static_source(&["a"])]);
        let first = coordinator.run_once(run_date()).await.expect("first run");
        let before = std::fs::read(&first.store_path).expect("read");

        let second = coordinator.run_once(run_date()).await.expect("second run");
        assert_eq!(second.new_offers, 0);
        assert!(!second.written);
        assert_eq!(std::fs::read(&second.store_path).expect("read"), before);
    }

    #[tokio::test]
    async fn no_candidates_creates_no_store_file() {
        let dir = tempdir().expect("tempdir");
        let summary = coordinator(dir.path(), vec![failing_source()])
            .run_once(run_date())
            .await
            .expect("run");

        assert!(!summary.written);
        assert!(!summary.store_path.exists());
    }

    #[tokio::test]
    async fn corrupt_store_stops_at_dedup_stage() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("offers_2024-06-01.csv");
        std::fs::write(&path, "title,link\nDev,https://a\n").expect("seed");

        let err = coordinator(dir.path(), vec![static_source(&["x"])])
            .run_once(run_date())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "dedup");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "title,link\nDev,https://a\n"
        );
    }

    #[tokio::test]
    async fn url_only_store_stops_append_run_at_dedup_stage() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("offers_2024-06-01.csv");
        std::fs::write(&path, "url\nhttps://a\n").expect("seed");

        let err = coordinator(dir.path(), vec![static_source(&["https://a", "https://b"])])
            .run_once(run_date())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "dedup");
        assert!(matches!(
            err,
            RunError::Dedup {
                source: StoreReadError::MissingColumn { column: "title", .. },
                ..
            }
        ));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "url\nhttps://a\n");
    }

    #[tokio::test]
    async fn url_only_store_is_replaced_in_overwrite_mode() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("offers_2024-06-01.csv");
        std::fs::write(&path, "url\nhttps://a\n").expect("seed");

        let summary = coordinator(dir.path(), vec![static_source(&["https://a", "https://b"])])
            .with_write_mode(WriteMode::Overwrite)
            .run_once(run_date())
            .await
            .expect("run");

        assert_eq!(summary.new_offers, 1);
        assert_eq!(stored_urls(&path), vec!["https://b"]);
    }

    #[test]
    fn search_config_defaults_to_justjoin() {
        let config = SearchConfig::from_yaml_str("keywords: [python, Django]\nlocation: Remote\n")
            .expect("parse");
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].source_id, JUSTJOIN_SOURCE_ID);
        assert_eq!(config.query(), SearchQuery::new(["python", "Django"], "Remote"));
    }

    #[test]
    fn disabled_and_unknown_sources() {
        let config = SearchConfig::from_yaml_str(
            "keywords: [rust]\nlocation: Remote\nsources:\n  - source_id: justjoin\n    enabled: false\n  - source_id: nofluff\n",
        )
        .expect("parse");
        let sync = SyncConfig {
            search_config_path: PathBuf::from("search.yaml"),
            offers_dir: PathBuf::from("."),
            write_mode: WriteMode::Append,
            user_agent: "test".into(),
            http_timeout_secs: 1,
        };

        let err = RunCoordinator::from_config(&sync, &config).err().expect("unknown source");
        assert!(err.to_string().contains("no source registered for nofluff"));
    }

    #[test]
    fn write_mode_parses_known_values() {
        assert_eq!("Append".parse::<WriteMode>().unwrap(), WriteMode::Append);
        assert_eq!(" overwrite ".parse::<WriteMode>().unwrap(), WriteMode::Overwrite);
        assert!("merge".parse::<WriteMode>().is_err());
    }

    #[test]
    fn report_lists_newest_store_first() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        let older = NaiveDate::from_ymd_opt(2024, 5, 31).expect("date");
        write_offers(&[offer("a")], &store.path_for(older)).expect("older");
        write_offers(&[offer("b"), offer("c")], &store.path_for(run_date())).expect("newer");

        let report = report_store_markdown(1, Some(dir.path().to_path_buf())).expect("report");
        assert!(report.contains("## 2024-06-01"));
        assert!(report.contains("- offers: 2"));
        assert!(!report.contains("2024-05-31"));
    }

    #[test]
    fn report_with_zero_days_lists_no_files() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        write_offers(&[offer("a")], &store.path_for(run_date())).expect("seed");

        let report = report_store_markdown(0, Some(dir.path().to_path_buf())).expect("report");
        assert!(report.starts_with("# Offer Store Report"));
        assert!(!report.contains("## "));
    }
}
