//! Dated CSV record store, URL deduplication and HTTP fetch utilities.
//!
//! The store functions are synchronous and hold no lock. Callers must
//! serialize access per store path: two runs that read and then rewrite the
//! same file concurrently can lose rows.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use offerwatch_core::{Offer, OFFER_FIELDS};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "offerwatch-storage";

const STORE_PREFIX: &str = "offers_";
const STORE_EXTENSION: &str = "csv";

#[derive(Debug, Error)]
pub enum StoreReadError {
    #[error("reading store {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing store {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("store {} has no `{column}` column", path.display())]
    MissingColumn { path: PathBuf, column: &'static str },
}

#[derive(Debug, Error)]
pub enum StoreWriteError {
    #[error("store path {} has no file name", path.display())]
    InvalidPath { path: PathBuf },
    #[error("writing store {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing offers into {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Read(#[from] StoreReadError),
    #[error(transparent)]
    Write(#[from] StoreWriteError),
}

/// A store file discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFile {
    pub date: NaiveDate,
    pub path: PathBuf,
}

/// Directory holding one `offers_<date>.csv` file per run date.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_file_name(date: NaiveDate) -> String {
        format!("{STORE_PREFIX}{}.{STORE_EXTENSION}", date.format("%Y-%m-%d"))
    }

    pub fn parse_store_file_name(name: &str) -> Option<NaiveDate> {
        let stem = name
            .strip_prefix(STORE_PREFIX)?
            .strip_suffix(STORE_EXTENSION)?
            .strip_suffix('.')?;
        NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.root.join(Self::store_file_name(date))
    }

    /// Store files under the root, newest date first.
    pub fn list_store_files(&self) -> anyhow::Result<Vec<StoreFile>> {
        let mut files = fs::read_dir(&self.root)
            .with_context(|| format!("reading {}", self.root.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name();
                Self::parse_store_file_name(&name.to_string_lossy()).map(|date| StoreFile {
                    date,
                    path: entry.path(),
                })
            })
            .collect::<Vec<_>>();
        files.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(files)
    }
}

fn store_exists(store_path: &Path) -> Result<bool, StoreReadError> {
    store_path.try_exists().map_err(|source| StoreReadError::Io {
        path: store_path.to_path_buf(),
        source,
    })
}

fn open_reader(store_path: &Path) -> Result<(csv::Reader<File>, csv::StringRecord), StoreReadError> {
    let file = File::open(store_path).map_err(|source| StoreReadError::Io {
        path: store_path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::Reader::from_reader(file);
    let headers = reader
        .headers()
        .map_err(|source| StoreReadError::Csv {
            path: store_path.to_path_buf(),
            source,
        })?
        .clone();
    Ok((reader, headers))
}

/// Every non-empty `url` value in the store, or `None` when the file is absent.
///
/// Only the `url` column is required; other columns are not inspected.
pub fn known_urls(store_path: &Path) -> Result<Option<HashSet<String>>, StoreReadError> {
    if !store_exists(store_path)? {
        return Ok(None);
    }

    let (mut reader, headers) = open_reader(store_path)?;
    let url_index = headers
        .iter()
        .position(|h| h == "url")
        .ok_or_else(|| StoreReadError::MissingColumn {
            path: store_path.to_path_buf(),
            column: "url",
        })?;

    let mut urls = HashSet::new();
    for record in reader.records() {
        let record = record.map_err(|source| StoreReadError::Csv {
            path: store_path.to_path_buf(),
            source,
        })?;
        if let Some(url) = record.get(url_index).filter(|url| !url.is_empty()) {
            urls.insert(url.to_string());
        }
    }

    debug!(path = %store_path.display(), known = urls.len(), "loaded store keys");
    Ok(Some(urls))
}

/// Candidates whose url is not already in the store, in their original order.
///
/// Duplicates inside `candidates` are kept. A candidate with an empty url
/// never matches a stored key.
pub fn dedupe(candidates: Vec<Offer>, store_path: &Path) -> Result<Vec<Offer>, StoreReadError> {
    let Some(known) = known_urls(store_path)? else {
        return Ok(candidates);
    };

    let before = candidates.len();
    let fresh = candidates
        .into_iter()
        .filter(|offer| !offer.has_key() || !known.contains(&offer.url))
        .collect::<Vec<_>>();
    debug!(
        path = %store_path.display(),
        candidates = before,
        fresh = fresh.len(),
        "deduplicated against store"
    );
    Ok(fresh)
}

fn require_offer_columns(
    store_path: &Path,
    headers: &csv::StringRecord,
) -> Result<(), StoreReadError> {
    match OFFER_FIELDS
        .iter()
        .copied()
        .find(|field| !headers.iter().any(|h| h == *field))
    {
        Some(column) => Err(StoreReadError::MissingColumn {
            path: store_path.to_path_buf(),
            column,
        }),
        None => Ok(()),
    }
}

/// Check that an existing store carries every offer column, so its rows can
/// be read back and rewritten. An absent store passes.
pub fn ensure_offer_columns(store_path: &Path) -> Result<(), StoreReadError> {
    if !store_exists(store_path)? {
        return Ok(());
    }
    let (_, headers) = open_reader(store_path)?;
    require_offer_columns(store_path, &headers)
}

/// Read every row of a store file back into offers. Columns may come in any
/// order; columns beyond the offer fields are ignored.
pub fn read_offers(store_path: &Path) -> Result<Vec<Offer>, StoreReadError> {
    let (mut reader, headers) = open_reader(store_path)?;
    require_offer_columns(store_path, &headers)?;

    reader
        .deserialize::<Offer>()
        .map(|row| {
            row.map_err(|source| StoreReadError::Csv {
                path: store_path.to_path_buf(),
                source,
            })
        })
        .collect()
}

fn count_rows(store_path: &Path) -> Result<usize, StoreReadError> {
    let (mut reader, _) = open_reader(store_path)?;
    let mut rows = 0;
    for record in reader.records() {
        record.map_err(|source| StoreReadError::Csv {
            path: store_path.to_path_buf(),
            source,
        })?;
        rows += 1;
    }
    Ok(rows)
}

/// Replace the store file with exactly `offers`.
///
/// An empty batch leaves the file system untouched. Rows are written to a
/// temp file beside the target and renamed into place, so a failed write
/// never leaves a half-written store.
pub fn write_offers(offers: &[Offer], store_path: &Path) -> Result<(), StoreWriteError> {
    if offers.is_empty() {
        debug!(path = %store_path.display(), "no offers to write");
        return Ok(());
    }

    let file_name = store_path
        .file_name()
        .ok_or_else(|| StoreWriteError::InvalidPath {
            path: store_path.to_path_buf(),
        })?
        .to_string_lossy()
        .into_owned();
    let parent = match store_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|source| StoreWriteError::Io {
        path: parent.clone(),
        source,
    })?;

    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
    let result = write_temp_file(offers, &temp_path).and_then(|()| {
        fs::rename(&temp_path, store_path).map_err(|source| StoreWriteError::Io {
            path: store_path.to_path_buf(),
            source,
        })
    });

    match result {
        Ok(()) => {
            debug!(path = %store_path.display(), rows = offers.len(), "wrote store");
            Ok(())
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path);
            Err(err)
        }
    }
}

fn write_temp_file(offers: &[Offer], temp_path: &Path) -> Result<(), StoreWriteError> {
    let io_err = |source: std::io::Error| StoreWriteError::Io {
        path: temp_path.to_path_buf(),
        source,
    };

    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .map_err(io_err)?;
    let mut writer = csv::Writer::from_writer(&file);
    for offer in offers {
        writer.serialize(offer).map_err(|source| StoreWriteError::Csv {
            path: temp_path.to_path_buf(),
            source,
        })?;
    }
    writer.flush().map_err(io_err)?;
    drop(writer);
    file.sync_all().map_err(io_err)?;
    Ok(())
}

/// Keep the existing rows and add `offers` after them. Returns the row count
/// of the store afterwards.
///
/// An empty batch only counts the existing rows and does not require the
/// offer columns.
pub fn append_offers(offers: &[Offer], store_path: &Path) -> Result<usize, StoreError> {
    let exists = store_exists(store_path)?;
    if offers.is_empty() {
        return Ok(if exists { count_rows(store_path)? } else { 0 });
    }

    let mut rows = if exists {
        read_offers(store_path)?
    } else {
        Vec::new()
    };
    rows.extend_from_slice(offers);
    write_offers(&rows, store_path)?;
    Ok(rows.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` as text, retrying transient failures per the backoff policy.
    pub async fn fetch_text(
        &self,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.fetch_with_retry(url)
            .instrument(info_span!("http_fetch", source_id, url))
            .await
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
