//! Record source contract + the justjoin listing source.

use async_trait::async_trait;
use offerwatch_core::{Offer, SearchQuery, UNKNOWN_COMPANY};
use offerwatch_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

pub const CRATE_NAME: &str = "offerwatch-adapters";

pub const JUSTJOIN_SOURCE_ID: &str = "justjoin";
pub const JUSTJOIN_LISTING_URL: &str = "https://justjoin.it/all/python";
pub const JUSTJOIN_BASE_URL: &str = "https://justjoin.it";

/// Offer card anchors on the justjoin listing page.
const JUSTJOIN_OFFER_SELECTOR: &str = "a.css-4lqp8g";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Producer of candidate offers for one site.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_offers(
        &self,
        http: &HttpFetcher,
        query: &SearchQuery,
    ) -> Result<Vec<Offer>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct JustJoinSource {
    listing_url: String,
    base_url: String,
}

impl JustJoinSource {
    pub fn new(listing_url: impl Into<String>, base_url: &str) -> Result<Self, SourceError> {
        parse_base_url(base_url)?;
        Ok(Self {
            listing_url: listing_url.into(),
            base_url: base_url.to_string(),
        })
    }

    pub fn listing_url(&self) -> &str {
        &self.listing_url
    }

    /// Extract the offers on a listing page that pass the keyword and
    /// location filters.
    pub fn parse_listing(&self, html: &str, query: &SearchQuery) -> Result<Vec<Offer>, SourceError> {
        let selector = Selector::parse(JUSTJOIN_OFFER_SELECTOR)
            .map_err(|e| SourceError::Message(e.to_string()))?;
        let base_url = parse_base_url(&self.base_url)?;
        let document = Html::parse_document(html);

        let mut offers = Vec::new();
        for anchor in document.select(&selector) {
            let element = anchor.value();
            let title = element.attr("title").unwrap_or_default();
            if !query.matches_title(title) {
                continue;
            }
            let text = anchor.text().collect::<String>();
            if !query.matches_location(&text) {
                continue;
            }

            let Some(href) = element.attr("href") else {
                warn!(source_id = JUSTJOIN_SOURCE_ID, title, "offer anchor without href skipped");
                continue;
            };
            let url = match base_url.join(href) {
                Ok(url) => url,
                Err(err) => {
                    warn!(source_id = JUSTJOIN_SOURCE_ID, href, error = %err, "unresolvable offer href skipped");
                    continue;
                }
            };

            offers.push(Offer {
                title: title.trim().to_string(),
                company: element
                    .attr("data-company")
                    .unwrap_or(UNKNOWN_COMPANY)
                    .to_string(),
                location: query.location.clone(),
                url: url.to_string(),
            });
        }
        Ok(offers)
    }
}

fn parse_base_url(base_url: &str) -> Result<Url, SourceError> {
    Url::parse(base_url)
        .map_err(|e| SourceError::Message(format!("invalid base url {base_url}: {e}")))
}

impl Default for JustJoinSource {
    fn default() -> Self {
        Self {
            listing_url: JUSTJOIN_LISTING_URL.to_string(),
            base_url: JUSTJOIN_BASE_URL.to_string(),
        }
    }
}

#[async_trait]
impl RecordSource for JustJoinSource {
    fn source_id(&self) -> &str {
        JUSTJOIN_SOURCE_ID
    }

    async fn fetch_offers(
        &self,
        http: &HttpFetcher,
        query: &SearchQuery,
    ) -> Result<Vec<Offer>, SourceError> {
        let page = http.fetch_text(JUSTJOIN_SOURCE_ID, &self.listing_url).await?;
        let offers = self.parse_listing(&page.body, query)?;
        info!(
            source_id = JUSTJOIN_SOURCE_ID,
            url = %page.final_url,
            offers = offers.len(),
            "parsed listing"
        );
        Ok(offers)
    }
}

/// Look up a source by id, optionally pointing it at another listing url.
pub fn source_for_id(
    source_id: &str,
    listing_url: Option<&str>,
) -> Result<Option<Box<dyn RecordSource>>, SourceError> {
    match source_id {
        JUSTJOIN_SOURCE_ID => {
            let source = match listing_url {
                Some(url) => JustJoinSource::new(url, JUSTJOIN_BASE_URL)?,
                None => JustJoinSource::default(),
            };
            Ok(Some(Box::new(source)))
        }
        _ => Ok(None),
    }
}
