//! Core domain model for offerwatch.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "offerwatch-core";

/// Company value used when a source cannot determine the employer.
pub const UNKNOWN_COMPANY: &str = "Unknown";

/// Column names of a record store, in serialization order.
pub const OFFER_FIELDS: [&str; 4] = ["title", "company", "location", "url"];

/// One job listing. `url` is the identity key: two offers with the same url
/// are the same offer whatever their other fields say.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offer {
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
}

impl Offer {
    pub fn new(
        title: impl Into<String>,
        company: impl Into<String>,
        location: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            company: company.into(),
            location: location.into(),
            url: url.into(),
        }
    }

    /// Offers without a url can never match a stored key.
    pub fn has_key(&self) -> bool {
        !self.url.is_empty()
    }
}

/// Keyword + location filter handed to every record source for one run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub keywords: Vec<String>,
    pub location: String,
}

impl SearchQuery {
    pub fn new<I, S>(keywords: I, location: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords.into_iter().map(Into::into).collect(),
            location: location.into(),
        }
    }

    /// True when any keyword is a case-insensitive substring of `title`.
    pub fn matches_title(&self, title: &str) -> bool {
        let title = title.to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| title.contains(&keyword.to_lowercase()))
    }

    pub fn matches_location(&self, text: &str) -> bool {
        text.to_lowercase().contains(&self.location.to_lowercase())
    }
}
