use serde::Deserialize;

use crate::{payload::Scheme, transport::Route};

/// The two feeder variants.
///
/// A feed fixes how envelope bodies are decoded and which endpoint the
/// resulting items are forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feed {
    /// Crawl seeds: structured edge lists forwarded to `/v1/crawl/`.
    #[default]
    Crawl,
    /// Crawled URLs: raw identifiers forwarded to `/v1/url/`.
    Url,
}

impl Feed {
    pub fn default_queue(&self) -> &'static str {
        match self {
            Feed::Crawl => "crawler",
            Feed::Url => "crawled_urls",
        }
    }

    pub fn scheme(&self) -> Scheme {
        match self {
            Feed::Crawl => Scheme::Structured,
            Feed::Url => Scheme::Raw,
        }
    }

    pub fn route(&self) -> Route {
        match self {
            Feed::Crawl => Route::Crawl,
            Feed::Url => Route::Url,
        }
    }
}
