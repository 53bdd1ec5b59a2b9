use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MostVisitedUrl {
    pub url: String,
    pub title: String,
    pub score: f64,
}

impl MostVisitedUrl {
    pub fn new(url: impl Into<String>, title: impl Into<String>, score: f64) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MostVisitedUrlWithRank {
    pub url: MostVisitedUrl,
    pub rank: usize,
}

/// Difference between two ranked lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopSitesDelta {
    pub added: Vec<MostVisitedUrlWithRank>,
    pub moved: Vec<MostVisitedUrlWithRank>,
    pub deleted: Vec<MostVisitedUrlWithRank>,
}

impl TopSitesDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.moved.is_empty() && self.deleted.is_empty()
    }
}

/// Canonical form of a URL. Unparseable input is kept as trimmed text.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    url::Url::parse(trimmed)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| trimmed.to_string())
}
