use crate::history::types::normalize_url;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use url::{Url, form_urlencoded};

pub const SEARCH_TERMS_PLACEHOLDER: &str = "{searchTerms}";
const TEMPLATE_MARKER: &str = "historyrankermarker";

/// The default search engine: the keyword id its terms are stored under and
/// a URL template that turns a term back into a results page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchProvider {
    pub keyword_id: i64,
    pub name: String,
    pub url_template: String,
}

impl Default for SearchProvider {
    fn default() -> Self {
        Self {
            keyword_id: 1,
            name: "Google".to_string(),
            url_template: "https://www.google.com/search?q={searchTerms}".to_string(),
        }
    }
}

impl SearchProvider {
    pub fn validate_template(template: &str) -> Result<()> {
        if !template.contains(SEARCH_TERMS_PLACEHOLDER) {
            bail!("search URL template must contain {SEARCH_TERMS_PLACEHOLDER}");
        }
        Url::parse(&template.replace(SEARCH_TERMS_PLACEHOLDER, TEMPLATE_MARKER))
            .with_context(|| format!("Invalid search URL template: {template}"))?;
        Ok(())
    }

    /// Results page URL for `term`.
    pub fn search_url(&self, term: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(term.as_bytes()).collect();
        normalize_url(&self.url_template.replace(SEARCH_TERMS_PLACEHOLDER, &encoded))
    }

    pub fn is_search_results_page(&self, url: &str) -> bool {
        match (self.template_url(), Url::parse(url)) {
            (Some(template), Ok(url)) => same_page(&template, &url),
            _ => false,
        }
    }

    /// The search terms carried by `url` when it is a results page of this
    /// provider.
    pub fn extract_search_terms(&self, url: &str) -> Option<String> {
        let template = self.template_url()?;
        let url = Url::parse(url).ok()?;
        if !same_page(&template, &url) {
            return None;
        }

        let key = template
            .query_pairs()
            .find(|(_, value)| value == TEMPLATE_MARKER)
            .map(|(key, _)| key.into_owned())?;
        url.query_pairs()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.into_owned())
            .filter(|term| !term.trim().is_empty())
    }

    fn template_url(&self) -> Option<Url> {
        Url::parse(&self.url_template.replace(SEARCH_TERMS_PLACEHOLDER, TEMPLATE_MARKER)).ok()
    }
}

fn same_page(template: &Url, url: &Url) -> bool {
    template.scheme() == url.scheme()
        && template.host_str() == url.host_str()
        && template.path() == url.path()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> SearchProvider {
        SearchProvider {
            keyword_id: 3,
            name: "Example".to_string(),
            url_template: "https://search.example/find?hl=en&q={searchTerms}".to_string(),
        }
    }

    #[test]
    fn search_url_encodes_the_term() {
        assert_eq!(
            provider().search_url("rust & tokio"),
            "https://search.example/find?hl=en&q=rust+%26+tokio"
        );
    }

    #[test]
    fn results_pages_are_recognized() {
        let provider = provider();
        assert!(provider.is_search_results_page("https://search.example/find?q=anything"));
        assert!(!provider.is_search_results_page("https://search.example/about"));
        assert!(!provider.is_search_results_page("https://other.example/find?q=x"));
    }

    #[test]
    fn terms_are_extracted_from_results_pages() {
        let provider = provider();
        assert_eq!(
            provider
                .extract_search_terms("https://search.example/find?q=rust+book&hl=en")
                .as_deref(),
            Some("rust book")
        );
        assert_eq!(provider.extract_search_terms("https://search.example/find?hl=en"), None);
        assert_eq!(provider.extract_search_terms("https://elsewhere.example/find?q=x"), None);
    }

    #[test]
    fn templates_need_the_placeholder() {
        assert!(SearchProvider::validate_template("https://s.example/?q={searchTerms}").is_ok());
        assert!(SearchProvider::validate_template("https://s.example/?q=").is_err());
    }
}
