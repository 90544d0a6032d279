use async_trait::async_trait;
use harvest_storage::FetchError;
use thiserror::Error;

/// A product-shaped element on a results page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CandidateElement {
    pub text: String,
    pub detail_ref: Option<String>,
}

impl CandidateElement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            detail_ref: None,
        }
    }

    pub fn with_detail_ref(mut self, detail_ref: impl Into<String>) -> Self {
        self.detail_ref = Some(detail_ref.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum NavigationError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("navigation to {url} timed out")]
    Timeout { url: String },
    #[error("no page loaded")]
    NoPage,
    #[error("navigator is closed")]
    Closed,
    #[error("could not start navigator: {0}")]
    Startup(String),
    #[error("page at {url} could not be parsed: {message}")]
    Parse { url: String, message: String },
}

impl NavigationError {
    /// Transient failures are worth a restart and another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            NavigationError::Fetch(err) => err.is_transient(),
            NavigationError::Timeout { .. } | NavigationError::Closed | NavigationError::NoPage => {
                true
            }
            NavigationError::Startup(_) | NavigationError::Parse { .. } => false,
        }
    }
}

/// Page-rendering capability the harvester drives. Owned exclusively by one
/// orchestrator, so every operation takes `&mut self`.
#[async_trait]
pub trait Navigator: Send {
    /// Loads the page at `url` and waits until it has content.
    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError>;

    async fn rendered_text(&mut self) -> Result<String, NavigationError>;

    async fn candidate_elements(&mut self) -> Result<Vec<CandidateElement>, NavigationError>;

    /// Asks the page for more results. Returns whether the page grew.
    async fn load_more(&mut self) -> Result<bool, NavigationError>;

    async fn is_healthy(&mut self) -> bool;

    async fn restart(&mut self) -> Result<(), NavigationError>;

    async fn close(&mut self) -> Result<(), NavigationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttled_fetches_and_lost_pages_are_transient() {
        let throttled = NavigationError::from(FetchError::Status {
            url: "https://catalog.test/q".into(),
            status: 429,
        });
        let missing = NavigationError::from(FetchError::Status {
            url: "https://catalog.test/q".into(),
            status: 404,
        });
        assert!(throttled.is_transient());
        assert!(!missing.is_transient());
        assert!(NavigationError::NoPage.is_transient());
        assert!(!NavigationError::Parse {
            url: "https://catalog.test/q".into(),
            message: "empty".into(),
        }
        .is_transient());
    }
}
