//! Navigator over plain HTTP for server-rendered or pre-rendered result pages.

use async_trait::async_trait;
use harvest_storage::{HttpClientConfig, HttpFetcher};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::navigator::{CandidateElement, NavigationError, Navigator};

/// Product containers, most specific first. The first selector that matches
/// anything wins.
pub const PRODUCT_SELECTORS: &[&str] = &[
    ".productViewControl",
    "app-ux-product-display-inline",
    ".product-item",
    ".result-item",
    ".product",
];

const DETAIL_LINK_MARKER: &str = "product_detail";
const NEXT_PAGE_SELECTOR: &str = r#"a[rel="next"]"#;
const UNHEALTHY_AFTER_FAILURES: usize = 2;

/// Owned result of parsing one HTML document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    pub text: String,
    pub elements: Vec<CandidateElement>,
    pub next: Option<String>,
}

fn selector(css: &str, url: &str) -> Result<Selector, NavigationError> {
    Selector::parse(css).map_err(|e| NavigationError::Parse {
        url: url.to_string(),
        message: e.to_string(),
    })
}

fn text_lines(node: ElementRef<'_>) -> String {
    node.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn resolve(base: Option<&Url>, href: &str) -> String {
    match base.and_then(|b| b.join(href).ok()) {
        Some(url) => url.to_string(),
        None => href.to_string(),
    }
}

/// Parses a results or detail page into text, product elements and the
/// next-page link.
pub fn parse_page(url: &str, html: &str) -> Result<ParsedPage, NavigationError> {
    let document = Html::parse_document(html);
    let base = Url::parse(url).ok();

    let body = selector("body", url)?;
    let text = document
        .select(&body)
        .next()
        .map(text_lines)
        .unwrap_or_else(|| text_lines(document.root_element()));

    let link = selector("a[href]", url)?;
    let mut elements = Vec::new();
    for css in PRODUCT_SELECTORS {
        let sel = selector(css, url)?;
        elements = document
            .select(&sel)
            .map(|node| {
                let detail_ref = node
                    .select(&link)
                    .filter_map(|a| a.value().attr("href"))
                    .find(|href| href.contains(DETAIL_LINK_MARKER))
                    .map(|href| resolve(base.as_ref(), href));
                CandidateElement {
                    text: text_lines(node),
                    detail_ref,
                }
            })
            .filter(|e| !e.text.is_empty())
            .collect();
        if !elements.is_empty() {
            break;
        }
    }

    let next_sel = selector(NEXT_PAGE_SELECTOR, url)?;
    let next = document
        .select(&next_sel)
        .filter_map(|a| a.value().attr("href"))
        .next()
        .map(|href| resolve(base.as_ref(), href));

    Ok(ParsedPage { text, elements, next })
}

fn start_fetcher(config: &HttpClientConfig) -> Result<HttpFetcher, NavigationError> {
    HttpFetcher::new(config).map_err(|e| NavigationError::Startup(format!("{e:#}")))
}

#[derive(Debug)]
struct LoadedPage {
    url: String,
    parsed: ParsedPage,
}

/// [`Navigator`] backed by [`HttpFetcher`]. `load_more` follows `rel="next"`
/// pagination and appends the next page's products.
#[derive(Debug)]
pub struct HtmlNavigator {
    config: HttpClientConfig,
    run_id: Uuid,
    fetcher: Option<HttpFetcher>,
    page: Option<LoadedPage>,
    consecutive_failures: usize,
}

impl HtmlNavigator {
    pub fn new(config: HttpClientConfig, run_id: Uuid) -> Result<Self, NavigationError> {
        let fetcher = start_fetcher(&config)?;
        Ok(Self {
            config,
            run_id,
            fetcher: Some(fetcher),
            page: None,
            consecutive_failures: 0,
        })
    }

    async fn load(&mut self, url: &str) -> Result<ParsedPage, NavigationError> {
        let fetcher = self.fetcher.as_ref().ok_or(NavigationError::Closed)?;
        let result = match fetcher.fetch_page(self.run_id, url).await {
            Ok(page) => parse_page(&page.final_url, &page.body),
            Err(err) => Err(err.into()),
        };
        match &result {
            Ok(_) => self.consecutive_failures = 0,
            Err(err) => {
                self.consecutive_failures += 1;
                warn!(url, %err, failures = self.consecutive_failures, "page load failed");
            }
        }
        result
    }

    fn current(&self) -> Result<&LoadedPage, NavigationError> {
        if self.fetcher.is_none() {
            return Err(NavigationError::Closed);
        }
        self.page.as_ref().ok_or(NavigationError::NoPage)
    }
}

#[async_trait]
impl Navigator for HtmlNavigator {
    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError> {
        self.page = None;
        let parsed = self.load(url).await?;
        debug!(url, products = parsed.elements.len(), "page loaded");
        self.page = Some(LoadedPage {
            url: url.to_string(),
            parsed,
        });
        Ok(())
    }

    async fn rendered_text(&mut self) -> Result<String, NavigationError> {
        Ok(self.current()?.parsed.text.clone())
    }

    async fn candidate_elements(&mut self) -> Result<Vec<CandidateElement>, NavigationError> {
        Ok(self.current()?.parsed.elements.clone())
    }

    async fn load_more(&mut self) -> Result<bool, NavigationError> {
        let Some(next) = self.current()?.parsed.next.clone() else {
            return Ok(false);
        };
        let more = self.load(&next).await?;
        let Some(page) = self.page.as_mut() else {
            return Err(NavigationError::NoPage);
        };
        let before = page.parsed.elements.len();
        page.parsed.elements.extend(more.elements);
        page.parsed.text.push('\n');
        page.parsed.text.push_str(&more.text);
        page.parsed.next = more.next;
        debug!(url = %page.url, added = page.parsed.elements.len() - before, "loaded next page");
        Ok(page.parsed.elements.len() > before)
    }

    async fn is_healthy(&mut self) -> bool {
        self.fetcher.is_some() && self.consecutive_failures < UNHEALTHY_AFTER_FAILURES
    }

    async fn restart(&mut self) -> Result<(), NavigationError> {
        let fetcher = start_fetcher(&self.config)?;
        self.fetcher = Some(fetcher);
        self.page = None;
        self.consecutive_failures = 0;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), NavigationError> {
        self.fetcher = None;
        self.page = None;
        Ok(())
    }
}
