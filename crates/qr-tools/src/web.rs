//! Fetch-and-convert: download a page, turn its markup into readable text and
//! record the outcome in the shared resource cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, Url};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use qr_core::{CachedResource, ResourceCache};

const EMPTY_PAGE_TEXT: &str = "(No text content found on page)";

/// Elements whose text never reaches the converted output.
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "aside", "noscript", "template", "svg", "head",
    "form", "button",
];

/// Elements rendered as separate paragraphs.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "ul", "ol", "table", "tr", "blockquote", "pre",
    "dl", "dt", "dd", "figure", "figcaption", "hr", "body",
];

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: String,
    /// Converted text beyond this many characters is cut off.
    pub max_chars: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: concat!("qr/", env!("CARGO_PKG_VERSION")).to_string(),
            max_chars: 50_000,
        }
    }
}

type InFlight = Shared<BoxFuture<'static, CachedResource>>;

/// Downloads resources into a [`ResourceCache`].
///
/// Every attempt ends with a cache entry: success stores the page text,
/// any failure stores [`CachedResource::Failed`] with the cause. Concurrent
/// fetches of the same URL share a single request.
pub struct ResourceFetcher {
    client: Client,
    cache: Arc<ResourceCache>,
    timeout: Duration,
    max_chars: usize,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
}

impl ResourceFetcher {
    pub fn new(cache: Arc<ResourceCache>, config: FetchConfig) -> Self {
        let client = Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build HTTP client; using defaults");
                Client::new()
            });
        Self {
            client,
            cache,
            timeout: config.timeout,
            max_chars: config.max_chars,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Fetch `url`, store the outcome in the cache and return it.
    pub async fn fetch(&self, url: &str) -> CachedResource {
        let request = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match in_flight.get(url) {
                Some(existing) => {
                    debug!(url = %url, "Joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    let request = download(
                        self.client.clone(),
                        url.to_string(),
                        self.timeout,
                        self.max_chars,
                        Arc::clone(&self.cache),
                    )
                    .boxed()
                    .shared();
                    in_flight.insert(url.to_string(), request.clone());
                    request
                }
            }
        };

        // Also runs when this caller is dropped mid-fetch.
        let _release = InFlightGuard {
            in_flight: &self.in_flight,
            url,
            request: request.clone(),
        };
        request.await
    }

    /// Fetch only when the cache has nothing for `url` yet.
    pub async fn fetch_if_missing(&self, url: &str) -> CachedResource {
        match self.cache.get(url) {
            Some(entry) => entry,
            None => self.fetch(url).await,
        }
    }
}

/// Clears a URL's in-flight entry once a caller stops waiting on it, whether
/// the download finished or the caller was cancelled. A later fetch then
/// starts afresh instead of joining a future nobody polls.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<String, InFlight>>,
    url: &'a str,
    request: InFlight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight
            .get(self.url)
            .is_some_and(|current| current.ptr_eq(&self.request))
        {
            in_flight.remove(self.url);
        }
    }
}

async fn download(
    client: Client,
    url: String,
    timeout: Duration,
    max_chars: usize,
    cache: Arc<ResourceCache>,
) -> CachedResource {
    debug!(url = %url, "Downloading resource");
    let entry = match fetch_text(&client, &url, timeout, max_chars).await {
        Ok(text) => CachedResource::Fetched(text),
        Err(cause) => {
            warn!(url = %url, error = %cause, "Failed to download resource");
            CachedResource::Failed(cause)
        }
    };
    cache.put(url, entry.clone());
    entry
}

async fn fetch_text(
    client: &Client,
    url: &str,
    timeout: Duration,
    max_chars: usize,
) -> Result<String, String> {
    let parsed = Url::parse(url).map_err(|e| format!("invalid URL '{}': {}", url, e))?;

    let response = client.get(parsed).timeout(timeout).send().await.map_err(|e| {
        if e.is_timeout() {
            format!("request to {} timed out", url)
        } else {
            e.to_string()
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP error {} for url {}", status, url));
    }

    let html = response
        .text()
        .await
        .map_err(|e| format!("failed to read response body: {}", e))?;

    Ok(html_to_text(&html, max_chars))
}

/// Convert an HTML document into plain text.
///
/// Paragraph structure survives as blank lines, list items as `* ` lines,
/// headings as `#` lines and links as `[text](href)`.
pub fn html_to_text(html: &str, max_chars: usize) -> String {
    let document = Html::parse_document(html);

    let mut out = String::new();
    match main_content(&document) {
        Some(root) => render(root, &mut out),
        None => render(document.root_element(), &mut out),
    }

    let cleaned = clean_text(&out);
    if cleaned.is_empty() {
        return EMPTY_PAGE_TEXT.to_string();
    }

    let total = cleaned.chars().count();
    if total > max_chars {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}\n\n... (truncated, {} total characters)", truncated, total)
    } else {
        cleaned
    }
}

/// The page's primary content region, falling back to `<body>`.
fn main_content(document: &Html) -> Option<ElementRef<'_>> {
    ["main, article, .content, #content, .post, .entry", "body"]
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|selector| document.select(&selector).next())
}

fn render(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            push_inline(out, text);
            continue;
        }

        let Some(child) = ElementRef::wrap(child) else {
            continue;
        };

        let tag = child.value().name();
        if SKIPPED_TAGS.contains(&tag) {
            continue;
        }

        match tag {
            "br" => {
                trim_trailing_spaces(out);
                out.push('\n');
            }
            "a" => {
                let mut inner = String::new();
                render(child, &mut inner);
                let inner = inner.split_whitespace().collect::<Vec<_>>().join(" ");
                let href = child
                    .value()
                    .attr("href")
                    .filter(|h| h.starts_with("http://") || h.starts_with("https://"));
                match href {
                    Some(href) if !inner.is_empty() && inner != href => {
                        push_inline(out, &format!("[{}]({})", inner, href))
                    }
                    _ => push_inline(out, &inner),
                }
            }
            "li" => {
                line_break(out);
                out.push_str("* ");
                render(child, out);
                line_break(out);
            }
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = tag[1..].parse::<usize>().unwrap_or(1);
                block_break(out);
                out.push_str(&"#".repeat(level));
                out.push(' ');
                render(child, out);
                block_break(out);
            }
            _ if BLOCK_TAGS.contains(&tag) => {
                block_break(out);
                render(child, out);
                block_break(out);
            }
            _ => render(child, out),
        }
    }
}

fn push_inline(out: &mut String, text: &str) {
    let words: Vec<&str> = text.split_whitespace().collect();
    let needs_space = !out.is_empty() && !out.ends_with(char::is_whitespace);

    if words.is_empty() {
        if !text.is_empty() && needs_space {
            out.push(' ');
        }
        return;
    }

    if text.starts_with(char::is_whitespace) && needs_space {
        out.push(' ');
    }
    out.push_str(&words.join(" "));
    if text.ends_with(char::is_whitespace) {
        out.push(' ');
    }
}

fn trim_trailing_spaces(out: &mut String) {
    let len = out.trim_end_matches(' ').len();
    out.truncate(len);
}

fn line_break(out: &mut String) {
    trim_trailing_spaces(out);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn block_break(out: &mut String) {
    trim_trailing_spaces(out);
    if out.is_empty() || out.ends_with("\n\n") {
        return;
    }
    if out.ends_with('\n') {
        out.push('\n');
    } else {
        out.push_str("\n\n");
    }
}

/// Trim every line and collapse runs of blank lines.
fn clean_text(text: &str) -> String {
    let mut result = String::new();
    let mut blank_run = 0;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !result.is_empty() {
                result.push('\n');
            }
            continue;
        }
        blank_run = 0;
        if !result.is_empty() && !result.ends_with('\n') {
            result.push('\n');
        }
        result.push_str(line);
        result.push('\n');
    }

    result.trim().to_string()
}
