//! Scrape strategies: platform classification plus the platform-JSON,
//! generic-listing and detail-page adapters behind one contract.
//!
//! The contract never fails a run: network and parse problems are logged and
//! degrade to an empty or partial item list. Deciding what an empty list
//! means is the orchestrator's job.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use pricewatch_core::{parse_price, RawItem, DEFAULT_CURRENCY};
use pricewatch_storage::{HttpFetcher, RenderProxyClient};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "pricewatch-scrape";

// ---------------------------------------------------------------------------
// Platform classification

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    PlatformJson,
    Generic,
}

const PLATFORM_HOST_SUFFIXES: &[&str] = &[".myshopify.com"];
const PLATFORM_PATH_MARKERS: &[&str] = &["/collections/", "/collections", "/products"];

/// Map a competitor root URL to a scrape strategy. Malformed URLs and
/// unrecognized hosts fall back to the generic adapter.
pub fn classify(root_url: &str) -> Strategy {
    let Ok(parsed) = Url::parse(root_url) else {
        return Strategy::Generic;
    };
    if let Some(host) = parsed.host_str() {
        if PLATFORM_HOST_SUFFIXES.iter().any(|s| host.ends_with(s)) {
            return Strategy::PlatformJson;
        }
    }
    let path = parsed.path();
    if PLATFORM_PATH_MARKERS
        .iter()
        .any(|m| path == m.trim_end_matches('/') || path.starts_with(m))
    {
        return Strategy::PlatformJson;
    }
    Strategy::Generic
}

/// Hostname of a root URL, with a best-effort fallback for malformed input.
pub fn derive_domain(root_url: &str) -> String {
    Url::parse(root_url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_else(|| {
            root_url
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .split('/')
                .next()
                .unwrap_or(root_url)
                .to_string()
        })
}

fn origin_of(url: &str) -> Option<Url> {
    let parsed = Url::parse(url).ok()?;
    let mut base = parsed.clone();
    base.set_path("/");
    base.set_query(None);
    base.set_fragment(None);
    Some(base)
}

// ---------------------------------------------------------------------------
// Text sources

/// Seam over page retrieval so adapters can be exercised without a network.
#[async_trait]
pub trait TextSource: Send + Sync {
    async fn get(&self, url: &str) -> anyhow::Result<String>;
}

/// Plain HTTP retrieval for JSON endpoints that need no rendering.
pub struct DirectSource {
    fetcher: Arc<HttpFetcher>,
}

impl DirectSource {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl TextSource for DirectSource {
    async fn get(&self, url: &str) -> anyhow::Result<String> {
        let domain = derive_domain(url);
        Ok(self.fetcher.fetch_text(&domain, url).await?)
    }
}

/// Retrieval through the URL-to-HTML rendering proxy.
pub struct RenderedSource {
    proxy: Arc<RenderProxyClient>,
}

impl RenderedSource {
    pub fn new(proxy: Arc<RenderProxyClient>) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl TextSource for RenderedSource {
    async fn get(&self, url: &str) -> anyhow::Result<String> {
        Ok(self.proxy.content(url).await?)
    }
}

// ---------------------------------------------------------------------------
// Bounds

#[derive(Debug, Clone, Copy)]
pub struct ScrapeLimits {
    pub max_pages: usize,
    pub max_items: usize,
    /// Pages yielding fewer items than this are treated as end-of-listing.
    pub min_page_items: usize,
}

impl Default for ScrapeLimits {
    fn default() -> Self {
        Self {
            max_pages: 5,
            max_items: 100,
            min_page_items: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Platform JSON adapter

const PLATFORM_LISTING_LIMIT: usize = 250;

/// Parse a platform `products.json` payload. Price and URL come from the
/// first variant and the product handle.
pub fn parse_platform_products(json_text: &str, root_url: &str, max_items: usize) -> Vec<RawItem> {
    let Ok(value) = serde_json::from_str::<JsonValue>(json_text) else {
        return Vec::new();
    };
    let Some(products) = value.get("products").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let origin = origin_of(root_url);

    let mut items = Vec::new();
    for product in products.iter().take(max_items) {
        let Some(name) = product.get("title").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(handle) = product.get("handle").and_then(|v| v.as_str()) else {
            continue;
        };
        let url = match &origin {
            Some(base) => match base.join(&format!("products/{handle}")) {
                Ok(joined) => joined.to_string(),
                Err(_) => continue,
            },
            None => continue,
        };
        let first_variant = product
            .get("variants")
            .and_then(|v| v.as_array())
            .and_then(|variants| variants.first());
        let price = first_variant
            .and_then(|variant| variant.get("price"))
            .and_then(|p| match p {
                JsonValue::String(s) => parse_price(s).amount,
                JsonValue::Number(n) => n.as_f64(),
                _ => None,
            });
        let sku = first_variant
            .and_then(|variant| variant.get("sku"))
            .and_then(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(ToString::to_string);
        let external_id = product.get("id").map(|id| id.to_string());
        items.push(RawItem {
            name: name.to_string(),
            url,
            sku,
            price,
            currency: DEFAULT_CURRENCY.to_string(),
            external_id,
        });
    }
    items
}

// ---------------------------------------------------------------------------
// Generic listing adapter: ordered extraction rules

/// One CSS extraction attempt: a selector plus an optional attribute to read
/// instead of the element text. Rules are tried in order until one yields a
/// non-empty value, which keeps adding site-specific rules a data change.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub selector: &'static str,
    pub attr: Option<&'static str>,
}

const CONTAINER_SELECTORS: &[&str] = &[
    "li.product",
    ".product-item",
    ".product-card",
    "article.product",
    ".grid__item .card",
    "ul.products > li",
    ".collection-item",
    ".product",
];

const NAME_RULES: &[FieldRule] = &[
    FieldRule { selector: ".product-title", attr: None },
    FieldRule { selector: ".product-item__title", attr: None },
    FieldRule { selector: ".card__heading", attr: None },
    FieldRule { selector: "h2 a", attr: None },
    FieldRule { selector: "h3 a", attr: None },
    FieldRule { selector: "h2", attr: None },
    FieldRule { selector: "h3", attr: None },
    FieldRule { selector: "a", attr: Some("title") },
    FieldRule { selector: "a", attr: None },
];

const URL_RULES: &[FieldRule] = &[
    FieldRule { selector: "a.product-link", attr: Some("href") },
    FieldRule { selector: "h2 a", attr: Some("href") },
    FieldRule { selector: "h3 a", attr: Some("href") },
    FieldRule { selector: "a", attr: Some("href") },
];

const PRICE_RULES: &[FieldRule] = &[
    FieldRule { selector: ".price--sale", attr: None },
    FieldRule { selector: ".price-item--sale", attr: None },
    FieldRule { selector: "[data-price]", attr: Some("data-price") },
    FieldRule { selector: ".product-price", attr: None },
    FieldRule { selector: ".price", attr: None },
    FieldRule { selector: ".amount", attr: None },
    FieldRule { selector: ".money", attr: None },
];

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn apply_rule(element: &ElementRef, rule: &FieldRule) -> Option<String> {
    let selector = Selector::parse(rule.selector).ok()?;
    let node = element.select(&selector).next()?;
    match rule.attr {
        Some(attr) => node.value().attr(attr).and_then(|s| text_or_none(s.to_string())),
        None => text_or_none(node.text().collect::<String>()),
    }
}

fn first_match(element: &ElementRef, rules: &[FieldRule]) -> Option<String> {
    rules.iter().find_map(|rule| apply_rule(element, rule))
}

/// Extract listing items from one rendered page. Relative item URLs are
/// resolved against the page URL; items without a name or href are skipped.
pub fn parse_listing_page(html: &str, page_url: &str) -> Vec<RawItem> {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();

    let containers = CONTAINER_SELECTORS.iter().find_map(|sel| {
        let selector = Selector::parse(sel).ok()?;
        let found: Vec<_> = document.select(&selector).collect();
        if found.is_empty() {
            None
        } else {
            Some(found)
        }
    });
    let Some(containers) = containers else {
        return Vec::new();
    };

    let mut items = Vec::new();
    for container in containers {
        let Some(name) = first_match(&container, NAME_RULES) else {
            debug!(page_url, "listing container without a name, skipping");
            continue;
        };
        let Some(href) = first_match(&container, URL_RULES) else {
            debug!(page_url, "listing container without a link, skipping");
            continue;
        };
        let url = match &base {
            Some(base) => match base.join(&href) {
                Ok(joined) => joined.to_string(),
                Err(_) => continue,
            },
            None => href,
        };
        let parsed = first_match(&container, PRICE_RULES)
            .map(|text| parse_price(&text))
            .unwrap_or_else(|| parse_price(""));
        items.push(RawItem {
            name,
            url,
            sku: None,
            price: parsed.amount,
            currency: parsed.currency,
            external_id: None,
        });
    }
    items
}

fn page_url(listing_url: &str, page: usize) -> String {
    if page <= 1 {
        listing_url.to_string()
    } else if listing_url.contains('?') {
        format!("{listing_url}&page={page}")
    } else {
        format!("{listing_url}?page={page}")
    }
}

// ---------------------------------------------------------------------------
// Detail page adapter

struct SiteParser {
    domain_fragment: &'static str,
    name_rules: &'static [FieldRule],
    price_rules: &'static [FieldRule],
}

const SITE_PARSERS: &[SiteParser] = &[
    SiteParser {
        domain_fragment: "amazon.",
        name_rules: &[FieldRule { selector: "#productTitle", attr: None }],
        price_rules: &[
            FieldRule { selector: ".a-price .a-offscreen", attr: None },
            FieldRule { selector: "#priceblock_ourprice", attr: None },
        ],
    },
    SiteParser {
        domain_fragment: "ebay.",
        name_rules: &[FieldRule { selector: "h1.x-item-title__mainTitle", attr: None }],
        price_rules: &[FieldRule { selector: ".x-price-primary", attr: None }],
    },
    SiteParser {
        domain_fragment: "etsy.",
        name_rules: &[FieldRule { selector: "h1[data-buy-box-listing-title]", attr: None }],
        price_rules: &[FieldRule { selector: ".wt-text-title-larger", attr: None }],
    },
];

const FALLBACK_NAME_RULES: &[FieldRule] = &[
    FieldRule { selector: "h1", attr: None },
    FieldRule { selector: ".product-title", attr: None },
];

const FALLBACK_PRICE_RULES: &[FieldRule] = &[
    FieldRule { selector: ".price", attr: None },
    FieldRule { selector: ".product-price", attr: None },
    FieldRule { selector: "[data-price]", attr: Some("data-price") },
    FieldRule { selector: ".amount", attr: None },
];

/// Parse a single product page, preferring a site-specific parser before the
/// generic `<h1>`/price-class fallback.
pub fn parse_detail_page(html: &str, url: &str) -> Option<RawItem> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let domain = derive_domain(url);

    let site = SITE_PARSERS
        .iter()
        .find(|p| domain.contains(p.domain_fragment));
    let (name_rules, price_rules): (&[FieldRule], &[FieldRule]) = match site {
        Some(parser) => (parser.name_rules, parser.price_rules),
        None => (FALLBACK_NAME_RULES, FALLBACK_PRICE_RULES),
    };

    let name = first_match(&root, name_rules)
        .or_else(|| first_match(&root, FALLBACK_NAME_RULES))?;
    let parsed = first_match(&root, price_rules)
        .or_else(|| first_match(&root, FALLBACK_PRICE_RULES))
        .map(|text| parse_price(&text))
        .unwrap_or_else(|| parse_price(""));

    Some(RawItem {
        name,
        url: url.to_string(),
        sku: None,
        price: parsed.amount,
        currency: parsed.currency,
        external_id: None,
    })
}

// ---------------------------------------------------------------------------
// Dispatcher

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeOutcome {
    pub strategy: Strategy,
    pub items: Vec<RawItem>,
}

/// Strategy dispatcher for one competitor. Holds the direct and rendered text
/// sources; [`classify`] picks the entry strategy and the platform adapter
/// falls through to the generic one when it yields nothing.
pub struct CompetitorScraper {
    direct: Arc<dyn TextSource>,
    rendered: Arc<dyn TextSource>,
    limits: ScrapeLimits,
}

impl CompetitorScraper {
    pub fn new(
        direct: Arc<dyn TextSource>,
        rendered: Arc<dyn TextSource>,
        limits: ScrapeLimits,
    ) -> Self {
        Self {
            direct,
            rendered,
            limits,
        }
    }

    /// Scrape a competitor root URL. Never errors; failures shrink the result.
    pub async fn scrape(&self, root_url: &str) -> ScrapeOutcome {
        match classify(root_url) {
            Strategy::PlatformJson => {
                let items = self.scrape_platform(root_url).await;
                if items.is_empty() {
                    debug!(root_url, "platform adapter yielded nothing, trying generic listing");
                    ScrapeOutcome {
                        strategy: Strategy::Generic,
                        items: self.scrape_generic(root_url).await,
                    }
                } else {
                    ScrapeOutcome {
                        strategy: Strategy::PlatformJson,
                        items,
                    }
                }
            }
            Strategy::Generic => ScrapeOutcome {
                strategy: Strategy::Generic,
                items: self.scrape_generic(root_url).await,
            },
        }
    }

    async fn scrape_platform(&self, root_url: &str) -> Vec<RawItem> {
        let Some(origin) = origin_of(root_url) else {
            return Vec::new();
        };
        let endpoint = match origin.join(&format!("products.json?limit={PLATFORM_LISTING_LIMIT}")) {
            Ok(url) => url.to_string(),
            Err(_) => return Vec::new(),
        };
        match self.direct.get(&endpoint).await {
            Ok(body) => parse_platform_products(&body, root_url, self.limits.max_items),
            Err(err) => {
                warn!(root_url, error = %err, "platform listing fetch failed");
                Vec::new()
            }
        }
    }

    async fn scrape_generic(&self, listing_url: &str) -> Vec<RawItem> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();

        for page in 1..=self.limits.max_pages {
            let url = page_url(listing_url, page);
            let html = match self.rendered.get(&url).await {
                Ok(html) => html,
                Err(err) => {
                    warn!(url, error = %err, "listing page fetch failed, skipping page");
                    continue;
                }
            };

            let page_items = parse_listing_page(&html, &url);
            let page_count = page_items.len();
            for item in page_items {
                if items.len() >= self.limits.max_items {
                    return items;
                }
                if seen.insert(item.url.clone()) {
                    items.push(item);
                }
            }

            // Short or selector-less pages signal the end of the listing.
            if page_count < self.limits.min_page_items {
                break;
            }
        }
        items
    }

    /// Single-URL flow used when a competitor is added by product link.
    pub async fn scrape_detail(&self, url: &str) -> Option<RawItem> {
        match self.rendered.get(url).await {
            Ok(html) => parse_detail_page(&html, url),
            Err(err) => {
                warn!(url, error = %err, "detail page fetch failed");
                None
            }
        }
    }
}
