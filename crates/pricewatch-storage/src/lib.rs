//! Tenant-scoped persistence + HTTP fetch utilities for Pricewatch.
//!
//! The [`Store`] trait is the single seam between the engine and the
//! relational layout described in the migrations. [`PgStore`] is the
//! production implementation; [`MemStore`] backs tests and local development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use pricewatch_core::{
    Competitor, CompetitorStatus, ConfirmedMatch, DiscoveryQuota, MatchCandidate, SellerProduct,
    StagingProduct,
};
use reqwest::StatusCode;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-storage";

// ---------------------------------------------------------------------------
// HTTP fetching

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
            max_retries: 2,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_domain_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 12,
            per_domain_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Direct HTTP fetcher with bounded timeout, capped exponential backoff and
/// global + per-domain concurrency limits. One unresponsive site can stall at
/// most its own permits, never a whole run.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_domain_limit: usize,
    per_domain: Mutex<HashMap<String, Arc<Semaphore>>>,
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
        let client = builder.build()?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_domain_limit: config.per_domain_concurrency.max(1),
            per_domain: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn domain_semaphore(&self, domain: &str) -> Arc<Semaphore> {
        let mut map = self.per_domain.lock().await;
        map.entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_domain_limit)))
            .clone()
    }

    pub async fn fetch_text(&self, domain: &str, url: &str) -> Result<String, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_domain = self.domain_semaphore(domain).await;
        let _domain = per_domain.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", domain, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
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
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Rendering proxy

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("render proxy network error: {0}")]
    Network(String),
    #[error("render proxy status {status}: {message}")]
    Api { status: u16, message: String },
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Network(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RenderProxyConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl RenderProxyConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("RENDER_PROXY_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            token: std::env::var("RENDER_PROXY_TOKEN").ok(),
            timeout: Duration::from_secs(
                std::env::var("RENDER_PROXY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

/// Client for the third-party URL-to-HTML rendering proxy. Pages are fetched
/// with JavaScript execution disabled; listing scrapes only need server-side
/// markup.
pub struct RenderProxyClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RenderProxyClient {
    pub fn new(config: RenderProxyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    /// Fetch rendered HTML for `url` via the proxy's `/content` endpoint.
    pub async fn content(&self, url: &str) -> Result<String, ProxyError> {
        let mut endpoint = format!("{}/content", self.base_url);
        if let Some(token) = &self.token {
            endpoint.push_str(&format!("?token={token}"));
        }

        let body = serde_json::json!({
            "url": url,
            "setJavaScriptEnabled": false,
        });

        let resp = self.client.post(&endpoint).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ProxyError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.text().await?)
    }
}

// ---------------------------------------------------------------------------
// Store

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("corrupt row: {0}")]
    Decode(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Tenant-scoped query/upsert/delete over the domain entities. Every method takes
/// or carries a `store_id`; nothing crosses tenants.
#[async_trait]
pub trait Store: Send + Sync {
    async fn competitor(&self, store_id: Uuid, id: Uuid) -> Result<Option<Competitor>, StoreError>;
    async fn update_competitor(&self, competitor: &Competitor) -> Result<(), StoreError>;
    /// All competitors currently `active`, across tenants. Drives the optional
    /// scheduler's sync pass.
    async fn active_competitors(&self) -> Result<Vec<Competitor>, StoreError>;

    /// Idempotent overwrite keyed by `(competitor_id, url)`; an existing row
    /// keeps its id and takes the new name/price/checked-at.
    async fn upsert_staging(&self, item: &StagingProduct) -> Result<(), StoreError>;
    async fn staging_for_competitor(
        &self,
        competitor_id: Uuid,
    ) -> Result<Vec<StagingProduct>, StoreError>;
    async fn wipe_staging(&self, competitor_id: Uuid) -> Result<u64, StoreError>;

    /// Atomic delete-then-insert of the candidate set for one
    /// `(store, competitor)` pair. No reader observes a half-rebuilt set.
    async fn replace_candidates(
        &self,
        store_id: Uuid,
        competitor_id: Uuid,
        candidates: &[MatchCandidate],
    ) -> Result<(), StoreError>;
    async fn candidates(
        &self,
        store_id: Uuid,
        competitor_id: Uuid,
    ) -> Result<Vec<MatchCandidate>, StoreError>;
    async fn delete_candidates_by_item(
        &self,
        store_id: Uuid,
        competitor_id: Uuid,
        item_ids: &[Uuid],
    ) -> Result<u64, StoreError>;

    /// Upsert on the natural key `(store_id, competitor_id, product_id)`.
    async fn upsert_confirmed(&self, matched: &ConfirmedMatch) -> Result<(), StoreError>;
    async fn confirmed_matches(
        &self,
        store_id: Uuid,
        competitor_id: Uuid,
    ) -> Result<Vec<ConfirmedMatch>, StoreError>;

    async fn seller_products(&self, store_id: Uuid) -> Result<Vec<SellerProduct>, StoreError>;

    /// Load the month's quota row, lazily creating it with `default_limit`.
    async fn discovery_quota(
        &self,
        store_id: Uuid,
        period: &str,
        default_limit: i64,
    ) -> Result<DiscoveryQuota, StoreError>;
    /// Single-statement upsert-with-increment; concurrent runs for the same
    /// tenant must not lose updates.
    async fn add_discovery_usage(
        &self,
        store_id: Uuid,
        period: &str,
        staged: i64,
        default_limit: i64,
    ) -> Result<(), StoreError>;

    /// Atomically count one sync invocation for `(store, date)` and return the
    /// new total.
    async fn record_sync_run(&self, store_id: Uuid, date: NaiveDate) -> Result<i64, StoreError>;
    async fn sync_runs_on(&self, store_id: Uuid, date: NaiveDate) -> Result<i64, StoreError>;

    async fn store_plan_tier(&self, store_id: Uuid) -> Result<Option<String>, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Embedded schema migrations, applied by `pricewatch-cli migrate`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

fn competitor_from_row(row: &PgRow) -> Result<Competitor, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Competitor {
        id: row.try_get("id")?,
        store_id: row.try_get("store_id")?,
        root_url: row.try_get("root_url")?,
        domain: row.try_get("domain")?,
        status: CompetitorStatus::from_str(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown competitor status {status}")))?,
        failure_reason: row.try_get("failure_reason")?,
        last_sync_at: row.try_get("last_sync_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn staging_from_row(row: &PgRow) -> Result<StagingProduct, StoreError> {
    Ok(StagingProduct {
        id: row.try_get("id")?,
        competitor_id: row.try_get("competitor_id")?,
        url: row.try_get("url")?,
        name: row.try_get("name")?,
        sku: row.try_get("sku")?,
        price: row.try_get("price")?,
        currency: row.try_get("currency")?,
        last_checked_at: row.try_get("last_checked_at")?,
    })
}

fn candidate_from_row(row: &PgRow) -> Result<MatchCandidate, StoreError> {
    Ok(MatchCandidate {
        id: row.try_get("id")?,
        store_id: row.try_get("store_id")?,
        competitor_id: row.try_get("competitor_id")?,
        competitor_item_id: row.try_get("competitor_item_id")?,
        product_id: row.try_get("product_id")?,
        score: row.try_get("score")?,
        competitor_name: row.try_get("competitor_name")?,
        competitor_url: row.try_get("competitor_url")?,
        competitor_price: row.try_get("competitor_price")?,
        currency: row.try_get("currency")?,
        checked_at: row.try_get("checked_at")?,
    })
}

fn confirmed_from_row(row: &PgRow) -> Result<ConfirmedMatch, StoreError> {
    Ok(ConfirmedMatch {
        id: row.try_get("id")?,
        store_id: row.try_get("store_id")?,
        competitor_id: row.try_get("competitor_id")?,
        product_id: row.try_get("product_id")?,
        competitor_name: row.try_get("competitor_name")?,
        competitor_url: row.try_get("competitor_url")?,
        last_price: row.try_get("last_price")?,
        currency: row.try_get("currency")?,
        last_checked_at: row.try_get("last_checked_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn competitor(&self, store_id: Uuid, id: Uuid) -> Result<Option<Competitor>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, store_id, root_url, domain, status, failure_reason,
                   last_sync_at, created_at, updated_at
              FROM competitors
             WHERE store_id = $1 AND id = $2
            "#,
        )
        .bind(store_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| competitor_from_row(&r)).transpose()
    }

    async fn update_competitor(&self, competitor: &Competitor) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE competitors
               SET domain = $3,
                   status = $4,
                   failure_reason = $5,
                   last_sync_at = $6,
                   updated_at = NOW()
             WHERE store_id = $1 AND id = $2
            "#,
        )
        .bind(competitor.store_id)
        .bind(competitor.id)
        .bind(&competitor.domain)
        .bind(competitor.status.as_str())
        .bind(&competitor.failure_reason)
        .bind(competitor.last_sync_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_competitors(&self) -> Result<Vec<Competitor>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, store_id, root_url, domain, status, failure_reason,
                   last_sync_at, created_at, updated_at
              FROM competitors
             WHERE status = 'active'
             ORDER BY last_sync_at NULLS FIRST
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(competitor_from_row).collect()
    }

    async fn upsert_staging(&self, item: &StagingProduct) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO staging_products (id, competitor_id, url, name, sku, price, currency, last_checked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (competitor_id, url) DO UPDATE
               SET name = EXCLUDED.name,
                   sku = EXCLUDED.sku,
                   price = EXCLUDED.price,
                   currency = EXCLUDED.currency,
                   last_checked_at = EXCLUDED.last_checked_at
            "#,
        )
        .bind(item.id)
        .bind(item.competitor_id)
        .bind(&item.url)
        .bind(&item.name)
        .bind(&item.sku)
        .bind(item.price)
        .bind(&item.currency)
        .bind(item.last_checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn staging_for_competitor(
        &self,
        competitor_id: Uuid,
    ) -> Result<Vec<StagingProduct>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, competitor_id, url, name, sku, price, currency, last_checked_at
              FROM staging_products
             WHERE competitor_id = $1
             ORDER BY url
            "#,
        )
        .bind(competitor_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(staging_from_row).collect()
    }

    async fn wipe_staging(&self, competitor_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM staging_products WHERE competitor_id = $1")
            .bind(competitor_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn replace_candidates(
        &self,
        store_id: Uuid,
        competitor_id: Uuid,
        candidates: &[MatchCandidate],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM match_candidates WHERE store_id = $1 AND competitor_id = $2")
            .bind(store_id)
            .bind(competitor_id)
            .execute(&mut *tx)
            .await?;
        for candidate in candidates {
            sqlx::query(
                r#"
                INSERT INTO match_candidates
                    (id, store_id, competitor_id, competitor_item_id, product_id, score,
                     competitor_name, competitor_url, competitor_price, currency, checked_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(candidate.id)
            .bind(candidate.store_id)
            .bind(candidate.competitor_id)
            .bind(candidate.competitor_item_id)
            .bind(candidate.product_id)
            .bind(candidate.score)
            .bind(&candidate.competitor_name)
            .bind(&candidate.competitor_url)
            .bind(candidate.competitor_price)
            .bind(&candidate.currency)
            .bind(candidate.checked_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn candidates(
        &self,
        store_id: Uuid,
        competitor_id: Uuid,
    ) -> Result<Vec<MatchCandidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, store_id, competitor_id, competitor_item_id, product_id, score,
                   competitor_name, competitor_url, competitor_price, currency, checked_at
              FROM match_candidates
             WHERE store_id = $1 AND competitor_id = $2
             ORDER BY score DESC, competitor_url
            "#,
        )
        .bind(store_id)
        .bind(competitor_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candidate_from_row).collect()
    }

    async fn delete_candidates_by_item(
        &self,
        store_id: Uuid,
        competitor_id: Uuid,
        item_ids: &[Uuid],
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM match_candidates
             WHERE store_id = $1 AND competitor_id = $2
               AND competitor_item_id = ANY($3)
            "#,
        )
        .bind(store_id)
        .bind(competitor_id)
        .bind(item_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_confirmed(&self, matched: &ConfirmedMatch) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO confirmed_matches
                (id, store_id, competitor_id, product_id, competitor_name, competitor_url,
                 last_price, currency, last_checked_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (store_id, competitor_id, product_id) DO UPDATE
               SET competitor_name = EXCLUDED.competitor_name,
                   competitor_url = EXCLUDED.competitor_url,
                   last_price = EXCLUDED.last_price,
                   currency = EXCLUDED.currency,
                   last_checked_at = EXCLUDED.last_checked_at,
                   updated_at = NOW()
            "#,
        )
        .bind(matched.id)
        .bind(matched.store_id)
        .bind(matched.competitor_id)
        .bind(matched.product_id)
        .bind(&matched.competitor_name)
        .bind(&matched.competitor_url)
        .bind(matched.last_price)
        .bind(&matched.currency)
        .bind(matched.last_checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn confirmed_matches(
        &self,
        store_id: Uuid,
        competitor_id: Uuid,
    ) -> Result<Vec<ConfirmedMatch>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, store_id, competitor_id, product_id, competitor_name, competitor_url,
                   last_price, currency, last_checked_at, created_at, updated_at
              FROM confirmed_matches
             WHERE store_id = $1 AND competitor_id = $2
             ORDER BY competitor_name
            "#,
        )
        .bind(store_id)
        .bind(competitor_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(confirmed_from_row).collect()
    }

    async fn seller_products(&self, store_id: Uuid) -> Result<Vec<SellerProduct>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, store_id, name, sku, price
              FROM products
             WHERE store_id = $1
             ORDER BY name
            "#,
        )
        .bind(store_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(SellerProduct {
                    id: row.try_get("id")?,
                    store_id: row.try_get("store_id")?,
                    name: row.try_get("name")?,
                    sku: row.try_get("sku")?,
                    price: row.try_get("price")?,
                })
            })
            .collect()
    }

    async fn discovery_quota(
        &self,
        store_id: Uuid,
        period: &str,
        default_limit: i64,
    ) -> Result<DiscoveryQuota, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO discovery_quotas (store_id, period, limit_total, used)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (store_id, period) DO NOTHING
            "#,
        )
        .bind(store_id)
        .bind(period)
        .bind(default_limit)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT store_id, period, limit_total, used
              FROM discovery_quotas
             WHERE store_id = $1 AND period = $2
            "#,
        )
        .bind(store_id)
        .bind(period)
        .fetch_one(&self.pool)
        .await?;
        Ok(DiscoveryQuota {
            store_id: row.try_get("store_id")?,
            period: row.try_get("period")?,
            limit: row.try_get("limit_total")?,
            used: row.try_get("used")?,
        })
    }

    async fn add_discovery_usage(
        &self,
        store_id: Uuid,
        period: &str,
        staged: i64,
        default_limit: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO discovery_quotas (store_id, period, limit_total, used)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (store_id, period) DO UPDATE
               SET used = discovery_quotas.used + EXCLUDED.used
            "#,
        )
        .bind(store_id)
        .bind(period)
        .bind(default_limit)
        .bind(staged)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_sync_run(&self, store_id: Uuid, date: NaiveDate) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sync_runs (store_id, run_date, runs)
            VALUES ($1, $2, 1)
            ON CONFLICT (store_id, run_date) DO UPDATE
               SET runs = sync_runs.runs + 1
            RETURNING runs
            "#,
        )
        .bind(store_id)
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("runs")?)
    }

    async fn sync_runs_on(&self, store_id: Uuid, date: NaiveDate) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT runs FROM sync_runs WHERE store_id = $1 AND run_date = $2",
        )
        .bind(store_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get("runs")).transpose()?.unwrap_or(0))
    }

    async fn store_plan_tier(&self, store_id: Uuid) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT plan_tier FROM stores WHERE id = $1")
            .bind(store_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("plan_tier")).transpose()?)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation

#[derive(Default)]
struct MemInner {
    competitors: HashMap<Uuid, Competitor>,
    staging: HashMap<(Uuid, String), StagingProduct>,
    candidates: Vec<MatchCandidate>,
    confirmed: HashMap<(Uuid, Uuid, Uuid), ConfirmedMatch>,
    products: Vec<SellerProduct>,
    quotas: HashMap<(Uuid, String), DiscoveryQuota>,
    sync_counts: HashMap<(Uuid, NaiveDate), i64>,
    plan_tiers: HashMap<Uuid, String>,
}

/// In-memory [`Store`] used by tests and local development. Candidate
/// replacement happens under one lock region, mirroring the transactional
/// boundary of [`PgStore`].
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_competitor(&self, competitor: Competitor) {
        let mut inner = self.inner.lock().await;
        inner.competitors.insert(competitor.id, competitor);
    }

    pub async fn insert_product(&self, product: SellerProduct) {
        let mut inner = self.inner.lock().await;
        inner.products.push(product);
    }

    pub async fn set_plan_tier(&self, store_id: Uuid, tier: &str) {
        let mut inner = self.inner.lock().await;
        inner.plan_tiers.insert(store_id, tier.to_string());
    }
}

#[async_trait]
impl Store for MemStore {
    async fn competitor(&self, store_id: Uuid, id: Uuid) -> Result<Option<Competitor>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .competitors
            .get(&id)
            .filter(|c| c.store_id == store_id)
            .cloned())
    }

    async fn update_competitor(&self, competitor: &Competitor) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let mut updated = competitor.clone();
        updated.updated_at = Utc::now();
        inner.competitors.insert(updated.id, updated);
        Ok(())
    }

    async fn active_competitors(&self) -> Result<Vec<Competitor>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .competitors
            .values()
            .filter(|c| c.status == CompetitorStatus::Active)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.last_sync_at);
        Ok(rows)
    }

    async fn upsert_staging(&self, item: &StagingProduct) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (item.competitor_id, item.url.clone());
        match inner.staging.get_mut(&key) {
            Some(existing) => {
                existing.name = item.name.clone();
                existing.sku = item.sku.clone();
                existing.price = item.price;
                existing.currency = item.currency.clone();
                existing.last_checked_at = item.last_checked_at;
            }
            None => {
                inner.staging.insert(key, item.clone());
            }
        }
        Ok(())
    }

    async fn staging_for_competitor(
        &self,
        competitor_id: Uuid,
    ) -> Result<Vec<StagingProduct>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .staging
            .values()
            .filter(|s| s.competitor_id == competitor_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(rows)
    }

    async fn wipe_staging(&self, competitor_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.staging.len();
        inner.staging.retain(|(cid, _), _| *cid != competitor_id);
        Ok((before - inner.staging.len()) as u64)
    }

    async fn replace_candidates(
        &self,
        store_id: Uuid,
        competitor_id: Uuid,
        candidates: &[MatchCandidate],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .candidates
            .retain(|c| !(c.store_id == store_id && c.competitor_id == competitor_id));
        inner.candidates.extend_from_slice(candidates);
        Ok(())
    }

    async fn candidates(
        &self,
        store_id: Uuid,
        competitor_id: Uuid,
    ) -> Result<Vec<MatchCandidate>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .candidates
            .iter()
            .filter(|c| c.store_id == store_id && c.competitor_id == competitor_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.score.cmp(&a.score).then(a.competitor_url.cmp(&b.competitor_url)));
        Ok(rows)
    }

    async fn delete_candidates_by_item(
        &self,
        store_id: Uuid,
        competitor_id: Uuid,
        item_ids: &[Uuid],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.candidates.len();
        inner.candidates.retain(|c| {
            !(c.store_id == store_id
                && c.competitor_id == competitor_id
                && item_ids.contains(&c.competitor_item_id))
        });
        Ok((before - inner.candidates.len()) as u64)
    }

    async fn upsert_confirmed(&self, matched: &ConfirmedMatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (matched.store_id, matched.competitor_id, matched.product_id);
        match inner.confirmed.get_mut(&key) {
            Some(existing) => {
                existing.competitor_name = matched.competitor_name.clone();
                existing.competitor_url = matched.competitor_url.clone();
                existing.last_price = matched.last_price;
                existing.currency = matched.currency.clone();
                existing.last_checked_at = matched.last_checked_at;
                existing.updated_at = Utc::now();
            }
            None => {
                inner.confirmed.insert(key, matched.clone());
            }
        }
        Ok(())
    }

    async fn confirmed_matches(
        &self,
        store_id: Uuid,
        competitor_id: Uuid,
    ) -> Result<Vec<ConfirmedMatch>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .confirmed
            .values()
            .filter(|m| m.store_id == store_id && m.competitor_id == competitor_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.competitor_name.cmp(&b.competitor_name));
        Ok(rows)
    }

    async fn seller_products(&self, store_id: Uuid) -> Result<Vec<SellerProduct>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .products
            .iter()
            .filter(|p| p.store_id == store_id)
            .cloned()
            .collect())
    }

    async fn discovery_quota(
        &self,
        store_id: Uuid,
        period: &str,
        default_limit: i64,
    ) -> Result<DiscoveryQuota, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .quotas
            .entry((store_id, period.to_string()))
            .or_insert_with(|| DiscoveryQuota {
                store_id,
                period: period.to_string(),
                limit: default_limit,
                used: 0,
            })
            .clone())
    }

    async fn add_discovery_usage(
        &self,
        store_id: Uuid,
        period: &str,
        staged: i64,
        default_limit: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .quotas
            .entry((store_id, period.to_string()))
            .or_insert_with(|| DiscoveryQuota {
                store_id,
                period: period.to_string(),
                limit: default_limit,
                used: 0,
            })
            .used += staged;
        Ok(())
    }

    async fn record_sync_run(&self, store_id: Uuid, date: NaiveDate) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let count = inner.sync_counts.entry((store_id, date)).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn sync_runs_on(&self, store_id: Uuid, date: NaiveDate) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.sync_counts.get(&(store_id, date)).copied().unwrap_or(0))
    }

    async fn store_plan_tier(&self, store_id: Uuid) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.plan_tiers.get(&store_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).single().unwrap()
    }

    fn staging(competitor_id: Uuid, url: &str, name: &str, price: f64) -> StagingProduct {
        StagingProduct {
            id: Uuid::new_v4(),
            competitor_id,
            url: url.to_string(),
            name: name.to_string(),
            sku: None,
            price: Some(price),
            currency: "USD".to_string(),
            last_checked_at: ts(),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(700),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(700));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(700));
    }

    #[test]
    fn too_many_requests_is_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn staging_upsert_overwrites_by_competitor_url() {
        let store = MemStore::new();
        let competitor_id = Uuid::new_v4();

        store
            .upsert_staging(&staging(competitor_id, "https://x.test/a", "Mouse", 10.0))
            .await
            .unwrap();
        store
            .upsert_staging(&staging(competitor_id, "https://x.test/a", "Mouse v2", 12.0))
            .await
            .unwrap();

        let rows = store.staging_for_competitor(competitor_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Mouse v2");
        assert_eq!(rows[0].price, Some(12.0));
    }

    #[tokio::test]
    async fn replace_candidates_leaves_no_stale_rows() {
        let store = MemStore::new();
        let store_id = Uuid::new_v4();
        let competitor_id = Uuid::new_v4();
        let mk = |url: &str| MatchCandidate {
            id: Uuid::new_v4(),
            store_id,
            competitor_id,
            competitor_item_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            score: 80,
            competitor_name: "Thing".into(),
            competitor_url: url.into(),
            competitor_price: Some(5.0),
            currency: "USD".into(),
            checked_at: ts(),
        };

        store
            .replace_candidates(store_id, competitor_id, &[mk("https://x.test/old")])
            .await
            .unwrap();
        store
            .replace_candidates(store_id, competitor_id, &[mk("https://x.test/new")])
            .await
            .unwrap();

        let rows = store.candidates(store_id, competitor_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].competitor_url, "https://x.test/new");
    }

    #[tokio::test]
    async fn discovery_usage_accumulates() {
        let store = MemStore::new();
        let store_id = Uuid::new_v4();
        store
            .add_discovery_usage(store_id, "2026-08", 7, 100)
            .await
            .unwrap();
        store
            .add_discovery_usage(store_id, "2026-08", 5, 100)
            .await
            .unwrap();
        let quota = store.discovery_quota(store_id, "2026-08", 100).await.unwrap();
        assert_eq!(quota.used, 12);
        assert_eq!(quota.remaining(), 88);
    }

    #[tokio::test]
    async fn sync_run_counter_increments_per_day() {
        let store = MemStore::new();
        let store_id = Uuid::new_v4();
        let date = ts().date_naive();
        assert_eq!(store.record_sync_run(store_id, date).await.unwrap(), 1);
        assert_eq!(store.record_sync_run(store_id, date).await.unwrap(), 2);
        assert_eq!(store.sync_runs_on(store_id, date).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn confirmed_matches_survive_staging_wipe() {
        let store = MemStore::new();
        let store_id = Uuid::new_v4();
        let competitor_id = Uuid::new_v4();

        store
            .upsert_staging(&staging(competitor_id, "https://x.test/a", "Mouse", 19.99))
            .await
            .unwrap();
        store
            .upsert_confirmed(&ConfirmedMatch {
                id: Uuid::new_v4(),
                store_id,
                competitor_id,
                product_id: Uuid::new_v4(),
                competitor_name: "Mouse".into(),
                competitor_url: "https://x.test/a".into(),
                last_price: Some(19.99),
                currency: "USD".into(),
                last_checked_at: ts(),
                created_at: ts(),
                updated_at: ts(),
            })
            .await
            .unwrap();

        store.wipe_staging(competitor_id).await.unwrap();

        let rows = store.confirmed_matches(store_id, competitor_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_price, Some(19.99));
        assert_eq!(rows[0].competitor_url, "https://x.test/a");
    }
}
