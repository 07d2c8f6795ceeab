//! Axum JSON API over the discovery and matching engine.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pricewatch_core::{Competitor, ConfirmedMatch, MatchCandidate};
use pricewatch_engine::{maybe_build_scheduler, ConfirmSelection, Engine, EngineError};
use pricewatch_storage::Store;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub store: Arc<dyn Store>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, store: Arc<dyn Store>) -> Self {
        Self { engine, store }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoveryRunRequest {
    store_id: Uuid,
    competitor_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    store_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest {
    store_id: Uuid,
    selections: Vec<ConfirmSelection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TenantQuery {
    store_id: Uuid,
}

/// Candidate row as served to clients.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CandidateRow {
    competitor_item_id: Uuid,
    product_id: Uuid,
    score: i32,
    competitor_name: String,
    competitor_url: String,
    competitor_price: Option<f64>,
    currency: String,
}

impl From<MatchCandidate> for CandidateRow {
    fn from(c: MatchCandidate) -> Self {
        Self {
            competitor_item_id: c.competitor_item_id,
            product_id: c.product_id,
            score: c.score,
            competitor_name: c.competitor_name,
            competitor_url: c.competitor_url,
            competitor_price: c.competitor_price,
            currency: c.currency,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompetitorRow {
    id: Uuid,
    root_url: String,
    domain: String,
    status: String,
    failure_reason: Option<String>,
    last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<Competitor> for CompetitorRow {
    fn from(c: Competitor) -> Self {
        Self {
            id: c.id,
            root_url: c.root_url,
            domain: c.domain,
            status: c.status.as_str().to_string(),
            failure_reason: c.failure_reason,
            last_sync_at: c.last_sync_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmedRow {
    product_id: Uuid,
    competitor_name: String,
    competitor_url: String,
    last_price: Option<f64>,
    currency: String,
    last_checked_at: chrono::DateTime<chrono::Utc>,
}

impl From<ConfirmedMatch> for ConfirmedRow {
    fn from(m: ConfirmedMatch) -> Self {
        Self {
            product_id: m.product_id,
            competitor_name: m.competitor_name,
            competitor_url: m.competitor_url,
            last_price: m.last_price,
            currency: m.currency,
            last_checked_at: m.last_checked_at,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/discovery/run", post(discovery_run_handler))
        .route("/sync/{id}", post(sync_handler))
        .route("/competitors/{id}", get(competitor_handler))
        .route("/competitors/{id}/candidates", get(candidates_handler))
        .route("/competitors/{id}/matches", get(matches_handler))
        .route("/competitors/{id}/matches/confirm", post(confirm_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("PRICEWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let config = pricewatch_engine::EngineConfig::from_env();
    if let Some(scheduler) = maybe_build_scheduler(state.engine.clone(), &config).await? {
        scheduler.start().await?;
        info!(cron = %config.sync_cron, "background sync scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn discovery_run_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DiscoveryRunRequest>,
) -> Response {
    match state
        .engine
        .run_discovery(req.store_id, req.competitor_id)
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(competitor_id): AxumPath<Uuid>,
    Json(req): Json<SyncRequest>,
) -> Response {
    match state.engine.run_sync(req.store_id, competitor_id).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn competitor_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(competitor_id): AxumPath<Uuid>,
    Query(query): Query<TenantQuery>,
) -> Response {
    match state.store.competitor(query.store_id, competitor_id).await {
        Ok(Some(competitor)) => Json(CompetitorRow::from(competitor)).into_response(),
        Ok(None) => engine_error(EngineError::CompetitorNotFound),
        Err(err) => server_error(err.into()),
    }
}

async fn candidates_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(competitor_id): AxumPath<Uuid>,
    Query(query): Query<TenantQuery>,
) -> Response {
    match state.store.candidates(query.store_id, competitor_id).await {
        Ok(rows) => Json(rows.into_iter().map(CandidateRow::from).collect::<Vec<_>>())
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn matches_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(competitor_id): AxumPath<Uuid>,
    Query(query): Query<TenantQuery>,
) -> Response {
    match state
        .store
        .confirmed_matches(query.store_id, competitor_id)
        .await
    {
        Ok(rows) => Json(rows.into_iter().map(ConfirmedRow::from).collect::<Vec<_>>())
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(competitor_id): AxumPath<Uuid>,
    Json(req): Json<ConfirmRequest>,
) -> Response {
    match state
        .engine
        .confirm_matches(req.store_id, competitor_id, &req.selections)
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(err) => engine_error(err),
    }
}

fn engine_error(err: EngineError) -> Response {
    match err {
        EngineError::CompetitorNotFound => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "competitor not found"})),
        )
            .into_response(),
        EngineError::Validation(message) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"error": message})),
        )
            .into_response(),
        EngineError::Store(err) => server_error(err.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use pricewatch_core::{Competitor, CompetitorStatus, SellerProduct};
    use pricewatch_engine::{EngineSettings, PlanRegistry};
    use pricewatch_scrape::{CompetitorScraper, ScrapeLimits, TextSource};
    use pricewatch_storage::MemStore;
    use std::collections::HashMap;
    use tower::ServiceExt;

    struct StubSource {
        pages: HashMap<String, String>,
    }

    #[async_trait]
    impl TextSource for StubSource {
        async fn get(&self, url: &str) -> anyhow::Result<String> {
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no stub page for {url}"))
        }
    }

    async fn test_state(pages: HashMap<String, String>) -> (AppState, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        let scraper = CompetitorScraper::new(
            Arc::new(StubSource {
                pages: HashMap::new(),
            }),
            Arc::new(StubSource { pages }),
            ScrapeLimits::default(),
        );
        let engine = Arc::new(Engine::new(
            store.clone(),
            scraper,
            PlanRegistry::builtin("free"),
            EngineSettings::default(),
        ));
        (AppState::new(engine, store.clone()), store)
    }

    async fn seed_competitor(store: &MemStore, store_id: Uuid, root_url: &str) -> Uuid {
        let competitor_id = Uuid::new_v4();
        store
            .insert_competitor(Competitor {
                id: competitor_id,
                store_id,
                root_url: root_url.to_string(),
                domain: String::new(),
                status: CompetitorStatus::Pending,
                failure_reason: None,
                last_sync_at: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await;
        store.set_plan_tier(store_id, "starter").await;
        competitor_id
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn discovery_run_returns_report() {
        let root = "https://rival.example.com/shop";
        let mut pages = HashMap::new();
        pages.insert(
            root.to_string(),
            r#"<html><ul><li class="product"><h3><a href="/p/mouse">Wireless Mouse</a></h3><span class="price">$19.99</span></li></ul></html>"#.to_string(),
        );
        let (state, store) = test_state(pages).await;
        let store_id = Uuid::new_v4();
        let competitor_id = seed_competitor(&store, store_id, root).await;
        store
            .insert_product(SellerProduct {
                id: Uuid::new_v4(),
                store_id,
                name: "Wireless Mouse".into(),
                sku: None,
                price: Some(24.99),
            })
            .await;

        let resp = app(state)
            .oneshot(json_request(
                "POST",
                "/discovery/run",
                serde_json::json!({"storeId": store_id, "competitorId": competitor_id}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["productsScraped"], 1);
    }

    #[tokio::test]
    async fn discovery_run_unknown_competitor_is_404() {
        let (state, store) = test_state(HashMap::new()).await;
        let store_id = Uuid::new_v4();
        store.set_plan_tier(store_id, "starter").await;

        let resp = app(state)
            .oneshot(json_request(
                "POST",
                "/discovery/run",
                serde_json::json!({"storeId": store_id, "competitorId": Uuid::new_v4()}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn candidates_then_confirm_then_matches() {
        let root = "https://rival.example.com/shop";
        let mut pages = HashMap::new();
        pages.insert(
            root.to_string(),
            r#"<html><ul><li class="product"><h3><a href="/p/mouse">Wireless Mouse</a></h3><span class="price">$19.99</span></li></ul></html>"#.to_string(),
        );
        let (state, store) = test_state(pages).await;
        let store_id = Uuid::new_v4();
        let competitor_id = seed_competitor(&store, store_id, root).await;
        let product_id = Uuid::new_v4();
        store
            .insert_product(SellerProduct {
                id: product_id,
                store_id,
                name: "Wireless Mouse".into(),
                sku: None,
                price: Some(24.99),
            })
            .await;

        let api = app(state);
        let resp = api
            .clone()
            .oneshot(json_request(
                "POST",
                "/discovery/run",
                serde_json::json!({"storeId": store_id, "competitorId": competitor_id}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = api
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!(
                        "/competitors/{competitor_id}/candidates?storeId={store_id}"
                    ))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let candidates = json_body(resp).await;
        assert_eq!(candidates.as_array().unwrap().len(), 1);
        assert_eq!(candidates[0]["score"], 100);
        let item_id = candidates[0]["competitorItemId"].clone();

        let resp = api
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/competitors/{competitor_id}/matches/confirm"),
                serde_json::json!({
                    "storeId": store_id,
                    "selections": [{"competitorItemId": item_id, "productId": product_id}],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["inserted"], 1);

        let resp = api
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!(
                        "/competitors/{competitor_id}/matches?storeId={store_id}"
                    ))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let matches = json_body(resp).await;
        assert_eq!(matches.as_array().unwrap().len(), 1);
        assert_eq!(matches[0]["competitorName"], "Wireless Mouse");
        assert_eq!(matches[0]["lastPrice"], 19.99);
    }

    #[tokio::test]
    async fn confirm_with_stale_selection_is_422() {
        let (state, store) = test_state(HashMap::new()).await;
        let store_id = Uuid::new_v4();
        let competitor_id = seed_competitor(&store, store_id, "https://r.example.com").await;

        let resp = app(state)
            .oneshot(json_request(
                "POST",
                &format!("/competitors/{competitor_id}/matches/confirm"),
                serde_json::json!({
                    "storeId": store_id,
                    "selections": [{"competitorItemId": Uuid::new_v4(), "productId": Uuid::new_v4()}],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn sync_on_free_plan_reports_skip() {
        let (state, store) = test_state(HashMap::new()).await;
        let store_id = Uuid::new_v4();
        let competitor_id = seed_competitor(&store, store_id, "https://r.example.com").await;
        store.set_plan_tier(store_id, "free").await;

        let resp = app(state)
            .oneshot(json_request(
                "POST",
                &format!("/sync/{competitor_id}"),
                serde_json::json!({"storeId": store_id}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["skipped"], true);
    }

    #[tokio::test]
    async fn competitor_read_reports_status_and_reason() {
        let (state, store) = test_state(HashMap::new()).await;
        let store_id = Uuid::new_v4();
        let competitor_id =
            seed_competitor(&store, store_id, "https://unreachable.example.com/shop").await;

        let api = app(state);
        // An empty scrape marks the competitor failed with a reason.
        let resp = api
            .clone()
            .oneshot(json_request(
                "POST",
                "/discovery/run",
                serde_json::json!({"storeId": store_id, "competitorId": competitor_id}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = api
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/competitors/{competitor_id}?storeId={store_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "failed");
        assert_eq!(body["failureReason"], "no products found");
        assert_eq!(body["domain"], "unreachable.example.com");
    }
}
