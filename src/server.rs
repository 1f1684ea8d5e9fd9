use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::assist::{AssistClient, AssistError};
use crate::audience::AudienceSelector;
use crate::campaign::{CampaignCreateError, CampaignStore};
use crate::comm_log::CommLogStore;
use crate::config::Config;
use crate::customer::{CustomerError, CustomerStore, NewCustomer};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::reconcile::{Receipt, ReceiptReconciler, ReconcileError};
use crate::rules::RuleNode;
use crate::store::Database;
use crate::vendor::SimulatedVendor;

pub struct AppState {
    pub customers: CustomerStore,
    pub campaigns: CampaignStore,
    pub logs: CommLogStore,
    pub audience: AudienceSelector,
    pub dispatcher: Dispatcher,
    pub reconciler: ReceiptReconciler,
    pub assist: AssistClient,
    pub api_key: Option<String>,
}

impl AppState {
    /// Wire every component against one database handle.
    pub fn new(config: &Config, db: Database) -> Self {
        let customers = CustomerStore::new(db.clone());
        let campaigns = CampaignStore::new(db.clone());
        let logs = CommLogStore::new(db);
        let audience = AudienceSelector::new(customers.clone(), config.audience_page_size);
        let reconciler = ReceiptReconciler::new(logs.clone(), campaigns.clone());
        let vendor = Arc::new(SimulatedVendor::new(config.vendor.clone()));
        let dispatcher = Dispatcher::new(
            campaigns.clone(),
            logs.clone(),
            audience.clone(),
            vendor,
            reconciler.clone(),
        );
        AppState {
            customers,
            campaigns,
            logs,
            audience,
            dispatcher,
            reconciler,
            assist: AssistClient::new(config.assist.clone()),
            api_key: config.api_key.clone(),
        }
    }
}

fn json_error(status: StatusCode, message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message })))
}

/// Routes the vendor cannot authenticate against: its receipt callback,
/// plus the health probe.
fn is_auth_exempt(path: &str) -> bool {
    path == "/health" || path == "/api/receipt"
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let expected = match &state.api_key {
        Some(key) => key,
        None => return next.run(request).await,
    };
    if is_auth_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    match bearer.or(header_key) {
        Some(provided) if provided == expected => next.run(request).await,
        Some(_) => json_error(StatusCode::FORBIDDEN, "invalid API key").into_response(),
        None => json_error(StatusCode::UNAUTHORIZED, "authentication required").into_response(),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/receipt", post(handle_receipt))
        .route("/api/campaigns", post(handle_create_campaign).get(handle_list_campaigns))
        .route("/api/campaigns/preview", post(handle_preview_audience))
        .route("/api/campaigns/{id}", get(handle_get_campaign))
        .route("/api/campaigns/{id}/dispatch", post(handle_dispatch))
        .route("/api/customers", post(handle_create_customer).get(handle_list_customers))
        .route("/api/customers/bulk", post(handle_bulk_customers))
        .route(
            "/api/customers/{id}",
            get(handle_get_customer)
                .put(handle_update_customer)
                .delete(handle_delete_customer),
        )
        .route("/api/orders", post(handle_create_order))
        .route("/api/assist/rules", post(handle_assist_rules))
        .route("/api/assist/message", post(handle_assist_message))
        .fallback(handle_not_found)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(config: &Config, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    log::info!("listening on http://{}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to install ctrl-c handler: {e}");
    }
}

async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

async fn handle_health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

#[derive(Deserialize)]
struct ReceiptCallback {
    communication_id: String,
    #[serde(flatten)]
    receipt: Receipt,
}

/// Vendor receipt callback. Unauthenticated: the vendor cannot be required
/// to present internal credentials.
async fn handle_receipt(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReceiptCallback>,
) -> Response {
    match state.reconciler.reconcile(&body.communication_id, &body.receipt) {
        Ok(result) => (
            StatusCode::OK,
            Json(serde_json::json!({ "applied": result.applied })),
        )
            .into_response(),
        Err(ReconcileError::UnknownReceipt(id)) => {
            log::warn!("receipt for unknown communication {id}");
            json_error(StatusCode::NOT_FOUND, "unknown communication id").into_response()
        }
        Err(ReconcileError::NonTerminalStatus) => {
            json_error(StatusCode::BAD_REQUEST, "status must be 'sent' or 'failed'").into_response()
        }
        Err(ReconcileError::Storage(e)) => {
            log::error!("receipt reconciliation failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

#[derive(Deserialize)]
struct CreateCampaignRequest {
    name: String,
    /// Structured rule tree, or...
    rules: Option<serde_json::Value>,
    /// ...a natural-language description for the assist collaborator.
    audience_description: Option<String>,
    /// Literal template, or...
    message_template: Option<String>,
    /// ...a campaign goal for the assist collaborator.
    goal: Option<String>,
}

async fn handle_create_campaign(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateCampaignRequest>,
) -> Response {
    let rules: RuleNode = if let Some(value) = body.rules {
        match serde_json::from_value(value) {
            Ok(rules) => rules,
            Err(e) => {
                return json_error(StatusCode::BAD_REQUEST, &format!("invalid rules: {e}"))
                    .into_response()
            }
        }
    } else if let Some(description) = &body.audience_description {
        match state.assist.rules_from_description(description).await {
            Ok(rules) => rules,
            Err(AssistError::RuleGenerationFailed(reason)) => {
                return json_error(StatusCode::BAD_GATEWAY, &reason).into_response()
            }
        }
    } else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "either rules or audience_description is required",
        )
        .into_response();
    };

    let template = if let Some(template) = body.message_template {
        template
    } else if let Some(goal) = &body.goal {
        state.assist.message_for_goal(goal).await
    } else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "either message_template or goal is required",
        )
        .into_response();
    };

    match state.campaigns.create(&body.name, &rules, &template) {
        Ok(campaign) => (StatusCode::CREATED, Json(campaign)).into_response(),
        Err(CampaignCreateError::InvalidRules(e)) => {
            json_error(StatusCode::BAD_REQUEST, &e.to_string()).into_response()
        }
        Err(CampaignCreateError::Storage(e)) => {
            log::error!("campaign creation failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn handle_list_campaigns(State(state): State<Arc<AppState>>) -> Response {
    match state.campaigns.list() {
        Ok(campaigns) => Json(serde_json::json!({ "campaigns": campaigns })).into_response(),
        Err(e) => {
            log::error!("campaign listing failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn handle_get_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.campaigns.get(id) {
        Ok(Some(campaign)) => Json(campaign).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "campaign not found").into_response(),
        Err(e) => {
            log::error!("campaign lookup failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn handle_dispatch(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.dispatcher.dispatch(id).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(DispatchError::CampaignNotFound(_)) => {
            json_error(StatusCode::NOT_FOUND, "campaign not found").into_response()
        }
        Err(DispatchError::InvalidRules(_, e)) => {
            json_error(StatusCode::BAD_REQUEST, &e.to_string()).into_response()
        }
        Err(DispatchError::Storage(e)) => {
            log::error!("dispatch failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn handle_preview_audience(
    State(state): State<Arc<AppState>>,
    Json(value): Json<serde_json::Value>,
) -> Response {
    let rules: RuleNode = match serde_json::from_value(value) {
        Ok(rules) => rules,
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("invalid rules: {e}"))
                .into_response()
        }
    };
    if let Err(e) = rules.validate() {
        return json_error(StatusCode::BAD_REQUEST, &e.to_string()).into_response();
    }
    match state.audience.preview_count(&rules) {
        Ok(matched) => Json(serde_json::json!({ "matched": matched })).into_response(),
        Err(e) => {
            log::error!("audience preview failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn handle_create_customer(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewCustomer>,
) -> Response {
    match state.customers.create(&body) {
        Ok(customer) => (StatusCode::CREATED, Json(customer)).into_response(),
        Err(CustomerError::DuplicateEmail) => {
            json_error(StatusCode::CONFLICT, "customer with this email already exists")
                .into_response()
        }
        Err(CustomerError::Invalid(reason)) => {
            json_error(StatusCode::BAD_REQUEST, &reason).into_response()
        }
        Err(CustomerError::Storage(e)) => {
            log::error!("customer creation failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_limit() -> u32 {
    50
}

async fn handle_list_customers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Response {
    match state.customers.list(params.limit.min(500), params.offset) {
        Ok(customers) => Json(serde_json::json!({ "customers": customers })).into_response(),
        Err(e) => {
            log::error!("customer listing failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn handle_get_customer(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.customers.get(id) {
        Ok(Some(customer)) => Json(customer).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "customer not found").into_response(),
        Err(e) => {
            log::error!("customer lookup failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn handle_update_customer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<NewCustomer>,
) -> Response {
    match state.customers.update(id, &body) {
        Ok(Some(customer)) => Json(customer).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "customer not found").into_response(),
        Err(CustomerError::DuplicateEmail) => {
            json_error(StatusCode::CONFLICT, "customer with this email already exists")
                .into_response()
        }
        Err(CustomerError::Invalid(reason)) => {
            json_error(StatusCode::BAD_REQUEST, &reason).into_response()
        }
        Err(CustomerError::Storage(e)) => {
            log::error!("customer update failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn handle_delete_customer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.customers.delete(id) {
        Ok(true) => Json(serde_json::json!({ "deleted": true })).into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "customer not found").into_response(),
        Err(e) => {
            log::error!("customer deletion failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

#[derive(Deserialize)]
struct BulkCustomers {
    customers: Vec<NewCustomer>,
}

async fn handle_bulk_customers(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BulkCustomers>,
) -> Response {
    if body.customers.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "no customer data supplied").into_response();
    }
    match state.customers.bulk_import(&body.customers) {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => {
            log::error!("bulk import failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

#[derive(Deserialize)]
struct AssistRulesRequest {
    description: String,
}

/// Turn a natural-language audience description into a rule tree without
/// creating a campaign, so clients can show the rules before committing.
async fn handle_assist_rules(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AssistRulesRequest>,
) -> Response {
    match state.assist.rules_from_description(&body.description).await {
        Ok(rules) => Json(serde_json::json!({ "rules": rules })).into_response(),
        Err(AssistError::RuleGenerationFailed(reason)) => {
            json_error(StatusCode::BAD_GATEWAY, &reason).into_response()
        }
    }
}

#[derive(Deserialize)]
struct AssistMessageRequest {
    goal: String,
}

async fn handle_assist_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AssistMessageRequest>,
) -> Response {
    let message = state.assist.message_for_goal(&body.goal).await;
    Json(serde_json::json!({ "message": message })).into_response()
}

#[derive(Deserialize)]
struct NewOrder {
    customer_id: i64,
    amount: f64,
}

async fn handle_create_order(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewOrder>,
) -> Response {
    match state.customers.record_order(body.customer_id, body.amount) {
        Ok(true) => (StatusCode::OK, Json(serde_json::json!({ "recorded": true }))).into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "customer not found").into_response(),
        Err(e) => {
            log::error!("order recording failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}
