use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::{delete, get, post}, Json, Router};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;

use crate::catalog::{CatalogSource, CatalogStore, LoadError, Product};
use crate::selection::{ResolvedSelection, SelectionSet};
use crate::session::{RoutineSession, SessionError, SessionSnapshot};
use crate::settings::AdvisorSettings;
use crate::storage::{KeyValueStore, SqliteKeyValueStore};
use crate::transport::{ChatTransport, WorkerClient};

/// Everything a client interacts with: one catalog, one selection, one
/// conversation.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogStore>,
    pub selection: Arc<Mutex<SelectionSet>>,
    pub session: Arc<RoutineSession>,
}

impl AppState {
    pub fn new(
        catalog: CatalogStore,
        selection: SelectionSet,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            catalog: Arc::new(catalog),
            selection: Arc::new(Mutex::new(selection)),
            session: Arc::new(RoutineSession::new(transport)),
        }
    }

    pub async fn from_settings(settings: &AdvisorSettings) -> anyhow::Result<Self> {
        let store: Arc<dyn KeyValueStore> =
            Arc::new(SqliteKeyValueStore::initialize(settings.database_url.clone()).await?);
        let selection = SelectionSet::restore(store).await;
        let transport =
            Arc::new(WorkerClient::new(&settings.chat_endpoint, settings.request_timeout())?);
        let catalog = CatalogStore::new(CatalogSource::parse(&settings.catalog_source));
        // A failed load is retried on the first catalog request.
        if let Err(e) = catalog.load().await {
            tracing::warn!(error = %e, "catalog not available at startup");
        }
        tracing::info!(
            selected = selection.len(),
            endpoint = %settings.chat_endpoint,
            "state initialised"
        );
        Ok(Self::new(catalog, selection, transport))
    }
}

#[derive(Debug)]
pub enum ApiError {
    Session(SessionError),
    Catalog(LoadError),
    Internal(anyhow::Error),
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self { ApiError::Session(e) }
}

impl From<LoadError> for ApiError {
    fn from(e: LoadError) -> Self { ApiError::Catalog(e) }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self { ApiError::Internal(e) }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            ApiError::Session(e) => {
                let (status, kind) = match e {
                    SessionError::NoSelection => (StatusCode::UNPROCESSABLE_ENTITY, "no_selection"),
                    SessionError::NotReady => (StatusCode::UNPROCESSABLE_ENTITY, "not_ready"),
                    SessionError::EmptyMessage => {
                        (StatusCode::UNPROCESSABLE_ENTITY, "empty_message")
                    }
                    SessionError::Busy => (StatusCode::CONFLICT, "busy"),
                    SessionError::Superseded => (StatusCode::CONFLICT, "superseded"),
                    SessionError::RoutineFailed(_) | SessionError::ReplyFailed(_) => {
                        (StatusCode::BAD_GATEWAY, "transport")
                    }
                };
                (status, kind, e.user_message().to_string())
            }
            ApiError::Catalog(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "catalog",
                "Products could not be loaded. Please try again later.".to_string(),
            ),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "Something went wrong. Please try again.".to_string(),
            ),
        };
        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }
        (status, Json(ErrorBody { error: kind.into(), message })).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ProductQuery {
    pub category: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProductCard {
    #[serde(flatten)]
    pub product: Product,
    pub selected: bool,
}

async fn list_products(
    State(state): State<AppState>,
    Query(q): Query<ProductQuery>,
) -> Result<Json<Vec<ProductCard>>, ApiError> {
    let products = state.catalog.filter(q.category.as_deref(), q.search.as_deref()).await?;
    let selection = state.selection.lock().await;
    let cards = products
        .into_iter()
        .map(|p| {
            let selected = selection.contains(&p.id);
            ProductCard { product: p, selected }
        })
        .collect();
    Ok(Json(cards))
}

async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let Some(product) = state.catalog.get(&id).await? else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let selected = state.selection.lock().await.contains(&product.id);
    Ok(Json(ProductCard { product, selected }).into_response())
}

async fn list_categories(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.catalog.categories().await?))
}

#[derive(Debug, Serialize)]
pub struct SelectionView {
    /// Raw ids as stored, including any the catalog no longer knows.
    pub ids: Vec<String>,
    #[serde(flatten)]
    pub resolved: ResolvedSelection,
}

async fn get_selection(State(state): State<AppState>) -> Result<Json<SelectionView>, ApiError> {
    let products = state.catalog.load().await?;
    let selection = state.selection.lock().await;
    Ok(Json(SelectionView {
        ids: selection.ids().to_vec(),
        resolved: selection.list(products),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToggleResponse {
    pub id: String,
    pub selected: bool,
}

async fn toggle_selection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ToggleResponse>, ApiError> {
    let selected = state.selection.lock().await.toggle(&id).await?;
    Ok(Json(ToggleResponse { id, selected }))
}

async fn remove_selection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.selection.lock().await.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_selection(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.selection.lock().await.clear().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoutineResponse {
    pub routine: String,
}

async fn generate_routine(
    State(state): State<AppState>,
) -> Result<Json<RoutineResponse>, ApiError> {
    let catalog = state.catalog.load().await?;
    let resolved = state.selection.lock().await.list(catalog);
    if resolved.dropped > 0 {
        tracing::warn!(dropped = resolved.dropped, "selected products missing from catalog");
    }
    let routine = state.session.generate(&resolved.products).await?;
    Ok(Json(RoutineResponse { routine }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
}

async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    match state.session.reply(&body.message).await {
        Ok(reply) => Ok(Json(ChatResponse { reply }).into_response()),
        Err(SessionError::EmptyMessage) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(e) => Err(e.into()),
    }
}

async fn get_session(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.session.snapshot())
}

async fn reset_session(State(state): State<AppState>) -> Json<SessionSnapshot> {
    state.session.reset();
    Json(state.session.snapshot())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/products", get(list_products))
        .route("/v1/products/:id", get(get_product))
        .route("/v1/categories", get(list_categories))
        .route("/v1/selection", get(get_selection).delete(clear_selection))
        .route("/v1/selection/:id", delete(remove_selection))
        .route("/v1/selection/:id/toggle", post(toggle_selection))
        .route("/v1/routine", post(generate_routine))
        .route("/v1/chat", post(chat))
        .route("/v1/session", get(get_session))
        .route("/v1/session/reset", post(reset_session))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
