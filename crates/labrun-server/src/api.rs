//! REST routes for systems, credentials and playbooks.

use axum::extract::{FromRequest, Path, State};
use axum::http::StatusCode;
use axum::routing::{any, get};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::errors::{ApiError, ApiResult};
use crate::gateway::socket_handler;
use crate::models::{
    CreateSystemRequest, CredentialRecord, CredentialRequest, DeleteByIdRequest,
    DeleteByLabRequest, HealthResponse, PlaybookRecord, PlaybookRequest, SystemRecord,
    UpsertSystemRequest,
};
use crate::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/systems",
            get(list_systems)
                .post(create_system)
                .put(upsert_system)
                .delete(delete_system),
        )
        .route("/api/systems/{id}", get(get_system))
        .route("/api/system", get(legacy_inventory))
        .route(
            "/api/credentials",
            get(list_credentials)
                .post(create_credential)
                .patch(update_credential)
                .delete(delete_credential),
        )
        .route(
            "/api/playbooks",
            get(list_playbooks)
                .post(create_playbook)
                .patch(update_playbook)
                .delete(delete_playbook),
        )
        .route("/api/socket", any(socket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.sessions().len(),
    })
}

/// JSON body whose rejections are reported as `{ "error": ... }`.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct ApiJson<T>(T);

fn required(value: &str, field: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::InvalidRequest(format!("{} is required", field)));
    }
    Ok(())
}

// =============================================================================
// Systems
// =============================================================================

async fn list_systems(State(state): State<AppState>) -> ApiResult<Json<Vec<SystemRecord>>> {
    let systems = state.store.blocking(|store| store.list_systems()).await?;
    Ok(Json(systems))
}

async fn get_system(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SystemRecord>> {
    let system = state.store.blocking(move |store| store.get_system(&id)).await?;
    Ok(Json(system))
}

async fn create_system(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateSystemRequest>,
) -> ApiResult<(StatusCode, Json<SystemRecord>)> {
    let (Some(lab), Some(address)) = (request.lab, request.address) else {
        return Err(ApiError::InvalidRequest(
            "lab and address are required".into(),
        ));
    };
    required(&lab, "lab")?;
    required(&address, "address")?;

    let system = SystemRecord {
        id: Uuid::new_v4().to_string(),
        lab,
        address,
    };
    let system = state
        .store
        .blocking(move |store| store.create_system(&system))
        .await?;
    info!(id = %system.id, lab = %system.lab, "system created");
    Ok((StatusCode::CREATED, Json(system)))
}

async fn upsert_system(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<UpsertSystemRequest>,
) -> ApiResult<Json<SystemRecord>> {
    required(&request.id, "id")?;
    let system = SystemRecord {
        id: request.id,
        lab: request.lab,
        address: request.address,
    };
    let system = state
        .store
        .blocking(move |store| store.upsert_system(&system))
        .await?;
    Ok(Json(system))
}

async fn delete_system(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<DeleteByIdRequest>,
) -> ApiResult<Json<SystemRecord>> {
    let removed = state
        .store
        .blocking(move |store| store.delete_system(&request.id))
        .await?;
    info!(id = %removed.id, "system deleted");
    Ok(Json(removed))
}

/// Listing shape older dashboards still poll.
#[derive(Debug, Serialize)]
struct LegacyInventoryResponse {
    message: &'static str,
    timestamp: String,
    inventory: Vec<SystemRecord>,
}

async fn legacy_inventory(
    State(state): State<AppState>,
) -> ApiResult<Json<LegacyInventoryResponse>> {
    let inventory = state.store.blocking(|store| store.list_systems()).await?;
    Ok(Json(LegacyInventoryResponse {
        message: "Inventory fetched successfully",
        timestamp: Utc::now().to_rfc3339(),
        inventory,
    }))
}

// =============================================================================
// Credentials
// =============================================================================

async fn list_credentials(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<CredentialRecord>>> {
    let credentials = state.store.blocking(|store| store.list_credentials()).await?;
    Ok(Json(credentials))
}

fn seal_credential(state: &AppState, request: CredentialRequest) -> ApiResult<CredentialRecord> {
    required(&request.lab, "lab")?;
    required(&request.username, "username")?;
    required(&request.password, "password")?;
    Ok(CredentialRecord {
        id: request
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        lab: request.lab,
        username: request.username,
        password: state.vault.encrypt(&request.password)?,
    })
}

async fn create_credential(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CredentialRequest>,
) -> ApiResult<(StatusCode, Json<CredentialRecord>)> {
    let credential = seal_credential(&state, request)?;
    let credential = state
        .store
        .blocking(move |store| store.create_credential(&credential))
        .await?;
    info!(lab = %credential.lab, "credential created");
    Ok((StatusCode::CREATED, Json(credential)))
}

async fn update_credential(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CredentialRequest>,
) -> ApiResult<Json<CredentialRecord>> {
    let credential = seal_credential(&state, request)?;
    let credential = state
        .store
        .blocking(move |store| store.update_credential(&credential))
        .await?;
    info!(lab = %credential.lab, "credential updated");
    Ok(Json(credential))
}

async fn delete_credential(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<DeleteByLabRequest>,
) -> ApiResult<Json<CredentialRecord>> {
    let removed = state
        .store
        .blocking(move |store| store.delete_credential(&request.lab))
        .await?;
    info!(lab = %removed.lab, "credential deleted");
    Ok(Json(removed))
}

// =============================================================================
// Playbooks
// =============================================================================

async fn list_playbooks(State(state): State<AppState>) -> ApiResult<Json<Vec<PlaybookRecord>>> {
    let playbooks = state.store.blocking(|store| store.list_playbooks()).await?;
    Ok(Json(playbooks))
}

async fn create_playbook(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<PlaybookRequest>,
) -> ApiResult<(StatusCode, Json<PlaybookRecord>)> {
    required(&request.id, "id")?;
    required(&request.name, "name")?;
    let playbook = PlaybookRecord {
        id: request.id,
        name: request.name,
        content: request.content,
        created_at: Utc::now(),
    };
    let playbook = state
        .store
        .blocking(move |store| store.create_playbook(&playbook))
        .await?;
    info!(id = %playbook.id, "playbook created");
    Ok((StatusCode::CREATED, Json(playbook)))
}

async fn update_playbook(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<PlaybookRequest>,
) -> ApiResult<Json<PlaybookRecord>> {
    required(&request.id, "id")?;
    let playbook = state
        .store
        .blocking(move |store| store.update_playbook(&request.id, &request.name, &request.content))
        .await?;
    Ok(Json(playbook))
}

async fn delete_playbook(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<DeleteByIdRequest>,
) -> ApiResult<Json<PlaybookRecord>> {
    let removed = state
        .store
        .blocking(move |store| store.delete_playbook(&request.id))
        .await?;
    info!(id = %removed.id, "playbook deleted");
    Ok(Json(removed))
}
