//! HTTP broker surface.
//!
//! All bodies are raw bytes. Handlers that find nothing to serve release the
//! state lock and wait on the notify with a 500 ms poll fallback, retrying
//! until data arrives or the client disconnects; requests arriving before
//! their prerequisites block the same way instead of erroring.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use advtrain_proto::wire;

use crate::error::BrokerError;
use crate::queue::SubmitOutcome;
use crate::state::ServerState;

const NOT_READY_POLL: Duration = Duration::from_millis(500);

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(wire::EP_DATASET, post(post_dataset))
        .route(wire::EP_DATALOADER, post(post_dataloader))
        .route(wire::EP_ATTACK, get(get_attack).post(post_attack))
        .route(wire::EP_MODEL, get(get_model).post(post_model))
        .route(wire::EP_MODEL_STATE, get(get_model_state).post(post_model_state))
        .route(wire::EP_PARAMETERS, post(post_parameters))
        .route(wire::EP_RESET, post(post_reset))
        .route(wire::EP_NUM_BATCHES, get(get_num_batches))
        .route(wire::EP_IDS, get(get_ids))
        .route(wire::EP_CLEAN_BATCH, get(get_clean_batch))
        .route(wire::EP_ADV_BATCH, get(get_adv_batch).post(post_adv_batch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

struct ApiError(BrokerError);

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_bad_request() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        tracing::error!(error = %self.0, %status, "request failed");
        (status, self.0.to_string()).into_response()
    }
}

/// Parks the handler until the next state change, or 500 ms, whichever
/// comes first. Callers loop around this and re-check under the lock.
async fn wait_for_change(state: &ServerState) {
    let _ = tokio::time::timeout(NOT_READY_POLL, state.notify.notified()).await;
}

// ---- setup ----

async fn post_dataset(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<(), ApiError> {
    state.core.lock().install_dataset(&body, &state.registries)?;
    tracing::info!("dataset installed; batch state cleared");
    state.notify.notify_waiters();
    Ok(())
}

async fn post_dataloader(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<(), ApiError> {
    loop {
        let installed = state
            .core
            .lock()
            .try_install_dataloader(&body, &state.registries)?;
        if installed {
            tracing::info!("dataloader installed; free queue primed");
            state.notify.notify_waiters();
            return Ok(());
        }
        // No dataset yet; block rather than error.
        wait_for_change(&state).await;
    }
}

async fn post_attack(State(state): State<Arc<ServerState>>, body: Bytes) -> Result<(), ApiError> {
    let attack_id = state.core.lock().install_attack(body);
    tracing::info!(attack_id, "attack updated; recycled in-flight batches");
    state.notify.notify_waiters();
    Ok(())
}

async fn post_model(State(state): State<Arc<ServerState>>, body: Bytes) -> Result<(), ApiError> {
    let (model_arch_id, new_architecture) = state.core.lock().install_model(&body)?;
    tracing::info!(model_arch_id, new_architecture, "model updated");
    state.notify.notify_waiters();
    Ok(())
}

async fn post_model_state(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<(), ApiError> {
    let model_state_id = state.core.lock().install_model_state(body);
    tracing::debug!(model_state_id, "model state updated");
    state.notify.notify_waiters();
    Ok(())
}

async fn post_parameters(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<(), ApiError> {
    let params = wire::Parameters::decode(&body).map_err(BrokerError::from)?;
    state.core.lock().set_parameters(params);
    tracing::info!(params.max_patience, params.queue_limit, "parameters updated");
    state.notify.notify_waiters();
    Ok(())
}

async fn post_reset(State(state): State<Arc<ServerState>>) -> Result<(), ApiError> {
    state.core.lock().reset();
    tracing::info!("broker state reset");
    state.notify.notify_waiters();
    Ok(())
}

// ---- reads ----

async fn get_attack(State(state): State<Arc<ServerState>>) -> Bytes {
    loop {
        if let Some(bytes) = state.core.lock().attack() {
            return bytes;
        }
        wait_for_change(&state).await;
    }
}

async fn get_model(State(state): State<Arc<ServerState>>) -> Bytes {
    loop {
        if let Some(bytes) = state.core.lock().model() {
            return bytes;
        }
        wait_for_change(&state).await;
    }
}

async fn get_model_state(State(state): State<Arc<ServerState>>) -> Bytes {
    loop {
        if let Some(bytes) = state.core.lock().model_state() {
            return bytes;
        }
        wait_for_change(&state).await;
    }
}

async fn get_num_batches(State(state): State<Arc<ServerState>>) -> Bytes {
    loop {
        if let Some(n) = state.core.lock().num_batches() {
            return Bytes::copy_from_slice(&n.to_be_bytes());
        }
        wait_for_change(&state).await;
    }
}

async fn get_ids(State(state): State<Arc<ServerState>>) -> Bytes {
    let triple = state.core.lock().version_triple();
    Bytes::copy_from_slice(&triple.encode())
}

// ---- batch flow ----

async fn get_clean_batch(State(state): State<Arc<ServerState>>) -> Bytes {
    loop {
        if let Some((id, bytes)) = state.core.lock().claim_clean() {
            tracing::debug!(id, "dispatched clean batch");
            return Bytes::from(wire::join_id_prefix(id, &bytes));
        }
        wait_for_change(&state).await;
    }
}

async fn post_adv_batch(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<(), ApiError> {
    let (id, payload) = wire::split_id_prefix(&body).map_err(BrokerError::from)?;
    let payload = body.slice_ref(payload);
    let outcome = state.core.lock().submit_adv(id, payload)?;
    match outcome {
        SubmitOutcome::Accepted => {
            tracing::debug!(id, "accepted adversarial batch");
            state.notify.notify_waiters();
        }
        SubmitOutcome::Stale | SubmitOutcome::Dropped => {
            tracing::debug!(id, ?outcome, "recycled adversarial batch to free");
            state.notify.notify_waiters();
        }
        SubmitOutcome::Unknown => {
            tracing::debug!(id, "ignored submission for unknown batch id");
        }
    }
    Ok(())
}

async fn get_adv_batch(State(state): State<Arc<ServerState>>) -> Response {
    loop {
        if let Some((id, bytes, dispatched_at)) = state.core.lock().take_done() {
            tracing::debug!(id, "delivered adversarial batch");
            let extra = serde_json::json!({
                "batch_id": id,
                "dispatch_model_state_id": dispatched_at,
            });
            return ([(wire::EXTRA_DATA_HEADER, extra.to_string())], bytes).into_response();
        }
        wait_for_change(&state).await;
    }
}
