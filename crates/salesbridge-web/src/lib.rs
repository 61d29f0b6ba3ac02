//! Axum webhook receivers feeding the reconciliation engine.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use salesbridge_core::{AppointmentGroupEvent, CrmAppointmentEvent, Guest, InvoiceEvent};
use salesbridge_sync::{GuestPush, Reconciler, SyncError, SyncErrorKind};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "salesbridge-web";

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/webhooks/zenoti/invoice", post(invoice_handler))
        .route(
            "/webhooks/zenoti/appointment-group",
            post(appointment_group_handler),
        )
        .route("/webhooks/zenoti/guest-created", post(guest_created_handler))
        .route("/webhooks/zenoti/guest-updated", post(guest_updated_handler))
        .route("/webhooks/crm/appointment", post(crm_appointment_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "webhook server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// A sync error rendered as a JSON response.
struct WebhookError(SyncError);

impl From<SyncError> for WebhookError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::UnknownLocation(_)
            | SyncError::UnknownCalendar(_)
            | SyncError::GuestNotFound(_) => StatusCode::NOT_FOUND,
            err => match err.kind() {
                SyncErrorKind::InsufficientIdentity => StatusCode::UNPROCESSABLE_ENTITY,
                SyncErrorKind::Api(_) => StatusCode::BAD_GATEWAY,
                SyncErrorKind::Persistence | SyncErrorKind::Config => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        };
        warn!(status = status.as_u16(), error = %self.0, "webhook rejected");
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type WebhookResult = Result<Json<Value>, WebhookError>;

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn invoice_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<InvoiceEvent>,
) -> WebhookResult {
    let registered = state.reconciler.handle_invoice(event).await?;
    Ok(Json(json!({ "registered": registered })))
}

async fn appointment_group_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<AppointmentGroupEvent>,
) -> WebhookResult {
    let registered = state.reconciler.handle_appointment_group(event).await?;
    Ok(Json(json!({ "registered": registered })))
}

fn guest_push_body(push: GuestPush) -> Value {
    match push {
        GuestPush::Created(id) => json!({ "result": "created", "contact_id": id }),
        GuestPush::AlreadyPresent(id) => json!({ "result": "already_present", "contact_id": id }),
        GuestPush::Updated(id) => json!({ "result": "updated", "contact_id": id }),
        GuestPush::NoMatch => json!({ "result": "no_match" }),
    }
}

async fn guest_created_handler(
    State(state): State<Arc<AppState>>,
    Json(guest): Json<Guest>,
) -> WebhookResult {
    let push = state.reconciler.handle_guest(guest, false).await?;
    Ok(Json(guest_push_body(push)))
}

async fn guest_updated_handler(
    State(state): State<Arc<AppState>>,
    Json(guest): Json<Guest>,
) -> WebhookResult {
    let push = state.reconciler.handle_guest(guest, true).await?;
    Ok(Json(guest_push_body(push)))
}

async fn crm_appointment_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<CrmAppointmentEvent>,
) -> WebhookResult {
    let outcome = state.reconciler.handle_crm_appointment(event).await?;
    Ok(Json(json!({
        "booking_id": outcome.booking_id,
        "guest_id": outcome.guest_id,
        "invoice_id": outcome.reservation.invoice_id,
    })))
}
