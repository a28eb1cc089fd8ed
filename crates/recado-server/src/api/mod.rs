//! HTTP surface of the service.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::Router;
use recado_worker::{RecadoWorker, ViewerScope};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

mod conversations;
mod instances;
mod messages;
mod templates;
mod webhook;

/// Header naming the school a request acts for. Without it the caller is an admin.
pub const SCHOOL_HEADER: &str = "x-recado-school";

#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<RecadoWorker>,
}

impl AppState {
    pub fn new(worker: Arc<RecadoWorker>) -> Self {
        Self { worker }
    }
}

/// The actor behind a request, taken from [`SCHOOL_HEADER`].
pub struct Actor(pub ViewerScope);

impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let school = parts
            .headers
            .get(SCHOOL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        Ok(Self(match school {
            Some(id) => ViewerScope::School(id.to_string()),
            None => ViewerScope::Admin,
        }))
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/instance", post(instances::create))
        .route(
            "/instance/{id}",
            get(instances::get_for_school)
                .patch(instances::update)
                .delete(instances::deactivate),
        )
        .route("/instance/{id}/connect", post(instances::connect))
        .route("/instance/{id}/disconnect", post(instances::disconnect))
        .route("/instance/{id}/status", get(instances::poll_status))
        .route("/conversations/{viewer_id}", get(conversations::list))
        .route(
            "/conversations/{viewer_id}/{contact_id}/read",
            post(conversations::mark_read),
        )
        .route("/messages", post(messages::send))
        .route("/messages/{viewer_id}/{contact_id}", get(conversations::thread))
        .route(
            "/contacts/{id}",
            get(conversations::contacts).patch(conversations::link_contact),
        )
        .route("/templates", get(templates::list).post(templates::create))
        .route(
            "/templates/{id}",
            get(templates::get)
                .patch(templates::update)
                .delete(templates::deactivate),
        )
        .route("/templates/extract-variables", post(templates::extract_variables))
        .route("/templates/process", post(templates::process))
        .route("/templates/validate", post(templates::validate))
        .route("/webhook/{instance_id}", post(webhook::receive))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
