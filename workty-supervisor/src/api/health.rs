use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::ApiContextRef;

pub fn router() -> Router<ApiContextRef> {
    Router::new().route("/", get(health))
}

/// Liveness probe payload; `tenants` lets operators confirm bootstrap
/// actually registered the accounts it loaded
#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    tenants: usize,
}

async fn health(State(context): State<ApiContextRef>) -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        tenants: context.locator.tenant_ids().len(),
    })
}
