pub mod connections;
pub mod health;
pub mod labs;
pub mod vms;
pub mod ws;

use crate::{api_docs::ApiDoc, state::AppState};
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub fn create_app(state: AppState) -> Router {
    // Browser consoles are served from a different origin during development.
    let cors = CorsLayer::permissive();

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(health::routes())
        .merge(labs::routes())
        .merge(vms::routes())
        .merge(connections::routes())
        .merge(ws::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
