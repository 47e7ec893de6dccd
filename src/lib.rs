pub mod artifact;
pub mod border;
pub mod database;
pub mod generator;
pub mod geocoder;
pub mod kdbush;
pub mod models;
pub mod osm;
pub mod polygon;

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::geocoder::RGeocoder;
use crate::models::Info;

/// Batch requests are capped at roughly 32 MB of JSON body.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub geocoder: Arc<RGeocoder>,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/rgeocode/address/:lat/:lon", get(address_handler))
        .route(
            "/rgeocode/multiaddress",
            get(multi_address_handler).post(multi_address_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

/// `200` with the address record, `204` when nothing is close enough. A
/// non-numeric path segment is rejected with `400` before this runs.
async fn address_handler(
    State(state): State<AppState>,
    Path((lat, lon)): Path<(f64, f64)>,
) -> Response {
    match state.geocoder.find(lat, lon) {
        Some(info) => (StatusCode::OK, Json(info)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Batch lookup: `[[lat, lon], …]` in, one `Info` per input coordinate out,
/// misses filled with an empty record so indices line up.
async fn multi_address_handler(
    State(state): State<AppState>,
    Json(coordinates): Json<Vec<[f64; 2]>>,
) -> impl IntoResponse {
    let results: Vec<Info> = coordinates
        .iter()
        .map(|&[lat, lon]| state.geocoder.find(lat, lon).unwrap_or_default())
        .collect();
    Json(results)
}
