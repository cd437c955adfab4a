use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::api::{ApiError, Envelope};
use crate::store::{BoroughSummary, CuisineCount, CuisineShare, MapRow, Store};

pub const MAP_ROUTE: &str = "/api/v1/map";
pub const TOP_CUISINES_ROUTE: &str = "/api/v1/top-cuisines";
pub const CUISINE_DISTRIBUTIONS_ROUTE: &str = "/api/v1/cuisine-distributions";
pub const BOROUGH_SUMMARIES_ROUTE: &str = "/api/v1/borough-summaries";

pub fn router(store: Store) -> Router {
    Router::new()
        .route("/", get(index))
        .route(MAP_ROUTE, get(map))
        .route(TOP_CUISINES_ROUTE, get(top_cuisines))
        .route(CUISINE_DISTRIBUTIONS_ROUTE, get(cuisine_distributions))
        .route(BOROUGH_SUMMARIES_ROUTE, get(borough_summaries))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

async fn index() -> &'static str {
    "tastemap"
}

/// Restaurant markers with details for the interactive map.
async fn map(State(store): State<Store>) -> Result<Json<Envelope<MapRow>>, ApiError> {
    let rows = store.map_rows().await?;
    Ok(Json(Envelope::new(
        MAP_ROUTE,
        "Restaurant details for the interactive map.",
        rows,
    )))
}

#[derive(Debug, Deserialize)]
struct TopCuisinesQuery {
    borough: Option<String>,
}

/// Aggregated cuisine counts for one borough, most common first.
async fn top_cuisines(
    State(store): State<Store>,
    Query(query): Query<TopCuisinesQuery>,
) -> Result<Json<Envelope<CuisineCount>>, ApiError> {
    let borough = query.borough.ok_or(ApiError::MissingParam("borough"))?;
    let rows = store.top_cuisines(&borough).await?;
    let params = HashMap::from([("borough", borough)]);
    Ok(Json(Envelope::with_params(
        TOP_CUISINES_ROUTE,
        "Cuisine counts for one borough, most common first.",
        params,
        rows,
    )))
}

/// Citywide percentage distribution of cuisines.
async fn cuisine_distributions(
    State(store): State<Store>,
) -> Result<Json<Envelope<CuisineShare>>, ApiError> {
    let rows = store.cuisine_distribution().await?;
    Ok(Json(Envelope::new(
        CUISINE_DISTRIBUTIONS_ROUTE,
        "Citywide percentage distribution of cuisines.",
        rows,
    )))
}

/// Restaurant count and population summary per borough.
async fn borough_summaries(
    State(store): State<Store>,
) -> Result<Json<Envelope<BoroughSummary>>, ApiError> {
    let rows = store.borough_summaries().await?;
    Ok(Json(Envelope::new(
        BOROUGH_SUMMARIES_ROUTE,
        "Restaurant count and population per borough.",
        rows,
    )))
}
