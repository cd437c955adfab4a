use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::error::StoreError;

/// The metadata half of every API response.
#[derive(Debug, Serialize)]
pub struct EnvelopeMetadata {
    pub current_route: &'static str,
    pub data_points: usize,
    pub info: &'static str,
    pub params: HashMap<&'static str, String>,
    pub format: &'static str,
}

/// Standard response envelope: metadata nested alongside the result rows.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub metadata: EnvelopeMetadata,
    pub results: Vec<T>,
}

impl<T> Envelope<T> {
    pub fn new(route: &'static str, info: &'static str, results: Vec<T>) -> Self {
        Self::with_params(route, info, HashMap::new(), results)
    }

    pub fn with_params(
        route: &'static str,
        info: &'static str,
        params: HashMap<&'static str, String>,
        results: Vec<T>,
    ) -> Self {
        Envelope {
            metadata: EnvelopeMetadata {
                current_route: route,
                data_points: results.len(),
                info,
                params,
                format: "json",
            },
            results,
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing required parameter: {0}")]
    MissingParam(&'static str),
    #[error("storage query failed: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::MissingParam(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        }
        .into_response()
    }
}
