//! Request handlers.

use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

use crate::state::PacState;

/// Path the script is served on.
pub const PAC_PATH: &str = "/proxy.pac";

pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// Serves the current script on [`PAC_PATH`] (case-insensitive), 404 otherwise.
pub async fn serve_pac(State(state): State<PacState>, uri: Uri) -> Response {
    if !uri.path().eq_ignore_ascii_case(PAC_PATH) {
        return StatusCode::NOT_FOUND.into_response();
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, PAC_CONTENT_TYPE),
            (header::CACHE_CONTROL, NO_CACHE),
        ],
        state.script().as_str().to_owned(),
    )
        .into_response()
}
