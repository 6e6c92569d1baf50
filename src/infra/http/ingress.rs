use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;
use serde_json::json;
use subsocket_wire::{ErrorBody, InitRequest, MutationRequest, SUBSOCKET_HEADER, event_from_path};
use tracing::debug;

use super::HttpState;
use crate::application::dispatcher::MutationOutcome;
use crate::application::error::{ErrorReport, HttpError};
use crate::domain::SubsocketError;

const INIT_SEGMENT: &str = "init";
const INVALID_SUBSOCKET: &str = "Invalid subsocket";

/// `POST /{namespace}/init` and `POST /{namespace}/{*event}`.
pub(super) async fn handle_post(
    State(state): State<HttpState>,
    Path((namespace, tail)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = if tail.trim_matches('/') == INIT_SEGMENT {
        init(&state, &namespace, &headers, &body).await
    } else {
        mutate(&state, &namespace, &tail, &body).await
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

async fn init(
    state: &HttpState,
    namespace: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, HttpError> {
    const SOURCE: &str = "infra::http::ingress::init";

    let Some(ns) = state.registry.lookup(namespace) else {
        return Err(HttpError::from(SubsocketError::UnknownNamespace {
            name: namespace.to_string(),
        }));
    };

    let claimed = headers
        .get(SUBSOCKET_HEADER)
        .and_then(|value| value.to_str().ok());
    if claimed != Some(namespace) {
        let mut response = (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: INVALID_SUBSOCKET.to_string(),
            }),
        )
            .into_response();
        ErrorReport::from_message(
            SOURCE,
            StatusCode::BAD_REQUEST,
            format!("`{SUBSOCKET_HEADER}` header {claimed:?} does not name `{namespace}`"),
        )
        .attach(&mut response);
        return Ok(response);
    }

    let request: InitRequest = parse_body(SOURCE, body)?;
    let value = ns
        .init_snapshot(request.criteria_list.as_deref())
        .await
        .map_err(|err| {
            HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &err,
            )
        })?;
    Ok((StatusCode::OK, Json(value)).into_response())
}

async fn mutate(
    state: &HttpState,
    namespace: &str,
    tail: &str,
    body: &Bytes,
) -> Result<Response, HttpError> {
    const SOURCE: &str = "infra::http::ingress::mutate";

    let Some(event) = event_from_path(tail) else {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Unknown event",
            "empty event path",
        ));
    };
    let Some(ns) = state.registry.lookup(namespace) else {
        return Err(HttpError::from(SubsocketError::UnknownNamespace {
            name: namespace.to_string(),
        }));
    };

    let request: MutationRequest = parse_body(SOURCE, body)?;
    match ns.publish(&event, &request.criteria, request.data).await? {
        MutationOutcome::Applied { .. } => Ok(empty_object(StatusCode::OK)),
        MutationOutcome::Rejected(reason) => {
            debug!(event = %reason.event, reason = %reason.reason, "HTTP mutation rejected");
            let status = StatusCode::from_u16(reason.status_code).unwrap_or(StatusCode::BAD_REQUEST);
            let mut response = empty_object(status);
            ErrorReport::from_message(SOURCE, status, format!("{}: {}", reason.event, reason.reason))
                .attach(&mut response);
            Ok(response)
        }
    }
}

fn empty_object(status: StatusCode) -> Response {
    (status, Json(json!({}))).into_response()
}

/// An empty body reads as the default request.
fn parse_body<T>(source: &'static str, body: &Bytes) -> Result<T, HttpError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice::<T>(body).map_err(|err| {
        HttpError::from_error(source, StatusCode::BAD_REQUEST, "Invalid request body", &err)
    })
}
