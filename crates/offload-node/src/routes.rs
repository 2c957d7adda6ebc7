use std::{
    collections::HashMap,
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::headers::{authorization::Basic, Authorization, HeaderMapExt};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use offload_proto::{
    server_header, BundleDescription, ControlMessage, CreateBundleRequest, CreateWorkerRequest,
    FrameDecoder, Framed, HealthReport, NodeIdentity, BASIC_REALM, COMPRESSION_NONE,
    WORKER_ID_HEADER,
};
use tracing::{debug, warn};

use crate::{workers::EventReader, NodeError, NodeState};

pub(crate) fn router(state: NodeState) -> Router {
    Router::new()
        .route("/", get(identity))
        .route("/health", get(health))
        .route("/bundles/create", post(bundle_create))
        .route("/bundles/{hash}", get(bundle_describe))
        .route("/bundles/{hash}/data", post(bundle_data))
        .route("/workers", get(list_workers))
        .route("/worker", post(create_worker))
        .route("/worker/{id}/streams-pipe", get(attach_stream).post(control_stream))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

/// Per-request failure mapped onto an HTTP status.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<NodeError> for ApiError {
    fn from(error: NodeError) -> Self {
        let status = match &error {
            NodeError::InvalidFingerprint { .. } => StatusCode::BAD_REQUEST,
            NodeError::NotReserved { .. } | NodeError::UnknownWorker { .. } => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

async fn require_auth(State(state): State<NodeState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .typed_get::<Authorization<Basic>>()
        .map(|auth| state.credentials().matches(auth.username(), auth.password()))
        .unwrap_or(false);
    if authorized {
        return next.run(request).await;
    }

    let mut response = StatusCode::UNAUTHORIZED.into_response();
    let challenge = format!("Basic realm=\"{BASIC_REALM}\"");
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_str(&challenge).unwrap_or_else(|_| HeaderValue::from_static("Basic")),
    );
    response
}

async fn identity(State(state): State<NodeState>) -> Response {
    let mut response = Json(NodeIdentity {
        name: state.name().to_string(),
        node_version: state.version().to_string(),
    })
    .into_response();
    let value = HeaderValue::from_str(&server_header(state.version()))
        .unwrap_or_else(|_| HeaderValue::from_static("offload"));
    response.headers_mut().insert(header::SERVER, value);
    response
}

async fn health(State(state): State<NodeState>) -> Json<HealthReport> {
    Json(HealthReport {
        workers_running: state.workers().running_count(),
        cpu_usage: state.cpu().sample(),
    })
}

async fn bundle_create(
    State(state): State<NodeState>,
    Json(request): Json<CreateBundleRequest>,
) -> Result<StatusCode, ApiError> {
    state.bundles().reserve(&request.hash)?;
    Ok(StatusCode::CREATED)
}

async fn bundle_describe(
    State(state): State<NodeState>,
    Path(hash): Path<String>,
) -> Result<Json<BundleDescription>, ApiError> {
    match state.bundles().describe(&hash).await? {
        Some(description) => Ok(Json(description)),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "unknown bundle")),
    }
}

async fn bundle_data(
    State(state): State<NodeState>,
    Path(hash): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Result<StatusCode, ApiError> {
    if let Some(compression) = params.get("compression") {
        // Future codecs are refused outright rather than guessed at.
        if compression != COMPRESSION_NONE {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("unrecognized compression `{compression}`"),
            ));
        }
    }

    let binary = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/octet-stream"))
        .unwrap_or(false);
    if !binary {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "bundle body must be binary",
        ));
    }

    let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|error| ApiError::new(StatusCode::BAD_REQUEST, error.to_string()))?;
    state.bundles().put(&hash, &bytes).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_workers(State(state): State<NodeState>) -> Json<Vec<String>> {
    Json(state.workers().live_ids())
}

async fn create_worker(
    State(state): State<NodeState>,
    Json(request): Json<CreateWorkerRequest>,
) -> Result<Response, ApiError> {
    if !state.bundles().contains(&request.bundle_hash).await? {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("unknown bundle `{}`", request.bundle_hash),
        ));
    }

    let artifact = state.bundles().artifact_path(&request.bundle_hash);
    let (entry, reader) = state
        .workers()
        .create(
            state.host(),
            artifact,
            request.extra_data,
            request.bundle_hash,
            request.exit_on_request_end,
        )
        .await?;

    let mut response = Response::new(Body::from_stream(EventBody { reader }));
    let id = HeaderValue::from_str(entry.id())
        .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "unrepresentable id"))?;
    response.headers_mut().insert(WORKER_ID_HEADER, id);
    Ok(response)
}

async fn attach_stream(
    State(state): State<NodeState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let entry = state
        .workers()
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown worker `{id}`")))?;

    let exit_on_request_end = params
        .get("exitOnRequestEnd")
        .map(|value| value != "false")
        .unwrap_or(false);
    let reader = entry
        .attach(exit_on_request_end)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown worker `{id}`")))?;

    Ok(Response::new(Body::from_stream(EventBody { reader })))
}

async fn control_stream(
    State(state): State<NodeState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<StatusCode, ApiError> {
    let entry = state
        .workers()
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown worker `{id}`")))?;

    let mut stream = request.into_body().into_data_stream();
    let mut decoder = FrameDecoder::<ControlMessage>::new();
    'recv: while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                debug!(worker = %id, ?error, "control stream transport ended");
                break;
            }
        };
        match decoder.feed(&chunk) {
            Ok(messages) => {
                for message in messages {
                    if entry.send_control(message).is_err() {
                        // Worker gone; drain nothing further.
                        break 'recv;
                    }
                }
            }
            Err(error) => {
                warn!(worker = %id, ?error, "malformed control record");
                return Err(ApiError::new(StatusCode::BAD_REQUEST, error.to_string()));
            }
        }
    }
    Ok(StatusCode::OK)
}

/// Streaming response body: encodes each fanned-out event as one framed
/// line. Dropping it (client disconnect) releases the reader guard.
struct EventBody {
    reader: EventReader,
}

impl Stream for EventBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut()
            .reader
            .rx
            .poll_recv(cx)
            .map(|event| event.map(|event| Ok(Bytes::from(event.encode()))))
    }
}
