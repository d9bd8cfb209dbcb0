use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

/// Body served by `GET /events`: two events, a comment and a retry hint.
pub const EVENT_STREAM: &str = "id: 1\nevent: greeting\ndata: hello\n\n: keep-alive\n\nid: 2\ndata: line one\ndata: line two\nretry: 1500\n\n";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: u32,
    pub name: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Upload {
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Receipt returned by `POST /uploads`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub id: Uuid,
    pub size: usize,
    pub content_type: Option<String>,
}

/// What `GET /echo` saw: the query and every `x-*` header.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Echo {
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
}

pub type Store = Arc<RwLock<HashMap<Uuid, Upload>>>;

pub fn app() -> Router {
    let store: Store = Arc::new(RwLock::new(HashMap::new()));
    Router::new()
        .route("/json", get(sample))
        .route("/status/{code}", get(status))
        .route("/echo", get(echo))
        .route("/uploads", post(create_upload))
        .route("/uploads/{id}", get(get_upload))
        .route("/events", get(events))
        .with_state(store)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

pub fn sample_value() -> Sample {
    Sample {
        id: 7,
        name: "netkit".to_string(),
        tags: vec!["http".to_string(), "sse".to_string()],
    }
}

async fn sample() -> Json<Sample> {
    Json(sample_value())
}

async fn status(Path(code): Path<u16>) -> Result<StatusCode, StatusCode> {
    tracing::debug!(code, "status route");
    StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)
}

async fn echo(Query(query): Query<HashMap<String, String>>, headers: HeaderMap) -> Json<Echo> {
    let headers = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-"))
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect();
    Json(Echo { query, headers })
}

async fn create_upload(State(store): State<Store>, headers: HeaderMap, body: Bytes) -> (StatusCode, Json<UploadReceipt>) {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let receipt = UploadReceipt {
        id: Uuid::new_v4(),
        size: body.len(),
        content_type: content_type.clone(),
    };
    tracing::debug!(id = %receipt.id, size = receipt.size, "stored upload");
    store.write().await.insert(
        receipt.id,
        Upload {
            content_type,
            data: body,
        },
    );
    (StatusCode::CREATED, Json(receipt))
}

async fn get_upload(State(store): State<Store>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, StatusCode> {
    let uploads = store.read().await;
    let upload = uploads.get(&id).cloned().ok_or(StatusCode::NOT_FOUND)?;
    let content_type = upload
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok(([(header::CONTENT_TYPE, content_type)], upload.data))
}

async fn events() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/event-stream"), (header::CACHE_CONTROL, "no-cache")],
        EVENT_STREAM,
    )
}
