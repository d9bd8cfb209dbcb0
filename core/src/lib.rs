//! Typed HTTP, upload, download, SSE and WebSocket deliverables over a
//! host-provided transport.
//!
//! # Overview
//! netkit never opens a socket. The host implements `Transport` and runs
//! every task; netkit builds the transport-native requests, routes the
//! transport's callbacks through one `SessionDelegate` per session, and turns
//! them into typed results (host-does-IO pattern).
//!
//! # Design
//! - `RequestDescriptor` is immutable and fails at build time, before any
//!   network activity, when its URL is unusable.
//! - `SessionDelegate` holds one weak interceptor per capability. Released
//!   owners stop receiving callbacks; capabilities never contend.
//! - Every delivery style (await, callback + handle, publisher, event
//!   stream) sits on one execution primitive whose completion fires exactly
//!   once, even when cancellation races it.
//! - Downloader, SSE and WebSocket clients are single-writer state machines
//!   publishing ordered event streams. Progress is the only event kind that
//!   may be dropped for a slow consumer.

pub mod call;
pub mod config;
pub mod connection;
pub mod decode;
pub mod delegate;
pub mod download;
pub mod error;
pub mod events;
pub mod http;
pub mod multipart;
pub mod performer;
pub mod reachability;
pub mod request;
pub mod session;
pub mod sse;
pub mod status;
pub mod transport;
pub mod upload;
pub mod websocket;

#[cfg(test)]
mod mock;

pub use call::{Publisher, TaskHandle};
pub use config::SessionConfiguration;
pub use connection::ConnectionState;
pub use delegate::{Capability, SessionDelegate};
pub use download::{DownloadEvent, DownloadState, Downloader};
pub use error::{HttpError, InternalError, NetworkingError, Result, StateError, TransportError};
pub use events::EventStream;
pub use http::{CachePolicy, HttpMethod, HttpRequest, HttpResponseInfo};
pub use multipart::MultipartForm;
pub use performer::RequestPerformer;
pub use reachability::{ConnectionType, NetworkMonitor, NetworkPath, NetworkStatus, PathObserver};
pub use request::RequestDescriptor;
pub use session::Session;
pub use sse::{ServerSentEvent, SseClient};
pub use status::StatusCategory;
pub use transport::{
    Completion, DataResponse, DownloadResponse, DownloadSource, TaskContext, TaskId, Transport, UploadSource,
    WebSocketMessage,
};
pub use upload::{ProgressFn, UploadPayload, UploadStream, UploadStreamEvent, Uploader};
pub use websocket::WebSocketClient;
