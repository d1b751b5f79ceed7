//! NDJSON framing for selector streams.
//!
//! One JSON document per line. The body is pulled by the response writer,
//! so database batches advance only as fast as the client reads, which is the
//! back-pressure contract for large selections. An error mid-stream can
//! no longer change the status line; it terminates the body and the full
//! cause is already logged store-side.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;

use evently_store::{EventStream, StoreError};

pub const CONTENT_TYPE: &str = "application/x-ndjson; charset=utf-8";

pub fn response(events: EventStream) -> Response {
    let frames = events.map(|item| match item {
        Ok(event) => {
            let mut line = serde_json::to_vec(&event)
                .map_err(|e| StoreError::internal("ndjson", e))?;
            line.push(b'\n');
            Ok::<Bytes, StoreError>(Bytes::from(line))
        }
        Err(err) => Err(err),
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE))
        .body(Body::from_stream(frames))
        .expect("ndjson response")
}
