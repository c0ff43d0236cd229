//! End-user block download edge: `GET /block/get`.
//!
//! The scheduler hands a user a URL carrying a signed grant; this handler
//! verifies the signature over `cid || sn || signTime || timeout`, streams
//! the block with exact length, and reports the outcome (with measured
//! speed) back to the scheduler.

use crate::error::{ApiError, ApiResult};
use crate::state::NodeState;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use courier_blockstore::{BlockStore as _, StoreResult};
use courier_core::CidHash;
use courier_core::rpc::UserDownloadResult;
use futures::Stream;
use serde::Deserialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub cid: String,
    pub sign: String,
    pub sn: i64,
    #[serde(rename = "signTime")]
    pub sign_time: i64,
    pub timeout: i64,
}

pub async fn get_block(
    State(state): State<NodeState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let verifier = state
        .verifier
        .read()
        .unwrap()
        .clone()
        .ok_or_else(|| ApiError::BadRequest("download key not loaded".to_string()))?;

    if let Err(e) = verifier.verify_download(
        &query.sign,
        &query.cid,
        query.sn,
        query.sign_time,
        query.timeout,
    ) {
        state.report_download(UserDownloadResult {
            sn: query.sn,
            sign: query.sign.clone(),
            block_size: 0,
            download_speed: 0,
            result: false,
            failed_reason: e.to_string(),
        });
        return Err(ApiError::BadRequest(format!("invalid signature: {e}")));
    }

    let hash = CidHash::from_cid_str(&query.cid)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let (stream, size) = match state.store.get_reader(&hash).await {
        Ok(found) => found,
        Err(e) if e.is_not_found() => {
            state.report_download(UserDownloadResult {
                sn: query.sn,
                sign: query.sign.clone(),
                block_size: 0,
                download_speed: 0,
                result: false,
                failed_reason: "block not found".to_string(),
            });
            return Err(ApiError::NotFound(query.cid));
        }
        Err(e) => return Err(e.into()),
    };

    let reporting = ReportingStream {
        inner: stream,
        state: state.clone(),
        sn: query.sn,
        sign: query.sign.clone(),
        sent: 0,
        started: Instant::now(),
        reported: false,
    };

    let response = Response::builder()
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", query.cid),
        )
        .header(header::CONTENT_LENGTH, size)
        .body(Body::from_stream(reporting))
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(response)
}

/// Wraps the block stream to report size and speed once the body has been
/// fully served (or the client went away).
struct ReportingStream {
    inner: Pin<Box<dyn Stream<Item = StoreResult<Bytes>> + Send>>,
    state: NodeState,
    sn: i64,
    sign: String,
    sent: i64,
    started: Instant,
    reported: bool,
}

impl ReportingStream {
    fn report(&mut self, ok: bool, reason: &str) {
        if self.reported {
            return;
        }
        self.reported = true;

        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            (self.sent as f64 / elapsed) as i64
        } else {
            0
        };
        self.state.report_download(UserDownloadResult {
            sn: self.sn,
            sign: self.sign.clone(),
            block_size: self.sent,
            download_speed: speed,
            result: ok,
            failed_reason: reason.to_string(),
        });
    }
}

impl Stream for ReportingStream {
    type Item = StoreResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.sent += chunk.len() as i64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                let reason = e.to_string();
                self.report(false, &reason);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.report(true, "");
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ReportingStream {
    fn drop(&mut self) {
        // client disconnected mid-stream
        self.report(false, "interrupted");
    }
}
