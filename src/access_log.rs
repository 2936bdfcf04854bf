//! Per-request access logging
//!
//! The log line is written when the response body has been fully streamed
//! (or dropped early), so the byte count and duration cover the whole
//! exchange and the status is the one actually sent.

use crate::error::GatewayBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::info;

/// What is known about a request when it arrives
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    method: Method,
    path: String,
    addr: SocketAddr,
    subject: Option<String>,
    started: Instant,
}

impl AccessLogEntry {
    pub fn start<B>(req: &Request<B>, addr: SocketAddr) -> Self {
        Self {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            addr,
            subject: None,
            started: Instant::now(),
        }
    }

    /// Attach the authenticated subject
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    fn emit(&self, status: StatusCode, bytes: u64, complete: bool) {
        info!(
            target: "access",
            method = %self.method,
            path = %self.path,
            status = status.as_u16(),
            bytes,
            ms = self.started.elapsed().as_millis() as u64,
            addr = %self.addr,
            subject = self.subject.as_deref(),
            complete,
            "request"
        );
    }
}

/// Response body that counts bytes and logs once it ends
pub struct LoggedBody {
    inner: GatewayBody,
    entry: Option<AccessLogEntry>,
    status: StatusCode,
    bytes: u64,
}

impl LoggedBody {
    fn finish(&mut self, complete: bool) {
        if let Some(entry) = self.entry.take() {
            entry.emit(self.status, self.bytes, complete);
        }
    }
}

impl Body for LoggedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_frame(cx);

        match &poll {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
            }
            Poll::Ready(Some(Err(_))) => this.finish(false),
            Poll::Ready(None) => this.finish(true),
            Poll::Pending => {}
        }

        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for LoggedBody {
    fn drop(&mut self) {
        let complete = self.inner.is_end_stream();
        self.finish(complete);
    }
}

/// Wrap `response` so its access log line is written when the body ends
pub fn wrap(response: Response<GatewayBody>, entry: AccessLogEntry) -> Response<GatewayBody> {
    let status = response.status();
    response.map(|inner| {
        LoggedBody {
            inner,
            entry: Some(entry),
            status,
            bytes: 0,
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;

    fn entry() -> AccessLogEntry {
        let req = Request::builder()
            .method("POST")
            .uri("/generate?x=1")
            .body(())
            .unwrap();
        AccessLogEntry::start(&req, "127.0.0.1:4000".parse().unwrap())
    }

    #[test]
    fn test_entry_records_path_without_query() {
        let entry = entry().with_subject("e2e");
        assert_eq!(entry.path, "/generate");
        assert_eq!(entry.method, Method::POST);
        assert_eq!(entry.subject(), Some("e2e"));
    }

    #[tokio::test]
    async fn test_wrap_preserves_status_headers_and_body() {
        let response = Response::builder()
            .status(StatusCode::CREATED)
            .header("Content-Type", "image/png")
            .body(full_body("png-bytes"))
            .unwrap();

        let wrapped = wrap(response, entry());
        assert_eq!(wrapped.status(), StatusCode::CREATED);
        assert_eq!(wrapped.headers()["content-type"], "image/png");

        let body = wrapped.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"png-bytes");
    }

    #[tokio::test]
    async fn test_logged_body_counts_bytes() {
        let mut body = LoggedBody {
            inner: full_body("0123456789"),
            entry: Some(entry()),
            status: StatusCode::OK,
            bytes: 0,
        };

        while let Some(frame) = body.frame().await {
            frame.unwrap();
        }

        assert_eq!(body.bytes, 10);
        assert!(body.entry.is_none());
    }

    #[test]
    fn test_dropped_body_still_logs_once() {
        let mut body = LoggedBody {
            inner: full_body("unread"),
            entry: Some(entry()),
            status: StatusCode::OK,
            bytes: 0,
        };

        body.finish(false);
        assert!(body.entry.is_none());
        drop(body);
    }
}
