//! Response body wrapping.
//!
//! [`wrap`] replaces a response body with a [`CacheBody`] that forwards every
//! frame to the client unchanged while keeping a copy for the store. When the
//! response has no `ETag`, a SHA-256 digest of the content is sent as an
//! `etag` trailer once the last data frame has passed through.

use std::{
    error::Error as StdError,
    pin::Pin,
    task::{Context, Poll, ready},
};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, header, response::Parts},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use http_body::{Body as HttpBody, Frame, SizeHint};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error};

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// A fully streamed response, handed to the completion callback.
#[derive(Debug)]
pub struct Completed {
    /// Status, version and headers of the response, including any trailers
    /// received and the computed `etag`.
    pub parts: Parts,
    pub body: Option<Bytes>,
    /// Trailer fields produced by the wrapped body itself.
    pub trailers: HeaderMap,
}

type OnComplete = Box<dyn FnOnce(Completed) + Send>;

/// Wrap `response` so that `on_complete` runs exactly once with the buffered
/// body after it has been streamed without error.
///
/// Bodies already at their end are treated as immutable and reported
/// immediately; there is nothing to buffer.
pub fn wrap<F>(response: Response, on_complete: F) -> Response
where
    F: FnOnce(Completed) + Send + 'static,
{
    let (mut parts, body) = response.into_parts();

    if body.is_end_stream() {
        on_complete(Completed {
            parts: snapshot(&parts),
            body: Some(Bytes::new()),
            trailers: HeaderMap::new(),
        });
        return Response::from_parts(parts, body);
    }

    let digest = if parts.headers.contains_key(header::ETAG) {
        None
    } else {
        parts
            .headers
            .append(header::TRAILER, HeaderValue::from_static("etag"));
        Some(Sha256::new())
    };

    let body = CacheBody {
        inner: body,
        buffer: BytesMut::new(),
        digest,
        trailers: HeaderMap::new(),
        head: Some(snapshot(&parts)),
        on_complete: Some(Box::new(on_complete)),
        finished: false,
    };

    Response::from_parts(parts, Body::new(body))
}

/// Copy of the cache-relevant response metadata; extensions are not carried.
fn snapshot(parts: &Parts) -> Parts {
    let (mut head, ()) = Response::new(()).into_parts();
    head.status = parts.status;
    head.version = parts.version;
    head.headers = parts.headers.clone();
    head
}

/// Entity tag for a body digest: the quoted hex SHA-256.
pub fn etag_for(digest: Sha256) -> HeaderValue {
    let value = format!("\"{}\"", hex::encode(digest.finalize()));
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("\"\""))
}

#[derive(Debug, Error)]
#[error("response body failed: {0}")]
pub struct BodyError(#[source] BoxError);

/// Tees a response body into a buffer, and optionally a digest.
pub struct CacheBody {
    inner: Body,
    buffer: BytesMut,
    digest: Option<Sha256>,
    trailers: HeaderMap,
    head: Option<Parts>,
    on_complete: Option<OnComplete>,
    finished: bool,
}

impl CacheBody {
    /// End of stream: settles the digest, fires the callback and returns the
    /// trailer frame still owed to the client, if any.
    fn finish(&mut self) -> Option<HeaderMap> {
        self.finished = true;

        let etag = self.digest.take().map(etag_for);
        let mut head = self.head.take()?;
        let received = std::mem::take(&mut self.trailers);

        for (name, value) in &received {
            head.headers.append(name.clone(), value.clone());
        }

        let outgoing = etag.map(|etag| {
            head.headers.insert(header::ETAG, etag.clone());
            let mut outgoing = received.clone();
            outgoing.insert(header::ETAG, etag);
            outgoing
        });

        if let Some(on_complete) = self.on_complete.take() {
            on_complete(Completed {
                parts: head,
                body: Some(std::mem::take(&mut self.buffer).freeze()),
                trailers: received,
            });
        }

        outgoing
    }

    fn fail(&mut self, error: &dyn StdError) {
        self.finished = true;
        self.on_complete = None;
        self.head = None;
        self.buffer.clear();
        error!(error = %error, "Response body failed; skipping cache update");
    }
}

impl HttpBody for CacheBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let frame = match frame.into_trailers() {
                        Ok(trailers) => {
                            for (name, value) in &trailers {
                                this.trailers.append(name.clone(), value.clone());
                            }
                            if this.digest.is_some() {
                                // Sent together with the etag at the end.
                                continue;
                            }
                            Frame::trailers(trailers)
                        }
                        Err(frame) => frame,
                    };

                    if let Some(data) = frame.data_ref() {
                        this.buffer.extend_from_slice(data);
                        if let Some(digest) = this.digest.as_mut() {
                            digest.update(data);
                        }
                    }

                    return Poll::Ready(Some(Ok(frame)));
                }
                Some(Err(error)) => {
                    let error = BodyError(error.into());
                    this.fail(&error);
                    return Poll::Ready(Some(Err(error)));
                }
                None => {
                    return Poll::Ready(this.finish().map(|trailers| Ok(Frame::trailers(trailers))));
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }

    fn size_hint(&self) -> SizeHint {
        if self.finished {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}

impl Drop for CacheBody {
    fn drop(&mut self) {
        if !self.finished && self.on_complete.is_some() {
            debug!(
                buffered = self.buffer.len(),
                "Response body dropped before completion; skipping cache update"
            );
        }
    }
}
