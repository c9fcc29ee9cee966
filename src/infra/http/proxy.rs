//! Reverse proxy to the configured origin.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Method, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use http_body::Body as _;
use thiserror::Error;
use url::Url;

use crate::{config::UpstreamSettings, error::ErrorReport, infra::error::InfraError};

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Clone)]
pub struct ProxyState {
    client: reqwest::Client,
    origin: Arc<Url>,
}

impl ProxyState {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            origin: Arc::new(settings.origin.clone()),
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Origin URL for a request target, keeping any base path of the origin.
    pub fn target(&self, uri: &Uri) -> Url {
        let mut url = Url::clone(&self.origin);
        let base = self.origin.path().trim_end_matches('/');
        url.set_path(&format!("{base}{}", uri.path()));
        url.set_query(uri.query());
        url
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Request(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Request(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let report = ErrorReport::from_error("infra::http::proxy", status, &self);
        let message = status.canonical_reason().unwrap_or("Bad Gateway");
        let mut response = (status, message).into_response();
        report.attach(&mut response);
        response
    }
}

/// Forward a request to the origin and stream its response back.
pub async fn forward(
    State(proxy): State<ProxyState>,
    request: Request<Body>,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);

    let mut upstream = proxy
        .client
        .request(parts.method.clone(), proxy.target(&parts.uri))
        .headers(headers);
    if !body.is_end_stream() {
        upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let upstream = upstream.send().await?;
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let bodyless = parts.method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;
    let body = if bodyless {
        Body::empty()
    } else {
        Body::from_stream(upstream.bytes_stream())
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Remove connection-specific headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}
