//! The HTTP front door.
//!
//! A deliberately small surface: subjects and tokens under `/api/v1`,
//! plus an unauthenticated health endpoint. Every other path requires a
//! bearer token. Errors leave as JSON with the status code the error
//! maps itself to.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, header};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::api::events::EnrollEvent;
use crate::commons::{Error, WardResult};
use crate::constants::CERTWARD_SERVER_APP;
use crate::daemon::auth::Identity;
use crate::daemon::server::CertwardServer;

const MAX_BODY_BYTES: usize = 64 * 1024;

type HttpResponse = Response<Full<Bytes>>;

//------------ serve ---------------------------------------------------------

/// Binds and serves the front door. Never returns except with a bind
/// error.
pub async fn serve(
    server: Arc<CertwardServer>,
    addr: SocketAddr,
) -> WardResult<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        Error::custom(format!("Could not bind to {addr}: {e}"))
    })?;
    info!("{CERTWARD_SERVER_APP} API listening on http://{addr}/");

    loop {
        let (stream, _peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("could not accept connection: {e}");
                continue;
            }
        };

        let server = server.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let server = server.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(
                        handle(server, request).await,
                    )
                }
            });
            let builder = ConnectionBuilder::new(TokioExecutor::new());
            let connection =
                builder.serve_connection(TokioIo::new(stream), service);
            if let Err(e) = connection.await {
                debug!("connection closed with error: {e}");
            }
        });
    }
}

async fn handle(
    server: Arc<CertwardServer>,
    request: Request<Incoming>,
) -> HttpResponse {
    match route(server, request).await {
        Ok(response) => response,
        Err(e) => render_error(e),
    }
}

//------------ Routing -------------------------------------------------------

#[derive(Deserialize)]
struct TokenRequest {
    name: String,
}

#[derive(Serialize)]
struct TokenResponse<'a> {
    token: &'a str,
}

async fn route(
    server: Arc<CertwardServer>,
    request: Request<Incoming>,
) -> WardResult<HttpResponse> {
    let method = request.method().clone();
    let path = request.uri().path().trim_matches('/').to_string();
    let segments: Vec<&str> = path.split('/').collect();

    if method == Method::GET && segments.as_slice() == ["health"] {
        return render_empty();
    }

    let identity = authenticate(&server, &request)?;
    let query = parse_query(request.uri().query());

    match (method, segments.as_slice()) {
        (Method::GET, ["api", "v1", "subjects"]) => {
            match query.get("target") {
                Some(target) => render_json(
                    &server.subjects_by_target(&identity, target).await?,
                ),
                None => render_json(&server.all_subjects(&identity).await?),
            }
        }
        (Method::POST, ["api", "v1", "subjects"]) => {
            let enroll: EnrollEvent = read_json_body(request).await?;
            server.add_subject(&identity, enroll).await?;
            render_accepted()
        }
        (Method::GET, ["api", "v1", "subjects", "expiring"]) => {
            let days = match query.get("days") {
                Some(days) => days.parse().map_err(|_| {
                    Error::ApiInvalid(format!("invalid 'days' value '{days}'"))
                })?,
                None => server.renew_before_days(),
            };
            render_json(&server.expiring_subjects(&identity, days).await?)
        }
        (Method::GET, ["api", "v1", "subjects", name]) => {
            render_json(&server.subject(&identity, name).await?)
        }
        (Method::POST, ["api", "v1", "subjects", name, "renew"]) => {
            server.renew_subject(&identity, name).await?;
            render_accepted()
        }
        (Method::DELETE, ["api", "v1", "subjects", name]) => {
            server.remove_subject(&identity, name).await?;
            render_accepted()
        }
        (Method::POST, ["api", "v1", "tokens"]) => {
            let token_request: TokenRequest = read_json_body(request).await?;
            let token =
                server.issue_token(&identity, &token_request.name)?;
            render_json(&TokenResponse {
                token: token.as_str(),
            })
        }
        _ => render_not_found(),
    }
}

fn authenticate(
    server: &CertwardServer,
    request: &Request<Incoming>,
) -> WardResult<Identity> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(Error::Unauthorized)?;
    let token = header.strip_prefix("Bearer ").ok_or(Error::Unauthorized)?;
    server.authenticate(token.trim())
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut values = HashMap::new();
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                values.insert(key.to_string(), value.to_string());
            }
        }
    }
    values
}

/// Reads and deserializes a JSON request body.
///
/// The cap is enforced on the bytes actually read, so chunked requests
/// without a content length cannot grow past it.
async fn read_json_body<T, B>(request: Request<B>) -> WardResult<T>
where
    T: serde::de::DeserializeOwned,
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = Limited::new(request.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| Error::ApiInvalid(format!("could not read body: {e}")))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| Error::ApiInvalid(format!("invalid JSON body: {e}")))
}

//------------ Responses -----------------------------------------------------

fn render_json<T: Serialize>(value: &T) -> WardResult<HttpResponse> {
    let body = serde_json::to_vec(value)?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(Error::custom)
}

fn render_empty() -> WardResult<HttpResponse> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::new()))
        .map_err(Error::custom)
}

/// The answer for publish-only endpoints: the request is queued, not
/// done.
fn render_accepted() -> WardResult<HttpResponse> {
    Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(Full::new(Bytes::new()))
        .map_err(Error::custom)
}

fn render_not_found() -> WardResult<HttpResponse> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from_static(b"not found")))
        .map_err(Error::custom)
}

fn render_error(error: Error) -> HttpResponse {
    let status = StatusCode::from_u16(error.status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!("request failed: {error}");
    }

    let body = serde_json::to_vec(&error.to_error_response())
        .unwrap_or_else(|_| b"{}".to_vec());

    // An infallible builder: static parts only.
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_strings_parse() {
        let query = parse_query(Some("target=10.0.0.1&days=30"));
        assert_eq!(query.get("target").map(String::as_str), Some("10.0.0.1"));
        assert_eq!(query.get("days").map(String::as_str), Some("30"));

        assert!(parse_query(None).is_empty());
        assert!(parse_query(Some("novalue")).is_empty());
    }

    #[tokio::test]
    async fn body_reads_are_capped_by_bytes_read() {
        let oversized = Request::builder()
            .body(Full::new(Bytes::from(vec![b'x'; MAX_BODY_BYTES + 1])))
            .unwrap();
        let result: WardResult<TokenRequest> = read_json_body(oversized).await;
        assert!(matches!(result, Err(Error::ApiInvalid(_))));

        let request = Request::builder()
            .body(Full::new(Bytes::from_static(b"{\"name\":\"10.0.0.1\"}")))
            .unwrap();
        let parsed: TokenRequest = read_json_body(request).await.unwrap();
        assert_eq!(parsed.name, "10.0.0.1");
    }

    #[test]
    fn queued_work_answers_accepted() {
        assert_eq!(
            render_accepted().unwrap().status(),
            StatusCode::ACCEPTED
        );
        assert_eq!(render_empty().unwrap().status(), StatusCode::OK);
    }

    #[test]
    fn errors_render_with_their_status() {
        let response =
            render_error(Error::SubjectUnknown("a.example.com".to_string()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = render_error(Error::Unauthorized);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = render_error(Error::custom("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
