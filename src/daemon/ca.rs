//! The certificate authority client.
//!
//! The CA is the one collaborator the daemon cannot control, so its
//! failures are classified: a [`CaError`] knows whether retrying the same
//! request can ever succeed, and the lifecycle workers base their
//! requeue-or-drop decision on that alone.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::daemon::config::{CaConfig, CertParams};

//------------ CaError -------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CaError {
    /// The request never produced a response.
    Transport(String),

    /// The CA rejected the request as malformed.
    BadRequest,

    /// The CA refused our credentials.
    Unauthorized,

    /// The CA does not know the certificate id.
    NotFound,

    /// The CA failed internally.
    ServerError,

    /// A status code outside the taxonomy.
    Unhandled(u16),

    /// The response body could not be interpreted.
    InvalidResponse(String),
}

impl CaError {
    /// Whether retrying the identical request can succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaError::Transport(_) | CaError::ServerError)
    }

    fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            400 => CaError::BadRequest,
            401 | 403 => CaError::Unauthorized,
            404 => CaError::NotFound,
            500..=599 => CaError::ServerError,
            other => CaError::Unhandled(other),
        }
    }
}

impl fmt::Display for CaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CaError::Transport(msg) => {
                write!(f, "could not reach the CA: {msg}")
            }
            CaError::BadRequest => write!(f, "the CA rejected the request"),
            CaError::Unauthorized => {
                write!(f, "the CA refused our credentials")
            }
            CaError::NotFound => {
                write!(f, "the CA does not know this certificate")
            }
            CaError::ServerError => write!(f, "the CA failed internally"),
            CaError::Unhandled(status) => {
                write!(f, "unexpected CA response status {status}")
            }
            CaError::InvalidResponse(msg) => {
                write!(f, "unusable CA response: {msg}")
            }
        }
    }
}

impl std::error::Error for CaError {}

impl From<reqwest::Error> for CaError {
    fn from(e: reqwest::Error) -> Self {
        CaError::Transport(e.to_string())
    }
}

//------------ EnrollRequest / EnrollResponse --------------------------------

/// What the enroll worker hands to the CA client. The client merges in
/// the configured certificate parameters.
#[derive(Clone, Debug)]
pub struct EnrollRequest {
    pub name: String,
    pub csr: String,
    pub alt_names: Vec<String>,
}

/// The CA's identifiers for a new enrollment.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EnrollResponse {
    /// The order id, needed to follow up on a pending enrollment.
    #[serde(rename = "renewId")]
    pub order_id: String,

    /// The certificate id, the handle for collect and revoke.
    #[serde(rename = "sslId")]
    pub cert_id: u64,
}

#[derive(Debug, Serialize)]
struct EnrollBody<'a> {
    csr: &'a str,
    #[serde(rename = "subjAltNames")]
    alt_names: String,
    term: u32,
    #[serde(rename = "certType")]
    cert_type: String,
    #[serde(rename = "numberServers")]
    number_servers: u32,
    #[serde(rename = "serverType")]
    server_type: i32,
    comments: &'a str,
}

#[derive(Debug, Serialize)]
struct RevokeBody<'a> {
    reason: &'a str,
}

//------------ CaClient ------------------------------------------------------

/// The operations the lifecycle workers need from a CA.
#[async_trait]
pub trait CaClient: Send + Sync {
    /// Submits a CSR. On success the certificate is ordered but not
    /// necessarily issued yet.
    async fn enroll(
        &self,
        request: &EnrollRequest,
    ) -> Result<EnrollResponse, CaError>;

    /// Fetches the issued certificate as PEM.
    async fn collect(&self, cert_id: u64) -> Result<String, CaError>;

    /// Revokes a certificate.
    async fn revoke(&self, cert_id: u64) -> Result<(), CaError>;
}

//------------ HttpCaClient --------------------------------------------------

/// The REST implementation of [`CaClient`].
///
/// Credentials go out as headers on every request, the way the CA's API
/// expects them.
pub struct HttpCaClient {
    client: reqwest::Client,
    config: CaConfig,
    params: CertParams,
}

impl HttpCaClient {
    pub fn new(
        config: CaConfig,
        params: CertParams,
    ) -> Result<Self, CaError> {
        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("login", &config.username),
            ("password", &config.password),
            ("customerUri", &config.customer_uri),
        ] {
            headers.insert(
                name,
                HeaderValue::from_str(value).map_err(|_| {
                    CaError::InvalidResponse(format!(
                        "CA credential '{name}' is not a valid header value"
                    ))
                })?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(HttpCaClient {
            client,
            config,
            params,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl CaClient for HttpCaClient {
    async fn enroll(
        &self,
        request: &EnrollRequest,
    ) -> Result<EnrollResponse, CaError> {
        let body = EnrollBody {
            csr: &request.csr,
            alt_names: request.alt_names.join(","),
            term: self.params.term,
            cert_type: if request.alt_names.is_empty() {
                self.params.cert_type.clone()
            } else {
                self.params.multi_domain_cert_type.clone()
            },
            number_servers: 0,
            server_type: -1,
            comments: &self.params.comments,
        };

        let response = self
            .client
            .post(self.endpoint(&self.config.enroll_endpoint))
            .json(&body)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(CaError::from_status(response.status()));
        }

        response.json().await.map_err(|e| {
            CaError::InvalidResponse(format!("enroll response: {e}"))
        })
    }

    async fn collect(&self, cert_id: u64) -> Result<String, CaError> {
        let url = format!(
            "{}/{}?format={}",
            self.endpoint(&self.config.collect_endpoint),
            cert_id,
            self.params.format_type,
        );
        debug!("collecting certificate {cert_id}");

        let response = self.client.get(url).send().await?;

        if response.status() != StatusCode::OK {
            return Err(CaError::from_status(response.status()));
        }

        Ok(response.text().await?)
    }

    async fn revoke(&self, cert_id: u64) -> Result<(), CaError> {
        let url = format!(
            "{}/{}",
            self.endpoint(&self.config.revoke_endpoint),
            cert_id,
        );

        let response = self
            .client
            .post(url)
            .json(&RevokeBody {
                reason: "certificate lifecycle rotation",
            })
            .send()
            .await?;

        if response.status() != StatusCode::NO_CONTENT {
            return Err(CaError::from_status(response.status()));
        }
        Ok(())
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_permanent_errors() {
        assert!(CaError::Transport("timed out".to_string()).is_transient());
        assert!(CaError::ServerError.is_transient());

        assert!(!CaError::BadRequest.is_transient());
        assert!(!CaError::Unauthorized.is_transient());
        assert!(!CaError::NotFound.is_transient());
        assert!(!CaError::Unhandled(418).is_transient());
    }

    #[test]
    fn status_taxonomy() {
        assert_eq!(
            CaError::from_status(StatusCode::BAD_REQUEST),
            CaError::BadRequest
        );
        assert_eq!(
            CaError::from_status(StatusCode::UNAUTHORIZED),
            CaError::Unauthorized
        );
        assert_eq!(
            CaError::from_status(StatusCode::FORBIDDEN),
            CaError::Unauthorized
        );
        assert_eq!(
            CaError::from_status(StatusCode::NOT_FOUND),
            CaError::NotFound
        );
        assert_eq!(
            CaError::from_status(StatusCode::BAD_GATEWAY),
            CaError::ServerError
        );
        assert_eq!(
            CaError::from_status(StatusCode::IM_A_TEAPOT),
            CaError::Unhandled(418)
        );
    }

    #[test]
    fn enroll_response_field_names() {
        let response: EnrollResponse = serde_json::from_str(
            r#"{ "renewId": "order-1", "sslId": 42 }"#,
        )
        .unwrap();
        assert_eq!(response.order_id, "order-1");
        assert_eq!(response.cert_id, 42);
    }
}
