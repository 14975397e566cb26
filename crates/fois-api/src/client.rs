use fois_core::{Endpoint, ResponsePayload};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unauthorized (401) for {url}: {body}")]
    Unauthorized { url: String, body: String },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
}

impl FetchError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: u16,
    pub url: String,
    pub body: String,
}

impl FetchedBody {
    /// JSON when the body parses, raw text otherwise.
    pub fn decode(&self) -> ResponsePayload {
        match serde_json::from_str(&self.body) {
            Ok(value) => ResponsePayload::Json(value),
            Err(_) => ResponsePayload::Text(self.body.clone()),
        }
    }
}

/// Authenticated GET against one dashboard endpoint.
#[derive(Debug, Clone)]
pub struct DashboardClient {
    http: reqwest::Client,
}

impl DashboardClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn fetch(
        &self,
        endpoint: &Endpoint,
        query_date: &str,
        token: &str,
    ) -> Result<FetchedBody, FetchError> {
        let headers = request_headers(endpoint, token)?;
        debug!(endpoint = %endpoint.name, url = %endpoint.url, query_date, "fetching dataset");

        let resp = self
            .http
            .get(&endpoint.url)
            .query(&[(endpoint.query_date_param.as_str(), query_date)])
            .headers(headers)
            .send()
            .await?;

        let status = resp.status();
        let url = resp.url().to_string();
        let body = resp.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(FetchError::Unauthorized { url, body });
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }

        Ok(FetchedBody {
            status: status.as_u16(),
            url,
            body,
        })
    }
}

fn request_headers(endpoint: &Endpoint, token: &str) -> Result<HeaderMap, FetchError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &endpoint.headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|err| FetchError::InvalidHeader {
                name: name.clone(),
                reason: err.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|err| FetchError::InvalidHeader {
            name: name.clone(),
            reason: err.to_string(),
        })?;
        headers.insert(header_name, header_value);
    }

    let mut authorization = HeaderValue::from_str(&endpoint.authorization_header(token))
        .map_err(|err| FetchError::InvalidHeader {
            name: AUTHORIZATION.to_string(),
            reason: err.to_string(),
        })?;
    authorization.set_sensitive(true);
    headers.insert(AUTHORIZATION, authorization);
    Ok(headers)
}
