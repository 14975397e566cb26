//! Upstream FOIS gateway access: OAuth2 client-credential tokens and
//! authenticated dashboard dataset requests.

use std::time::Duration;

mod client;
mod token;

pub use client::{DashboardClient, FetchError, FetchedBody};
pub use token::{
    AccessToken, AuthError, ClientCredentials, TokenEndpoints, TokenManager,
    EXPIRY_SAFETY_MARGIN_SECS,
};

pub const CRATE_NAME: &str = "fois-api";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("fois-sync/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// Shared reqwest client for the token endpoint and the dashboard endpoints.
pub fn build_http_client(config: &HttpClientConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build()
}
