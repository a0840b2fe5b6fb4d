//! HTTP clients for the authorization server.

use std::time::Duration;

use reqwest_middleware::ClientBuilder;
use reqwest_retry::RetryTransientMiddleware;

use super::BackoffPolicy;
use crate::error::Error;

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request timeout. A timed out request surfaces as a transient error.
    pub timeout: Duration,
    /// Maximum retries for the retrying client.
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            user_agent: format!("flow-auth/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Client with retry middleware, for idempotent GETs.
pub type AuthenticatedClient = reqwest_middleware::ClientWithMiddleware;

/// Builds the two clients the engine needs: a plain one for token, device and
/// backchannel POSTs, and a retrying one for idempotent reads.
#[derive(Debug, Clone, Default)]
pub struct HttpClientBuilder {
    config: HttpClientConfig,
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: HttpClientConfig) -> Self {
        Self { config }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.config.user_agent = user_agent;
        self
    }

    /// Client without retries. Redirects are not followed so the redirectless
    /// flow can read `Location` headers itself.
    pub fn build_plain(&self) -> Result<reqwest::Client, Error> {
        let client = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .user_agent(self.config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(client)
    }

    /// Client with bounded exponential backoff on transient failures.
    pub fn build_retrying(&self) -> Result<AuthenticatedClient, Error> {
        let client = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .user_agent(self.config.user_agent.clone())
            .build()?;

        let policy = BackoffPolicy::new(self.config.max_retries);
        Ok(ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(policy))
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_default() {
        let builder = HttpClientBuilder::new();
        assert_eq!(builder.config.timeout, Duration::from_secs(30));
        assert_eq!(builder.config.max_retries, 3);
        assert!(builder.config.user_agent.starts_with("flow-auth/"));
    }

    #[test]
    fn test_builder_overrides() {
        let builder = HttpClientBuilder::new()
            .with_timeout(Duration::from_secs(5))
            .with_max_retries(0);
        assert_eq!(builder.config.timeout, Duration::from_secs(5));
        assert_eq!(builder.config.max_retries, 0);
    }

    #[tokio::test]
    async fn test_plain_client_does_not_follow_redirects() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/start")
            .with_status(302)
            .with_header("location", "https://app.example/cb?code=abc")
            .create_async()
            .await;

        let client = HttpClientBuilder::new().build_plain().unwrap();
        let response = client
            .get(format!("{}/start", server.url()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 302);
    }

    #[tokio::test]
    async fn test_retrying_client_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/doc")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let client = HttpClientBuilder::new()
            .with_max_retries(1)
            .build_retrying()
            .unwrap();
        let response = client
            .get(format!("{}/doc", server.url()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503);
        mock.assert_async().await;
    }
}
