//! The worker's view of the network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{redirect, Client, Method};
use tracing::debug;
use url::Url;

use super::{WorkerError, WorkerResponse};

#[async_trait]
pub trait Network: Send + Sync {
    /// Send a `method` request to `url`. Transport failures are errors; any
    /// HTTP status is a response.
    async fn fetch(&self, method: &str, url: &Url) -> Result<WorkerResponse, WorkerError>;
}

/// `Network` backed by reqwest. Redirects are returned, not followed, so
/// cached responses are exactly what the server sent.
#[derive(Clone)]
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    pub fn new(timeout: Duration) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| WorkerError::Network {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, method: &str, url: &Url) -> Result<WorkerResponse, WorkerError> {
        let network_error = |e: reqwest::Error| WorkerError::Network {
            url: url.to_string(),
            message: e.to_string(),
        };
        let method = Method::from_bytes(method.as_bytes()).map_err(|e| WorkerError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let response = self
            .client
            .request(method.clone(), url.clone())
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status().as_u16();
        let mut result = WorkerResponse::new(status, Vec::new());
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                result = result.with_header(name.as_str(), value);
            }
        }
        result.body = response.bytes().await.map_err(network_error)?.to_vec();

        debug!(%method, url = %url, status, bytes = result.body.len(), "Network fetch");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_returns_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/static/css/main.css"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("body{}")
                    .insert_header("content-type", "text/css"),
            )
            .mount(&server)
            .await;

        let network = HttpNetwork::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&format!("{}/static/css/main.css", server.uri())).unwrap();
        let response = network.fetch("GET", &url).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"body{}");
        assert_eq!(response.header("content-type"), Some("text/css"));
    }

    #[tokio::test]
    async fn test_redirects_are_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
            .mount(&server)
            .await;

        let network = HttpNetwork::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&format!("{}/old", server.uri())).unwrap();
        let response = network.fetch("GET", &url).await.unwrap();
        assert_eq!(response.status, 301);
        assert_eq!(response.header("location"), Some("/new"));
    }

    #[tokio::test]
    async fn test_connection_failure_is_network_error() {
        let network = HttpNetwork::new(Duration::from_secs(1)).unwrap();
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        assert!(matches!(network.fetch("GET", &url).await, Err(WorkerError::Network { .. })));
    }

    #[tokio::test]
    async fn test_fetch_keeps_request_method() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/users/7"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(405))
            .expect(0)
            .mount(&server)
            .await;

        let network = HttpNetwork::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&format!("{}/api/users/7", server.uri())).unwrap();
        let response = network.fetch("DELETE", &url).await.unwrap();
        assert_eq!(response.status, 204);
    }

    #[tokio::test]
    async fn test_invalid_method_is_network_error() {
        let network = HttpNetwork::new(Duration::from_secs(1)).unwrap();
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        assert!(matches!(network.fetch("BAD METHOD", &url).await, Err(WorkerError::Network { .. })));
    }
}
