//! Minimal HTTP/1 client for the daemon's REST API.

use anyhow::Context;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

pub struct ApiClient {
    base: String,
    http: Client<HttpConnector, Full<Bytes>>,
}

/// Status plus the decoded `{success, data, error}` envelope.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Value,
}

impl Reply {
    /// Decode the envelope's `data` field.
    pub fn data<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let data = self.body.get("data").cloned().unwrap_or(Value::Null);
        serde_json::from_value(data).context("unexpected response from daemon")
    }

    pub fn error_message(&self) -> String {
        match self.body.get("error").and_then(Value::as_str) {
            Some(msg) => msg.to_string(),
            None => format!("daemon returned {}", self.status),
        }
    }
}

impl ApiClient {
    pub fn new(server: &str) -> Self {
        Self {
            base: server.trim_end_matches('/').to_string(),
            http: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<Reply> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Option<&Value>) -> anyhow::Result<Reply> {
        self.send(Method::POST, path, body).await
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> anyhow::Result<Reply> {
        let uri = format!("{}{path}", self.base);
        let mut builder = Request::builder().method(method.clone()).uri(&uri);
        let payload = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Bytes::from(serde_json::to_vec(value)?)
            }
            None => Bytes::new(),
        };
        let request = builder.body(Full::new(payload))?;

        debug!(%method, %uri, "api request");
        let response = self
            .http
            .request(request)
            .await
            .with_context(|| format!("cannot reach cutoverd at {}", self.base))?;

        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok(Reply { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn serve_once(response: String) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn decodes_envelope() {
        let body = r#"{"success":true,"data":["orders"]}"#;
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let client = ApiClient::new(&serve_once(response).await);

        let reply = client.get("/api/v1/things").await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        let data: Vec<String> = reply.data().unwrap();
        assert_eq!(data, vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn error_message_falls_back_to_status() {
        let client = ApiClient::new(
            &serve_once(
                "HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    .to_string(),
            )
            .await,
        );
        let reply = client.post("/api/v1/things", None).await.unwrap();
        assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
        assert!(reply.error_message().contains("502"));
    }

    #[tokio::test]
    async fn unreachable_daemon_is_an_error() {
        let client = ApiClient::new("http://127.0.0.1:1");
        assert!(client.get("/healthz").await.is_err());
    }
}
