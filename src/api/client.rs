use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::endpoints;
use super::error::FetchError;
use super::params::Params;
use super::types::Reading;

/// Thin HTTP client for the sensor backend.
///
/// One GET per call, no retries. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ApiClient {
  http: reqwest::Client,
  base: Url,
}

impl ApiClient {
  pub fn new(base: Url, timeout: Option<Duration>) -> Result<Self, FetchError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }
    let http = builder.build().map_err(FetchError::from)?;

    Ok(Self { http, base })
  }

  pub fn base(&self) -> &Url {
    &self.base
  }

  /// `<base><endpoint>?<params>`. The base may carry a path prefix.
  pub fn url_for(&self, endpoint: &str, params: &Params) -> Result<Url, FetchError> {
    if !endpoint.starts_with('/') {
      return Err(FetchError::InvalidUrl(format!(
        "endpoint must start with '/': {}",
        endpoint
      )));
    }

    let mut url = self.base.clone();
    if url.cannot_be_a_base() {
      return Err(FetchError::InvalidUrl(format!(
        "backend url cannot be a base: {}",
        self.base
      )));
    }

    let path = format!("{}{}", self.base.path().trim_end_matches('/'), endpoint);
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    if !params.is_empty() {
      url.query_pairs_mut().extend_pairs(params.iter());
    }

    Ok(url)
  }

  /// GET `endpoint` and parse the body as JSON.
  ///
  /// Non-2xx responses become [`FetchError::RequestFailed`] with the body
  /// text. If `cancel` fires first the request is dropped and
  /// [`FetchError::Aborted`] is returned.
  pub async fn get_json(
    &self,
    endpoint: &str,
    params: &Params,
    cancel: Option<&CancellationToken>,
  ) -> Result<Value, FetchError> {
    let url = self.url_for(endpoint, params)?;

    match cancel {
      Some(token) => {
        tokio::select! {
          biased;
          _ = token.cancelled() => {
            debug!(%url, "request cancelled");
            Err(FetchError::Aborted)
          }
          result = self.send(url.clone()) => result,
        }
      }
      None => self.send(url).await,
    }
  }

  async fn send(&self, url: Url) -> Result<Value, FetchError> {
    debug!(%url, "GET");

    let response = self
      .http
      .get(url)
      .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(FetchError::RequestFailed {
        status: status.as_u16(),
        body,
      });
    }

    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  async fn get_typed<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    params: &Params,
    cancel: &CancellationToken,
  ) -> Result<T, FetchError> {
    let value = self.get_json(endpoint, params, Some(cancel)).await?;
    Ok(serde_json::from_value(value)?)
  }

  /// Downsampled readings for `variable` over the last `days` days.
  pub async fn readings(
    &self,
    variable: &str,
    days: u32,
    remove_outliers: bool,
    cancel: &CancellationToken,
  ) -> Result<Vec<Reading>, FetchError> {
    let (endpoint, params) = endpoints::readings(variable, days, remove_outliers);
    self.get_typed(&endpoint, &params, cancel).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  /// Serve exactly one canned HTTP response and hand back the request head.
  async fn one_shot_server(
    status_line: &'static str,
    body: &'static str,
  ) -> (Url, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 4096];
      let n = socket.read(&mut buf).await.unwrap();
      let request = String::from_utf8_lossy(&buf[..n]).to_string();

      let response = format!(
        "{}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        body.len(),
        body
      );
      socket.write_all(response.as_bytes()).await.unwrap();
      socket.shutdown().await.ok();
      request
    });

    (Url::parse(&format!("http://{}", addr)).unwrap(), handle)
  }

  fn client(base: &str) -> ApiClient {
    ApiClient::new(Url::parse(base).unwrap(), None).unwrap()
  }

  #[test]
  fn test_url_for_with_params() {
    let c = client("http://localhost:5000");
    let url = c
      .url_for("/api/data/PM2.5", &Params::new().with("days", 1))
      .unwrap();
    assert_eq!(url.as_str(), "http://localhost:5000/api/data/PM2.5?days=1");
  }

  #[test]
  fn test_url_for_keeps_base_prefix() {
    let c = client("https://example.org/backend/");
    let url = c.url_for("/api/averages", &Params::new()).unwrap();
    assert_eq!(url.as_str(), "https://example.org/backend/api/averages");
  }

  #[test]
  fn test_url_for_encodes_spaces() {
    let c = client("http://localhost:5000");
    let url = c
      .url_for("/api/data/Wind Speed", &Params::new().with("days", 7))
      .unwrap();
    assert_eq!(
      url.as_str(),
      "http://localhost:5000/api/data/Wind%20Speed?days=7"
    );
  }

  #[test]
  fn test_url_for_rejects_relative_endpoint() {
    let c = client("http://localhost:5000");
    assert!(matches!(
      c.url_for("api/data", &Params::new()),
      Err(FetchError::InvalidUrl(_))
    ));
  }

  #[tokio::test]
  async fn test_get_json_success() {
    let (base, server) = one_shot_server(
      "HTTP/1.1 200 OK",
      r#"[{"Timestamp":"2024-01-01T00:00:00Z","Value":12.3}]"#,
    )
    .await;

    let value = ApiClient::new(base, None)
      .unwrap()
      .get_json("/api/data/PM2.5", &Params::new().with("days", 1), None)
      .await
      .unwrap();
    assert_eq!(value[0]["Value"], serde_json::json!(12.3));

    let request = server.await.unwrap();
    assert!(request.starts_with("GET /api/data/PM2.5?days=1 HTTP/1.1"));
    assert!(request.to_lowercase().contains("content-type: application/json"));
  }

  #[tokio::test]
  async fn test_get_json_non_success_carries_status_and_body() {
    let (base, _server) =
      one_shot_server("HTTP/1.1 500 Internal Server Error", "sensor feed down").await;

    let err = ApiClient::new(base, None)
      .unwrap()
      .get_json("/api/averages", &Params::new(), None)
      .await
      .unwrap_err();

    assert_eq!(
      err,
      FetchError::RequestFailed {
        status: 500,
        body: "sensor feed down".to_string()
      }
    );
  }

  #[tokio::test]
  async fn test_get_json_bad_body_is_decode_error() {
    let (base, _server) = one_shot_server("HTTP/1.1 200 OK", "not json").await;

    let err = ApiClient::new(base, None)
      .unwrap()
      .get_json("/api/averages", &Params::new(), None)
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Decode(_)));
  }

  #[tokio::test]
  async fn test_get_json_connection_refused_is_network_error() {
    // Bind then drop to get a port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(&format!("http://{}", addr))
      .get_json("/api/averages", &Params::new(), None)
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Network(_)));
  }

  #[tokio::test]
  async fn test_get_json_precancelled() {
    let token = CancellationToken::new();
    token.cancel();

    let err = client("http://127.0.0.1:9")
      .get_json("/api/averages", &Params::new(), Some(&token))
      .await
      .unwrap_err();
    assert!(err.is_abort());
  }

  #[tokio::test]
  async fn test_readings_typed() {
    let (base, server) = one_shot_server(
      "HTTP/1.1 200 OK",
      r#"[{"Timestamp":"2024-01-01T00:00:00Z","Value":12.3}]"#,
    )
    .await;

    let readings = ApiClient::new(base, None)
      .unwrap()
      .readings("PM2.5", 1, true, &CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].value, Some(12.3));

    let request = server.await.unwrap();
    assert!(request.starts_with("GET /api/data/PM2.5?days=1&remove_outliers=true HTTP/1.1"));
  }

  #[tokio::test]
  async fn test_readings_cancelled_while_backend_hangs() {
    // Accepts the connection but never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(async move {
      let (socket, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(3600)).await;
      drop(socket);
    });

    let token = CancellationToken::new();
    let canceller = {
      let token = token.clone();
      tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
      })
    };

    let err = client(&format!("http://{}", addr))
      .readings("PM2.5", 1, true, &token)
      .await
      .unwrap_err();
    assert!(err.is_abort());
    canceller.await.unwrap();
  }
}
