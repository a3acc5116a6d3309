use crate::api::api_types::{ApiPart, ApiWorkOrder};
use crate::api::error::RemoteError;
use crate::api::operation::RemoteOperation;
use crate::api::types::{Part, WorkOrder};
use crate::config::Config;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// CMMS REST API client
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base_url = parse_base_url(&config.api.url)?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.api.timeout_secs))
      .user_agent(concat!("wotrack/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      token: Config::get_api_token(),
    })
  }

  fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, RemoteError> {
    let url = self.base_url.join(path)?;
    let request = self.http.request(method, url);
    Ok(match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    })
  }

  /// Send a request, mapping non-2xx responses to [`RemoteError::Status`].
  async fn send(request: RequestBuilder) -> Result<Response, RemoteError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
      status: status.as_u16(),
      body,
    })
  }

  async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
    let response = Self::send(self.request(Method::GET, path)?).await?;
    response
      .json()
      .await
      .map_err(|e| RemoteError::Decode(format!("{}: {}", path, e)))
  }

  /// Fetch all work orders
  pub async fn list_work_orders(&self) -> Result<Vec<WorkOrder>, RemoteError> {
    let orders: Vec<ApiWorkOrder> = self.get_json("work-orders").await?;
    Ok(orders.into_iter().map(WorkOrder::from).collect())
  }

  /// Fetch the parts inventory
  pub async fn list_parts(&self) -> Result<Vec<Part>, RemoteError> {
    let parts: Vec<ApiPart> = self.get_json("parts").await?;
    Ok(parts.into_iter().map(Part::from).collect())
  }

  /// Perform a state-changing call. The response body is ignored; the
  /// caller refetches the affected collection instead.
  pub async fn execute(&self, operation: &RemoteOperation) -> Result<(), RemoteError> {
    let body = operation
      .body()
      .map_err(|e| RemoteError::Decode(format!("Failed to encode request: {}", e)))?;

    let request = self.request(operation.method(), &operation.path())?.json(&body);
    Self::send(request).await?;

    debug!(%operation, "remote operation succeeded");
    Ok(())
  }
}

/// Parse the configured API url, making sure relative joins stay below it.
fn parse_base_url(raw: &str) -> Result<Url> {
  let mut url = Url::parse(raw.trim()).map_err(|e| eyre!("Invalid API url '{}': {}", raw, e))?;
  if url.cannot_be_a_base() {
    return Err(eyre!("API url '{}' cannot be used as a base url", raw));
  }
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  Ok(url)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_base_url_keeps_api_prefix() {
    let base = parse_base_url("https://cmms.example.com/api").unwrap();
    assert_eq!(
      base.join("work-orders/7/status").unwrap().as_str(),
      "https://cmms.example.com/api/work-orders/7/status"
    );
  }

  #[test]
  fn test_base_url_with_trailing_slash_unchanged() {
    let base = parse_base_url("http://localhost:8080/v1/").unwrap();
    assert_eq!(base.as_str(), "http://localhost:8080/v1/");
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(parse_base_url("not a url").is_err());
    assert!(parse_base_url("mailto:ops@example.com").is_err());
  }
}
