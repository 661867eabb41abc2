use crate::config::BackendConfig;
use crate::connectivity::Probe;
use crate::kpi::KpiSource;
use crate::session::{Session, SessionSource};
use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

/// Managed backend client speaking the REST RPC surface
#[derive(Clone)]
pub struct RemoteClient {
  http: reqwest::Client,
  base_url: Url,
  api_key: String,
  access_token: Option<String>,
  business_id: Option<String>,
}

impl RemoteClient {
  pub fn new(config: &BackendConfig, api_key: String) -> Result<Self> {
    let mut base_url = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid backend url {}: {}", config.url, e))?;
    // Url::join drops the last segment unless the path ends with a slash
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(std::time::Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      api_key,
      access_token: None,
      business_id: config.business_id.clone(),
    })
  }

  /// Authenticate subsequent calls as a signed-in user
  pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
    self.access_token = Some(token.into());
    self
  }

  /// Call a remote procedure and return its raw JSON result
  pub async fn rpc(&self, function: &str, params: &Value) -> Result<Value> {
    let url = self
      .base_url
      .join(&format!("rest/v1/rpc/{}", function))
      .map_err(|e| eyre!("Invalid RPC name {}: {}", function, e))?;
    let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);

    let response = self
      .http
      .post(url)
      .header("apikey", &self.api_key)
      .bearer_auth(bearer)
      .json(params)
      .send()
      .await
      .map_err(|e| eyre!("Failed to call {}: {}", function, e))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(eyre!("RPC {} failed with status {}: {}", function, status, body));
    }

    let body = response
      .text()
      .await
      .map_err(|e| eyre!("Failed to read {} response: {}", function, e))?;
    // Void functions answer with an empty body
    if body.trim().is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| eyre!("Failed to parse {} response: {}", function, e))
  }

  /// Parameters every aggregate RPC takes
  pub fn business_params(&self) -> Value {
    match &self.business_id {
      Some(id) => json!({ "p_business_id": id }),
      None => json!({}),
    }
  }

  /// Exchange a refresh token for a new session
  pub async fn refresh_session(&self, refresh_token: &str) -> Result<Session> {
    let mut url = self
      .base_url
      .join("auth/v1/token")
      .map_err(|e| eyre!("Invalid auth url: {}", e))?;
    url.set_query(Some("grant_type=refresh_token"));

    let response = self
      .http
      .post(url)
      .header("apikey", &self.api_key)
      .json(&json!({ "refresh_token": refresh_token }))
      .send()
      .await
      .map_err(|e| eyre!("Failed to refresh session: {}", e))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(eyre!("Session refresh failed with status {}: {}", status, body));
    }

    let token: ApiTokenResponse = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse session: {}", e))?;

    Ok(Session {
      access_token: token.access_token,
      refresh_token: token.refresh_token,
      user_id: token.user.map(|u| u.id),
      expires_at: token.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
    })
  }
}

#[derive(Debug, Deserialize)]
struct ApiTokenResponse {
  access_token: String,
  refresh_token: Option<String>,
  expires_in: Option<i64>,
  user: Option<ApiUser>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
  id: String,
}

impl KpiSource for RemoteClient {
  async fn today_sales_total(&self) -> Result<Value> {
    self.rpc("get_today_sales_total", &self.business_params()).await
  }

  async fn today_expenses_total(&self) -> Result<Value> {
    self.rpc("get_today_expenses_total", &self.business_params()).await
  }

  async fn inventory_totals(&self) -> Result<Value> {
    self.rpc("get_inventory_totals", &self.business_params()).await
  }

  async fn active_orders_count(&self) -> Result<Value> {
    self.rpc("get_active_orders_count", &self.business_params()).await
  }
}

impl Probe for RemoteClient {
  /// Any HTTP answer counts as reachable; only transport failures do not.
  async fn is_reachable(&self) -> bool {
    let Ok(url) = self.base_url.join("rest/v1/") else {
      return false;
    };
    self
      .http
      .get(url)
      .header("apikey", &self.api_key)
      .timeout(std::time::Duration::from_secs(5))
      .send()
      .await
      .is_ok()
  }
}

/// Session source backed by a stored refresh token
pub struct RefreshTokenSource {
  client: RemoteClient,
  refresh_token: String,
}

impl RefreshTokenSource {
  pub fn new(client: RemoteClient, refresh_token: String) -> Self {
    Self {
      client,
      refresh_token,
    }
  }
}

impl SessionSource for RefreshTokenSource {
  async fn fetch_session(&self) -> Result<Session> {
    self.client.refresh_session(&self.refresh_token).await
  }
}
