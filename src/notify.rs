use crate::config::WeComConfig;
use chrono::Local;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NotifyError {
	#[error("notification settings incomplete: {0} is empty")]
	Incomplete(&'static str),
	#[error("messaging endpoint failure: {0}")]
	Upstream(String),
}

/// Cached WeCom access token. Lives in memory only; a process restart simply
/// fetches a fresh one.
#[derive(Debug, Clone)]
pub struct AccessToken {
	pub value: String,
	expires_at: Instant,
}

impl AccessToken {
	pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
		Self {
			value: value.into(),
			expires_at: Instant::now() + ttl,
		}
	}

	fn is_fresh(&self) -> bool {
		Instant::now() < self.expires_at
	}
}

/// Delivery result, distinguishing token rejection so the dispatcher can
/// refresh and retry exactly once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SendStatus {
	Delivered,
	TokenRejected,
}

/// The WeCom HTTP API behind a trait so tests can count calls.
pub trait WeComApi: Send + Sync {
	fn fetch_token(&self, corp_id: &str, secret: &str) -> Result<AccessToken, NotifyError>;

	fn send_text(
		&self,
		token: &str,
		agent_id: &str,
		to_user: &str,
		content: &str,
	) -> Result<SendStatus, NotifyError>;
}

/// Delivers execution outcomes via WeCom, owning the token lifecycle.
pub struct Notifier {
	api: Arc<dyn WeComApi>,
	token: Mutex<Option<AccessToken>>,
}

impl Notifier {
	pub fn new(api: Arc<dyn WeComApi>) -> Self {
		Self {
			api,
			token: Mutex::new(None),
		}
	}

	/// Send `title`/`body` to the configured recipient. A disabled config is a
	/// no-op success so callers never have to branch.
	pub fn notify(&self, cfg: &WeComConfig, title: &str, body: &str) -> Result<(), NotifyError> {
		if !cfg.enabled {
			return Ok(());
		}
		validate(cfg)?;

		let content = format!(
			"【autocheckin】\n{}\n----------------\n{}\nTime: {}",
			title,
			body,
			Local::now().format("%Y-%m-%d %H:%M:%S")
		);

		let token = self.current_token(cfg)?;
		match self
			.api
			.send_text(&token, &cfg.agent_id, &cfg.to_user, &content)?
		{
			SendStatus::Delivered => Ok(()),
			SendStatus::TokenRejected => {
				debug!("access token rejected by remote, refreshing once");
				self.invalidate();
				let token = self.current_token(cfg)?;
				match self
					.api
					.send_text(&token, &cfg.agent_id, &cfg.to_user, &content)?
				{
					SendStatus::Delivered => Ok(()),
					SendStatus::TokenRejected => Err(NotifyError::Upstream(
						"access token rejected twice in a row".to_string(),
					)),
				}
			}
		}
	}

	/// The lock is held across the fetch, so concurrent cold sends coalesce
	/// into a single token request instead of racing.
	fn current_token(&self, cfg: &WeComConfig) -> Result<String, NotifyError> {
		let mut guard = self.token.lock().unwrap();
		if let Some(token) = guard.as_ref() {
			if token.is_fresh() {
				return Ok(token.value.clone());
			}
		}

		let token = self.api.fetch_token(&cfg.corp_id, &cfg.secret)?;
		let value = token.value.clone();
		*guard = Some(token);
		Ok(value)
	}

	fn invalidate(&self) {
		*self.token.lock().unwrap() = None;
	}
}

/// Enabled settings need all four fields; checked at dispatch time only, so
/// saving a half-filled config never fails.
fn validate(cfg: &WeComConfig) -> Result<(), NotifyError> {
	if cfg.corp_id.trim().is_empty() {
		return Err(NotifyError::Incomplete("corp_id"));
	}
	if cfg.secret.trim().is_empty() {
		return Err(NotifyError::Incomplete("secret"));
	}
	if cfg.agent_id.trim().is_empty() {
		return Err(NotifyError::Incomplete("agent_id"));
	}
	if cfg.to_user.trim().is_empty() {
		return Err(NotifyError::Incomplete("to_user"));
	}
	Ok(())
}

const WECOM_API_BASE: &str = "https://qyapi.weixin.qq.com/cgi-bin";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Refresh slightly before the provider-announced expiry.
const TOKEN_EXPIRY_MARGIN: u64 = 60;

/// Error codes WeCom returns for an invalid or expired access token.
const TOKEN_REJECTED_CODES: &[i64] = &[40014, 41001, 42001];

pub struct HttpWeComApi {
	client: reqwest::blocking::Client,
}

impl HttpWeComApi {
	pub fn new() -> Result<Self, NotifyError> {
		let client = reqwest::blocking::Client::builder()
			.timeout(REQUEST_TIMEOUT)
			.build()
			.map_err(|e| NotifyError::Upstream(e.to_string()))?;
		Ok(Self { client })
	}
}

impl WeComApi for HttpWeComApi {
	fn fetch_token(&self, corp_id: &str, secret: &str) -> Result<AccessToken, NotifyError> {
		let url = format!("{WECOM_API_BASE}/gettoken?corpid={corp_id}&corpsecret={secret}");
		let resp: Value = self
			.client
			.get(&url)
			.send()
			.map_err(|e| NotifyError::Upstream(e.to_string()))?
			.json()
			.map_err(|e| NotifyError::Upstream(e.to_string()))?;

		let token = resp
			.get("access_token")
			.and_then(Value::as_str)
			.ok_or_else(|| {
				NotifyError::Upstream(format!(
					"token endpoint returned no access_token: {resp}"
				))
			})?;
		let expires_in = resp
			.get("expires_in")
			.and_then(Value::as_u64)
			.unwrap_or(7200);

		Ok(AccessToken::new(
			token,
			Duration::from_secs(expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN)),
		))
	}

	fn send_text(
		&self,
		token: &str,
		agent_id: &str,
		to_user: &str,
		content: &str,
	) -> Result<SendStatus, NotifyError> {
		let url = format!("{WECOM_API_BASE}/message/send?access_token={token}");
		let payload = serde_json::json!({
			"touser": to_user,
			"msgtype": "text",
			"agentid": agent_id,
			"text": { "content": content },
			"safe": 0,
		});

		let resp: Value = self
			.client
			.post(&url)
			.json(&payload)
			.send()
			.map_err(|e| NotifyError::Upstream(e.to_string()))?
			.json()
			.map_err(|e| NotifyError::Upstream(e.to_string()))?;

		match resp.get("errcode").and_then(Value::as_i64) {
			Some(0) => Ok(SendStatus::Delivered),
			Some(code) if TOKEN_REJECTED_CODES.contains(&code) => Ok(SendStatus::TokenRejected),
			_ => Err(NotifyError::Upstream(format!("message send failed: {resp}"))),
		}
	}
}
