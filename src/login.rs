use crate::platform::{LoginAttempt, LoginProvider, LoginResult, PlatformError};
use image::Luma;
use qrcode::QrCode;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoginError {
	#[error("login platform unreachable: {0}")]
	Upstream(String),
	#[error("login session expired, request a new QR code")]
	Expired,
	#[error("failed to render QR code: {0}")]
	Qr(String),
}

impl From<PlatformError> for LoginError {
	fn from(e: PlatformError) -> Self {
		match e {
			PlatformError::Rejected(reason) | PlatformError::Transient(reason) => {
				LoginError::Upstream(reason)
			}
		}
	}
}

/// What the caller shows the user: a QR image to scan and the token to poll with.
pub struct LoginChallenge {
	pub qr_png: Vec<u8>,
	pub poll_token: String,
}

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(180);

struct LoginSession {
	attempt: Box<dyn LoginAttempt>,
	created_at: Instant,
}

/// Caller-driven QR login. No background loop lives here: the caller polls on
/// its own interval and may simply stop - abandoned sessions are reaped on
/// later calls, nothing leaks.
pub struct LoginFlow {
	provider: Box<dyn LoginProvider>,
	sessions: Mutex<HashMap<String, LoginSession>>,
	max_age: Duration,
}

impl LoginFlow {
	pub fn new(provider: Box<dyn LoginProvider>) -> Self {
		Self::with_max_age(provider, DEFAULT_MAX_AGE)
	}

	pub fn with_max_age(provider: Box<dyn LoginProvider>, max_age: Duration) -> Self {
		Self {
			provider,
			sessions: Mutex::new(HashMap::new()),
			max_age,
		}
	}

	/// Start a fresh login attempt and render its QR code.
	pub fn begin(&self) -> Result<LoginChallenge, LoginError> {
		self.reap_expired();

		let attempt = self.provider.begin()?;
		let qr_png = render_qr_png(attempt.login_url())?;
		let poll_token = uuid::Uuid::new_v4().to_string();

		self.sessions.lock().unwrap().insert(
			poll_token.clone(),
			LoginSession {
				attempt,
				created_at: Instant::now(),
			},
		);

		Ok(LoginChallenge { qr_png, poll_token })
	}

	/// One status check. `Ok(None)` while the QR is unscanned, the credential
	/// exactly once on completion, `Expired` for unknown or over-age tokens.
	pub fn poll(&self, poll_token: &str) -> Result<Option<LoginResult>, LoginError> {
		// The session is taken out of the map while its poll is in flight so
		// the lock is never held across network I/O.
		let session = self
			.sessions
			.lock()
			.unwrap()
			.remove(poll_token)
			.ok_or(LoginError::Expired)?;

		if session.created_at.elapsed() > self.max_age {
			return Err(LoginError::Expired);
		}

		match session.attempt.poll() {
			Ok(Some(result)) => Ok(Some(result)),
			Ok(None) => {
				self.restore(poll_token, session);
				Ok(None)
			}
			Err(e) => {
				// A network blip should not burn the session; the caller can
				// poll again.
				self.restore(poll_token, session);
				Err(e.into())
			}
		}
	}

	fn restore(&self, poll_token: &str, session: LoginSession) {
		self.sessions
			.lock()
			.unwrap()
			.insert(poll_token.to_string(), session);
	}

	fn reap_expired(&self) {
		let max_age = self.max_age;
		self.sessions
			.lock()
			.unwrap()
			.retain(|_, s| s.created_at.elapsed() <= max_age);
	}
}

fn render_qr_png(url: &str) -> Result<Vec<u8>, LoginError> {
	let code = QrCode::new(url).map_err(|e| LoginError::Qr(e.to_string()))?;
	let image = code.render::<Luma<u8>>().build();

	let mut buffer = Cursor::new(Vec::new());
	image
		.write_to(&mut buffer, image::ImageFormat::Png)
		.map_err(|e| LoginError::Qr(e.to_string()))?;

	Ok(buffer.into_inner())
}
