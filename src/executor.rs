use crate::config::{Location, Task};
use crate::platform::{CheckinPlatform, PlatformError};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// Terminal result of one execution attempt. Whatever the variant, the
/// scheduler marks the task fired for the day - retries happened in here.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
	Success { message: String },
	/// Platform-side denial (expired cookie, out of range, closed session).
	Rejected { reason: String },
	/// Network/server trouble that survived every retry.
	TransientFailure { reason: String },
	/// The task itself is unusable (no cookie, malformed coordinates).
	ConfigError { reason: String },
}

impl Outcome {
	pub fn is_success(&self) -> bool {
		matches!(self, Outcome::Success { .. })
	}

	pub fn headline(&self) -> &'static str {
		match self {
			Outcome::Success { .. } => "Check-in succeeded",
			Outcome::Rejected { .. } => "Check-in rejected",
			Outcome::TransientFailure { .. } => "Check-in failed",
			Outcome::ConfigError { .. } => "Check-in misconfigured",
		}
	}

	pub fn detail(&self) -> &str {
		match self {
			Outcome::Success { message } => message,
			Outcome::Rejected { reason }
			| Outcome::TransientFailure { reason }
			| Outcome::ConfigError { reason } => reason,
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub attempts: u32,
	pub base_delay: Duration,
}

impl RetryPolicy {
	pub fn new(attempts: u32, base_delay: Duration) -> Self {
		Self {
			attempts: attempts.max(1),
			base_delay,
		}
	}
}

pub struct CheckinExecutor {
	platform: Arc<dyn CheckinPlatform>,
	retry: RetryPolicy,
}

impl CheckinExecutor {
	pub fn new(platform: Arc<dyn CheckinPlatform>, retry: RetryPolicy) -> Self {
		Self { platform, retry }
	}

	/// Run one task to a definitive outcome. Never touches the config store;
	/// recording fire state is the scheduler's job.
	pub fn execute(&self, task: &Task) -> Outcome {
		if task.cookie.trim().is_empty() {
			return Outcome::ConfigError {
				reason: "task has no session cookie; log in first".to_string(),
			};
		}
		// Surface bad coordinates before any network traffic.
		if let Err(reason) = parse_coordinates(&task.location) {
			return Outcome::ConfigError { reason };
		}

		let ids = match self.with_retry(|| self.platform.active_checkins(task)) {
			Ok(ids) => ids,
			Err(PlatformError::Rejected(reason)) => return Outcome::Rejected { reason },
			Err(PlatformError::Transient(reason)) => {
				return Outcome::TransientFailure { reason }
			}
		};

		if ids.is_empty() {
			return Outcome::Success {
				message: "no open check-in sessions".to_string(),
			};
		}

		let mut messages = Vec::new();
		for id in &ids {
			// Fresh jitter per submission so repeated requests never report
			// the same suspiciously exact spot.
			let (lat, lng) = match jitter_coordinate(&task.location) {
				Ok(coord) => coord,
				Err(reason) => return Outcome::ConfigError { reason },
			};

			match self.with_retry(|| self.platform.submit_checkin(task, id, &lat, &lng)) {
				Ok(message) => {
					info!(task = %task.name, checkin_id = %id, %lat, %lng, "signed in");
					messages.push(format!("{id}: {message}"));
				}
				Err(PlatformError::Rejected(reason)) => {
					return Outcome::Rejected {
						reason: format!("{id}: {reason}"),
					}
				}
				Err(PlatformError::Transient(reason)) => {
					return Outcome::TransientFailure {
						reason: format!("{id}: {reason}"),
					}
				}
			}
		}

		Outcome::Success {
			message: messages.join("; "),
		}
	}

	/// Bounded exponential backoff around transient failures; rejections pass
	/// straight through since retrying cannot help them.
	fn with_retry<T>(
		&self,
		mut op: impl FnMut() -> Result<T, PlatformError>,
	) -> Result<T, PlatformError> {
		let mut delay = self.retry.base_delay;
		let mut last = String::new();

		for attempt in 1..=self.retry.attempts {
			match op() {
				Ok(value) => return Ok(value),
				Err(PlatformError::Rejected(reason)) => {
					return Err(PlatformError::Rejected(reason))
				}
				Err(PlatformError::Transient(reason)) => {
					warn!(attempt, error = %reason, "transient platform failure");
					last = reason;
					if attempt < self.retry.attempts {
						thread::sleep(delay);
						delay *= 2;
					}
				}
			}
		}

		Err(PlatformError::Transient(format!(
			"gave up after {} attempts: {last}",
			self.retry.attempts
		)))
	}
}

fn parse_coordinates(location: &Location) -> Result<(f64, f64), String> {
	let lat: f64 = location
		.lat
		.trim()
		.parse()
		.map_err(|_| format!("invalid latitude {:?}", location.lat))?;
	let lng: f64 = location
		.lng
		.trim()
		.parse()
		.map_err(|_| format!("invalid longitude {:?}", location.lng))?;
	Ok((lat, lng))
}

/// Draw a point uniformly within `accuracy` meters of the stored coordinate,
/// formatted to the six decimals the platform expects.
pub fn jitter_coordinate(location: &Location) -> Result<(String, String), String> {
	let (lat, lng) = parse_coordinates(location)?;
	let radius = location.accuracy.max(0.0);

	let mut rng = rand::thread_rng();
	// sqrt keeps the draw uniform over the disk rather than clustered center.
	let r = radius * rng.gen::<f64>().sqrt();
	let theta = rng.gen::<f64>() * std::f64::consts::TAU;

	let north = r * theta.sin();
	let east = r * theta.cos();
	let dlat = north / METERS_PER_DEGREE_LAT;
	let dlng = east / (METERS_PER_DEGREE_LAT * lat.to_radians().cos().max(1e-6));

	Ok((format!("{:.6}", lat + dlat), format!("{:.6}", lng + dlng)))
}
