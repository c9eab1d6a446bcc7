use anyhow::Result;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Reported GPS position for a task. Latitude/longitude are kept as the exact
/// strings the user entered so they round-trip without float renormalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
	pub lat: String,
	pub lng: String,
	/// Accuracy radius in meters; jitter stays inside this circle.
	#[serde(default = "default_accuracy")]
	pub accuracy: f64,
}

fn default_accuracy() -> f64 {
	10.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
	#[serde(default)]
	pub id: String,
	pub name: String,
	/// Local wall-clock time the task becomes due, stored as "HH:MM".
	#[serde(with = "hhmm")]
	pub time: NaiveTime,
	pub class_id: String,
	/// Opaque session credential for the attendance platform.
	#[serde(default)]
	pub cookie: String,
	pub location: Location,
	pub enabled: bool,
	/// Last local date this task reached a definitive outcome. One fire per day.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_fired: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeComConfig {
	pub enabled: bool,
	#[serde(default)]
	pub corp_id: String,
	#[serde(default)]
	pub secret: String,
	#[serde(default)]
	pub agent_id: String,
	#[serde(default = "default_to_user")]
	pub to_user: String,
}

fn default_to_user() -> String {
	"@all".to_string()
}

impl Default for WeComConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			corp_id: String::new(),
			secret: String::new(),
			agent_id: String::new(),
			to_user: default_to_user(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
	#[serde(default = "default_tick_interval")]
	pub tick_interval_secs: u64,
	#[serde(default = "default_retry_attempts")]
	pub retry_attempts: u32,
	#[serde(default = "default_retry_base_delay")]
	pub retry_base_delay_secs: u64,
	#[serde(default = "default_base_url")]
	pub base_url: String,
	#[serde(default = "default_login_url")]
	pub login_url: String,
}

fn default_tick_interval() -> u64 {
	30
}

fn default_retry_attempts() -> u32 {
	3
}

fn default_retry_base_delay() -> u64 {
	2
}

fn default_base_url() -> String {
	"http://k8n.cn".to_string()
}

fn default_login_url() -> String {
	"https://login.b8n.cn/qr/weixin/student/2".to_string()
}

impl Default for GeneralConfig {
	fn default() -> Self {
		Self {
			tick_interval_secs: default_tick_interval(),
			retry_attempts: default_retry_attempts(),
			retry_base_delay_secs: default_retry_base_delay(),
			base_url: default_base_url(),
			login_url: default_login_url(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
	#[serde(default)]
	pub wecom: WeComConfig,
	#[serde(default)]
	pub general: GeneralConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
	#[serde(default)]
	pub global: GlobalConfig,
	#[serde(default)]
	pub tasks: Vec<Task>,
}

/// "HH:MM" round-trip for task times.
mod hhmm {
	use chrono::NaiveTime;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(time: &NaiveTime, ser: S) -> Result<S::Ok, S::Error> {
		ser.serialize_str(&time.format("%H:%M").to_string())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<NaiveTime, D::Error> {
		let raw = String::deserialize(de)?;
		NaiveTime::parse_from_str(&raw, "%H:%M").map_err(serde::de::Error::custom)
	}
}

pub fn base_dir() -> Result<PathBuf> {
	dirs::home_dir()
		.map(|p| p.join(".autocheckin"))
		.ok_or_else(|| anyhow::anyhow!("Failed to resolve home directory"))
}

pub fn default_config_path() -> Result<PathBuf> {
	Ok(base_dir()?.join("config.json"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_time_round_trips_as_hhmm() {
		let task = Task {
			id: "t1".to_string(),
			name: "morning".to_string(),
			time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
			class_id: "12345".to_string(),
			cookie: String::new(),
			location: Location {
				lat: "30.274085".to_string(),
				lng: "120.155070".to_string(),
				accuracy: 10.0,
			},
			enabled: true,
			last_fired: None,
		};

		let json = serde_json::to_string(&task).unwrap();
		assert!(json.contains("\"08:00\""));

		let back: Task = serde_json::from_str(&json).unwrap();
		assert_eq!(back.time, task.time);
	}

	#[test]
	fn test_coordinates_preserved_verbatim() {
		// Trailing zeros would be lost through f64; strings must survive.
		let json = r#"{"lat":"30.2740850","lng":"120.1550700","accuracy":15.0}"#;
		let loc: Location = serde_json::from_str(json).unwrap();
		assert_eq!(loc.lat, "30.2740850");
		assert_eq!(loc.lng, "120.1550700");

		let out = serde_json::to_string(&loc).unwrap();
		assert_eq!(out, json);
	}

	#[test]
	fn test_config_defaults_fill_missing_fields() {
		let cfg: AppConfig = serde_json::from_str("{}").unwrap();
		assert!(cfg.tasks.is_empty());
		assert!(!cfg.global.wecom.enabled);
		assert_eq!(cfg.global.wecom.to_user, "@all");
		assert_eq!(cfg.global.general.tick_interval_secs, 30);
		assert_eq!(cfg.global.general.retry_attempts, 3);
		assert_eq!(cfg.global.general.base_url, "http://k8n.cn");
	}
}
