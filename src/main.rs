mod config;
mod executor;
mod login;
mod notify;
mod platform;
mod scheduler;
mod store;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use config::{Location, Task};
use executor::{CheckinExecutor, RetryPolicy};
use login::{LoginError, LoginFlow};
use notify::{HttpWeComApi, Notifier};
use platform::k8n::{K8nLoginProvider, K8nPlatform};
use scheduler::Scheduler;
use store::{ConfigStore, StoreError};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "autocheckin")]
#[command(about = "Scheduled class check-in daemon with QR login and WeCom notifications")]
struct Cli {
	/// Config file path (defaults to ~/.autocheckin/config.json)
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the scheduler daemon in the foreground
	Run,
	/// Log in by QR scan; stores the credential on a task with --task
	Login {
		/// Task id to receive the credential; printed when omitted
		#[arg(long)]
		task: Option<String>,
	},
	/// Manage check-in tasks
	Task {
		#[command(subcommand)]
		command: TaskCommands,
	},
	/// Inspect the stored configuration
	Config {
		#[command(subcommand)]
		command: ConfigCommands,
	},
	/// Configure or test WeCom notifications
	Notify {
		#[command(subcommand)]
		command: NotifyCommands,
	},
}

#[derive(Subcommand)]
enum TaskCommands {
	/// Print all tasks as JSON
	List,
	/// Add a task
	Add {
		/// Display name
		name: String,
		/// Due time as HH:MM, local clock
		#[arg(long)]
		time: String,
		/// Class id on the attendance platform
		#[arg(long)]
		class_id: String,
		/// Session cookie; usually filled in later via `login --task`
		#[arg(long, default_value = "")]
		cookie: String,
		/// Latitude to report, decimal degrees
		#[arg(long)]
		lat: String,
		/// Longitude to report, decimal degrees
		#[arg(long)]
		lng: String,
		/// Accuracy radius in meters
		#[arg(long, default_value_t = 10.0)]
		accuracy: f64,
		/// Create the task disabled
		#[arg(long, default_value_t = false)]
		disabled: bool,
	},
	/// Edit fields of an existing task
	Set {
		id: String,
		#[arg(long)]
		name: Option<String>,
		/// Due time as HH:MM, local clock
		#[arg(long)]
		time: Option<String>,
		#[arg(long)]
		class_id: Option<String>,
		#[arg(long)]
		cookie: Option<String>,
		#[arg(long)]
		lat: Option<String>,
		#[arg(long)]
		lng: Option<String>,
		#[arg(long)]
		accuracy: Option<f64>,
	},
	/// Remove a task (removing a missing id is not an error)
	Rm { id: String },
	/// Enable a task
	Enable { id: String },
	/// Disable a task without losing its fire history
	Disable { id: String },
	/// Execute a task immediately, outside the schedule
	Run { id: String },
}

#[derive(Subcommand)]
enum ConfigCommands {
	/// Print the full configuration as JSON
	Show,
	/// Print the config file path
	Path,
}

#[derive(Subcommand)]
enum NotifyCommands {
	/// Update WeCom settings; only the given fields change
	Set {
		#[arg(long)]
		enabled: Option<bool>,
		#[arg(long)]
		corp_id: Option<String>,
		#[arg(long)]
		secret: Option<String>,
		#[arg(long)]
		agent_id: Option<String>,
		#[arg(long)]
		to_user: Option<String>,
	},
	/// Send a test message with the stored settings
	Test,
}

fn main() -> Result<()> {
	let subscriber = FmtSubscriber::builder()
		.with_max_level(Level::INFO)
		.finish();
	tracing::subscriber::set_global_default(subscriber).ok();

	let cli = Cli::parse();
	let path = match cli.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let store = Arc::new(ConfigStore::open(path).context("failed to open config store")?);

	match cli.command {
		Commands::Run => tokio::runtime::Runtime::new()
			.context("failed to start runtime")?
			.block_on(run_daemon(store)),
		Commands::Login { task } => run_login(&store, task),
		Commands::Task { command } => handle_task(&store, command),
		Commands::Config { command } => handle_config(&store, command),
		Commands::Notify { command } => handle_notify(&store, command),
	}
}

async fn run_daemon(store: Arc<ConfigStore>) -> Result<()> {
	let snapshot = store.snapshot();
	let general = snapshot.global.general;
	info!(
		config = %store.path().display(),
		tasks = snapshot.tasks.len(),
		tick_interval_secs = general.tick_interval_secs,
		"daemon starting"
	);

	let platform = Arc::new(K8nPlatform::new(&general.base_url)?);
	let retry = RetryPolicy::new(
		general.retry_attempts,
		Duration::from_secs(general.retry_base_delay_secs),
	);
	let executor = Arc::new(CheckinExecutor::new(platform, retry));
	let notifier = Arc::new(Notifier::new(Arc::new(HttpWeComApi::new()?)));

	Scheduler::new(store, executor, notifier).run().await;
	Ok(())
}

fn run_login(store: &ConfigStore, task_id: Option<String>) -> Result<()> {
	let general = store.snapshot().global.general;
	let provider = K8nLoginProvider::new(&general.login_url, &general.base_url);
	let flow = LoginFlow::new(Box::new(provider));

	let challenge = flow.begin()?;
	let qr_path = std::env::temp_dir().join("autocheckin-login.png");
	fs::write(&qr_path, &challenge.qr_png)
		.with_context(|| format!("failed to write QR image to {}", qr_path.display()))?;
	println!("Scan the QR code with WeChat: {}", qr_path.display());

	loop {
		std::thread::sleep(Duration::from_secs(2));
		match flow.poll(&challenge.poll_token) {
			Ok(Some(result)) => {
				println!("Login confirmed.");
				match task_id {
					Some(id) => {
						let mut task = store
							.get_task(&id)
							.ok_or_else(|| anyhow::anyhow!("no task with id {id}"))?;
						task.cookie = result.cookie;
						if !result.class_id.is_empty() {
							task.class_id = result.class_id;
						}
						store.update_task(task)?;
						println!("Credential stored on task {id}.");
					}
					None => {
						println!("cookie: {}", result.cookie);
						println!("class_id: {}", result.class_id);
					}
				}
				return Ok(());
			}
			Ok(None) => {}
			Err(LoginError::Expired) => {
				anyhow::bail!("login session expired before it was scanned; run login again")
			}
			Err(e) => warn!(error = %e, "login poll failed, retrying"),
		}
	}
}

fn handle_task(store: &ConfigStore, command: TaskCommands) -> Result<()> {
	match command {
		TaskCommands::List => {
			let tasks = store.snapshot().tasks;
			println!("{}", serde_json::to_string_pretty(&tasks)?);
			Ok(())
		}
		TaskCommands::Add {
			name,
			time,
			class_id,
			cookie,
			lat,
			lng,
			accuracy,
			disabled,
		} => {
			let time = NaiveTime::parse_from_str(&time, "%H:%M")
				.context("time must be HH:MM, e.g. 08:00")?;
			let task = store.upsert_task(Task {
				id: String::new(),
				name,
				time,
				class_id,
				cookie,
				location: Location { lat, lng, accuracy },
				enabled: !disabled,
				last_fired: None,
			})?;
			println!("added task {}", task.id);
			Ok(())
		}
		TaskCommands::Set {
			id,
			name,
			time,
			class_id,
			cookie,
			lat,
			lng,
			accuracy,
		} => {
			let mut task = store
				.get_task(&id)
				.ok_or_else(|| anyhow::anyhow!("no task with id {id}"))?;
			if let Some(name) = name {
				task.name = name;
			}
			if let Some(time) = time {
				task.time = NaiveTime::parse_from_str(&time, "%H:%M")
					.context("time must be HH:MM, e.g. 08:00")?;
			}
			if let Some(class_id) = class_id {
				task.class_id = class_id;
			}
			if let Some(cookie) = cookie {
				task.cookie = cookie;
			}
			if let Some(lat) = lat {
				task.location.lat = lat;
			}
			if let Some(lng) = lng {
				task.location.lng = lng;
			}
			if let Some(accuracy) = accuracy {
				task.location.accuracy = accuracy;
			}
			store.update_task(task)?;
			println!("updated task {id}");
			Ok(())
		}
		TaskCommands::Rm { id } => match store.delete_task(&id) {
			Ok(()) => {
				println!("removed task {id}");
				Ok(())
			}
			Err(StoreError::NotFound(_)) => {
				println!("no task {id}, nothing to remove");
				Ok(())
			}
			Err(e) => Err(e.into()),
		},
		TaskCommands::Enable { id } => set_enabled(store, &id, true),
		TaskCommands::Disable { id } => set_enabled(store, &id, false),
		TaskCommands::Run { id } => {
			let task = store
				.get_task(&id)
				.ok_or_else(|| anyhow::anyhow!("no task with id {id}"))?;
			let general = store.snapshot().global.general;

			let platform = Arc::new(K8nPlatform::new(&general.base_url)?);
			let retry = RetryPolicy::new(
				general.retry_attempts,
				Duration::from_secs(general.retry_base_delay_secs),
			);
			let executor = CheckinExecutor::new(platform, retry);

			let outcome = executor.execute(&task);
			println!("{}: {}", outcome.headline(), outcome.detail());
			if !outcome.is_success() {
				std::process::exit(1);
			}
			Ok(())
		}
	}
}

fn set_enabled(store: &ConfigStore, id: &str, enabled: bool) -> Result<()> {
	let mut task = store
		.get_task(id)
		.ok_or_else(|| anyhow::anyhow!("no task with id {id}"))?;
	task.enabled = enabled;
	store.update_task(task)?;
	println!(
		"task {id} {}",
		if enabled { "enabled" } else { "disabled" }
	);
	Ok(())
}

fn handle_config(store: &ConfigStore, command: ConfigCommands) -> Result<()> {
	match command {
		ConfigCommands::Show => {
			println!("{}", serde_json::to_string_pretty(&store.snapshot())?);
			Ok(())
		}
		ConfigCommands::Path => {
			println!("{}", store.path().display());
			Ok(())
		}
	}
}

fn handle_notify(store: &ConfigStore, command: NotifyCommands) -> Result<()> {
	match command {
		NotifyCommands::Set {
			enabled,
			corp_id,
			secret,
			agent_id,
			to_user,
		} => {
			let mut cfg = store.snapshot();
			let wecom = &mut cfg.global.wecom;
			if let Some(enabled) = enabled {
				wecom.enabled = enabled;
			}
			if let Some(corp_id) = corp_id {
				wecom.corp_id = corp_id;
			}
			if let Some(secret) = secret {
				wecom.secret = secret;
			}
			if let Some(agent_id) = agent_id {
				wecom.agent_id = agent_id;
			}
			if let Some(to_user) = to_user {
				wecom.to_user = to_user;
			}
			store.replace(cfg)?;
			println!("notification settings updated");
			Ok(())
		}
		NotifyCommands::Test => {
			let wecom = store.snapshot().global.wecom;
			if !wecom.enabled {
				anyhow::bail!("notifications are disabled; run `notify set --enabled true` first");
			}
			let notifier = Notifier::new(Arc::new(HttpWeComApi::new()?));
			notifier.notify(&wecom, "Test notification", "autocheckin can reach you.")?;
			println!("test message sent to {}", wecom.to_user);
			Ok(())
		}
	}
}
