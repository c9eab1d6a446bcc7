use crate::config::{Task, WeComConfig};
use crate::executor::CheckinExecutor;
use crate::notify::Notifier;
use crate::store::ConfigStore;
use chrono::{Local, NaiveDate, NaiveTime};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// The timing engine: one coarse tick loop deciding which tasks are due and
/// handing them to the executor, at most once per task per calendar day.
pub struct Scheduler {
	store: Arc<ConfigStore>,
	executor: Arc<CheckinExecutor>,
	notifier: Arc<Notifier>,
	in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Scheduler {
	pub fn new(
		store: Arc<ConfigStore>,
		executor: Arc<CheckinExecutor>,
		notifier: Arc<Notifier>,
	) -> Self {
		Self {
			store,
			executor,
			notifier,
			in_flight: Arc::new(Mutex::new(HashSet::new())),
		}
	}

	pub async fn run(&self) {
		info!("scheduler started");
		loop {
			let interval = self.tick();
			sleep(interval).await;
		}
	}

	/// One evaluation pass; returns how long to sleep until the next one.
	/// Never blocks on network I/O - executions go to blocking worker threads.
	pub fn tick(&self) -> Duration {
		let config = self.store.snapshot();
		let now = Local::now();
		let today = now.date_naive();

		let due = {
			let in_flight = self.in_flight.lock().unwrap();
			due_tasks(&config.tasks, today, now.time(), &in_flight)
		};

		for task in due {
			self.dispatch(task, today, config.global.wecom.clone());
		}

		Duration::from_secs(config.global.general.tick_interval_secs.max(1))
	}

	fn dispatch(&self, task: Task, today: NaiveDate, wecom: WeComConfig) {
		self.in_flight.lock().unwrap().insert(task.id.clone());
		info!(task = %task.name, "task due, dispatching check-in");

		let store = self.store.clone();
		let executor = self.executor.clone();
		let notifier = self.notifier.clone();
		let in_flight = self.in_flight.clone();

		tokio::task::spawn_blocking(move || {
			let outcome = executor.execute(&task);
			if outcome.is_success() {
				info!(task = %task.name, detail = outcome.detail(), "check-in finished");
			} else {
				error!(task = %task.name, detail = outcome.detail(), "check-in did not succeed");
			}

			// Whatever the outcome, the task is done for today; a task that
			// exhausted its retries waits for tomorrow rather than hammering
			// a platform that may be rate-limiting.
			if let Err(e) = store.mark_fired(&task.id, today) {
				error!(task = %task.name, error = %e, "failed to record fire state");
			}

			let body = format!("{}\n{}", task.name, outcome.detail());
			if let Err(e) = notifier.notify(&wecom, outcome.headline(), &body) {
				warn!(task = %task.name, error = %e, "notification delivery failed");
			}

			in_flight.lock().unwrap().remove(&task.id);
		});
	}
}

/// A task is due when it is enabled, its wall-clock time has passed for the
/// current local date, it has not already fired today, and no execution for it
/// is still in flight. Comparing "time already passed" instead of "time equals
/// now" keeps tasks from being lost to coarse ticks, process sleep or a late
/// start - and `last_fired` keeps them from firing twice.
pub fn due_tasks(
	tasks: &[Task],
	today: NaiveDate,
	now: NaiveTime,
	in_flight: &HashSet<String>,
) -> Vec<Task> {
	tasks
		.iter()
		.filter(|t| {
			t.enabled
				&& t.time <= now
				&& t.last_fired != Some(today)
				&& !in_flight.contains(&t.id)
		})
		.cloned()
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Location;
	use crate::executor::RetryPolicy;
	use crate::notify::tests::CountingApi;
	use crate::platform::{CheckinPlatform, PlatformError};
	use tempfile::TempDir;

	fn task_at(hour: u32, minute: u32) -> Task {
		Task {
			id: "t1".to_string(),
			name: "morning".to_string(),
			time: NaiveTime::from_hms_opt(hour, minute, 0).unwrap(),
			class_id: "40121".to_string(),
			cookie: "remember_token=abc".to_string(),
			location: Location {
				lat: "30.274085".to_string(),
				lng: "120.155070".to_string(),
				accuracy: 10.0,
			},
			enabled: true,
			last_fired: None,
		}
	}

	fn at(hour: u32, minute: u32) -> NaiveTime {
		NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
	}

	fn today() -> NaiveDate {
		NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
	}

	#[test]
	fn test_not_due_before_scheduled_time() {
		let tasks = vec![task_at(8, 0)];
		let due = due_tasks(&tasks, today(), at(7, 59), &HashSet::new());
		assert!(due.is_empty());
	}

	#[test]
	fn test_due_once_time_has_passed() {
		let tasks = vec![task_at(8, 0)];
		let due = due_tasks(&tasks, today(), at(8, 1), &HashSet::new());
		assert_eq!(due.len(), 1);

		// Still due much later the same day if it never fired (late start).
		let due = due_tasks(&tasks, today(), at(8, 20), &HashSet::new());
		assert_eq!(due.len(), 1);
	}

	#[test]
	fn test_fired_today_is_not_due_again() {
		let mut task = task_at(8, 0);
		task.last_fired = Some(today());
		let tasks = vec![task];

		let due = due_tasks(&tasks, today(), at(8, 5), &HashSet::new());
		assert!(due.is_empty());

		// The next calendar day it becomes due again.
		let tomorrow = today().succ_opt().unwrap();
		let due = due_tasks(&tasks, tomorrow, at(8, 1), &HashSet::new());
		assert_eq!(due.len(), 1);
	}

	#[test]
	fn test_disabled_task_is_never_due() {
		let mut task = task_at(8, 0);
		task.enabled = false;
		let due = due_tasks(&[task], today(), at(12, 0), &HashSet::new());
		assert!(due.is_empty());
	}

	#[test]
	fn test_in_flight_task_is_not_redispatched() {
		let tasks = vec![task_at(8, 0)];
		let mut in_flight = HashSet::new();
		in_flight.insert("t1".to_string());

		let due = due_tasks(&tasks, today(), at(8, 1), &in_flight);
		assert!(due.is_empty());
	}

	#[test]
	fn test_only_eligible_tasks_selected() {
		let early = task_at(6, 0);
		let mut late = task_at(22, 0);
		late.id = "t2".to_string();

		let due = due_tasks(&[early, late], today(), at(12, 0), &HashSet::new());
		assert_eq!(due.len(), 1);
		assert_eq!(due[0].id, "t1");
	}

	struct AlwaysOk;

	impl CheckinPlatform for AlwaysOk {
		fn active_checkins(&self, _task: &Task) -> Result<Vec<String>, PlatformError> {
			Ok(vec![])
		}

		fn submit_checkin(
			&self,
			_task: &Task,
			_checkin_id: &str,
			_lat: &str,
			_lng: &str,
		) -> Result<String, PlatformError> {
			Ok("签到成功".to_string())
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_tick_records_fire_state_after_outcome() {
		let dir = TempDir::new().unwrap();
		let store = Arc::new(ConfigStore::open(dir.path().join("config.json")).unwrap());

		// Due immediately: scheduled at midnight, never fired.
		let task = store.upsert_task(task_at(0, 0)).unwrap();

		let executor = Arc::new(CheckinExecutor::new(
			Arc::new(AlwaysOk),
			RetryPolicy::new(1, Duration::from_millis(0)),
		));
		let notifier = Arc::new(Notifier::new(Arc::new(CountingApi::ok())));
		let scheduler = Scheduler::new(store.clone(), executor, notifier);

		scheduler.tick();

		// Wait for the blocking execution to settle.
		for _ in 0..100 {
			if store.get_task(&task.id).unwrap().last_fired.is_some() {
				break;
			}
			sleep(Duration::from_millis(10)).await;
		}

		let today = Local::now().date_naive();
		assert_eq!(store.get_task(&task.id).unwrap().last_fired, Some(today));

		// A second tick the same day dispatches nothing further.
		scheduler.tick();
		sleep(Duration::from_millis(50)).await;
		assert!(scheduler.in_flight.lock().unwrap().is_empty());
	}
}
