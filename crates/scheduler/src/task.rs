//! Task records, validation, and the in-memory store.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use mqmesh_core::{now_ms, rand_hex};

/// How a task's fire time is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// Fire once at an absolute time.
    Scheduled,
    /// Fire once after a relative delay.
    Countdown,
    /// Fire repeatedly at a fixed interval.
    Recurring,
}

/// A stored task. `device_id` is the target clientId.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub device_id: String,
    pub command: Value,
    pub mode: TaskMode,
    /// Next fire time, ms epoch.
    pub execute_at: i64,
    /// Recurrence period in ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<i64>,
    pub enabled: bool,
}

/// Parameters for creating a task. `countdown` and `interval` are seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub device_id: String,
    pub command: Value,
    pub mode: TaskMode,
    pub execute_at: Option<i64>,
    pub countdown: Option<i64>,
    pub interval: Option<i64>,
}

/// Partial update; absent fields keep their current values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub command: Option<Value>,
    pub mode: Option<TaskMode>,
    pub execute_at: Option<i64>,
    pub countdown: Option<i64>,
    pub interval: Option<i64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("scheduled tasks require executeAt")]
    MissingExecuteAt,
    #[error("countdown must be greater than zero")]
    InvalidCountdown,
    #[error("interval must be greater than zero")]
    InvalidInterval,
    #[error("task not found")]
    NotFound,
}

/// In-memory task store keyed by random 16-hex ids.
#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, ScheduledTask>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, spec: TaskSpec) -> Result<ScheduledTask, TaskError> {
        let now = now_ms();
        let (execute_at, interval) = match spec.mode {
            TaskMode::Scheduled => (spec.execute_at.ok_or(TaskError::MissingExecuteAt)?, None),
            TaskMode::Countdown => {
                let countdown = spec.countdown.filter(|c| *c > 0).ok_or(TaskError::InvalidCountdown)?;
                (now + countdown * 1000, None)
            }
            TaskMode::Recurring => {
                let interval = spec.interval.filter(|i| *i > 0).ok_or(TaskError::InvalidInterval)?;
                let interval_ms = interval * 1000;
                (
                    spec.execute_at.unwrap_or(now + interval_ms),
                    Some(interval_ms),
                )
            }
        };

        let task = ScheduledTask {
            id: rand_hex(16),
            device_id: spec.device_id,
            command: spec.command,
            mode: spec.mode,
            execute_at,
            interval,
            created_at: now,
            last_executed_at: None,
            enabled: true,
        };
        self.tasks.write().insert(task.id.clone(), task.clone());
        Ok(task)
    }

    /// Update a task. Mode changes require the new mode's parameter, with
    /// one historical exception: switching to countdown without a countdown
    /// leaves `execute_at` unchanged.
    pub fn update(&self, id: &str, update: TaskUpdate) -> Result<ScheduledTask, TaskError> {
        let now = now_ms();
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(id).ok_or(TaskError::NotFound)?;

        let mode_changed = update.mode.is_some_and(|m| m != task.mode);
        let mode = update.mode.unwrap_or(task.mode);

        match mode {
            TaskMode::Scheduled => {
                if let Some(execute_at) = update.execute_at {
                    task.execute_at = execute_at;
                } else if mode_changed {
                    return Err(TaskError::MissingExecuteAt);
                }
                task.interval = None;
            }
            TaskMode::Countdown => {
                match update.countdown {
                    Some(countdown) if countdown > 0 => task.execute_at = now + countdown * 1000,
                    Some(_) => return Err(TaskError::InvalidCountdown),
                    // No countdown given: execute_at intentionally stays as
                    // it was, even on a mode change.
                    None => {}
                }
                task.interval = None;
            }
            TaskMode::Recurring => {
                let interval = match update.interval {
                    Some(interval) if interval > 0 => interval * 1000,
                    Some(_) => return Err(TaskError::InvalidInterval),
                    None => task.interval.ok_or(TaskError::InvalidInterval)?,
                };
                task.interval = Some(interval);
                if let Some(execute_at) = update.execute_at {
                    task.execute_at = execute_at;
                } else if mode_changed {
                    task.execute_at = now + interval;
                }
            }
        }

        task.mode = mode;
        if let Some(command) = update.command {
            task.command = command;
        }
        if let Some(enabled) = update.enabled {
            task.enabled = enabled;
        }
        Ok(task.clone())
    }

    pub fn remove(&self, id: &str) -> bool {
        self.tasks.write().remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<ScheduledTask> {
        self.tasks.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<_> = self.tasks.read().values().cloned().collect();
        tasks.sort_by_key(|t| t.execute_at);
        tasks
    }

    /// Tasks targeting one device.
    pub fn list_for_device(&self, device_id: &str) -> Vec<ScheduledTask> {
        let mut tasks: Vec<_> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.device_id == device_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.execute_at);
        tasks
    }

    /// Enabled tasks whose fire time has arrived.
    pub(crate) fn due_tasks(&self, now: i64) -> Vec<ScheduledTask> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.enabled && t.execute_at <= now)
            .cloned()
            .collect()
    }

    /// Advance a recurring task past a run, or retire a one-shot.
    pub(crate) fn complete_run(&self, id: &str, now: i64) {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(id) else { return };
        match (task.mode, task.interval) {
            (TaskMode::Recurring, Some(interval)) => {
                task.last_executed_at = Some(now);
                task.execute_at = now + interval;
            }
            _ => {
                tasks.remove(id);
            }
        }
    }
}
