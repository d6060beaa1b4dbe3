//! Turns a [`Task`] plus its trigger into a row-shaped [`InsertTask`],
//! merging configuration in strict precedence:
//! defaults ⊂ service defaults ⊂ per-task overrides.

use crate::types::{InsertTask, Task, TaskConfig, TaskDto, TaskOverrides, Trigger};

#[derive(Debug, Clone)]
pub(crate) struct TaskFactory {
    queue: String,
    service_config: TaskOverrides,
}

impl TaskFactory {
    pub fn new(queue: impl Into<String>, service_config: TaskOverrides) -> Self {
        Self {
            queue: queue.into(),
            service_config,
        }
    }

    pub fn to_insert(&self, task: &Task, trigger: Trigger) -> InsertTask {
        let config = task
            .config
            .apply(&self.service_config.apply(&TaskConfig::default()));

        InsertTask {
            queue: task.queue.clone().unwrap_or_else(|| self.queue.clone()),
            data: TaskDto {
                tn: task.task_name.clone(),
                data: task.data.clone(),
                trace: trigger,
            },
            retry_limit: config.retry_limit,
            retry_delay: config.retry_delay,
            retry_backoff: config.retry_backoff,
            start_after_seconds: config.start_after_seconds,
            expire_in_seconds: config.expire_in_seconds,
            keep_in_seconds: config.keep_in_seconds,
            singleton_key: config.singleton_key,
        }
    }
}
