//! Background tasks queued in the manager's `rbd_support` module.

use crate::commander::{CommandResponse, MgrCommand, MgrCommander};
use crate::error::Result;
use crate::spec::{ImageIdSpec, ImageSpec};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Format of `retry_time`, a naive timestamp with fractional seconds
const RETRY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// The image a task acts on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRefs {
    pub action: String,
    pub pool_name: String,
    pub pool_namespace: String,
    pub image_name: String,
    pub image_id: String,
}

/// State of a queued or running task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskResponse {
    pub sequence: i64,
    pub id: String,
    pub message: String,
    pub refs: TaskRefs,
    pub in_progress: bool,
    pub progress: f64,
    pub retry_attempts: i64,
    pub retry_time: String,
    pub retry_message: String,
}

impl TaskResponse {
    /// When the next retry is scheduled, if the task has failed before
    pub fn retry_time(&self) -> Option<NaiveDateTime> {
        if self.retry_time.is_empty() {
            return None;
        }
        NaiveDateTime::parse_from_str(&self.retry_time, RETRY_TIME_FORMAT).ok()
    }
}

fn parse_task(res: CommandResponse) -> Result<TaskResponse> {
    res.no_status()?.unmarshal()
}

fn parse_task_list(res: CommandResponse) -> Result<Vec<TaskResponse>> {
    res.no_status()?.unmarshal()
}

/// Queue, inspect and cancel background image tasks
#[derive(Clone)]
pub struct TaskAdmin {
    conn: Arc<dyn MgrCommander>,
}

impl TaskAdmin {
    pub(crate) fn new(conn: Arc<dyn MgrCommander>) -> Self {
        Self { conn }
    }

    async fn send(&self, command: MgrCommand) -> Result<CommandResponse> {
        debug!("Sending mgr command '{}'", command.prefix());
        self.conn.mgr_command(&command).await
    }

    async fn add(&self, prefix: &str, key: &str, spec: &str) -> Result<TaskResponse> {
        let res = self.send(MgrCommand::new(prefix).arg(key, spec)).await?;
        let task = parse_task(res)?;
        info!("Queued task {} ({}) for {}", task.id, task.refs.action, spec);
        Ok(task)
    }

    /// Flatten a cloned image (`rbd task add flatten <image_spec>`)
    pub async fn add_flatten(&self, image: &ImageSpec) -> Result<TaskResponse> {
        self.add("rbd task add flatten", "image_spec", image.as_str())
            .await
    }

    /// Remove an image (`rbd task add remove <image_spec>`)
    pub async fn add_remove(&self, image: &ImageSpec) -> Result<TaskResponse> {
        self.add("rbd task add remove", "image_spec", image.as_str())
            .await
    }

    /// Remove an image from the trash (`rbd task add trash remove <image_id_spec>`)
    pub async fn add_trash_remove(&self, image: &ImageIdSpec) -> Result<TaskResponse> {
        self.add("rbd task add trash remove", "image_id_spec", image.as_str())
            .await
    }

    pub async fn add_migration_commit(&self, image: &ImageSpec) -> Result<TaskResponse> {
        self.add("rbd task add migration commit", "image_spec", image.as_str())
            .await
    }

    pub async fn add_migration_abort(&self, image: &ImageSpec) -> Result<TaskResponse> {
        self.add("rbd task add migration abort", "image_spec", image.as_str())
            .await
    }

    pub async fn add_migration_execute(&self, image: &ImageSpec) -> Result<TaskResponse> {
        self.add("rbd task add migration execute", "image_spec", image.as_str())
            .await
    }

    /// All tasks known to the manager
    pub async fn list(&self) -> Result<Vec<TaskResponse>> {
        let res = self.send(MgrCommand::new("rbd task list")).await?;
        parse_task_list(res)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskResponse> {
        let res = self
            .send(MgrCommand::new("rbd task list").arg("task_id", task_id))
            .await?;
        parse_task(res)
    }

    pub async fn cancel(&self, task_id: &str) -> Result<TaskResponse> {
        let res = self
            .send(MgrCommand::new("rbd task cancel").arg("task_id", task_id))
            .await?;
        let task = parse_task(res)?;
        info!("Cancelled task {}", task.id);
        Ok(task)
    }
}
