//! Transport for JSON commands addressed to the cluster manager.

use crate::error::{AdminError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use tracing::debug;

/// Arguments that the `ceph` CLI takes positionally, in order
const POSITIONAL_KEYS: &[&str] = &["image_spec", "image_id_spec", "task_id", "level_spec"];

/// A manager command: a JSON object with a `prefix` and named arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MgrCommand {
    args: BTreeMap<String, String>,
}

impl MgrCommand {
    /// Create a command that asks for a JSON formatted response
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut args = BTreeMap::new();
        args.insert("prefix".to_string(), prefix.into());
        args.insert("format".to_string(), "json".to_string());
        Self { args }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.args.insert(key.into(), value.to_string());
        self
    }

    pub fn prefix(&self) -> &str {
        self.get("prefix").unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Body and status returned by a manager command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResponse {
    pub body: Vec<u8>,
    pub status: String,
    prefix: String,
}

impl CommandResponse {
    pub fn new(prefix: impl Into<String>, body: impl Into<Vec<u8>>, status: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            status: status.into(),
            prefix: prefix.into(),
        }
    }

    /// Fail if the command returned a status message
    pub fn no_status(self) -> Result<Self> {
        if self.status.is_empty() {
            Ok(self)
        } else {
            Err(AdminError::unexpected_status(self.prefix, self.status))
        }
    }

    /// Decode the body as JSON
    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            AdminError::serialization_error(
                format!("Failed to decode response to '{}': {}", self.prefix, e),
                Some(Box::new(e)),
            )
        })
    }
}

/// Sends manager commands to a cluster
#[async_trait]
pub trait MgrCommander: Send + Sync {
    async fn mgr_command(&self, command: &MgrCommand) -> Result<CommandResponse>;
}

/// Configuration for the `ceph` CLI transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CephCliConfig {
    pub program: String,
    pub conf: Option<PathBuf>,
    pub cluster: Option<String>,
    pub client_id: Option<String>,
}

impl Default for CephCliConfig {
    fn default() -> Self {
        Self {
            program: "ceph".to_string(),
            conf: None,
            cluster: None,
            client_id: None,
        }
    }
}

/// Manager transport that shells out to the `ceph` CLI
#[derive(Debug, Clone)]
pub struct CephCli {
    config: CephCliConfig,
}

impl CephCli {
    pub fn new(config: CephCliConfig) -> Result<Self> {
        if config.program.trim().is_empty() {
            return Err(AdminError::invalid_config(
                "ceph program path is empty",
                "Set CEPH_BIN or pass --ceph-bin with the path to the ceph CLI",
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &CephCliConfig {
        &self.config
    }

    /// Translate a JSON command into `ceph` CLI arguments
    pub fn argv(&self, command: &MgrCommand) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(conf) = &self.config.conf {
            args.push("--conf".to_string());
            args.push(conf.display().to_string());
        }
        if let Some(cluster) = &self.config.cluster {
            args.push("--cluster".to_string());
            args.push(cluster.clone());
        }
        if let Some(id) = &self.config.client_id {
            args.push("--id".to_string());
            args.push(id.clone());
        }

        args.extend(command.prefix().split_whitespace().map(String::from));

        for key in POSITIONAL_KEYS {
            if let Some(value) = command.get(key) {
                args.push(value.to_string());
            }
        }

        for (key, value) in &command.args {
            let key = key.as_str();
            if key == "prefix" || key == "format" || POSITIONAL_KEYS.contains(&key) {
                continue;
            }
            args.push(format!("--{}={}", key, value));
        }

        if let Some(format) = command.get("format") {
            args.push("--format".to_string());
            args.push(format.to_string());
        }

        args
    }
}

#[async_trait]
impl MgrCommander for CephCli {
    async fn mgr_command(&self, command: &MgrCommand) -> Result<CommandResponse> {
        let args = self.argv(command);
        debug!("Executing: {} {}", self.config.program, args.join(" "));

        let output = tokio::process::Command::new(&self.config.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| {
                AdminError::command_failed(
                    command.prefix(),
                    -1,
                    format!("failed to run {}: {}", self.config.program, e),
                )
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        if exit_code != 0 {
            return Err(AdminError::command_failed(
                command.prefix(),
                exit_code,
                stderr.trim(),
            ));
        }

        // The CLI mixes client log lines into stderr; on success they carry
        // no manager status.
        if !stderr.trim().is_empty() {
            debug!("ceph stderr for '{}': {}", command.prefix(), stderr.trim());
        }
        debug!(
            "mgr command '{}' returned {} bytes",
            command.prefix(),
            output.stdout.len()
        );

        Ok(CommandResponse::new(command.prefix(), output.stdout, ""))
    }
}

/// In-memory commander that replays queued responses and records commands
#[derive(Debug, Default)]
pub struct MockCommander {
    responses: Mutex<VecDeque<MockReply>>,
    commands: Mutex<Vec<MgrCommand>>,
}

#[derive(Debug)]
enum MockReply {
    Body(Vec<u8>),
    Status(String),
    Failure { exit_code: i32, stderr: String },
}

impl MockCommander {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response with the given body
    pub fn push_body(&self, body: impl Into<Vec<u8>>) {
        self.responses.lock().push_back(MockReply::Body(body.into()));
    }

    /// Queue a response that carries a status message and no body
    pub fn push_status(&self, status: impl Into<String>) {
        self.responses.lock().push_back(MockReply::Status(status.into()));
    }

    /// Queue a command failure
    pub fn push_failure(&self, exit_code: i32, stderr: impl Into<String>) {
        self.responses.lock().push_back(MockReply::Failure {
            exit_code,
            stderr: stderr.into(),
        });
    }

    /// Commands received so far, oldest first
    pub fn commands(&self) -> Vec<MgrCommand> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl MgrCommander for MockCommander {
    async fn mgr_command(&self, command: &MgrCommand) -> Result<CommandResponse> {
        self.commands.lock().push(command.clone());

        let reply = self.responses.lock().pop_front();
        match reply {
            Some(MockReply::Body(body)) => Ok(CommandResponse::new(command.prefix(), body, "")),
            Some(MockReply::Status(status)) => {
                Ok(CommandResponse::new(command.prefix(), Vec::new(), status))
            }
            Some(MockReply::Failure { exit_code, stderr }) => {
                Err(AdminError::command_failed(command.prefix(), exit_code, stderr))
            }
            None => Err(AdminError::command_failed(
                command.prefix(),
                -1,
                "no mock response queued",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn test_command_json() {
        let cmd = MgrCommand::new("rbd task add flatten").arg("image_spec", "rbd/img");
        let value: serde_json::Value = serde_json::from_str(&cmd.to_json().unwrap()).unwrap();
        assert_eq!(value["prefix"], "rbd task add flatten");
        assert_eq!(value["image_spec"], "rbd/img");
        assert_eq!(value["format"], "json");
    }

    #[test]
    fn test_no_status() {
        let ok = CommandResponse::new("rbd task list", b"[]".to_vec(), "");
        assert!(ok.no_status().is_ok());

        let err = CommandResponse::new("rbd task list", Vec::new(), "module not enabled")
            .no_status()
            .unwrap_err();
        assert!(matches!(err, AdminError::UnexpectedStatus { .. }));
    }

    #[test]
    fn test_unmarshal_error() {
        #[derive(Debug, Deserialize)]
        struct Body {
            #[allow(unused)]
            id: String,
        }

        let resp = CommandResponse::new("rbd task list", b"not json".to_vec(), "");
        let err = resp.unmarshal::<Body>().unwrap_err();
        assert!(matches!(err, AdminError::SerializationError { .. }));
    }

    #[test]
    fn test_ceph_cli_argv() {
        let cli = CephCli::new(CephCliConfig {
            conf: Some(PathBuf::from("/etc/ceph/ceph.conf")),
            client_id: Some("admin".to_string()),
            ..Default::default()
        })
        .unwrap();

        let cmd = MgrCommand::new("rbd task add trash remove")
            .arg("image_id_spec", "rbd/1234")
            .arg("force", "true");

        assert_eq!(
            cli.argv(&cmd),
            vec![
                "--conf",
                "/etc/ceph/ceph.conf",
                "--id",
                "admin",
                "rbd",
                "task",
                "add",
                "trash",
                "remove",
                "rbd/1234",
                "--force=true",
                "--format",
                "json",
            ]
        );
    }

    #[test]
    fn test_ceph_cli_rejects_empty_program() {
        let err = CephCli::new(CephCliConfig {
            program: " ".to_string(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, AdminError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_ceph_cli_runs_program() {
        // `echo` stands in for the ceph binary and prints its arguments
        let cli = CephCli::new(CephCliConfig {
            program: "echo".to_string(),
            ..Default::default()
        })
        .unwrap();

        let resp = cli
            .mgr_command(&MgrCommand::new("rbd task list"))
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(resp.body).unwrap().trim(),
            "rbd task list --format json"
        );
        assert!(resp.status.is_empty());
    }

    /// Write an executable shell script standing in for the ceph CLI
    fn fake_ceph(dir: &Path, body: &str) -> CephCli {
        let path = dir.join("ceph");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        CephCli::new(CephCliConfig {
            program: path.display().to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_ceph_cli_ignores_stderr_noise_on_success() {
        let dir = tempdir().unwrap();
        let cli = fake_ceph(
            dir.path(),
            "echo '[]'\necho '2026-10-18T00:00:00.000+0000 7f00 -1 auth: unable to find a keyring on /etc/ceph/keyring' >&2\nexit 0",
        );

        let resp = cli
            .mgr_command(&MgrCommand::new("rbd task list"))
            .await
            .unwrap();
        assert!(resp.status.is_empty());

        let resp = resp.no_status().unwrap();
        let tasks: Vec<serde_json::Value> = resp.unmarshal().unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_ceph_cli_failure_carries_prefix_and_stderr() {
        let dir = tempdir().unwrap();
        let cli = fake_ceph(dir.path(), "echo 'Error ENOENT: no such task' >&2\nexit 2");

        let err = cli
            .mgr_command(&MgrCommand::new("rbd task cancel").arg("task_id", "x"))
            .await
            .unwrap_err();
        match err {
            AdminError::CommandFailed {
                command,
                exit_code,
                stderr,
            } => {
                assert_eq!(command, "rbd task cancel");
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "Error ENOENT: no such task");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ceph_cli_missing_program() {
        let cli = CephCli::new(CephCliConfig {
            program: "snapbridge-no-such-ceph".to_string(),
            ..Default::default()
        })
        .unwrap();

        let err = cli
            .mgr_command(&MgrCommand::new("rbd task list"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::CommandFailed { exit_code: -1, .. }));
    }

    #[tokio::test]
    async fn test_mock_commander_replays_in_order() {
        let mock = MockCommander::new();
        mock.push_body("[]");
        mock.push_failure(2, "ENOENT");

        let first = mock.mgr_command(&MgrCommand::new("a")).await.unwrap();
        assert_eq!(first.body, b"[]");

        let err = mock.mgr_command(&MgrCommand::new("b")).await.unwrap_err();
        assert!(matches!(err, AdminError::CommandFailed { exit_code: 2, .. }));

        let err = mock.mgr_command(&MgrCommand::new("c")).await.unwrap_err();
        assert!(matches!(err, AdminError::CommandFailed { exit_code: -1, .. }));

        let prefixes: Vec<_> = mock
            .commands()
            .iter()
            .map(|c| c.prefix().to_string())
            .collect();
        assert_eq!(prefixes, vec!["a", "b", "c"]);
    }
}
