//! File lifecycle action hooks
//!
//! An optional external command is invoked after uploads, downloads, deletes
//! and renames. Hook execution is fire-and-forget: a slow or failing hook
//! must never stall or fail the file operation that triggered it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// File operations a hook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionEvent {
    Upload,
    Download,
    Delete,
    Rename,
}

impl ActionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionEvent::Upload => "upload",
            ActionEvent::Download => "download",
            ActionEvent::Delete => "delete",
            ActionEvent::Rename => "rename",
        }
    }
}

/// Hook configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// Events the hook subscribes to; empty disables the hook entirely.
    #[serde(default)]
    pub execute_on: Vec<ActionEvent>,
    /// Absolute path of the program to run.
    #[serde(default)]
    pub command: Option<PathBuf>,
}

/// Runs configured hooks for file lifecycle events.
#[derive(Debug, Default)]
pub struct ActionHandler {
    config: ActionsConfig,
}

impl ActionHandler {
    pub fn new(config: ActionsConfig) -> Self {
        if let Some(command) = &config.command {
            if !command.is_absolute() {
                warn!(
                    "action command {:?} is not an absolute path, hooks disabled",
                    command
                );
                return Self {
                    config: ActionsConfig::default(),
                };
            }
        }
        Self { config }
    }

    pub fn is_enabled(&self, event: ActionEvent) -> bool {
        self.config.command.is_some() && self.config.execute_on.contains(&event)
    }

    /// Fire the hook for `event` if subscribed. `target` is the rename
    /// destination and empty otherwise.
    pub fn notify(&self, event: ActionEvent, username: &str, path: &str, target: &str) {
        if !self.is_enabled(event) {
            return;
        }
        let command = self.config.command.clone().expect("checked by is_enabled");
        debug!(
            "executing action hook {:?} for {} {:?}",
            command,
            event.as_str(),
            path
        );

        let event_name = event.as_str().to_string();
        let username = username.to_string();
        let path = path.to_string();
        let target = target.to_string();
        tokio::spawn(async move {
            let result = tokio::process::Command::new(&command)
                .arg(&event_name)
                .arg(&username)
                .arg(&path)
                .arg(&target)
                .env("SP_ACTION", &event_name)
                .env("SP_USERNAME", &username)
                .env("SP_PATH", &path)
                .env("SP_TARGET", &target)
                .output()
                .await;
            match result {
                Ok(output) if !output.status.success() => {
                    warn!(
                        "action hook for {} exited with {:?}",
                        event_name,
                        output.status.code()
                    );
                }
                Err(err) => warn!("action hook for {} failed to start: {}", event_name, err),
                _ => {}
            }
        });
    }
}
