//! Control of the external proxy process
//!
//! The controller never talks to nginx directly. It asks [`ProxyControl`] to
//! dry-run a configuration and to reload, which keeps the deploy and reload
//! paths testable without an nginx binary.

use crate::error::ProxyError;
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Validate the configuration rooted at `main_config` without applying it
    async fn check_config(&self, main_config: &Path) -> Result<(), ProxyError>;

    /// Make the running proxy pick up the deployed configuration
    async fn reload(&self) -> Result<(), ProxyError>;
}

pub struct Nginx {
    binary: PathBuf,
}

impl Nginx {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(&self, args: &[&OsStr]) -> Result<(), ProxyError> {
        let command = format!(
            "{} {}",
            self.binary.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        debug!(command = %command, "Running proxy command");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ProxyError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }

        Err(ProxyError::Failed {
            command,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl ProxyControl for Nginx {
    async fn check_config(&self, main_config: &Path) -> Result<(), ProxyError> {
        // Relative paths (temp dirs, pid) resolve inside the scratch tree
        let prefix = main_config.parent().unwrap_or_else(|| Path::new("."));
        self.run(&[
            OsStr::new("-t"),
            OsStr::new("-q"),
            OsStr::new("-p"),
            prefix.as_os_str(),
            OsStr::new("-c"),
            main_config.as_os_str(),
        ])
        .await
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        self.run(&[OsStr::new("-s"), OsStr::new("reload")]).await?;
        info!(binary = %self.binary.display(), "nginx reloaded");
        Ok(())
    }
}
