//! Validated, minimal writes of rendered fragments
//!
//! Before anything touches the live config directory the candidate is
//! dry-run: a scratch tree is assembled from every other deployed fragment
//! plus the candidate, wrapped in a minimal `nginx.conf`, and handed to
//! [`ProxyControl::check_config`]. Only when that passes are the changed
//! fragments written, each through a temp file and rename.

use crate::error::DeployError;
use crate::proxy::ProxyControl;
use crate::render::{render_fallback, Bucket, ConfigSet, RenderContext, FALLBACK_FILE, HTTP_DIR, STREAM_DIR};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Which fragments a deploy touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOutcome {
    pub written: Vec<Bucket>,
    pub removed: Vec<Bucket>,
}

impl DeployOutcome {
    pub fn changed(&self) -> bool {
        !self.written.is_empty() || !self.removed.is_empty()
    }
}

pub struct ConfigDeployer {
    config_dir: PathBuf,
    /// Parent of dry-run trees; the system temp dir when unset
    scratch_dir: Option<PathBuf>,
    proxy: Arc<dyn ProxyControl>,
    /// Serializes validate-and-write so every dry run sees a settled tree
    lock: Mutex<()>,
}

impl ConfigDeployer {
    pub fn new(config_dir: impl Into<PathBuf>, proxy: Arc<dyn ProxyControl>) -> Self {
        Self {
            config_dir: config_dir.into(),
            scratch_dir: None,
            proxy,
            lock: Mutex::new(()),
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn fragment_path(&self, service_id: &str, bucket: Bucket) -> PathBuf {
        self.config_dir.join(bucket.relative_path(service_id))
    }

    /// Fragments currently on disk for a service
    pub async fn deployed(&self, service_id: &str) -> Result<ConfigSet, DeployError> {
        let mut set = ConfigSet::new();
        for bucket in Bucket::ALL {
            let path = self.fragment_path(service_id, bucket);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => set.insert(bucket, content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(DeployError::io(path, e)),
            }
        }
        Ok(set)
    }

    /// Dry-run `candidate` against everything else that is deployed
    pub async fn validate(&self, service_id: &str, candidate: &ConfigSet) -> Result<(), DeployError> {
        let config_dir = self.config_dir.clone();
        let scratch_dir = self.scratch_dir.clone();
        let id = service_id.to_string();
        let set = candidate.clone();
        let scratch = tokio::task::spawn_blocking(move || {
            build_scratch_tree(&config_dir, scratch_dir.as_deref(), &id, &set)
        })
        .await
        .map_err(|e| DeployError::io(&self.config_dir, std::io::Error::other(e)))??;

        let main = scratch.path().join("nginx.conf");
        self.proxy
            .check_config(&main)
            .await
            .map_err(DeployError::Validation)?;
        debug!(service = service_id, "Candidate configuration passed validation");
        Ok(())
    }

    /// Validate `candidate`, then write the fragments whose content differs
    /// from disk and remove this service's fragments it no longer contains.
    /// On validation failure nothing on disk changes.
    pub async fn deploy(&self, service_id: &str, candidate: &ConfigSet) -> Result<DeployOutcome, DeployError> {
        let _guard = self.lock.lock().await;

        let current = self.deployed(service_id).await?;
        let mut outcome = DeployOutcome::default();
        for (bucket, content) in candidate.iter() {
            if current.get(bucket) != Some(content) {
                outcome.written.push(bucket);
            }
        }
        for bucket in current.buckets() {
            if !candidate.contains(bucket) {
                outcome.removed.push(bucket);
            }
        }
        if !outcome.changed() {
            debug!(service = service_id, "Configuration unchanged");
            return Ok(outcome);
        }

        self.validate(service_id, candidate).await?;

        for bucket in &outcome.written {
            if let Some(content) = candidate.get(*bucket) {
                let path = self.fragment_path(service_id, *bucket);
                write_atomic(&path, content).await?;
                info!(service = service_id, bucket = %bucket, "Configuration fragment written");
            }
        }
        for bucket in &outcome.removed {
            let path = self.fragment_path(service_id, *bucket);
            remove_if_exists(&path).await?;
            info!(service = service_id, bucket = %bucket, "Stale configuration fragment removed");
        }

        Ok(outcome)
    }

    /// Remove every fragment of a service. Returns the buckets that existed.
    pub async fn remove_all(&self, service_id: &str) -> Result<Vec<Bucket>, DeployError> {
        let _guard = self.lock.lock().await;

        let mut removed = Vec::new();
        for bucket in Bucket::ALL {
            let path = self.fragment_path(service_id, bucket);
            if remove_if_exists(&path).await? {
                removed.push(bucket);
            }
        }
        if !removed.is_empty() {
            info!(service = service_id, count = removed.len(), "Configuration removed");
        }
        Ok(removed)
    }

    /// Ensure the fragment directories and the shared fallback responder exist.
    /// Returns whether anything was written.
    pub async fn prepare(&self, ctx: &RenderContext) -> Result<bool, DeployError> {
        let _guard = self.lock.lock().await;

        let mut dirs: Vec<PathBuf> = [HTTP_DIR, STREAM_DIR, "certs"]
            .iter()
            .map(|d| self.config_dir.join(d))
            .collect();
        dirs.extend(self.scratch_dir.clone());
        for path in dirs {
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| DeployError::io(&path, e))?;
        }

        let path = self.config_dir.join(HTTP_DIR).join(FALLBACK_FILE);
        let content = render_fallback(ctx);
        match tokio::fs::read_to_string(&path).await {
            Ok(current) if current == content => Ok(false),
            _ => {
                write_atomic(&path, &content).await?;
                info!(path = %path.display(), "Fallback responder written");
                Ok(true)
            }
        }
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<(), DeployError> {
    let path = path.to_path_buf();
    let content = content.to_string();
    let target = path.clone();
    tokio::task::spawn_blocking(move || -> Result<(), DeployError> {
        let dir = path
            .parent()
            .ok_or_else(|| DeployError::io(&path, std::io::ErrorKind::InvalidInput.into()))?;
        std::fs::create_dir_all(dir).map_err(|e| DeployError::io(dir, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| DeployError::io(dir, e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| DeployError::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| DeployError::io(&path, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| DeployError::io(target, std::io::Error::other(e)))?
}

async fn remove_if_exists(path: &Path) -> Result<bool, DeployError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(DeployError::io(path, e)),
    }
}

/// Copy every deployed fragment except `service_id`'s into a scratch tree,
/// add the candidate, and write a main config including both directories.
fn build_scratch_tree(
    config_dir: &Path,
    scratch_dir: Option<&Path>,
    service_id: &str,
    candidate: &ConfigSet,
) -> Result<TempDir, DeployError> {
    let parent = scratch_dir.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
    let scratch = tempfile::Builder::new()
        .prefix("catalog-proxy-check")
        .tempdir_in(&parent)
        .map_err(|e| DeployError::io(&parent, e))?;
    let own: Vec<String> = Bucket::ALL.iter().map(|b| b.file_name(service_id)).collect();

    let mut has_stream = false;
    for dir in [HTTP_DIR, STREAM_DIR] {
        let target = scratch.path().join(dir);
        std::fs::create_dir_all(&target).map_err(|e| DeployError::io(&target, e))?;

        let source = config_dir.join(dir);
        let entries = match std::fs::read_dir(&source) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(DeployError::io(&source, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| DeployError::io(&source, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".conf") || own.contains(&name) {
                continue;
            }
            std::fs::copy(entry.path(), target.join(&name))
                .map_err(|e| DeployError::io(entry.path(), e))?;
            has_stream |= dir == STREAM_DIR;
        }
    }

    for (bucket, content) in candidate.iter() {
        let path = scratch.path().join(bucket.relative_path(service_id));
        std::fs::write(&path, content).map_err(|e| DeployError::io(&path, e))?;
        has_stream |= bucket.dir() == STREAM_DIR;
    }

    let root = scratch.path();
    let mut main = String::new();
    main.push_str(&format!("pid {};\n", root.join("nginx.pid").display()));
    main.push_str("error_log stderr;\n");
    main.push_str("events {}\n\n");
    main.push_str("http {\n");
    main.push_str("    access_log off;\n");
    main.push_str(&format!("    include {}/*.conf;\n", root.join(HTTP_DIR).display()));
    main.push_str("}\n");
    if has_stream {
        main.push_str("\nstream {\n");
        main.push_str(&format!("    include {}/*.conf;\n", root.join(STREAM_DIR).display()));
        main.push_str("}\n");
    }
    let path = root.join("nginx.conf");
    std::fs::write(&path, main).map_err(|e| DeployError::io(&path, e))?;

    Ok(scratch)
}
