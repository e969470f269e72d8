//! Persistent state: the current container handle and its credentials
//!
//! Two flat files live in the data directory:
//!
//! - `container.id`: the id of the container created by the last activation
//! - `moodle.txt`: `password=<secret>` and `url=<endpoint>` lines
//!
//! [`MemoryStore`] offers the same interface without touching disk.

use crate::credentials::{Credentials, DEFAULT_ENDPOINT};
use crate::errors::{validate_handle, validate_not_empty, Result, StoreError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, instrument};

/// File holding the current container id
pub const HANDLE_FILE: &str = "container.id";
/// File holding the stored credentials
pub const CREDENTIALS_FILE: &str = "moodle.txt";

const SECRET_KEY: &str = "password";
const ENDPOINT_KEY: &str = "url";

/// Storage for the single current handle and its credentials
pub trait StateStore: Send + Sync {
    fn save_handle(&self, id: &str) -> Result<()>;

    /// Stored handle, `None` when nothing is stored
    fn load_handle(&self) -> Result<Option<String>>;

    fn handle_exists(&self) -> bool;

    /// Remove the stored handle; removing a missing handle succeeds
    fn delete_handle(&self) -> Result<()>;

    fn save_credentials(&self, secret: &str, endpoint: &str) -> Result<()>;

    /// Stored credentials, or an empty secret with the default endpoint when
    /// nothing is stored
    fn load_credentials(&self) -> Result<Credentials>;

    fn credentials_exist(&self) -> bool;

    /// Remove stored credentials; removing missing credentials succeeds
    fn delete_credentials(&self) -> Result<()>;
}

/// Render credentials in the on-disk `key=value` format
pub fn format_credentials(secret: &str, endpoint: &str) -> String {
    format!("{}={}\n{}={}\n", SECRET_KEY, secret, ENDPOINT_KEY, endpoint)
}

/// Parse the on-disk `key=value` format.
///
/// Blank and malformed lines are skipped; unknown keys are ignored. Returns
/// `None` when no known entry is present.
pub fn parse_credentials(content: &str) -> Option<Credentials> {
    let mut secret = None;
    let mut endpoint = None;

    for line in content.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            SECRET_KEY => secret = Some(value.trim().to_string()),
            ENDPOINT_KEY => endpoint = Some(value.trim().to_string()),
            _ => {}
        }
    }

    if secret.is_none() && endpoint.is_none() {
        return None;
    }
    Some(Credentials {
        secret: secret.unwrap_or_default(),
        endpoint: endpoint
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
    })
}

fn default_credentials() -> Credentials {
    Credentials::new("", DEFAULT_ENDPOINT)
}

/// File-backed store rooted at a data directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Store rooted at `dir`; the directory is created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn handle_path(&self) -> PathBuf {
        self.dir.join(HANDLE_FILE)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    fn write_atomic(&self, path: &Path, content: &str, private: bool) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, content).map_err(|source| StoreError::Io {
            path: temp_path.clone(),
            source,
        })?;

        #[cfg(unix)]
        if private {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|source| StoreError::Io {
                    path: temp_path.clone(),
                    source,
                })?;
        }
        #[cfg(not(unix))]
        let _ = private;

        std::fs::rename(&temp_path, path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    fn read_optional(path: &Path) -> Result<Option<String>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
            .into()),
        }
    }

    fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
            .into()),
        }
    }
}

impl StateStore for FileStore {
    #[instrument(skip(self))]
    fn save_handle(&self, id: &str) -> Result<()> {
        validate_handle(id)?;
        self.write_atomic(&self.handle_path(), id, false)?;
        debug!("Saved container handle to {}", self.handle_path().display());
        Ok(())
    }

    fn load_handle(&self) -> Result<Option<String>> {
        let path = self.handle_path();
        let Some(content) = Self::read_optional(&path)? else {
            return Ok(None);
        };
        let id = content.trim();
        if id.is_empty() {
            return Err(StoreError::Corrupted {
                path,
                reason: "container id file is empty".to_string(),
            }
            .into());
        }
        validate_handle(id)?;
        Ok(Some(id.to_string()))
    }

    fn handle_exists(&self) -> bool {
        self.handle_path().is_file()
    }

    fn delete_handle(&self) -> Result<()> {
        Self::remove(&self.handle_path())
    }

    #[instrument(skip(self, secret))]
    fn save_credentials(&self, secret: &str, endpoint: &str) -> Result<()> {
        validate_not_empty("password", secret)?;
        validate_not_empty("url", endpoint)?;
        self.write_atomic(
            &self.credentials_path(),
            &format_credentials(secret, endpoint),
            true,
        )?;
        debug!("Saved credentials to {}", self.credentials_path().display());
        Ok(())
    }

    fn load_credentials(&self) -> Result<Credentials> {
        let path = self.credentials_path();
        let Some(content) = Self::read_optional(&path)? else {
            return Ok(default_credentials());
        };
        parse_credentials(&content).ok_or_else(|| {
            StoreError::Corrupted {
                path,
                reason: "no valid credential entries found".to_string(),
            }
            .into()
        })
    }

    fn credentials_exist(&self) -> bool {
        self.credentials_path().is_file()
    }

    fn delete_credentials(&self) -> Result<()> {
        Self::remove(&self.credentials_path())
    }
}

/// In-memory store with failure injection
#[derive(Debug, Default)]
pub struct MemoryStore {
    handle: Mutex<Option<String>>,
    credentials: Mutex<Option<Credentials>>,
    fail_handle_saves: AtomicBool,
    fail_credential_deletes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a handle
    pub fn with_handle(id: &str) -> Self {
        let store = Self::default();
        *store.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(id.to_string());
        store
    }

    /// Make `save_handle` fail
    pub fn fail_handle_saves(&self, fail: bool) {
        self.fail_handle_saves.store(fail, Ordering::SeqCst);
    }

    /// Make `delete_credentials` fail
    pub fn fail_credential_deletes(&self, fail: bool) {
        self.fail_credential_deletes.store(fail, Ordering::SeqCst);
    }

    fn injected_failure(what: &str) -> StoreError {
        StoreError::Io {
            path: PathBuf::from(format!("memory://{}", what)),
            source: std::io::Error::new(std::io::ErrorKind::Other, "injected failure"),
        }
    }
}

impl StateStore for MemoryStore {
    fn save_handle(&self, id: &str) -> Result<()> {
        validate_handle(id)?;
        if self.fail_handle_saves.load(Ordering::SeqCst) {
            return Err(Self::injected_failure(HANDLE_FILE).into());
        }
        *self.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(id.to_string());
        Ok(())
    }

    fn load_handle(&self) -> Result<Option<String>> {
        Ok(self.handle.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn handle_exists(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    fn delete_handle(&self) -> Result<()> {
        self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        Ok(())
    }

    fn save_credentials(&self, secret: &str, endpoint: &str) -> Result<()> {
        validate_not_empty("password", secret)?;
        validate_not_empty("url", endpoint)?;
        *self.credentials.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(Credentials::new(secret, endpoint));
        Ok(())
    }

    fn load_credentials(&self) -> Result<Credentials> {
        Ok(self
            .credentials
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .unwrap_or_else(default_credentials))
    }

    fn credentials_exist(&self) -> bool {
        self.credentials
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    fn delete_credentials(&self) -> Result<()> {
        if self.fail_credential_deletes.load(Ordering::SeqCst) {
            return Err(Self::injected_failure(CREDENTIALS_FILE).into());
        }
        self.credentials
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        Ok(())
    }
}
