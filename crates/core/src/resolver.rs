//! Container runtime binary resolution
//!
//! GUI-launched processes frequently inherit a `PATH` that does not include the
//! container runtime, so resolution falls back to well-known install locations.
//! The resolved path is memoized inside the resolver instance; construct one
//! resolver and share it with everything that spawns runtime commands.

use crate::errors::DockerError;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Resolves (and caches) the path of the container runtime CLI
#[derive(Debug)]
pub struct RuntimeResolver {
    binary: String,
    explicit: Option<PathBuf>,
    resolved: Mutex<OnceCell<PathBuf>>,
}

impl RuntimeResolver {
    /// Resolver for the `docker` binary
    pub fn docker() -> Self {
        Self::new("docker")
    }

    /// Resolver for an arbitrary runtime binary name (e.g. `podman`)
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            explicit: None,
            resolved: Mutex::new(OnceCell::new()),
        }
    }

    /// Use a fixed path and skip discovery
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit = Some(path.into());
        self
    }

    /// Name of the runtime binary this resolver looks for
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Locate the runtime binary, memoizing the first successful lookup
    pub fn resolve(&self) -> Result<PathBuf, DockerError> {
        let cell = self
            .resolved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cell.get_or_try_init(|| self.discover()).cloned()
    }

    /// Forget the memoized path so the next call re-runs discovery
    pub fn reset(&self) {
        let mut cell = self
            .resolved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cell.take();
    }

    /// Build a command for the runtime.
    ///
    /// Falls back to the bare binary name when discovery fails so that the
    /// spawn error names the missing program.
    pub fn command(&self) -> Command {
        let program = self.resolve().unwrap_or_else(|e| {
            debug!("Runtime discovery failed, using bare name: {}", e);
            PathBuf::from(&self.binary)
        });
        let mut cmd = Command::new(program);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Verify the runtime binary responds to `--version`
    #[instrument(skip(self))]
    pub async fn check_installed(&self) -> Result<String, DockerError> {
        let path = self.resolve()?;
        let output = Command::new(&path)
            .arg("--version")
            .output()
            .await
            .map_err(|e| DockerError::NotInstalled {
                message: format!("{}: {}", path.display(), e),
            })?;

        if !output.status.success() {
            return Err(DockerError::CommandFailed {
                operation: "--version".to_string(),
                code: output.status.code().unwrap_or(-1),
                output: combined_output(&output.stdout, &output.stderr),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn discover(&self) -> Result<PathBuf, DockerError> {
        if let Some(path) = &self.explicit {
            debug!("Using explicit runtime path: {}", path.display());
            return Ok(path.clone());
        }

        if let Some(path) = search_path_env(&self.binary) {
            debug!("Found {} on PATH at {}", self.binary, path.display());
            return Ok(path);
        }

        for candidate in well_known_locations(&self.binary) {
            if is_file(&candidate) {
                debug!("Found {} at {}", self.binary, candidate.display());
                return Ok(candidate);
            }
        }

        Err(DockerError::NotInstalled {
            message: format!(
                "{} executable not found. Make sure it is installed and running, \
                 verify it is on your PATH, then retry",
                self.binary
            ),
        })
    }
}

impl Default for RuntimeResolver {
    fn default() -> Self {
        Self::docker()
    }
}

/// Join stdout and stderr the way a combined-output capture would
pub(crate) fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut out = String::from_utf8_lossy(stdout).into_owned();
    let err = String::from_utf8_lossy(stderr);
    if !err.is_empty() {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&err);
    }
    out.trim_end().to_string()
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

fn executable_names(binary: &str) -> Vec<String> {
    if cfg!(windows) && !binary.ends_with(".exe") {
        vec![format!("{}.exe", binary), binary.to_string()]
    } else {
        vec![binary.to_string()]
    }
}

fn search_path_env(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    let names = executable_names(binary);
    std::env::split_paths(&path_var)
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| is_file(candidate))
}

fn well_known_locations(binary: &str) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();

    if cfg!(target_os = "macos") {
        dirs.extend(
            [
                "/usr/local/bin",
                "/opt/homebrew/bin",
                "/Applications/Docker.app/Contents/Resources/bin",
                "/usr/bin",
            ]
            .iter()
            .map(PathBuf::from),
        );
    } else if cfg!(windows) {
        for var in ["PROGRAMFILES", "PROGRAMFILES(X86)"] {
            if let Some(base) = std::env::var_os(var) {
                dirs.push(PathBuf::from(base).join("Docker\\Docker\\resources\\bin"));
            }
        }
        dirs.push(PathBuf::from("C:\\Program Files\\Docker\\Docker\\resources\\bin"));
        dirs.push(PathBuf::from("C:\\ProgramData\\DockerDesktop\\version-bin"));
    } else {
        dirs.extend(
            [
                "/usr/bin",
                "/usr/local/bin",
                "/snap/bin",
                "/opt/docker/bin",
            ]
            .iter()
            .map(PathBuf::from),
        );
    }

    let names = executable_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .collect()
}
