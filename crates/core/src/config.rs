//! Configuration: which image to run, where state lives, how readiness is polled
//!
//! The image name comes from (in order) an explicit override, the first valid
//! `image.docker` file found on the search path, or [`DEFAULT_IMAGE`]. An
//! optional `protoman.toml` in the data directory can override the remaining
//! service settings.

use crate::errors::{validate_image_name, Result, StoreError, ValidationError};
use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Image used when no image file is found
pub const DEFAULT_IMAGE: &str = "wenkhairu/moodle-prototype:502-stable";
/// Name of the file holding the image name
pub const IMAGE_FILE: &str = "image.docker";
/// Name of the optional settings file in the data directory
pub const SETTINGS_FILE: &str = "protoman.toml";
/// Host and container port published by `create_and_start`
pub const DEFAULT_PORT_MAPPING: &str = "8080:8080";
/// URL probed on subsequent activations
pub const DEFAULT_PROBE_URL: &str = "http://localhost:8080";

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "PROTOMAN_DATA_DIR";
/// Environment variable overriding the image name
pub const IMAGE_ENV: &str = "PROTOMAN_IMAGE";

/// The configured service image (`repo:tag`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceImage(String);

impl ServiceImage {
    pub fn new(name: impl AsRef<str>) -> std::result::Result<Self, ValidationError> {
        let name = name.as_ref().trim();
        validate_image_name(name)?;
        Ok(Self(name.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ServiceImage {
    type Error = ValidationError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceImage> for String {
    fn from(image: ServiceImage) -> Self {
        image.0
    }
}

impl Default for ServiceImage {
    fn default() -> Self {
        Self(DEFAULT_IMAGE.to_string())
    }
}

/// Where the image name came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// `--image` flag or `PROTOMAN_IMAGE`
    Override,
    /// An `image.docker` file
    File(PathBuf),
    /// Nothing found; built-in default
    Default,
}

/// Directories searched for `image.docker`, in priority order
pub fn image_search_paths(data_dir: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![data_dir.to_path_buf()];
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(parent) = cwd.parent() {
            let parent = parent.to_path_buf();
            dirs.push(cwd);
            dirs.push(parent);
        } else {
            dirs.push(cwd);
        }
    }
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir);
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    for dir in dirs {
        let path = dir.join(IMAGE_FILE);
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// Read the first non-empty, valid image file among `paths`
pub fn load_image_from_paths(paths: &[PathBuf]) -> Option<(ServiceImage, PathBuf)> {
    for path in paths {
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        match ServiceImage::new(content.trim()) {
            Ok(image) => {
                debug!("Loaded image name from {}", path.display());
                return Some((image, path.clone()));
            }
            Err(e) => warn!("Ignoring {}: {}", path.display(), e),
        }
    }
    None
}

/// Resolve the service image from an override, image files, or the default
pub fn resolve_image(
    override_name: Option<&str>,
    data_dir: &Path,
) -> std::result::Result<(ServiceImage, ImageSource), ValidationError> {
    if let Some(name) = override_name {
        return Ok((ServiceImage::new(name)?, ImageSource::Override));
    }

    let paths = image_search_paths(data_dir);
    if let Some((image, path)) = load_image_from_paths(&paths) {
        return Ok((image, ImageSource::File(path)));
    }

    warn!(
        "No valid {} found in {} locations, using default image {}",
        IMAGE_FILE,
        paths.len(),
        DEFAULT_IMAGE
    );
    Ok((ServiceImage::default(), ImageSource::Default))
}

/// Default per-user data directory
pub fn default_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "protoman", "protoman").map(|dirs| dirs.data_dir().to_path_buf())
}

/// Data directory: explicit value, then `PROTOMAN_DATA_DIR`, then the per-user default
pub fn resolve_data_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
        .or_else(default_data_dir)
        .unwrap_or_else(|| PathBuf::from(".protoman"))
}

/// Timing of the readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Delay between polls
    pub poll_interval: Duration,
    /// Delay between log polls once fetches keep failing
    pub backoff_interval: Duration,
    /// Consecutive failed log fetches before backing off
    pub backoff_after: u32,
    /// Bound on probing a restarted instance
    pub subsequent_timeout: Duration,
    /// Timeout of a single reachability request
    pub probe_request_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            backoff_interval: Duration::from_secs(5),
            backoff_after: 5,
            subsequent_timeout: Duration::from_secs(10 * 60),
            probe_request_timeout: Duration::from_secs(5),
        }
    }
}

impl ReadinessPolicy {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, after: u32, interval: Duration) -> Self {
        self.backoff_after = after;
        self.backoff_interval = interval;
        self
    }

    pub fn with_subsequent_timeout(mut self, timeout: Duration) -> Self {
        self.subsequent_timeout = timeout;
        self
    }

    pub fn with_probe_request_timeout(mut self, timeout: Duration) -> Self {
        self.probe_request_timeout = timeout;
        self
    }
}

/// Everything the orchestrator needs to know about the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub image: ServiceImage,
    /// `host:container` port mapping
    pub port_mapping: String,
    /// URL probed on subsequent activations; also the stored endpoint then
    pub probe_url: String,
    /// Runtime binary name
    pub container_runtime: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            image: ServiceImage::default(),
            port_mapping: DEFAULT_PORT_MAPPING.to_string(),
            probe_url: DEFAULT_PROBE_URL.to_string(),
            container_runtime: "docker".to_string(),
        }
    }
}

impl ServiceSettings {
    pub fn with_image(mut self, image: ServiceImage) -> Self {
        self.image = image;
        self
    }

    /// Apply overrides read from a settings file
    pub fn apply(mut self, file: SettingsFile) -> Self {
        if let Some(image) = file.image {
            self.image = image;
        }
        if let Some(port_mapping) = file.port_mapping {
            self.port_mapping = port_mapping;
        }
        if let Some(probe_url) = file.probe_url {
            self.probe_url = probe_url;
        }
        if let Some(runtime) = file.container_runtime {
            self.container_runtime = runtime;
        }
        self
    }
}

/// Optional overrides from `protoman.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsFile {
    pub image: Option<ServiceImage>,
    pub port_mapping: Option<String>,
    pub probe_url: Option<String>,
    pub container_runtime: Option<String>,
}

impl SettingsFile {
    /// Parse `path`; a missing file yields empty overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                }
                .into())
            }
        };
        let file: Self = toml::from_str(&content).map_err(|e| StoreError::Settings {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        debug!("Loaded settings overrides from {}", path.display());
        Ok(file)
    }
}

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub settings: ServiceSettings,
    pub image_source: ImageSource,
}

impl Config {
    /// Resolve configuration from explicit values, environment and files.
    ///
    /// Precedence for the image: `image_override`, `PROTOMAN_IMAGE`, the
    /// settings file, `image.docker`, the default.
    pub fn load(data_dir: Option<PathBuf>, image_override: Option<String>) -> Result<Self> {
        let data_dir = resolve_data_dir(data_dir);
        let file = SettingsFile::load(&data_dir.join(SETTINGS_FILE))?;
        let image_override = image_override.or_else(|| std::env::var(IMAGE_ENV).ok());

        let (image, image_source) = match (&image_override, &file.image) {
            (None, Some(image)) => (
                image.clone(),
                ImageSource::File(data_dir.join(SETTINGS_FILE)),
            ),
            _ => resolve_image(image_override.as_deref(), &data_dir)?,
        };

        let settings = ServiceSettings::default().apply(file).with_image(image);
        info!("Using image {} ({:?})", settings.image, image_source);

        Ok(Self {
            data_dir,
            settings,
            image_source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_image_validation() {
        assert!(ServiceImage::new("").is_err());
        assert!(ServiceImage::new("ab").is_err());
        assert_eq!(
            ServiceImage::new("  moodle:latest\n").unwrap().name(),
            "moodle:latest"
        );
    }

    #[test]
    fn test_load_image_skips_empty_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("a").join(IMAGE_FILE);
        let short = dir.path().join("b").join(IMAGE_FILE);
        let good = dir.path().join("c").join(IMAGE_FILE);
        let missing = dir.path().join("d").join(IMAGE_FILE);
        for (path, content) in [(&empty, "\n"), (&short, "ab"), (&good, "moodle:4.3\n")] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }

        let (image, path) =
            load_image_from_paths(&[missing, empty, short, good.clone()]).unwrap();
        assert_eq!(image.name(), "moodle:4.3");
        assert_eq!(path, good);
    }

    #[test]
    fn test_resolve_image_prefers_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IMAGE_FILE), "custom/moodle:1.0").unwrap();

        let (image, source) = resolve_image(None, dir.path()).unwrap();
        assert_eq!(image.name(), "custom/moodle:1.0");
        assert_eq!(source, ImageSource::File(dir.path().join(IMAGE_FILE)));
    }

    #[test]
    fn test_resolve_image_override() {
        let dir = tempfile::tempdir().unwrap();
        let (image, source) = resolve_image(Some("override:1"), dir.path()).unwrap();
        assert_eq!(image.name(), "override:1");
        assert_eq!(source, ImageSource::Override);
        assert!(resolve_image(Some("x"), dir.path()).is_err());
    }

    #[test]
    fn test_resolve_image_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IMAGE_FILE), "  \n").unwrap();

        let (image, source) = resolve_image(None, dir.path()).unwrap();
        assert_eq!(image.name(), DEFAULT_IMAGE);
        assert_eq!(source, ImageSource::Default);
    }

    #[test]
    fn test_search_paths_start_with_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = image_search_paths(dir.path());
        assert_eq!(paths[0], dir.path().join(IMAGE_FILE));
        assert!(paths.len() >= 2);
    }

    #[test]
    fn test_policy_defaults_and_builders() {
        let policy = ReadinessPolicy::default();
        assert_eq!(policy.poll_interval, Duration::from_secs(2));
        assert_eq!(policy.backoff_interval, Duration::from_secs(5));
        assert_eq!(policy.backoff_after, 5);
        assert_eq!(policy.subsequent_timeout, Duration::from_secs(600));
        assert_eq!(policy.probe_request_timeout, Duration::from_secs(5));

        let fast = policy
            .with_poll_interval(Duration::from_millis(5))
            .with_backoff(2, Duration::from_millis(10))
            .with_subsequent_timeout(Duration::from_millis(100));
        assert_eq!(fast.poll_interval, Duration::from_millis(5));
        assert_eq!(fast.backoff_after, 2);
        assert_eq!(fast.subsequent_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_settings_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(
            &path,
            "image = \"moodle:dev\"\nport_mapping = \"9090:8080\"\nprobe_url = \"http://localhost:9090\"\n",
        )
        .unwrap();

        let file = SettingsFile::load(&path).unwrap();
        let settings = ServiceSettings::default().apply(file);
        assert_eq!(settings.image.name(), "moodle:dev");
        assert_eq!(settings.port_mapping, "9090:8080");
        assert_eq!(settings.probe_url, "http://localhost:9090");
        assert_eq!(settings.container_runtime, "docker");
    }

    #[test]
    fn test_settings_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            SettingsFile::load(&dir.path().join("missing.toml")).unwrap(),
            SettingsFile::default()
        );

        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "unknown_key = 1\n").unwrap();
        assert!(SettingsFile::load(&path).is_err());

        std::fs::write(&path, "image = \"x\"\n").unwrap();
        assert!(SettingsFile::load(&path).is_err());
    }

    #[test]
    fn test_config_load_uses_settings_file_image() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "image = \"from/settings:1\"\n").unwrap();
        std::fs::write(dir.path().join(IMAGE_FILE), "from/image-file:1").unwrap();

        let config = Config::load(Some(dir.path().to_path_buf()), None).unwrap();
        assert_eq!(config.data_dir, dir.path());
        if std::env::var_os(IMAGE_ENV).is_none() {
            assert_eq!(config.settings.image.name(), "from/settings:1");
        }
        // An explicit override still wins
        let config =
            Config::load(Some(dir.path().to_path_buf()), Some("explicit:1".to_string())).unwrap();
        assert_eq!(config.settings.image.name(), "explicit:1");
    }
}
