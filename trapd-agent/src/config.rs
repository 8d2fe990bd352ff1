use std::env;
use std::fs::File;
use std::io::BufReader;
use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use cfg_if::cfg_if;
use serde::{Deserialize, Serialize};
use tap::prelude::*;

const DEFAULT_API_URL: &str = "https://api.trapd.io";
const DEFAULT_INTERVAL_S: i64 = 60;
const INTERVAL_RANGE_S: RangeInclusive<i64> = 10..=3600;
const DEFAULT_BATCH_SIZE: i64 = 100;
const BATCH_SIZE_RANGE: RangeInclusive<i64> = 1..=1000;

cfg_if! {
    if #[cfg(target_os = "windows")] {
        const COMPANY_DIR: &str = "TRAPD";
        const PROGRAM_DIR: &str = "Agent";
        const APPLICATION_DIR: &str = "TRAPD\\Agent";
    } else if #[cfg(target_os = "macos")] {
        const COMPANY_DIR: &str = "TRAPD";
        const PROGRAM_DIR: &str = "Agent";
        const APPLICATION_DIR: &str = "TRAPD Agent";
    } else {
        const COMPANY_DIR: &str = "trapd";
        const PROGRAM_DIR: &str = "agent";
        const APPLICATION_DIR: &str = "trapd-agent";
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no project_id configured; set it in {conf_file} or via PROJECT_ID_OVERRIDE")]
    MissingProjectId { conf_file: Utf8PathBuf },
    #[error("failed to create directory {dir}")]
    DataDir {
        dir: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Validated agent configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct Conf {
    /// Base URL of the intake, without a trailing slash.
    pub api_url: String,
    pub project_id: String,
    /// Tick cadence of the worker loop.
    pub interval: Duration,
    /// Maximum number of items claimed per lease.
    pub batch_size: usize,
    pub log_level: dto::LogLevel,
}

impl Conf {
    /// Loads the configuration file (tolerating a missing or malformed one)
    /// and applies environment overrides.
    ///
    /// Returns the validated configuration along with warnings gathered
    /// during loading; the caller emits them once the logger is up.
    pub fn load(paths: &AgentPaths) -> Result<(Self, Vec<String>), ConfigError> {
        Self::load_with(paths, |name| env::var(name).ok())
    }

    fn load_with(
        paths: &AgentPaths,
        env_lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, Vec<String>), ConfigError> {
        let mut warnings = Vec::new();

        let conf_file_path = paths.conf_file();

        let mut conf_file = match load_conf_file(&conf_file_path) {
            Ok(Some(conf_file)) => conf_file,
            Ok(None) => {
                warnings.push(format!("no configuration file at {conf_file_path}; using defaults"));
                dto::ConfFile::default()
            }
            Err(error) => {
                warnings.push(format!("{error:#}; using defaults"));
                dto::ConfFile::default()
            }
        };

        apply_env_overrides(&mut conf_file, env_lookup, &mut warnings);

        let conf = Self::from_conf_file(&conf_file, &conf_file_path, &mut warnings)?;

        Ok((conf, warnings))
    }

    fn from_conf_file(
        conf_file: &dto::ConfFile,
        conf_file_path: &Utf8Path,
        warnings: &mut Vec<String>,
    ) -> Result<Self, ConfigError> {
        let project_id = conf_file
            .project_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ConfigError::MissingProjectId {
                conf_file: conf_file_path.to_owned(),
            })?
            .to_owned();

        let api_url = conf_file
            .api_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/')
            .to_owned();

        let interval_s = validate_range(
            "interval_s",
            conf_file.interval_s,
            INTERVAL_RANGE_S,
            DEFAULT_INTERVAL_S,
            warnings,
        );

        let batch_size = validate_range(
            "batch_size",
            conf_file.batch_size,
            BATCH_SIZE_RANGE,
            DEFAULT_BATCH_SIZE,
            warnings,
        );

        Ok(Self {
            api_url,
            project_id,
            interval: Duration::from_secs(u64::try_from(interval_s).expect("validated range is positive")),
            batch_size: usize::try_from(batch_size).expect("validated range is positive"),
            log_level: conf_file.log_level.unwrap_or_default(),
        })
    }
}

/// Out-of-range values are replaced by the default, not clamped to the
/// nearest bound.
fn validate_range(
    name: &str,
    value: Option<i64>,
    range: RangeInclusive<i64>,
    default: i64,
    warnings: &mut Vec<String>,
) -> i64 {
    match value {
        None => default,
        Some(value) if range.contains(&value) => value,
        Some(value) => {
            warnings.push(format!(
                "{name} = {value} is outside [{}, {}]; using default {default}",
                range.start(),
                range.end()
            ));
            default
        }
    }
}

fn apply_env_overrides(
    conf_file: &mut dto::ConfFile,
    env_lookup: impl Fn(&str) -> Option<String>,
    warnings: &mut Vec<String>,
) {
    if let Some(api_url) = env_lookup("API_URL_OVERRIDE").filter(|value| !value.is_empty()) {
        warnings.push(format!("API_URL_OVERRIDE is set; overriding api_url with {api_url}"));
        conf_file.api_url = Some(api_url);
    }

    if let Some(project_id) = env_lookup("PROJECT_ID_OVERRIDE").filter(|value| !value.is_empty()) {
        warnings.push("PROJECT_ID_OVERRIDE is set; overriding project_id".to_owned());
        conf_file.project_id = Some(project_id);
    }
}

fn load_conf_file(conf_path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    match File::open(conf_path) {
        Ok(file) => BufReader::new(file)
            .pipe(serde_json::from_reader)
            .map(Some)
            .with_context(|| format!("invalid config file at {conf_path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(e).context(format!("couldn't open config file at {conf_path}"))),
    }
}

/// Locations of everything the agent persists, all under one data
/// directory.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    data_dir: Utf8PathBuf,
}

impl AgentPaths {
    pub fn resolve() -> Self {
        Self::from_data_dir(get_data_dir())
    }

    pub fn from_data_dir(data_dir: Utf8PathBuf) -> Self {
        Self { data_dir }
    }

    /// Creates the data directory and its `secrets/` subdirectory.
    ///
    /// An unwritable data directory is fatal at startup.
    pub fn init(&self) -> Result<(), ConfigError> {
        for dir in [self.data_dir.clone(), self.secrets_dir()] {
            std::fs::create_dir_all(&dir).map_err(|source| ConfigError::DataDir { dir, source })?;
        }

        Ok(())
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    pub fn conf_file(&self) -> Utf8PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn api_key_file(&self) -> Utf8PathBuf {
        self.secrets_dir().join("api_key.enc")
    }

    pub fn queue_db(&self) -> Utf8PathBuf {
        self.data_dir.join("queue.db")
    }

    pub fn device_id_file(&self) -> Utf8PathBuf {
        self.data_dir.join("device_id.txt")
    }

    fn secrets_dir(&self) -> Utf8PathBuf {
        self.data_dir.join("secrets")
    }
}

fn get_data_dir() -> Utf8PathBuf {
    if let Ok(dir_override) = env::var("DATA_DIR_OVERRIDE")
        && !dir_override.is_empty()
    {
        return Utf8PathBuf::from(dir_override);
    }

    let mut data_dir = Utf8PathBuf::new();

    if cfg!(target_os = "windows") {
        let program_data_env = env::var("ProgramData").expect("ProgramData env variable should be set on Windows");
        data_dir.push(program_data_env);
        data_dir.push(COMPANY_DIR);
        data_dir.push(PROGRAM_DIR);
    } else if cfg!(target_os = "macos") {
        data_dir.push("/Library/Application Support");
        data_dir.push(APPLICATION_DIR);
    } else {
        data_dir.push("/var/lib");
        data_dir.push(APPLICATION_DIR);
    }

    data_dir
}

pub mod dto {
    use super::*;

    /// Source of truth for agent configuration
    ///
    /// This struct represents the JSON file used for configuration as close
    /// as possible and is not trying to be too smart. Range validation
    /// happens when [`super::Conf`] is built from it.
    #[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
    pub struct ConfFile {
        /// Base URL of the intake
        #[serde(skip_serializing_if = "Option::is_none")]
        pub api_url: Option<String>,

        /// Project identifier sent in every event (required)
        #[serde(skip_serializing_if = "Option::is_none")]
        pub project_id: Option<String>,

        /// Tick cadence in seconds, valid range [10, 3600]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub interval_s: Option<i64>,

        /// Maximum items per lease, valid range [1, 1000]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub batch_size: Option<i64>,

        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_level: Option<LogLevel>,

        /// Other unofficial options.
        /// This field is useful so that we can deserialize
        /// and then losslessly serialize back all root keys of the config file.
        #[serde(flatten)]
        pub rest: serde_json::Map<String, serde_json::Value>,
    }

    /// Verbosity of the agent log.
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, Default)]
    pub enum LogLevel {
        Trace,
        Debug,
        #[default]
        Information,
        Warning,
        Error,
        Critical,
    }

    impl LogLevel {
        pub fn to_log_filter(self) -> &'static str {
            match self {
                LogLevel::Trace => "trace",
                LogLevel::Debug => "debug",
                LogLevel::Information => "info",
                LogLevel::Warning => "warn",
                // tracing has no level above error; both map to error-only.
                LogLevel::Error | LogLevel::Critical => "error",
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths_in(tmp_dir: &tempfile::TempDir) -> AgentPaths {
        AgentPaths::from_data_dir(Utf8PathBuf::from(tmp_dir.path().to_str().expect("utf-8 temp path")))
    }

    fn no_env(_name: &str) -> Option<String> {
        None
    }

    #[test]
    fn missing_file_uses_defaults_but_requires_project_id() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let paths = paths_in(&tmp_dir);

        let result = Conf::load_with(&paths, no_env);
        assert!(matches!(result, Err(ConfigError::MissingProjectId { .. })));
    }

    #[test]
    fn minimal_file_fills_in_defaults() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let paths = paths_in(&tmp_dir);
        std::fs::write(paths.conf_file(), r#"{"project_id": "proj-1"}"#).unwrap();

        let (conf, warnings) = Conf::load_with(&paths, no_env).expect("load");

        assert_eq!(conf.api_url, DEFAULT_API_URL);
        assert_eq!(conf.project_id, "proj-1");
        assert_eq!(conf.interval, Duration::from_secs(60));
        assert_eq!(conf.batch_size, 100);
        assert_eq!(conf.log_level, dto::LogLevel::Information);
        assert!(warnings.is_empty());
    }

    #[test]
    fn out_of_range_values_fall_back_to_defaults_with_warnings() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let paths = paths_in(&tmp_dir);
        std::fs::write(
            paths.conf_file(),
            r#"{"project_id": "p", "interval_s": 5, "batch_size": 100000}"#,
        )
        .unwrap();

        let (conf, warnings) = Conf::load_with(&paths, no_env).expect("load");

        assert_eq!(conf.interval, Duration::from_secs(60));
        assert_eq!(conf.batch_size, 100);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("interval_s"));
        assert!(warnings[1].contains("batch_size"));
    }

    #[test]
    fn in_range_values_are_kept() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let paths = paths_in(&tmp_dir);
        std::fs::write(
            paths.conf_file(),
            r#"{"project_id": "p", "interval_s": 10, "batch_size": 1000, "log_level": "Debug"}"#,
        )
        .unwrap();

        let (conf, warnings) = Conf::load_with(&paths, no_env).expect("load");

        assert_eq!(conf.interval, Duration::from_secs(10));
        assert_eq!(conf.batch_size, 1000);
        assert_eq!(conf.log_level, dto::LogLevel::Debug);
        assert!(warnings.is_empty());
    }

    #[test]
    fn malformed_file_degrades_to_defaults() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let paths = paths_in(&tmp_dir);
        std::fs::write(paths.conf_file(), "{ this is not json").unwrap();

        let result = Conf::load_with(&paths, |name| {
            (name == "PROJECT_ID_OVERRIDE").then(|| "env-proj".to_owned())
        });

        let (conf, warnings) = result.expect("env override still applies over defaults");
        assert_eq!(conf.project_id, "env-proj");
        assert!(warnings.iter().any(|warning| warning.contains("invalid config file")));
    }

    #[test]
    fn env_overrides_take_precedence_and_warn() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let paths = paths_in(&tmp_dir);
        std::fs::write(
            paths.conf_file(),
            r#"{"project_id": "file-proj", "api_url": "https://file.example"}"#,
        )
        .unwrap();

        let (conf, warnings) = Conf::load_with(&paths, |name| match name {
            "API_URL_OVERRIDE" => Some("https://env.example/".to_owned()),
            "PROJECT_ID_OVERRIDE" => Some("env-proj".to_owned()),
            _ => None,
        })
        .expect("load");

        assert_eq!(conf.api_url, "https://env.example", "trailing slash is trimmed");
        assert_eq!(conf.project_id, "env-proj");
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let conf_file: dto::ConfFile =
            serde_json::from_str(r#"{"project_id": "p", "future_option": {"nested": true}}"#).unwrap();

        assert_eq!(conf_file.project_id.as_deref(), Some("p"));
        assert!(conf_file.rest.contains_key("future_option"));
    }

    #[test]
    fn log_levels_map_to_tracing_filters() {
        assert_eq!(dto::LogLevel::Trace.to_log_filter(), "trace");
        assert_eq!(dto::LogLevel::Information.to_log_filter(), "info");
        assert_eq!(dto::LogLevel::Critical.to_log_filter(), "error");
    }

    #[test]
    fn derived_paths_live_under_the_data_dir() {
        let paths = AgentPaths::from_data_dir(Utf8PathBuf::from("/data"));

        assert_eq!(paths.conf_file(), "/data/config.json");
        assert_eq!(paths.api_key_file(), "/data/secrets/api_key.enc");
        assert_eq!(paths.queue_db(), "/data/queue.db");
        assert_eq!(paths.device_id_file(), "/data/device_id.txt");
    }

    #[test]
    fn init_creates_data_and_secrets_dirs() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::from(tmp_dir.path().to_str().unwrap()).join("nested/agent");
        let paths = AgentPaths::from_data_dir(root.clone());

        paths.init().expect("init");

        assert!(root.is_dir());
        assert!(root.join("secrets").is_dir());
    }
}
