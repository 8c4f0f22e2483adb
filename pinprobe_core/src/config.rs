use crate::encoding::TextEncoding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "pinprobe.toml";

const PLACEHOLDER_PIN: &str = "PATH_TO_PIN";
const PLACEHOLDER_BCOUNT32: &str = "PATH_TO_BCOUNT32";
const PLACEHOLDER_BCOUNT64: &str = "PATH_TO_BCOUNT64";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unsupported architecture '{0}', expected 32 or 64")]
    UnknownArch(String),
    #[error("Unknown branch counting mode '{0}', expected all, taken or not-taken")]
    UnknownCountMode(String),
    #[error("Range end {end:#x} must be greater than range start {start:#x}")]
    InvalidRange { start: u64, end: u64 },
    #[error("Harness path '{0}' is not set")]
    MissingHarnessPath(&'static str),
    #[error("Harness path '{key}' still holds the placeholder '{value}'")]
    PlaceholderHarnessPath { key: &'static str, value: String },
}

/// Word size of the target, which picks the harness tool variant.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    #[serde(rename = "32")]
    X86,
    #[serde(rename = "64")]
    X64,
}

impl Arch {
    pub fn bits(&self) -> u32 {
        match self {
            Arch::X86 => 32,
            Arch::X64 => 64,
        }
    }
}

impl FromStr for Arch {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "32" => Ok(Arch::X86),
            "64" => Ok(Arch::X64),
            other => Err(ConfigError::UnknownArch(other.to_string())),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// Which direct branches the harness counts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CountMode {
    #[default]
    All,
    Taken,
    NotTaken,
}

impl CountMode {
    /// Harness flag selecting this mode, if any.
    pub fn harness_flag(&self) -> Option<&'static str> {
        match self {
            CountMode::All => None,
            CountMode::Taken => Some("-b"),
            CountMode::NotTaken => Some("-n"),
        }
    }
}

impl FromStr for CountMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(CountMode::All),
            "taken" => Ok(CountMode::Taken),
            "not-taken" => Ok(CountMode::NotTaken),
            other => Err(ConfigError::UnknownCountMode(other.to_string())),
        }
    }
}

/// Filesystem locations of the instrumentation front-end and its tools.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HarnessPaths {
    pub pin: PathBuf,
    pub bcount32: PathBuf,
    pub bcount64: PathBuf,
}

impl HarnessPaths {
    pub fn tool_for(&self, arch: Arch) -> &Path {
        match arch {
            Arch::X86 => &self.bcount32,
            Arch::X64 => &self.bcount64,
        }
    }

    fn placeholders() -> Self {
        Self {
            pin: PathBuf::from(PLACEHOLDER_PIN),
            bcount32: PathBuf::from(PLACEHOLDER_BCOUNT32),
            bcount64: PathBuf::from(PLACEHOLDER_BCOUNT64),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let entries: [(&'static str, &Path, &str); 3] = [
            ("pin", &self.pin, PLACEHOLDER_PIN),
            ("bcount32", &self.bcount32, PLACEHOLDER_BCOUNT32),
            ("bcount64", &self.bcount64, PLACEHOLDER_BCOUNT64),
        ];
        for (key, path, placeholder) in entries {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::MissingHarnessPath(key));
            }
            if path == Path::new(placeholder) {
                return Err(ConfigError::PlaceholderHarnessPath {
                    key,
                    value: placeholder.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    /// Worker count for parallel batches. Unset means host parallelism.
    #[serde(default)]
    pub workers: Option<usize>,
}

/// Contents of the on-disk configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PinprobeConfig {
    pub path: HarnessPaths,
    #[serde(default)]
    pub pool: Option<PoolSettings>,
}

impl PinprobeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: PinprobeConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn default_path() -> Result<PathBuf, anyhow::Error> {
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine the user config directory"))?;
        Ok(dir.join(CONFIG_FILE_NAME))
    }

    /// Loads the configuration at `explicit`, or at the default location.
    ///
    /// A missing default file is created from a template and reported as an
    /// error so the user can fill in the harness paths. A missing explicit
    /// path is only an error.
    pub fn load_or_bootstrap(explicit: Option<&Path>) -> Result<Self, anyhow::Error> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }
        let path = Self::default_path()?;
        if !path.exists() {
            Self::write_template(&path)?;
            anyhow::bail!("Please complete the config file ({})", path.display());
        }
        Self::load_from_file(&path)
    }

    pub fn write_template(path: &Path) -> Result<(), anyhow::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("Failed to create config directory {:?}: {}", parent, e)
            })?;
        }
        let template = PinprobeConfig {
            path: HarnessPaths::placeholders(),
            pool: None,
        };
        let text = toml::to_string_pretty(&template)?;
        std::fs::write(path, text)
            .map_err(|e| anyhow::anyhow!("Failed to write config template {:?}: {}", path, e))?;
        tracing::info!(path = %path.display(), "wrote configuration template");
        Ok(())
    }
}

/// Run-wide harness parameters. Built once, shared read-only by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub arch: Arch,
    pub range_start: Option<u64>,
    pub range_end: Option<u64>,
    pub count_mode: CountMode,
    pub module: Option<String>,
    pub encoding: TextEncoding,
    pub retry: u32,
    pub harness_debug: bool,
    pub harness: HarnessPaths,
}

impl ProbeConfig {
    pub fn new(arch: Arch, harness: HarnessPaths) -> Self {
        Self {
            arch,
            range_start: None,
            range_end: None,
            count_mode: CountMode::All,
            module: None,
            encoding: TextEncoding::Utf8,
            retry: 0,
            harness_debug: false,
            harness,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let (Some(start), Some(end)) = (self.range_start, self.range_end)
            && end <= start
        {
            return Err(ConfigError::InvalidRange { start, end });
        }
        self.harness.validate()
    }

    pub fn tool_path(&self) -> &Path {
        self.harness.tool_for(self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> HarnessPaths {
        HarnessPaths {
            pin: PathBuf::from("/opt/pin/pin"),
            bcount32: PathBuf::from("/opt/pin/bcount32.so"),
            bcount64: PathBuf::from("/opt/pin/bcount64.so"),
        }
    }

    #[test]
    fn parse_config_file() {
        let text = r#"
            [path]
            pin = "/opt/pin/pin"
            bcount32 = "/opt/pin/bcount32.so"
            bcount64 = "/opt/pin/bcount64.so"

            [pool]
            workers = 3
        "#;
        let config: PinprobeConfig = toml::from_str(text).unwrap();
        assert_eq!(config.path, harness());
        assert_eq!(config.pool.unwrap().workers, Some(3));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = r#"
            [path]
            pin = "a"
            bcount32 = "b"
            bcount64 = "c"
            bcount128 = "d"
        "#;
        assert!(toml::from_str::<PinprobeConfig>(text).is_err());
    }

    #[test]
    fn template_round_trips_and_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        PinprobeConfig::write_template(&path).unwrap();

        let loaded = PinprobeConfig::load_from_file(&path).unwrap();
        let config = ProbeConfig::new(Arch::X64, loaded.path);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PlaceholderHarnessPath { key: "pin", .. })
        ));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = PinprobeConfig::load_or_bootstrap(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
        assert!(!path.exists());
    }

    #[test]
    fn tool_follows_arch() {
        let mut config = ProbeConfig::new(Arch::X86, harness());
        assert_eq!(config.tool_path(), Path::new("/opt/pin/bcount32.so"));
        config.arch = Arch::X64;
        assert_eq!(config.tool_path(), Path::new("/opt/pin/bcount64.so"));
    }

    #[test]
    fn range_must_be_ordered() {
        let mut config = ProbeConfig::new(Arch::X64, harness());
        config.range_start = Some(0x2000);
        config.range_end = Some(0x1000);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidRange {
                start: 0x2000,
                end: 0x1000
            })
        );
        config.range_end = Some(0x3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn arch_and_count_mode_parse_exactly() {
        assert_eq!("32".parse::<Arch>(), Ok(Arch::X86));
        assert_eq!("64".parse::<Arch>(), Ok(Arch::X64));
        assert!("16".parse::<Arch>().is_err());
        assert_eq!("not-taken".parse::<CountMode>(), Ok(CountMode::NotTaken));
        assert!("tak".parse::<CountMode>().is_err());
        assert_eq!(CountMode::All.harness_flag(), None);
        assert_eq!(CountMode::Taken.harness_flag(), Some("-b"));
    }
}
