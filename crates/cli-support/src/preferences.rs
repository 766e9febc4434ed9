//! User-wide preferences, read from `$GLOBALODOCONFIG` or `~/.odo/preference.yaml`

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use odo_core::trace_call_result;

pub const PREFERENCE_ENV_VAR: &str = "GLOBALODOCONFIG";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Deserialize, Default, Debug)]
struct PreferenceFile {
    #[serde(rename = "OdoSettings", default)]
    settings: Preferences,
}

#[derive(Clone, PartialEq, Eq, Deserialize, Default, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct Preferences {
    #[serde(default)]
    timeout: Option<DurationValue>,
    #[serde(default)]
    push_timeout: Option<DurationValue>,
    #[serde(default)]
    image_registry: Option<String>,
    #[serde(default)]
    ephemeral: Option<bool>,
}

/// Either whole seconds or a duration string such as `1m30s`
#[derive(Clone, PartialEq, Eq, Deserialize, Debug)]
#[serde(untagged)]
enum DurationValue {
    Seconds(u64),
    Text(String),
}

#[derive(Error, Debug)]
pub enum PreferenceError {
    #[error("failed to read preferences from {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid preferences in {}: {message}", .path.display())]
    Invalid { path: PathBuf, message: String },
}

impl Preferences {
    pub fn path() -> Option<PathBuf> {
        match env::var_os(PREFERENCE_ENV_VAR) {
            Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
            _ => dirs::home_dir().map(|home| home.join(".odo").join("preference.yaml")),
        }
    }

    /// Loads the user's preferences; a missing file means defaults
    pub fn load() -> Result<Preferences, PreferenceError> {
        match Preferences::path() {
            Some(path) => Preferences::load_from(&path),
            None => Ok(Preferences::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Preferences, PreferenceError> {
        let source = match trace_call_result!(fs::read_to_string(path), expect: [NotFound]) {
            Ok(source) => source,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(code = "preferences_missing", path = %path.display());
                return Ok(Preferences::default());
            }
            Err(source) => {
                return Err(PreferenceError::Read {
                    path: path.to_owned(),
                    source,
                })
            }
        };
        if source.trim().is_empty() {
            return Ok(Preferences::default());
        }
        let invalid = |message: String| PreferenceError::Invalid {
            path: path.to_owned(),
            message,
        };
        let file: PreferenceFile = serde_yaml::from_str(&source).map_err(|err| invalid(err.to_string()))?;
        let preferences = file.settings;
        for value in [&preferences.timeout, &preferences.push_timeout].into_iter().flatten() {
            value.to_duration().map_err(invalid)?;
        }
        Ok(preferences)
    }

    /// Deadline for individual platform operations
    pub fn timeout(&self) -> Duration {
        resolve(&self.timeout, DEFAULT_TIMEOUT)
    }

    /// How long a new pod may take to become ready
    pub fn push_timeout(&self) -> Duration {
        resolve(&self.push_timeout, DEFAULT_PUSH_TIMEOUT)
    }

    pub fn image_registry(&self) -> Option<&str> {
        self.image_registry.as_deref().filter(|registry| !registry.is_empty())
    }

    pub fn ephemeral(&self) -> bool {
        self.ephemeral.unwrap_or(true)
    }
}

fn resolve(value: &Option<DurationValue>, default: Duration) -> Duration {
    value
        .as_ref()
        .and_then(|value| value.to_duration().ok())
        .unwrap_or(default)
}

impl DurationValue {
    fn to_duration(&self) -> Result<Duration, String> {
        match self {
            DurationValue::Seconds(seconds) => Ok(Duration::from_secs(*seconds)),
            DurationValue::Text(text) => parse_duration(text),
        }
    }
}

/// Parses durations of the form `90`, `45s`, `2m`, `1h30m` or `500ms`
fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let invalid = || format!("invalid duration {:?}", text);
    if let Ok(seconds) = text.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    if rest.is_empty() {
        return Err(invalid());
    }
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let amount: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount * 60),
            "h" => Duration::from_secs(amount * 3600),
            _ => return Err(invalid()),
        };
        total += unit;
        rest = &rest[unit_len..];
    }
    Ok(total)
}
