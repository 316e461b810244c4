//! Where a run's settings come from.
//!
//! The first source present wins: the `--config` flag, `$DIRWATCH_CONFIG_PATH`, inline JSON in
//! `$DIRWATCH_CONFIG_JSON`, then `dirwatch.toml` in the working directory. With none of them the
//! built-in defaults apply. A source only needs to name the fields it changes.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use dirwatch_core::StressSettings;

/// Environment variable naming a settings file (`.json` is read as JSON, anything else as TOML).
pub const CONFIG_PATH_ENV: &str = "DIRWATCH_CONFIG_PATH";
/// Environment variable carrying the settings as inline JSON.
pub const CONFIG_JSON_ENV: &str = "DIRWATCH_CONFIG_JSON";

const WORKING_DIR_FILE: &str = "dirwatch.toml";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SettingsSource {
    #[default]
    Defaults,
    Flag(PathBuf),
    EnvPath(PathBuf),
    EnvInline(String),
    WorkingDir(PathBuf),
}

impl SettingsSource {
    /// Pick the source for this process: `flag` first, then the environment, then the working
    /// directory.
    pub fn resolve(flag: Option<&Path>) -> Self {
        let local = Path::new(WORKING_DIR_FILE);
        Self::resolve_with(flag, |name| std::env::var(name).ok(), local.is_file().then_some(local))
    }

    fn resolve_with(
        flag: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
        working_dir_file: Option<&Path>,
    ) -> Self {
        let set = |name: &str| env(name).filter(|value: &String| !value.trim().is_empty());

        if let Some(path) = flag {
            Self::Flag(path.to_path_buf())
        } else if let Some(path) = set(CONFIG_PATH_ENV) {
            Self::EnvPath(PathBuf::from(path))
        } else if let Some(json) = set(CONFIG_JSON_ENV) {
            Self::EnvInline(json)
        } else if let Some(path) = working_dir_file {
            Self::WorkingDir(path.to_path_buf())
        } else {
            Self::Defaults
        }
    }

    pub fn load(&self) -> anyhow::Result<StressSettings> {
        match self {
            Self::Defaults => Ok(StressSettings::default()),
            Self::EnvInline(json) => Format::Json.parse(json, &self.to_string()),
            Self::Flag(path) | Self::EnvPath(path) | Self::WorkingDir(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings from {self}"))?;
                Format::of(path).parse(&text, &self.to_string())
            }
        }
    }
}

impl fmt::Display for SettingsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defaults => f.write_str("built-in defaults"),
            Self::Flag(path) => write!(f, "--config {}", path.display()),
            Self::EnvPath(path) => write!(f, "${} ({})", CONFIG_PATH_ENV, path.display()),
            Self::EnvInline(_) => write!(f, "${}", CONFIG_JSON_ENV),
            Self::WorkingDir(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Toml,
        }
    }

    fn parse(self, text: &str, origin: &str) -> anyhow::Result<StressSettings> {
        match self {
            Self::Toml => toml::from_str(text).with_context(|| format!("invalid TOML in {origin}")),
            Self::Json => {
                serde_json::from_str(text).with_context(|| format!("invalid JSON in {origin}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn toml_file_overrides_only_what_it_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dirwatch.toml");
        fs::write(&path, "iterations = 12\n\n[poller]\ncancel_timeout_ms = 250\n").unwrap();

        let settings = SettingsSource::WorkingDir(path).load().unwrap();
        assert_eq!(settings.iterations, 12);
        assert_eq!(settings.poller.cancel_timeout_ms, 250);
        assert_eq!(settings.poller.wait_slice_ms, 50);
        assert_eq!(settings.deadline_secs, 300);
    }

    #[test]
    fn json_extension_selects_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.JSON");
        fs::write(&path, r#"{"deadline_secs": 7}"#).unwrap();

        let settings = SettingsSource::Flag(path).load().unwrap();
        assert_eq!(settings.deadline_secs, 7);
    }

    #[test]
    fn flag_beats_environment_beats_working_dir() {
        let flag = Path::new("flag.toml");
        let local = Path::new("dirwatch.toml");
        let env = env_of(&[
            (CONFIG_PATH_ENV, "env.toml"),
            (CONFIG_JSON_ENV, r#"{"settle_ms": 1}"#),
        ]);

        assert_eq!(
            SettingsSource::resolve_with(Some(flag), &env, Some(local)),
            SettingsSource::Flag(flag.to_path_buf())
        );
        assert_eq!(
            SettingsSource::resolve_with(None, &env, Some(local)),
            SettingsSource::EnvPath(PathBuf::from("env.toml"))
        );
        assert_eq!(
            SettingsSource::resolve_with(None, env_of(&[(CONFIG_JSON_ENV, "{}")]), Some(local)),
            SettingsSource::EnvInline("{}".into())
        );
        assert_eq!(
            SettingsSource::resolve_with(None, env_of(&[(CONFIG_PATH_ENV, "  ")]), Some(local)),
            SettingsSource::WorkingDir(local.to_path_buf())
        );
        assert_eq!(
            SettingsSource::resolve_with(None, env_of(&[]), None),
            SettingsSource::Defaults
        );
    }

    #[test]
    fn malformed_settings_name_their_source() {
        let err = SettingsSource::EnvInline("not json".into()).load().unwrap_err();
        assert!(err.to_string().contains(CONFIG_JSON_ENV), "{err}");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "iterations = [").unwrap();
        let err = SettingsSource::Flag(path).load().unwrap_err();
        assert!(err.to_string().contains("--config"), "{err}");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = SettingsSource::EnvPath(dir.path().join("absent.toml"));
        assert!(source.load().is_err());
    }
}
