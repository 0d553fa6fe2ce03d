/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::rollout::logger::{LogFormat, LogLevel};

use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, PathBuf};
use std::time::Duration;

/// Filesystem locations the rollout process works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    Keyspace,
    LockFile,
    ResourceRoot,
    ManifestDir,
}

impl Config {
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Keyspace => "ROLLOUT_KEYSPACE",
            Config::LockFile => "ROLLOUT_LOCK_FILE",
            Config::ResourceRoot => "ROLLOUT_RESOURCE_ROOT",
            Config::ManifestDir => "ROLLOUT_MANIFEST_DIR",
        }
    }

    pub fn default_path(&self) -> &'static str {
        match self {
            Config::Keyspace => {
                #[cfg(test)]
                {
                    "/tmp/controlplane-rollout-test/keyspace"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/controlplane-rollout/keyspace"
                }
            }
            Config::LockFile => {
                #[cfg(test)]
                {
                    "/tmp/controlplane-rollout-test/keyspace/.lock"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/controlplane-rollout/keyspace/.lock"
                }
            }
            Config::ResourceRoot => {
                #[cfg(test)]
                {
                    "/tmp/controlplane-rollout-test/static-pod-resources"
                }
                #[cfg(not(test))]
                {
                    "/etc/kubernetes/static-pod-resources"
                }
            }
            Config::ManifestDir => {
                #[cfg(test)]
                {
                    "/tmp/controlplane-rollout-test/manifests"
                }
                #[cfg(not(test))]
                {
                    "/etc/kubernetes/manifests"
                }
            }
        }
    }

    /// Returns the environment override when set, the default otherwise.
    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var()).map_or_else(
            |_| Self::normalize_path(self.default_path()),
            |value| Self::normalize_path(&value),
        )
    }

    /// Creates the directory when absent and rejects non-directories.
    pub fn verify(&self) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
        let path = match self {
            Config::LockFile => match self.get_path().parent() {
                Some(parent) => parent.to_path_buf(),
                None => return Ok(self.get_path()),
            },
            _ => self.get_path(),
        };

        if !path.exists() {
            fs::create_dir_all(&path)
                .map_err(|e| format!("Failed to create directory '{}': {}", path.display(), e))?;
        } else if !path.is_dir() {
            return Err(format!("Path '{}' exists but is not a directory", path.display()).into());
        }

        if let Some(mode) = self.desired_mode() {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).map_err(|error| {
                std::io::Error::other(format!(
                    "Failed to set permissions on '{}': {}",
                    path.display(),
                    error
                ))
            })?;
        }

        Ok(self.get_path())
    }

    /// Expands `~`, anchors relative paths at the working directory and
    /// collapses `.` / `..` components.
    fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }

    fn desired_mode(&self) -> Option<u32> {
        match self {
            Config::Keyspace => Some(0o750),
            Config::LockFile => None,
            Config::ResourceRoot => Some(0o755),
            Config::ManifestDir => Some(0o755),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsError {
    pub variable: &'static str,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid value '{}' for {}: {}",
            self.value, self.variable, self.reason
        )
    }
}

impl Error for SettingsError {}

/// Tunables for the controller loops, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutSettings {
    /// Periodic resync applied on top of change notifications.
    pub resync_interval: Duration,
    /// Upper bound for a single reconcile pass.
    pub pass_deadline: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Grace period the API server gets to shut down before the new instance
    /// is expected to report its revision.
    pub termination_grace_period: Duration,
    pub stall_margin: Duration,
    /// Number of revisions kept in addition to any revision still in use.
    pub revision_history_limit: u64,
    pub pod_bundle_name: String,
    /// Restricts the local installer executor to one node. `None` runs tasks
    /// for every node.
    pub node_name: Option<String>,
    pub log_format: LogFormat,
    pub log_level: LogLevel,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            pass_deadline: Duration::from_secs(30),
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
            termination_grace_period: Duration::from_secs(135),
            stall_margin: Duration::from_secs(60),
            revision_history_limit: 5,
            pod_bundle_name: "kube-apiserver-pod".to_string(),
            node_name: None,
            log_format: LogFormat::Text,
            log_level: LogLevel::Info,
        }
    }
}

const RESYNC_INTERVAL: &str = "ROLLOUT_RESYNC_INTERVAL";
const PASS_DEADLINE: &str = "ROLLOUT_PASS_DEADLINE";
const BACKOFF_INITIAL: &str = "ROLLOUT_BACKOFF_INITIAL";
const BACKOFF_MAX: &str = "ROLLOUT_BACKOFF_MAX";
const TERMINATION_GRACE_PERIOD: &str = "ROLLOUT_TERMINATION_GRACE_PERIOD";
const STALL_MARGIN: &str = "ROLLOUT_STALL_MARGIN";
const REVISION_HISTORY_LIMIT: &str = "ROLLOUT_REVISION_HISTORY_LIMIT";
const POD_BUNDLE_NAME: &str = "ROLLOUT_POD_BUNDLE_NAME";
const NODE_NAME: &str = "ROLLOUT_NODE_NAME";
const LOG_FORMAT: &str = "ROLLOUT_LOG_FORMAT";
const LOG_LEVEL: &str = "ROLLOUT_LOG_LEVEL";

impl RolloutSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        let defaults = Self::default();
        let settings = Self {
            resync_interval: duration_var(RESYNC_INTERVAL, defaults.resync_interval)?,
            pass_deadline: duration_var(PASS_DEADLINE, defaults.pass_deadline)?,
            backoff_initial: duration_var(BACKOFF_INITIAL, defaults.backoff_initial)?,
            backoff_max: duration_var(BACKOFF_MAX, defaults.backoff_max)?,
            termination_grace_period: duration_var(
                TERMINATION_GRACE_PERIOD,
                defaults.termination_grace_period,
            )?,
            stall_margin: duration_var(STALL_MARGIN, defaults.stall_margin)?,
            revision_history_limit: parsed_var(
                REVISION_HISTORY_LIMIT,
                defaults.revision_history_limit,
            )?,
            pod_bundle_name: match non_empty_var(POD_BUNDLE_NAME) {
                Some(name) => validate_bundle_name(name)?,
                None => defaults.pod_bundle_name,
            },
            node_name: non_empty_var(NODE_NAME),
            log_format: parsed_var(LOG_FORMAT, defaults.log_format)?,
            log_level: parsed_var(LOG_LEVEL, defaults.log_level)?,
        };

        if settings.backoff_initial.is_zero() || settings.backoff_initial > settings.backoff_max {
            return Err(SettingsError {
                variable: BACKOFF_INITIAL,
                value: humantime::format_duration(settings.backoff_initial).to_string(),
                reason: "must be non-zero and not exceed ROLLOUT_BACKOFF_MAX".to_string(),
            });
        }
        if settings.resync_interval.is_zero() {
            return Err(SettingsError {
                variable: RESYNC_INTERVAL,
                value: "0s".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(settings)
    }

    /// Time after a successful install before a node still reporting an older
    /// revision counts as stalled.
    pub fn stall_threshold(&self) -> Duration {
        self.termination_grace_period + self.stall_margin
    }
}

fn non_empty_var(variable: &str) -> Option<String> {
    env::var(variable)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn duration_var(variable: &'static str, default: Duration) -> Result<Duration, SettingsError> {
    match non_empty_var(variable) {
        Some(value) => humantime::parse_duration(&value).map_err(|err| SettingsError {
            variable,
            value,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}

fn parsed_var<T>(variable: &'static str, default: T) -> Result<T, SettingsError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match non_empty_var(variable) {
        Some(value) => value.parse::<T>().map_err(|err| SettingsError {
            variable,
            reason: err.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn validate_bundle_name(name: String) -> Result<String, SettingsError> {
    let valid = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid && !name.starts_with('-') {
        Ok(name)
    } else {
        Err(SettingsError {
            variable: POD_BUNDLE_NAME,
            value: name,
            reason: "must contain only lowercase alphanumerics and '-'".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::test_support::EnvGuard;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_apply_without_environment() {
        let _guard = EnvGuard::clear(&[RESYNC_INTERVAL, TERMINATION_GRACE_PERIOD, LOG_FORMAT]);
        let settings = RolloutSettings::from_env().expect("settings");
        assert_eq!(settings, RolloutSettings::default());
        assert_eq!(settings.stall_threshold(), Duration::from_secs(195));
    }

    #[test]
    #[serial]
    fn parses_humantime_durations_and_formats() {
        let _guard = EnvGuard::set(&[
            (RESYNC_INTERVAL, "1m 30s"),
            (TERMINATION_GRACE_PERIOD, "15s"),
            (LOG_FORMAT, "json"),
            (REVISION_HISTORY_LIMIT, "2"),
        ]);
        let settings = RolloutSettings::from_env().expect("settings");
        assert_eq!(settings.resync_interval, Duration::from_secs(90));
        assert_eq!(settings.termination_grace_period, Duration::from_secs(15));
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.revision_history_limit, 2);
    }

    #[test]
    #[serial]
    fn rejects_invalid_values() {
        let _guard = EnvGuard::set(&[(PASS_DEADLINE, "soon")]);
        let err = RolloutSettings::from_env().expect_err("invalid duration");
        assert_eq!(err.variable, PASS_DEADLINE);

        let _guard = EnvGuard::set(&[(PASS_DEADLINE, "5s"), (POD_BUNDLE_NAME, "Bad_Name")]);
        let err = RolloutSettings::from_env().expect_err("invalid bundle name");
        assert_eq!(err.variable, POD_BUNDLE_NAME);
    }

    #[test]
    #[serial]
    fn config_paths_follow_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("nested/../resources");
        let _guard = EnvGuard::set(&[(
            Config::ResourceRoot.env_var(),
            target.to_str().expect("utf8 path"),
        )]);
        let path = Config::ResourceRoot.verify().expect("verify");
        assert_eq!(path, dir.path().join("resources"));
        assert!(path.is_dir());
    }
}
