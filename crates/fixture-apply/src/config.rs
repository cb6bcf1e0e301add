//! Harness configuration.
//!
//! Supports `.fixture-config.yaml` files placed anywhere in the directory
//! hierarchy. The search starts at a given directory and walks upward to the
//! filesystem root.

use std::{
	fs, io,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::decode::NamespaceLabels;

/// The name of the config file the harness looks for
pub const CONFIG_FILE_NAME: &str = ".fixture-config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file: {}", path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("failed to parse config file: {}", path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_yaml::Error,
	},
}

/// Deadlines for backend calls and remote manifest fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
	/// Bound for get, create, update and publish calls.
	#[serde(deserialize_with = "duration")]
	pub create_timeout: Duration,
	/// Bound for explicit deletes and teardown actions.
	#[serde(deserialize_with = "duration")]
	pub delete_timeout: Duration,
	/// Bound for a whole remote manifest fetch, body included.
	#[serde(deserialize_with = "duration")]
	pub manifest_fetch_timeout: Duration,
}

impl Default for TimeoutConfig {
	fn default() -> Self {
		Self {
			create_timeout: Duration::from_secs(60),
			delete_timeout: Duration::from_secs(10),
			manifest_fetch_timeout: Duration::from_secs(10),
		}
	}
}

/// Root configuration structure for .fixture-config.yaml
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarnessConfig {
	#[serde(default)]
	pub timeouts: TimeoutConfig,

	/// Labels injected into every core Namespace object of a manifest
	#[serde(default)]
	pub namespace_labels: NamespaceLabels,
}

impl HarnessConfig {
	/// Load config by searching from the given directory upward
	pub fn load_from_directory(start_dir: &Path) -> Result<Option<Self>, ConfigError> {
		find_config_file(start_dir)
			.map(|path| Self::load_from_file(&path))
			.transpose()
	}

	/// Load config from a specific file path
	pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
		let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})
	}
}

/// Search for a config file starting from `start_dir` and walking up to the filesystem root
pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
	let start = start_dir
		.canonicalize()
		.unwrap_or_else(|_| start_dir.to_path_buf());

	start
		.ancestors()
		.map(|dir| dir.join(CONFIG_FILE_NAME))
		.find(|candidate| candidate.is_file())
}

/// Accepts integer seconds or a humantime string such as `500ms`, `10s` or `2m`.
fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Raw {
		Seconds(u64),
		Text(String),
	}

	match Raw::deserialize(deserializer)? {
		Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
		Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
	}
}

fn parse_duration(text: &str) -> Result<Duration, humantime::DurationError> {
	let text = text.trim();
	match text.parse::<u64>() {
		Ok(secs) => Ok(Duration::from_secs(secs)),
		Err(_) => humantime::parse_duration(text),
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use indoc::indoc;
	use rstest::rstest;
	use tempfile::TempDir;

	use super::*;

	#[test]
	fn test_find_config_in_parent_dir() {
		let temp = TempDir::new().unwrap();
		let config_path = temp.path().join(CONFIG_FILE_NAME);
		fs::write(&config_path, "{}").unwrap();

		let subdir = temp.path().join("nested").join("deeper");
		fs::create_dir_all(&subdir).unwrap();

		let found = find_config_file(&subdir).unwrap();
		// Compare file names only to avoid canonicalization issues on macOS
		assert_eq!(found.file_name(), config_path.file_name());
	}

	#[test]
	fn test_no_config_found() {
		let temp = TempDir::new().unwrap();
		assert!(HarnessConfig::load_from_directory(temp.path())
			.unwrap()
			.is_none());
	}

	#[test]
	fn test_defaults_for_empty_object() {
		let temp = TempDir::new().unwrap();
		let config_path = temp.path().join(CONFIG_FILE_NAME);
		fs::write(&config_path, "{}").unwrap();

		let config = HarnessConfig::load_from_file(&config_path).unwrap();
		assert_eq!(config, HarnessConfig::default());
		assert_eq!(config.timeouts.create_timeout, Duration::from_secs(60));
		assert_eq!(config.timeouts.delete_timeout, Duration::from_secs(10));
		assert_eq!(
			config.timeouts.manifest_fetch_timeout,
			Duration::from_secs(10)
		);
	}

	#[test]
	fn test_full_config() {
		let temp = TempDir::new().unwrap();
		let config_path = temp.path().join(CONFIG_FILE_NAME);
		fs::write(
			&config_path,
			indoc! {"
				timeouts:
				  createTimeout: 2m
				  deleteTimeout: 30
				namespaceLabels:
				  istio-injection: enabled
			"},
		)
		.unwrap();

		let config = HarnessConfig::load_from_file(&config_path).unwrap();
		assert_eq!(config.timeouts.create_timeout, Duration::from_secs(120));
		assert_eq!(config.timeouts.delete_timeout, Duration::from_secs(30));
		assert_eq!(
			config.timeouts.manifest_fetch_timeout,
			Duration::from_secs(10)
		);
		assert_eq!(
			config.namespace_labels.get("istio-injection").map(String::as_str),
			Some("enabled")
		);
	}

	#[test]
	fn test_overflowing_timeout_is_rejected() {
		let temp = TempDir::new().unwrap();
		let config_path = temp.path().join(CONFIG_FILE_NAME);
		fs::write(
			&config_path,
			"timeouts:\n  createTimeout: 18446744073709551615h\n",
		)
		.unwrap();

		assert_matches!(
			HarnessConfig::load_from_file(&config_path),
			Err(ConfigError::Parse { .. })
		);
	}

	#[test]
	fn test_invalid_config() {
		let temp = TempDir::new().unwrap();
		let config_path = temp.path().join(CONFIG_FILE_NAME);
		fs::write(&config_path, "timeouts:\n  createTimeout: soon\n").unwrap();

		assert_matches!(
			HarnessConfig::load_from_file(&config_path),
			Err(ConfigError::Parse { .. })
		);
	}

	#[rstest]
	#[case("500ms", Duration::from_millis(500))]
	#[case("10s", Duration::from_secs(10))]
	#[case("10", Duration::from_secs(10))]
	#[case("2m", Duration::from_secs(120))]
	#[case("1h", Duration::from_secs(3600))]
	#[case("1m 30s", Duration::from_secs(90))]
	fn test_parse_duration(#[case] text: &str, #[case] expected: Duration) {
		assert_eq!(parse_duration(text).unwrap(), expected);
	}

	#[rstest]
	#[case("")]
	#[case("ms")]
	#[case("5 fortnights")]
	#[case("1.5s")]
	#[case::overflow("18446744073709551615h")]
	fn test_parse_duration_rejects(#[case] text: &str) {
		assert!(parse_duration(text).is_err());
	}
}
