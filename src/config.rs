//! # Configuration
//!
//! Loads the engine's key=value configuration file (`#` comments, `$VAR` /
//! `${VAR}` expansion, `~` home expansion) and validates it into a typed
//! [`Config`]. Per-cloud credential files named `<cloud>.conf` use the same
//! format and are loaded on demand.
//!
//! Recognized keys:
//!
//! | Key            | Meaning                                        |
//! |----------------|------------------------------------------------|
//! | `SRC_DIR`      | watched directory (required)                   |
//! | `SYS_DIR`      | state directory (required)                     |
//! | `CLOUDS`       | colon-separated backend ids (default `local`)  |
//! | `INTERVAL`     | sync period in seconds, `0` = no repeat        |
//! | `EXCLUDE_FILE` | glob patterns, one per line                    |
//! | `COMPRESS`     | zstd-compress payloads (default `yes`)         |
//! | `ZSTD_LEVEL`   | compression level 1–22 (default 3)             |
//! | `ENCRYPT`      | AES-256-GCM encrypt payloads (default `no`)    |
//! | `PASSWORD`     | encryption password (required with `ENCRYPT`)  |

use crate::error::{ConfigError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG: &str = ".config";

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory mirrored to the backends.
    pub src_dir: PathBuf,

    /// Engine state directory (cache, local snapshots, pointer db, temp).
    pub sys_dir: PathBuf,

    /// Backend ids, in configuration order.
    pub clouds: Vec<String>,

    /// Seconds between sync passes; 0 disables the repeat timer.
    pub interval: u64,

    /// Optional file of exclude globs, one pattern per line.
    pub exclude_file: Option<String>,

    pub compress: bool,
    pub zstd_level: i32,
    pub encrypt: bool,
    pub password: Option<String>,

    /// Every key from the file, for backend-specific lookups.
    raw: BTreeMap<String, String>,
}

impl Config {
    /// Loads and validates configuration from a key=value file.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = parse_kv_file(path)?;

        let src_dir = PathBuf::from(expand(raw.get("SRC_DIR").map_or("", String::as_str)));
        let sys_dir = PathBuf::from(expand(raw.get("SYS_DIR").map_or("", String::as_str)));
        let clouds = raw
            .get("CLOUDS")
            .map_or("local", String::as_str)
            .split(':')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        let interval = raw
            .get("INTERVAL")
            .map_or(Ok(300), |v| v.parse())
            .map_err(|_| ConfigError::Validation {
                message: "INTERVAL must be a non-negative integer".to_string(),
            })?;

        let config = Config {
            src_dir,
            sys_dir,
            clouds,
            interval,
            exclude_file: raw.get("EXCLUDE_FILE").cloned(),
            compress: raw.get("COMPRESS").map_or(true, |v| truthy(v)),
            zstd_level: raw
                .get("ZSTD_LEVEL")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            encrypt: raw.get("ENCRYPT").map_or(false, |v| truthy(v)),
            password: raw.get("PASSWORD").cloned(),
            raw,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.src_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                message: "SRC_DIR must be set".to_string(),
            });
        }
        if self.sys_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                message: "SYS_DIR must be set".to_string(),
            });
        }
        if self.clouds.is_empty() {
            return Err(ConfigError::Validation {
                message: "CLOUDS must name at least one backend".to_string(),
            });
        }
        if !(1..=22).contains(&self.zstd_level) {
            return Err(ConfigError::Validation {
                message: format!("ZSTD_LEVEL must be between 1 and 22, got {}", self.zstd_level),
            });
        }
        if self.encrypt && self.password.as_ref().map_or(true, |p| p.is_empty()) {
            return Err(ConfigError::Validation {
                message: "ENCRYPT=yes requires PASSWORD".to_string(),
            });
        }
        Ok(())
    }

    /// Raw value lookup, for backend-specific keys.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(String::as_str)
    }

    // Derived state paths.

    pub fn ss_dir(&self) -> PathBuf {
        self.sys_dir.join("snapshots")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.sys_dir.join("cache")
    }

    pub fn db_path(&self) -> PathBuf {
        self.sys_dir.join("local.db")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.sys_dir.join("tmp")
    }

    /// Creates the state directory tree if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.sys_dir.clone(),
            self.ss_dir(),
            self.cache_dir(),
            self.tmp_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Loads `<cloud>.conf`, inheriting `SYS_DIR` from the global file.
    pub fn cloud_conf(&self, cloud: &str) -> Result<BTreeMap<String, String>> {
        let path = PathBuf::from(format!("{cloud}.conf"));
        let mut conf = parse_kv_file(&path)
            .map_err(|_| ConfigError::CloudNotFound(cloud.to_string()))?;
        conf.insert(
            "SYS_DIR".to_string(),
            self.sys_dir.to_string_lossy().into_owned(),
        );
        Ok(conf)
    }

    /// Compiles the exclude patterns into a matcher. The exclude file itself
    /// is always excluded so editing it never produces a snapshot.
    pub fn exclude_patterns(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        if let Some(file) = &self.exclude_file {
            builder.add(Glob::new(file).map_err(ConfigError::from)?);
            match std::fs::read_to_string(file) {
                Ok(content) => {
                    for line in content.lines() {
                        let line = line.trim();
                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }
                        builder.add(Glob::new(line).map_err(ConfigError::from)?);
                    }
                }
                // A missing exclude file just means no extra patterns.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(builder.build().map_err(ConfigError::from)?)
    }
}

/// Parses a `KEY=VALUE` file, skipping blank lines and `#` comments.
fn parse_kv_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(path.to_path_buf()).into()
        } else {
            crate::error::CumulusError::Io(e)
        }
    })?;

    let mut map = BTreeMap::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or(ConfigError::Parse {
            path: path.to_path_buf(),
            line: lineno + 1,
        })?;
        map.insert(key.trim().to_string(), expand(value));
    }
    Ok(map)
}

/// Expands `$VAR`, `${VAR}`, and a leading `~` from the environment.
/// Unset variables expand to the empty string.
fn expand(value: &str) -> String {
    let homed;
    let mut rest = match value.strip_prefix('~') {
        Some(tail) if tail.is_empty() || tail.starts_with('/') => {
            homed = format!("{}{tail}", env::var("HOME").unwrap_or_default());
            homed.as_str()
        }
        _ => value,
    };

    let mut out = String::with_capacity(rest.len());
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(body) = after.strip_prefix('{') {
            if let Some(end) = body.find('}') {
                out.push_str(&env::var(&body[..end]).unwrap_or_default());
                rest = &body[end + 1..];
                continue;
            }
        }
        let end = after
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(after.len());
        if end == 0 {
            // Lone `$`, keep it literal.
            out.push('$');
            rest = after;
            continue;
        }
        out.push_str(&env::var(&after[..end]).unwrap_or_default());
        rest = &after[end..];
    }
    out.push_str(rest);
    out
}

fn truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "yes" | "true" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(".config");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_minimal_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            "# comment\nSRC_DIR=/data/src\nSYS_DIR=/data/sys\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.src_dir, PathBuf::from("/data/src"));
        assert_eq!(config.clouds, vec!["local".to_string()]);
        assert_eq!(config.interval, 300);
        assert!(config.compress);
        assert!(!config.encrypt);
    }

    #[test]
    fn splits_clouds_on_colon() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            "SRC_DIR=/s\nSYS_DIR=/y\nCLOUDS=local:oss:azure\nINTERVAL=0\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.clouds, vec!["local", "oss", "azure"]);
        assert_eq!(config.interval, 0);
    }

    #[test]
    fn expands_environment_variables() {
        env::set_var("CUMULUS_TEST_BASE", "/expanded");
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            "SRC_DIR=$CUMULUS_TEST_BASE/src\nSYS_DIR=${CUMULUS_TEST_BASE}/sys\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.src_dir, PathBuf::from("/expanded/src"));
        assert_eq!(config.sys_dir, PathBuf::from("/expanded/sys"));
    }

    #[test]
    fn missing_file_is_config_not_found() {
        let err = Config::load(Path::new("/nonexistent/.config")).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_GLB_CONF_NOT_FOUND);
    }

    #[test]
    fn malformed_line_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "SRC_DIR=/s\nSYS_DIR=/y\nnot a kv line\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn encrypt_requires_password() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "SRC_DIR=/s\nSYS_DIR=/y\nENCRYPT=yes\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn exclude_patterns_compile_and_match() {
        let tmp = tempfile::tempdir().unwrap();
        let excludes = tmp.path().join("excludes");
        std::fs::write(&excludes, "*.tmp\n# comment\n\n*.swp\n").unwrap();
        let path = write_config(
            tmp.path(),
            &format!(
                "SRC_DIR=/s\nSYS_DIR=/y\nEXCLUDE_FILE={}\n",
                excludes.display()
            ),
        );
        let config = Config::load(&path).unwrap();
        let set = config.exclude_patterns().unwrap();
        assert!(set.is_match("scratch.tmp"));
        assert!(set.is_match("editor.swp"));
        assert!(!set.is_match("kept.txt"));
    }
}
