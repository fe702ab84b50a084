//! Configuration file parsing for gccheck.toml.

use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_NAMES: &[&str] = &["gccheck.toml", ".gccheck.toml"];

/// Settings read from `gccheck.toml`. Command-line flags win.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Default option string, with or without the `-Xcheck:gc` prefix
    pub options: Option<String>,

    /// Stop reporting after this many errors
    pub max_errors: Option<u64>,

    /// Canonicalize dead objects before checking
    pub fix_dead_objects: bool,
}

/// Load `path`, or the nearest config file above the current directory.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config_path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => std::env::current_dir().ok().and_then(|cwd| find_config_file(&cwd)),
    };

    match config_path {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
            tracing::debug!(path = %path.display(), "loaded config");
            Ok(config)
        }
        Some(path) => Err(anyhow::anyhow!("config file {} not found", path.display())),
        None => Ok(Config::default()),
    }
}

/// Search `start` and its parents.
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        for name in CONFIG_NAMES {
            let path = current.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        dir = current.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gccheck.toml");
        std::fs::write(&path, "options = \"heap:all:verbose\"\nmax_errors = 5\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.options.as_deref(), Some("heap:all:verbose"));
        assert_eq!(config.max_errors, Some(5));
        assert!(!config.fix_dead_objects);
    }

    #[test]
    fn test_find_in_parent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gccheck.toml"), "fix_dead_objects = true\n").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file(&nested), Some(dir.path().join("gccheck.toml")));
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gccheck.toml");
        std::fs::write(&path, "max_errors = \"many\"\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
