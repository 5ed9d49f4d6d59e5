use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::settings::RedqSettings;

pub const DEFAULT_CONFIG_FILENAME: &str = "redq.toml";
pub const ENV_CONFIG_KEY: &str = "REDQ_CONFIG";

/// Locate the config file: an explicit path wins, then `REDQ_CONFIG`,
/// then `redq.toml` in the working directory.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }
    if let Some(path) = non_empty_env(ENV_CONFIG_KEY) {
        return Some(PathBuf::from(path));
    }
    let default = Path::new(DEFAULT_CONFIG_FILENAME);
    default.is_file().then(|| default.to_path_buf())
}

/// Load settings from TOML, then let `REDQ_*` environment variables
/// override individual fields. The file may nest everything under a
/// `[redq]` table or use a bare top-level table.
pub fn load_toml_settings(config_path: Option<&str>) -> Result<RedqSettings> {
    dotenvy::dotenv().ok();

    let path = resolve_config_path(config_path).ok_or_else(|| {
        anyhow::anyhow!("redq config not found. Provide a path, set REDQ_CONFIG, or add redq.toml.")
    })?;
    let payload = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let mut table: toml::Value = toml::from_str(&payload)
        .with_context(|| format!("failed to parse TOML at {}", path.display()))?;
    if let toml::Value::Table(mut top) = table {
        table = match top.remove("redq") {
            Some(nested) => nested,
            None => toml::Value::Table(top),
        };
    }
    let mut settings: RedqSettings = table.try_into().context("invalid redq config")?;
    apply_env_overrides(&mut settings)?;
    Ok(settings)
}

fn apply_env_overrides(settings: &mut RedqSettings) -> Result<()> {
    if let Some(dsn) = non_empty_env("REDQ_REDIS_DSN") {
        settings.redis_dsn = dsn;
    }
    if let Some(prefix) = non_empty_env("REDQ_KEY_PREFIX") {
        settings.key_prefix = prefix;
    }
    if let Some(raw) = non_empty_env("REDQ_DEFAULT_MAX_ATTEMPTS") {
        settings.default_max_attempts = parse_env("REDQ_DEFAULT_MAX_ATTEMPTS", &raw)?;
    }
    if let Some(raw) = non_empty_env("REDQ_SHUTDOWN_GRACE_MS") {
        settings.shutdown_grace_ms = parse_env("REDQ_SHUTDOWN_GRACE_MS", &raw)?;
    }
    Ok(())
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|err| anyhow::anyhow!("invalid {name} value {raw:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use uuid::Uuid;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Run `body` with the given variables set, restoring the previous
    /// environment afterwards. All env mutation in this test binary goes
    /// through the one mutex.
    fn with_env<T>(pairs: &[(&str, &str)], body: impl FnOnce() -> T) -> T {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved: Vec<(&str, Option<String>)> = pairs
            .iter()
            .map(|(name, _)| (*name, std::env::var(name).ok()))
            .collect();
        for (name, value) in pairs {
            unsafe { std::env::set_var(name, value) };
        }
        let result = body();
        for (name, previous) in saved {
            match previous {
                Some(value) => unsafe { std::env::set_var(name, value) },
                None => unsafe { std::env::remove_var(name) },
            }
        }
        result
    }

    fn write_temp_config(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("redq-test-{}.toml", Uuid::new_v4()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn explicit_path_wins_over_env() {
        with_env(&[(ENV_CONFIG_KEY, "ignored.toml")], || {
            let path = resolve_config_path(Some("custom.toml"));
            assert_eq!(path, Some(PathBuf::from("custom.toml")));
        });
    }

    #[test]
    fn env_overrides_beat_toml_values() {
        let path = write_temp_config("[redq]\nkey_prefix = \"from_toml\"\ndefault_max_attempts = 4\n");
        let settings = with_env(
            &[
                ("REDQ_KEY_PREFIX", "from_env"),
                ("REDQ_SHUTDOWN_GRACE_MS", "1250"),
            ],
            || load_toml_settings(Some(path.to_str().unwrap())).unwrap(),
        );
        assert_eq!(settings.key_prefix, "from_env");
        assert_eq!(settings.default_max_attempts, 4);
        assert_eq!(settings.shutdown_grace_ms, 1250);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn bare_table_is_accepted() {
        let path = write_temp_config("default_max_attempts = 2\n");
        let settings = with_env(&[], || {
            load_toml_settings(Some(path.to_str().unwrap())).unwrap()
        });
        assert_eq!(settings.default_max_attempts, 2);
        assert_eq!(settings.key_prefix, "q");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn bad_numeric_override_is_an_error() {
        let path = write_temp_config("");
        let err = with_env(&[("REDQ_DEFAULT_MAX_ATTEMPTS", "lots")], || {
            load_toml_settings(Some(path.to_str().unwrap())).unwrap_err()
        });
        assert!(err.to_string().contains("REDQ_DEFAULT_MAX_ATTEMPTS"));
        let _ = fs::remove_file(&path);
    }
}
