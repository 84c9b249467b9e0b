use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings, resolved once from `WARDEN_*` environment variables.
///
/// Everything has a default so `Settings::from_env()` never fails; tests
/// construct settings directly with a temp directory root.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory holding the coordination database and the archive repo.
    pub storage_root: PathBuf,
    /// Author identity used for archive commits.
    pub git_author_name: String,
    pub git_author_email: String,
    /// Encoded attachments at or below this size are returned inline.
    pub inline_image_max_bytes: usize,
    /// Keep the original attachment bytes alongside the canonical encoding.
    pub keep_original_images: bool,
    /// Upper bound on waiting for the archive lock.
    pub lock_timeout: Duration,
    /// Pause between stale-lease sweep cycles.
    pub sweep_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./storage"),
            git_author_name: "warden".into(),
            git_author_email: "warden@localhost".into(),
            inline_image_max_bytes: 64 * 1024,
            keep_original_images: false,
            lock_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            storage_root: env_var("WARDEN_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            git_author_name: env_var("WARDEN_GIT_AUTHOR_NAME").unwrap_or(defaults.git_author_name),
            git_author_email: env_var("WARDEN_GIT_AUTHOR_EMAIL")
                .unwrap_or(defaults.git_author_email),
            inline_image_max_bytes: env_parse("WARDEN_INLINE_IMAGE_MAX_BYTES")
                .unwrap_or(defaults.inline_image_max_bytes),
            keep_original_images: env_var("WARDEN_KEEP_ORIGINAL_IMAGES")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.keep_original_images),
            lock_timeout: env_parse("WARDEN_LOCK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_timeout),
            sweep_interval: env_parse("WARDEN_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
        }
    }

    /// Settings rooted at an explicit directory (tests, CLI `--root`).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: root.into(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage_root.join("warden.sqlite3")
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.trim().parse().ok())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "t" | "yes" | "y"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.inline_image_max_bytes, 64 * 1024);
        assert!(!s.keep_original_images);
        assert_eq!(s.lock_timeout, Duration::from_secs(60));
    }

    #[test]
    fn with_root_overrides_storage_root() {
        let s = Settings::with_root("/tmp/warden-test");
        assert_eq!(s.storage_root, PathBuf::from("/tmp/warden-test"));
        assert_eq!(s.database_path(), PathBuf::from("/tmp/warden-test/warden.sqlite3"));
    }

    #[test]
    fn parse_bool_variants() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" yes "));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("nope"));
    }
}
