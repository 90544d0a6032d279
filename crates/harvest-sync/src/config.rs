use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use harvest_core::HarvestKind;
use harvest_storage::{CheckpointConfig, HttpClientConfig, RetryPolicy, DEFAULT_BACKUP_RETENTION};

/// Run settings. Environment variables provide defaults; the CLI overrides
/// individual fields.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub store: PathBuf,
    pub mapping: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub backup_retention: usize,
    pub save_every: usize,
    pub sin_save_every: usize,
    pub rate_limit: Duration,
    pub recycle_every: usize,
    pub max_attempts: usize,
    pub max_scrolls: usize,
    pub sin_target: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub match_rules: Option<PathBuf>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            store: PathBuf::from("./catalog.csv"),
            mapping: PathBuf::from("./manufacturer_mapping.csv"),
            backup_dir: None,
            backup_retention: DEFAULT_BACKUP_RETENTION,
            save_every: 100,
            sin_save_every: 50,
            rate_limit: Duration::from_millis(2000),
            recycle_every: 100,
            max_attempts: 3,
            max_scrolls: 5,
            sin_target: 2,
            user_agent: "catalog-harvester/0.1".to_string(),
            http_timeout_secs: 30,
            match_rules: None,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store: std::env::var("HARVEST_STORE")
                .map(PathBuf::from)
                .unwrap_or(defaults.store),
            mapping: std::env::var("HARVEST_MAPPING")
                .map(PathBuf::from)
                .unwrap_or(defaults.mapping),
            backup_dir: std::env::var("HARVEST_BACKUP_DIR").ok().map(PathBuf::from),
            backup_retention: env_or("HARVEST_BACKUP_RETENTION", defaults.backup_retention),
            save_every: env_or("HARVEST_SAVE_EVERY", defaults.save_every),
            sin_save_every: env_or("HARVEST_SIN_SAVE_EVERY", defaults.sin_save_every),
            rate_limit: Duration::from_millis(env_or("HARVEST_RATE_LIMIT_MS", 2000u64)),
            recycle_every: env_or("HARVEST_RECYCLE_EVERY", defaults.recycle_every),
            max_attempts: env_or("HARVEST_MAX_ATTEMPTS", defaults.max_attempts),
            max_scrolls: env_or("HARVEST_MAX_SCROLLS", defaults.max_scrolls),
            sin_target: defaults.sin_target,
            user_agent: std::env::var("HARVEST_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("HARVEST_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            match_rules: std::env::var("HARVEST_MATCH_RULES").ok().map(PathBuf::from),
        }
    }

    pub fn save_every_for(&self, kind: HarvestKind) -> usize {
        match kind {
            HarvestKind::Pricing => self.save_every,
            HarvestKind::Sin => self.sin_save_every,
        }
        .max(1)
    }

    pub fn checkpoint_config(&self) -> CheckpointConfig {
        let mut config = CheckpointConfig::beside(&self.store);
        if let Some(dir) = &self.backup_dir {
            config.backup_dir = dir.clone();
        }
        config.retention = self.backup_retention.max(1);
        config
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy::default(),
        }
    }

    /// `<store>.last_run.json` beside the store.
    pub fn summary_path(&self) -> PathBuf {
        let mut name = self
            .store
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "store".into());
        name.push(".last_run.json");
        self.store.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_sit_beside_the_store() {
        let config = HarvestConfig {
            store: PathBuf::from("/data/catalog.csv"),
            ..HarvestConfig::default()
        };
        assert_eq!(config.summary_path(), PathBuf::from("/data/catalog.csv.last_run.json"));
        assert_eq!(config.checkpoint_config().backup_dir, PathBuf::from("/data/backups"));
        assert_eq!(config.save_every_for(HarvestKind::Sin), 50);
    }
}
