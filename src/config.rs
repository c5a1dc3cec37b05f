use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheSettings;
use crate::geo::GeoBoundingBoxBuilder;
use crate::search::SearchOptions;

/// Environment variable that overrides `api_key` from the file
pub const API_KEY_ENV: &str = "GEOALBUM_API_KEY";

const PLACEHOLDER_API_KEY: &str = "YOUR_FLICKR_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_key: String,
    pub endpoint: String,
    /// Directory holding the store index and image files
    pub data_dir: String,
    pub per_page: u32,
    pub min_upload_date: String,
    pub safe_search: bool,
    pub bbox_half_width: f64,
    pub bbox_half_height: f64,
    pub request_timeout_secs: u64,
    pub max_concurrent_fetches: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: PLACEHOLDER_API_KEY.to_string(),
            endpoint: "https://api.flickr.com/services/rest".to_string(),
            data_dir: "data".to_string(),
            per_page: 10,
            min_upload_date: "2014/01/01".to_string(),
            safe_search: true,
            bbox_half_width: 1.0,
            bbox_half_height: 1.0,
            request_timeout_secs: 30,
            max_concurrent_fetches: 2,
        }
    }
}

impl Config {
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Loads the file, then lets `GEOALBUM_API_KEY` replace the api key
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&yaml)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config.with_api_key_override(std::env::var(API_KEY_ENV).ok()))
    }

    pub fn get_config_path(config_arg: &Option<PathBuf>) -> PathBuf {
        config_arg
            .clone()
            .unwrap_or_else(|| PathBuf::from("config.yaml"))
    }

    fn with_api_key_override(mut self, key: Option<String>) -> Self {
        if let Some(key) = key.filter(|k| !k.trim().is_empty()) {
            self.api_key = key;
        }
        self
    }

    pub fn has_placeholder_key(&self) -> bool {
        self.api_key == PLACEHOLDER_API_KEY
    }

    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            safe_search: self.safe_search,
            per_page: self.per_page.max(1),
            min_upload_date: self.min_upload_date.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn bbox_builder(&self) -> GeoBoundingBoxBuilder {
        GeoBoundingBoxBuilder::new(self.bbox_half_width, self.bbox_half_height)
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            bbox: self.bbox_builder(),
            max_concurrent_fetches: self.max_concurrent_fetches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.endpoint, "https://api.flickr.com/services/rest");
        assert_eq!(config.data_dir, "data");
        assert_eq!(config.per_page, 10);
        assert_eq!(config.min_upload_date, "2014/01/01");
        assert!(config.safe_search);
        assert_eq!(config.max_concurrent_fetches, 2);
        assert!(config.has_placeholder_key());
    }

    #[test]
    fn test_save_and_load_config() -> Result<()> {
        let temp_dir = tempdir()?;
        let config_path = temp_dir.path().join("nested").join("config.yaml");

        let config = Config {
            api_key: "abc123".to_string(),
            per_page: 25,
            ..Config::default()
        };
        config.save_to_file(&config_path)?;

        let loaded = Config::load_from_file(&config_path)?;
        assert_eq!(loaded.per_page, 25);
        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.bbox_half_width, config.bbox_half_width);

        Ok(())
    }

    #[test]
    fn test_missing_keys_take_defaults() -> Result<()> {
        let temp_dir = tempdir()?;
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "per_page: 5\ndata_dir: photos\n")?;

        let loaded = Config::load_from_file(&config_path)?;
        assert_eq!(loaded.per_page, 5);
        assert_eq!(loaded.data_dir, "photos");
        assert_eq!(loaded.request_timeout_secs, 30);
        assert_eq!(loaded.bbox_half_height, 1.0);

        Ok(())
    }

    #[test]
    fn test_env_key_wins_unless_blank() {
        let config = Config::default().with_api_key_override(Some("from-env".to_string()));
        assert_eq!(config.api_key, "from-env");

        let config = Config::default().with_api_key_override(Some("  ".to_string()));
        assert!(config.has_placeholder_key());

        let config = Config::default().with_api_key_override(None);
        assert!(config.has_placeholder_key());
    }

    #[test]
    fn test_derived_settings() {
        let config = Config {
            bbox_half_width: 0.5,
            bbox_half_height: 0.25,
            request_timeout_secs: 7,
            per_page: 0,
            ..Config::default()
        };

        let options = config.search_options();
        assert_eq!(options.timeout, Duration::from_secs(7));
        assert_eq!(options.per_page, 1);

        let bbox = config.bbox_builder().build(10.0, 20.0);
        assert_eq!(bbox.to_query_value(), "19.5,9.75,20.5,10.25");
    }

    #[test]
    fn test_get_config_path() {
        assert_eq!(Config::get_config_path(&None), PathBuf::from("config.yaml"));
        let custom = Some(PathBuf::from("/tmp/custom.yaml"));
        assert_eq!(
            Config::get_config_path(&custom),
            PathBuf::from("/tmp/custom.yaml")
        );
    }
}
