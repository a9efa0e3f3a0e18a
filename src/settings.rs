use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::camera::CameraId;
use crate::error::{RecorderError, RecorderResult};

const TEMP_DIR_ENV: &str = "CHUNKCAM_TEMP_DIR";
const CHUNK_SECS_ENV: &str = "CHUNKCAM_CHUNK_SECS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderSettings {
    /// Root under which one directory per camera is created.
    pub temp_root: PathBuf,
    pub chunk_duration_secs: f64,
    /// Upper bound on how long stop/cancel wait for the capture loop to exit.
    pub join_timeout_secs: f64,
    /// Extra capture ticks the drain phase may spend after a clean stop.
    pub drain_max_ticks: u32,
    pub jpeg_quality: u8,
    pub max_loop_restarts: u32,
    pub min_tick_interval_ms: u64,
    /// Cameras that deliver a depth buffer alongside color.
    pub depth_camera_ids: BTreeSet<CameraId>,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir().join("chunkcam"),
            chunk_duration_secs: 5.0,
            join_timeout_secs: 10.0,
            drain_max_ticks: 30,
            jpeg_quality: 90,
            max_loop_restarts: 3,
            min_tick_interval_ms: 5,
            depth_camera_ids: BTreeSet::new(),
        }
    }
}

impl RecorderSettings {
    /// Load settings from a JSON file, falling back to defaults when the file
    /// is absent or unparsable, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings from {}", path.display()))?;
                serde_json::from_str(&contents).unwrap_or_else(|err| {
                    warn!("Ignoring malformed settings file {}: {err}", path.display());
                    RecorderSettings::default()
                })
            }
            _ => RecorderSettings::default(),
        };

        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(TEMP_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.temp_root = PathBuf::from(dir);
            }
        }

        if let Ok(value) = std::env::var(CHUNK_SECS_ENV) {
            match value.parse::<f64>() {
                Ok(secs) => self.chunk_duration_secs = secs,
                Err(_) => warn!("{CHUNK_SECS_ENV}={value} is not a number, keeping {}", self.chunk_duration_secs),
            }
        }
    }

    pub fn validate(&self) -> RecorderResult<()> {
        if !(self.chunk_duration_secs.is_finite() && self.chunk_duration_secs > 0.0) {
            return Err(RecorderError::InvalidSettings(format!(
                "chunkDurationSecs must be positive, got {}",
                self.chunk_duration_secs
            )));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(RecorderError::InvalidSettings(format!(
                "jpegQuality must be within 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if !(self.join_timeout_secs.is_finite() && self.join_timeout_secs >= 0.0) {
            return Err(RecorderError::InvalidSettings(format!(
                "joinTimeoutSecs must be non-negative, got {}",
                self.join_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_duration_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.join_timeout_secs)
    }

    pub fn min_tick_interval(&self) -> Duration {
        Duration::from_millis(self.min_tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let settings = RecorderSettings::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(settings.drain_max_ticks, 30);
        assert_eq!(settings.jpeg_quality, 90);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"chunkDurationSecs": 2.5, "depthCameraIds": [1, 3]}"#).unwrap();

        let settings = RecorderSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.chunk_duration(), Duration::from_millis(2500));
        assert!(settings.depth_camera_ids.contains(&3));
        assert_eq!(settings.max_loop_restarts, 3);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();

        let settings = RecorderSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.join_timeout_secs, 10.0);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut settings = RecorderSettings::default();
        settings.chunk_duration_secs = 0.0;
        assert!(matches!(
            settings.validate(),
            Err(RecorderError::InvalidSettings(_))
        ));

        let mut settings = RecorderSettings::default();
        settings.jpeg_quality = 0;
        assert!(settings.validate().is_err());
    }
}
