use directories::ProjectDirs;
use driftmic_core::constants::PIPELINE_SAMPLE_RATE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Application configuration for persisting capture-session preferences.
#[derive(Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_reference_rate_hz")]
    pub reference_rate_hz: u32,
    #[serde(default = "default_pipeline_rate_hz")]
    pub pipeline_rate_hz: u32,
    #[serde(default)]
    pub reference_trim_ppm: i32,
    #[serde(default)]
    pub usb_offset_ppm: i32,
    #[serde(default = "default_agc_target")]
    pub agc_target_level: f32,
    #[serde(default)]
    pub frames: u64,
    #[serde(default = "default_playback_packet_frames")]
    pub playback_packet_frames: usize,
    #[serde(default = "default_send_buffer_frames")]
    pub send_buffer_frames: usize,
}

fn default_reference_rate_hz() -> u32 {
    96_000
}

fn default_pipeline_rate_hz() -> u32 {
    PIPELINE_SAMPLE_RATE
}

fn default_agc_target() -> f32 {
    0.7 // Approx -3dB
}

fn default_playback_packet_frames() -> usize {
    48 // One high-speed service interval at 48 kHz
}

fn default_send_buffer_frames() -> usize {
    1920 // 40 ms at 48 kHz; the bridge primes to half of this
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            reference_rate_hz: default_reference_rate_hz(),
            pipeline_rate_hz: default_pipeline_rate_hz(),
            reference_trim_ppm: 0,
            usb_offset_ppm: 0,
            agc_target_level: default_agc_target(),
            frames: 0,
            playback_packet_frames: default_playback_packet_frames(),
            send_buffer_frames: default_send_buffer_frames(),
        }
    }
}

impl AppConfig {
    /// Loads the per-user configuration. On first run (no file yet) the
    /// defaults are written out so there is something to edit; an existing
    /// file that fails to parse is left untouched.
    pub fn load() -> Self {
        if let Some(path) = config_path() {
            match fs::read_to_string(&path) {
                Ok(content) => {
                    if let Ok(cfg) = serde_json::from_str(&content) {
                        return cfg;
                    }
                    log::warn!("config at {} did not parse, using defaults", path.display());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    let cfg = Self::default();
                    cfg.save();
                    log::info!("created default config at {}", path.display());
                    return cfg;
                }
                Err(_) => {}
            }
        }
        Self::default()
    }

    /// Loads configuration from an explicit path, falling back to default
    /// on any read or parse failure.
    pub fn load_from(path: &Path) -> Self {
        if let Ok(content) = fs::read_to_string(path) {
            if let Ok(cfg) = serde_json::from_str(&content) {
                return cfg;
            }
            log::warn!("config at {} did not parse, using defaults", path.display());
        }
        Self::default()
    }

    /// Saves configuration to the per-user path in JSON format.
    pub fn save(&self) {
        if let Some(path) = config_path() {
            self.save_to(&path);
        }
    }

    /// Best-effort write to an explicit path, creating the parent directory
    /// as needed.
    pub fn save_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(self) {
            let _ = fs::write(path, json);
        }
    }
}

fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "driftmic", "driftmic")
        .map(|dirs| dirs.config_dir().join("config.json"))
}
