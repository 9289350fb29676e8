use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_mpv_path")]
    pub mpv_path: String,
    #[serde(default = "default_mpv_options")]
    pub mpv_options: Vec<String>,
    #[serde(default = "default_ipc_socket")]
    pub ipc_socket: String,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub source_folder: PathBuf,
    pub watched_folder: PathBuf,
    /// Reserved: parsed and shown by `status`, not yet acted on.
    #[serde(default = "default_true")]
    pub autoplay_next: bool,
    #[serde(default)]
    pub audio_track: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub keepalive: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub base_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            keepalive: 60,
            username: None,
            password: None,
            client_id: "nextup-series".to_string(),
            base_topic: "nextup/series".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn profile(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .get(name)
            .with_context(|| format!("profile '{name}' is not defined in the config"))
    }
}

fn default_mpv_path() -> String {
    "mpv".to_string()
}

fn default_mpv_options() -> Vec<String> {
    vec!["--fullscreen".to_string()]
}

fn default_true() -> bool {
    true
}

#[cfg(unix)]
fn default_ipc_socket() -> String {
    "/tmp/mpvsocket".to_string()
}

#[cfg(windows)]
fn default_ipc_socket() -> String {
    r"\\.\pipe\mpvpipe".to_string()
}
