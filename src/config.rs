//! Configuration options.

use std::path::PathBuf;
use std::{env, fs};

use serde::Deserialize;
use tracing::warn;

#[derive(Deserialize, Default, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub permission: Permission,
    pub tracking: Tracking,
    pub alerts: Alerts,
    pub prompts: Prompts,
    pub settings: Settings,
}

impl Config {
    /// Load the configuration file.
    ///
    /// Missing or invalid files fall back to the defaults.
    pub fn load() -> Self {
        let path = match config_path() {
            Some(path) => path,
            None => return Self::default(),
        };

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => return Self::default(),
        };

        match toml::from_str(&text) {
            Ok(config) => config,
            Err(err) => {
                warn!("Config error in {path:?}: {err}");
                Self::default()
            },
        }
    }
}

/// Location permission configuration.
#[derive(Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Permission {
    /// Application id used in the portal permission store.
    pub app_id: String,

    /// Run silent checks only, without interactive prompts.
    pub service: bool,
}

impl Default for Permission {
    fn default() -> Self {
        Self { app_id: "lodestone".into(), service: false }
    }
}

/// Tracking worker configuration.
#[derive(Deserialize, Default, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Tracking {
    /// Worker command started for a tracking session.
    pub command: Vec<String>,
}

/// Alert notification configuration.
#[derive(Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Alerts {
    /// Command retracting active alert notifications.
    pub cancel_command: Vec<String>,
}

impl Default for Alerts {
    fn default() -> Self {
        let cancel_command = ["makoctl", "dismiss", "--all"].map(String::from).to_vec();
        Self { cancel_command }
    }
}

/// Prompt dialog configuration.
///
/// Dialog commands signal an affirmative answer through a zero exit code.
#[derive(Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Prompts {
    /// Dialog asking to enable the location sensor.
    pub gps_command: Vec<String>,

    /// Dialog asking to grant the location permission.
    pub permission_command: Vec<String>,
}

impl Default for Prompts {
    fn default() -> Self {
        let gps_command = [
            "zenity",
            "--question",
            "--title",
            "Location disabled",
            "--text",
            "Location is required for tracking. Enable it now?",
        ]
        .map(String::from)
        .to_vec();

        let permission_command = [
            "zenity",
            "--question",
            "--title",
            "Permission required",
            "--text",
            "The location permission is required for tracking. Grant it now?",
        ]
        .map(String::from)
        .to_vec();

        Self { gps_command, permission_command }
    }
}

/// Settings navigation configuration.
#[derive(Deserialize, Default, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Command opening the location sensor settings.
    pub location_command: Vec<String>,

    /// Command opening the application permission settings.
    pub permission_command: Vec<String>,
}

/// Default configuration file location.
fn config_path() -> Option<PathBuf> {
    let base = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;

    Some(base.join("lodestone").join("lodestone.toml"))
}
