use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration for a render front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Write finished images to disk.
    pub output_to_file: bool,
    /// Park after every animation frame until resumed.
    pub pause_when_done: bool,
    /// Delay between `process` calls in the driving loop.
    pub poll_interval_ms: u64,
    pub image_output_to_stdout: bool,
    pub shellouts: ShelloutConfig,
    pub io: IoRestrictions,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            output_to_file: true,
            pause_when_done: false,
            poll_interval_ms: 10,
            image_output_to_stdout: true,
            shellouts: ShelloutConfig::default(),
            io: IoRestrictions::default(),
        }
    }
}

impl FrontendConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// Settings for the external commands run around scenes and frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShelloutConfig {
    pub permitted: bool,
    /// Seconds to wait for a shellout to exit on its own when stopping.
    pub graceful_kill_secs: u64,
    /// Seconds to wait after forcibly killing a shellout.
    pub forced_kill_secs: u64,
    /// `%1%`..`%9%` template used when a shellout cancels the render.
    pub cancel_message: String,
    /// `%1%`..`%6%` template used when a shellout skips frames.
    pub skip_message: String,
}

impl Default for ShelloutConfig {
    fn default() -> Self {
        Self {
            permitted: false,
            graceful_kill_secs: 2,
            forced_kill_secs: 1,
            cancel_message: "Render halted because the %1% shell-out ('%6%') requested to %5%."
                .to_owned(),
            skip_message: "The %1% shell-out ('%3%') requested to %2%.".to_owned(),
        }
    }
}

/// How far file access may reach outside the working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Restriction {
    #[default]
    Unrestricted,
    WorkingDirOnly,
    AllowedDirs,
}

/// File access restrictions applied to state files, output images and
/// stream files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IoRestrictions {
    pub read: Restriction,
    pub write: Restriction,
    pub allowed_dirs: Vec<PathBuf>,
    /// Base for relative paths; the process working directory when unset.
    pub working_dir: Option<PathBuf>,
}
