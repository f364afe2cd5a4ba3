//! Well-known locations for per-user state.
//!
//! Everything lives under `~/.clawgate`: the config file, the per-session
//! JSONL logs, the cron job store, OAuth credentials, and the user-editable
//! workspace.

use std::fs;
use std::path::PathBuf;

use crate::error::GatewayError;

/// Directory names under the config dir that tools must never touch.
pub const SENSITIVE_DIR_NAMES: &[&str] = &["auth", "whatsapp-auth"];

/// The per-user config directory (`~/.clawgate`).
pub fn config_dir() -> Result<PathBuf, GatewayError> {
    let home = dirs::home_dir()
        .ok_or_else(|| GatewayError::Config("cannot determine home directory".into()))?;
    Ok(home.join(".clawgate"))
}

/// Path of `config.json`.
pub fn config_path() -> Result<PathBuf, GatewayError> {
    Ok(config_dir()?.join("config.json"))
}

/// Directory holding per-session JSONL logs.
pub fn sessions_dir() -> PathBuf {
    config_dir()
        .map(|d| d.join("sessions"))
        .unwrap_or_else(|_| PathBuf::from(".clawgate/sessions"))
}

/// Path of the cron job store.
pub fn cron_store_path() -> PathBuf {
    config_dir()
        .map(|d| d.join("cron.json"))
        .unwrap_or_else(|_| PathBuf::from(".clawgate/cron.json"))
}

/// Default workspace directory.
pub fn workspace_dir() -> PathBuf {
    config_dir()
        .map(|d| d.join("workspace"))
        .unwrap_or_else(|_| PathBuf::from(".clawgate/workspace"))
}

/// Create the state directories with owner-only permissions.
pub fn ensure_state_dirs() -> Result<(), GatewayError> {
    let cfg_dir = config_dir()?;
    fs::create_dir_all(&cfg_dir)?;
    fs::create_dir_all(sessions_dir())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for dir in [cfg_dir, sessions_dir()] {
            let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700));
        }
    }
    Ok(())
}
