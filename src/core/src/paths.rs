use std::path::PathBuf;

use directories::BaseDirs;

fn env_home_dir() -> Option<PathBuf> {
    for key in ["HOME", "USERPROFILE"] {
        if let Some(home) = std::env::var_os(key) {
            if !home.is_empty() {
                return Some(PathBuf::from(home));
            }
        }
    }
    None
}

pub fn user_home_dir() -> Option<PathBuf> {
    if let Some(base) = BaseDirs::new() {
        return Some(base.home_dir().to_path_buf());
    }
    env_home_dir()
}

/// `$DESKCHAT_HOME`, or `~/.deskchat`. Created on first use.
pub fn deskchat_home_dir() -> Result<PathBuf, String> {
    if let Some(override_dir) = std::env::var_os("DESKCHAT_HOME") {
        let path = PathBuf::from(override_dir);
        if path.is_relative() {
            return Err("DESKCHAT_HOME must be an absolute path".to_string());
        }
        std::fs::create_dir_all(&path)
            .map_err(|e| format!("failed to create DESKCHAT_HOME directory: {e}"))?;
        return Ok(path);
    }

    let home = user_home_dir().ok_or_else(|| {
        "failed to resolve user home; set DESKCHAT_HOME or HOME/USERPROFILE".to_string()
    })?;
    let dir = home.join(".deskchat");
    std::fs::create_dir_all(&dir).map_err(|e| format!("failed to create ~/.deskchat: {e}"))?;
    Ok(dir)
}

pub fn deskchat_config_path() -> Result<PathBuf, String> {
    Ok(deskchat_home_dir()?.join("config.toml"))
}
