//! Server password persistence
//!
//! The server password lives in a single ASCII file `viiper.key.txt` in the
//! platform configuration directory:
//!
//! - Linux: `~/.config/viiper/viiper.key.txt`
//! - macOS: `~/Library/Application Support/viiper/viiper.key.txt`
//! - Windows: `%APPDATA%\viiper\viiper.key.txt`
//!
//! On first run a fresh random password is generated and written with 0600
//! permissions; every later start reads the same file, so clients keep
//! working across restarts.

use crate::error::{Error, Result};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Application name for config directory lookup
const APP_NAME: &str = "viiper";

/// Password filename
const KEY_FILE_NAME: &str = "viiper.key.txt";

/// Length of a generated password in characters
const GENERATED_KEY_LEN: usize = 32;

/// Get the default password file path in the platform config directory.
pub fn default_key_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::KeyFile("cannot determine config directory (HOME not set?)".into()))?;
    Ok(config_dir.join(APP_NAME).join(KEY_FILE_NAME))
}

/// Load the server password, generating and saving one on first run.
///
/// # Arguments
/// * `path` - Optional path to the key file. If None, uses the default
///   platform path.
pub fn load_or_generate_password(path: Option<&Path>) -> Result<String> {
    let key_path = match path {
        Some(p) => p.to_path_buf(),
        None => default_key_path()?,
    };

    if key_path.exists() {
        load_password(&key_path)
    } else {
        let password = generate_password();
        save_password(&password, &key_path)?;
        info!("Generated new server password at {}", key_path.display());
        Ok(password)
    }
}

/// Read and validate the password file.
pub fn load_password(path: &Path) -> Result<String> {
    debug!("Loading server password from {}", path.display());

    let contents = fs::read_to_string(path)
        .map_err(|e| Error::KeyFile(format!("failed to read {}: {}", path.display(), e)))?;

    let password = contents.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        return Err(Error::KeyFile(format!("{} is empty", path.display())));
    }
    if !password.is_ascii() || password.chars().any(|c| c.is_ascii_control()) {
        return Err(Error::KeyFile(format!(
            "{} must contain printable ASCII only",
            path.display()
        )));
    }

    Ok(password)
}

/// Generate a new random alphanumeric password.
pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(GENERATED_KEY_LEN)
        .map(char::from)
        .collect()
}

/// Save the password with a trailing newline and 0600 permissions.
pub fn save_password(password: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::KeyFile(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }

    let mut file = File::create(path)
        .map_err(|e| Error::KeyFile(format!("failed to create {}: {}", path.display(), e)))?;
    file.write_all(password.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = fs::Permissions::from_mode(0o600);
        if let Err(e) = fs::set_permissions(path, permissions) {
            warn!("Failed to set 0600 on {}: {}", path.display(), e);
        }
    }

    info!("Saved server password to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_password_is_random() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), GENERATED_KEY_LEN);
        assert!(a.is_ascii());
        assert_ne!(a, b);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);

        save_password("hunter2", &path).unwrap();
        assert_eq!(load_password(&path).unwrap(), "hunter2");
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);

        let first = load_or_generate_password(Some(&path)).unwrap();
        assert!(path.exists());
        let second = load_or_generate_password(Some(&path)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_load_rejects_empty_and_binary() {
        let dir = TempDir::new().unwrap();

        let empty = dir.path().join("empty");
        fs::write(&empty, "\n").unwrap();
        assert!(load_password(&empty).is_err());

        let binary = dir.path().join("binary");
        fs::write(&binary, [0x01, 0x02, 0x03]).unwrap();
        assert!(load_password(&binary).is_err());
    }

    #[test]
    fn test_trailing_newline_is_stripped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);
        fs::write(&path, "hunter2\r\n").unwrap();
        assert_eq!(load_password(&path).unwrap(), "hunter2");
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);
        save_password("hunter2", &path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
