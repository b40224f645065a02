//! Data directory preparation.

use crate::error::ConfigError;
use std::fs;
use std::path::Path;

/// Filesystem collaborator that makes the daemon's data directory usable.
pub trait DataDirectory: Send + Sync {
    /// Ensure `path` exists, is private to this user, and is writable.
    fn prepare(&self, path: &Path) -> Result<(), ConfigError>;
}

/// Default [`DataDirectory`] backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDataDirectory;

const PROBE_FILE: &str = ".torkeeper-probe";

impl DataDirectory for FsDataDirectory {
    fn prepare(&self, path: &Path) -> Result<(), ConfigError> {
        let fail = |reason: String| ConfigError::Directory {
            path: path.to_path_buf(),
            reason,
        };

        fs::create_dir_all(path).map_err(|e| fail(format!("create failed: {}", e)))?;

        let meta = fs::metadata(path).map_err(|e| fail(format!("stat failed: {}", e)))?;
        if !meta.is_dir() {
            return Err(fail("not a directory".into()));
        }

        // Tor refuses to run with a group/world readable DataDirectory
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o700))
                .map_err(|e| fail(format!("chmod failed: {}", e)))?;
        }

        let probe = path.join(PROBE_FILE);
        fs::write(&probe, b"ok").map_err(|e| fail(format!("not writable: {}", e)))?;
        let _ = fs::remove_file(&probe);

        tracing::debug!(path = ?path, "Data directory ready");
        Ok(())
    }
}
