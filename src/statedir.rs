//! StateDir: the on-disk layout that is the single source of truth.
//!
//! Resolution order for the state directory:
//!   1. `HAPLESS_DIR` environment variable
//!   2. `<system-tmp>/hapless`

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::HaplessError;

/// Resolve the state directory following the priority chain above.
pub fn resolve_root() -> PathBuf {
    if let Ok(dir) = std::env::var("HAPLESS_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    std::env::temp_dir().join("hapless")
}

/// Handle to the shared state directory.
pub struct StateDir {
    path: PathBuf,
}

impl StateDir {
    /// Create the directory if missing, then verify it is writable.
    ///
    /// The directory's mtime doubles as a liveness/synchronization signal
    /// Touching it here and on every mutating operation means a concurrent
    /// `restart` can observe "something changed" without any lock file.
    pub fn init(path: PathBuf) -> Result<Self, HaplessError> {
        let current_user = current_username();
        if !path.exists() {
            std::fs::create_dir_all(&path).map_err(|_| {
                HaplessError::StateInaccessible(path.display().to_string(), current_user.clone())
            })?;
        }
        let dir = StateDir { path };
        if !dir.touch() {
            return Err(HaplessError::StateInaccessible(
                dir.path.display().to_string(),
                current_user,
            ));
        }
        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bump the directory's mtime by creating and removing a sentinel file.
    /// Returns `false` if the directory is not writable by the current user.
    fn touch(&self) -> bool {
        let sentinel = self.path.join(".hapless-touch");
        if std::fs::write(&sentinel, b"").is_err() {
            return false;
        }
        let _ = std::fs::remove_file(&sentinel);
        true
    }

    /// Enumerate hap ids: directory names that are entirely decimal digits,
    /// numerically sorted ascending. Non-digit names are future-extension
    /// directories and are silently skipped.
    pub fn list_hap_ids(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.path) else {
            return Vec::new();
        };
        let mut ids: Vec<u64> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()))
            .filter_map(|name| name.parse::<u64>().ok())
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| id.to_string()).collect()
    }

    /// Next hap id: `max(existing) + 1`, or `"1"` if none exist.
    pub fn next_id(&self) -> String {
        match self.list_hap_ids().last() {
            Some(max) => {
                let n: u64 = max.parse().unwrap_or(0);
                (n + 1).to_string()
            }
            None => "1".to_string(),
        }
    }

    pub fn hap_path(&self, hap_id: &str) -> PathBuf {
        self.path.join(hap_id)
    }

    /// Resolve an alias (hap id, or base name) to a hap directory.
    ///
    /// Only base names are matched — a raw name of the form `foo@2` is never
    /// looked up verbatim.
    pub fn lookup(&self, alias: &str) -> Option<PathBuf> {
        let ids = self.list_hap_ids();
        if ids.iter().any(|id| id == alias) {
            return Some(self.hap_path(alias));
        }
        for id in ids {
            let hap_path = self.hap_path(&id);
            let name_file = hap_path.join("name");
            let Ok(raw) = std::fs::read_to_string(&name_file) else {
                continue;
            };
            let base = raw.trim().split('@').next().unwrap_or("");
            if base == alias {
                return Some(hap_path);
            }
        }
        debug!(alias, "no hap matched alias");
        None
    }

    /// Whether the current user has full F_OK|R_OK|W_OK|X_OK access to a hap
    /// directory. Haps owned by another user are read-only to us.
    #[cfg(unix)]
    pub fn accessible(hap_path: &Path) -> bool {
        use std::ffi::CString;
        let Ok(c_path) = CString::new(hap_path.as_os_str().as_encoded_bytes()) else {
            return false;
        };
        // SAFETY: c_path is a valid, NUL-terminated C string for the lifetime
        // of this call.
        unsafe { libc::access(c_path.as_ptr(), libc::F_OK | libc::R_OK | libc::W_OK | libc::X_OK) == 0 }
    }

    #[cfg(not(unix))]
    pub fn accessible(hap_path: &Path) -> bool {
        let probe = hap_path.join(".hapless-access-probe");
        if std::fs::write(&probe, b"").is_ok() {
            let _ = std::fs::remove_file(&probe);
            true
        } else {
            false
        }
    }
}

/// Best-effort current username, used only for error messages ("... is
/// not accessible by user U").
pub fn current_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_root_env_var_wins() {
        // SAFETY: test-only; no other test in this module mutates HAPLESS_DIR
        // concurrently.
        unsafe {
            std::env::set_var("HAPLESS_DIR", "/tmp/hapless-test-root");
        }
        let root = resolve_root();
        unsafe {
            std::env::remove_var("HAPLESS_DIR");
        }
        assert_eq!(root, PathBuf::from("/tmp/hapless-test-root"));
    }

    #[test]
    fn resolve_root_default_is_system_tmp_hapless() {
        unsafe {
            std::env::remove_var("HAPLESS_DIR");
        }
        let root = resolve_root();
        assert_eq!(root, std::env::temp_dir().join("hapless"));
    }

    #[test]
    fn next_id_is_max_plus_one() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::init(tmp.path().to_path_buf()).unwrap();
        assert_eq!(dir.next_id(), "1");
        std::fs::create_dir(tmp.path().join("1")).unwrap();
        std::fs::create_dir(tmp.path().join("3")).unwrap();
        assert_eq!(dir.next_id(), "4");
    }

    #[test]
    fn list_hap_ids_skips_non_digit_names() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::init(tmp.path().to_path_buf()).unwrap();
        std::fs::create_dir(tmp.path().join("2")).unwrap();
        std::fs::create_dir(tmp.path().join("not-a-hap")).unwrap();
        std::fs::create_dir(tmp.path().join("1")).unwrap();
        assert_eq!(dir.list_hap_ids(), vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn lookup_resolves_base_name_but_not_raw_name() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::init(tmp.path().to_path_buf()).unwrap();
        let hap_dir = tmp.path().join("1");
        std::fs::create_dir(&hap_dir).unwrap();
        std::fs::write(hap_dir.join("name"), "foo@2").unwrap();

        assert_eq!(dir.lookup("foo"), Some(hap_dir.clone()));
        assert_eq!(dir.lookup("1"), Some(hap_dir));
        // The raw name itself does not match, only its base portion.
        assert_eq!(dir.lookup("foo@2"), None);
    }
}
