//! Path utilities for locating worker handler scripts.

use std::path::{Path, PathBuf};

/// Environment variable overriding the handlers directory.
pub const HANDLERS_DIR_ENV: &str = "MULTIRUNNER_HANDLERS_DIR";

/// Directory name holding the reference handler scripts.
const HANDLERS_DIR_NAME: &str = "handlers";

/// Get the data directory for multirunner.
///
/// - Linux: `~/.local/share/multirunner`
/// - macOS: `~/Library/Application Support/multirunner`
pub fn get_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("multirunner"))
        .unwrap_or_else(|| PathBuf::from(".multirunner"))
}

/// Locate the directory holding `python.py`, `node.js` and friends.
///
/// Checked in order:
/// 1. `$MULTIRUNNER_HANDLERS_DIR`
/// 2. `handlers/` next to the running executable (and one level up, which
///    covers `target/<profile>/deps` test binaries)
/// 3. `<data dir>/multirunner/handlers`
/// 4. the source tree's `handlers/`
///
/// The first existing directory wins; if none exists the source tree path is
/// returned so that error messages point somewhere meaningful.
pub fn handlers_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(HANDLERS_DIR_ENV) {
        return expand_tilde(PathBuf::from(dir));
    }

    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe()
        && let Some(parent) = exe.parent()
    {
        candidates.push(parent.join(HANDLERS_DIR_NAME));
        if let Some(grandparent) = parent.parent() {
            candidates.push(grandparent.join(HANDLERS_DIR_NAME));
        }
    }
    candidates.push(get_data_dir().join(HANDLERS_DIR_NAME));

    let source_tree = Path::new(env!("CARGO_MANIFEST_DIR")).join(HANDLERS_DIR_NAME);
    candidates
        .into_iter()
        .find(|dir| dir.is_dir())
        .unwrap_or(source_tree)
}

/// Expands a leading `~` in a path to the user's home directory.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use multirunner::paths::expand_tilde;
///
/// let path = PathBuf::from("/tmp/foo");
/// assert_eq!(expand_tilde(&path), path);
/// ```
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}
