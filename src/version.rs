//! Version strings, with the git revision when the build provides one
//! through `MULTIRUNNER_GIT_REV`.

use std::sync::LazyLock;

/// The package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git revision baked in at build time (empty string if not set).
pub const GIT_REV: &str = match option_env!("MULTIRUNNER_GIT_REV") {
    Some(rev) => rev,
    None => "",
};

static LONG_VERSION: LazyLock<String> = LazyLock::new(|| {
    if GIT_REV.is_empty() {
        PKG_VERSION.to_string()
    } else {
        format!("{} ({})", PKG_VERSION, GIT_REV)
    }
});

/// Version for `--version`: `"X.Y.Z"` or `"X.Y.Z (abcdef0)"`.
///
/// # Examples
///
/// ```
/// let version = multirunner::version::long_version();
/// assert!(version.starts_with(env!("CARGO_PKG_VERSION")));
/// ```
pub fn long_version() -> &'static str {
    LONG_VERSION.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_version_format() {
        let version = long_version();
        if GIT_REV.is_empty() {
            assert_eq!(version, PKG_VERSION);
        } else {
            assert!(version.contains(GIT_REV));
            assert!(version.starts_with(PKG_VERSION));
        }
    }
}
