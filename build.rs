//! Build script for multirunner.
//!
//! Rebuilds when the git revision baked into `--version` changes, or when
//! the reference handler scripts are edited.

fn main() {
    println!("cargo:rerun-if-env-changed=MULTIRUNNER_GIT_REV");
    println!("cargo:rerun-if-changed=handlers");
}
