//! Run directory resolution.
//!
//! Every invocation works inside one run directory under the runs root:
//! `<root>/run-001`, `run-002`, ... The root comes from the
//! `GAUNTLET_WORKDIR_ROOT` override, the platform data directory, or the
//! system temp directory, in that order.

use anyhow::{Context, Result, bail};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::env::WORKDIR_ROOT_ENV;

const RUN_PREFIX: &str = "run-";

/// Root directory holding all run directories.
pub fn runs_root() -> PathBuf {
    if let Ok(path) = env::var(WORKDIR_ROOT_ENV)
        && !path.trim().is_empty()
    {
        return PathBuf::from(path.trim());
    }
    dirs_next::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join("gauntlet")
        .join("runs")
}

/// Create the next run directory under the root and return it.
pub fn allocate_run_dir(root: &Path) -> Result<PathBuf> {
    fs::create_dir_all(root).with_context(|| format!("could not create runs root '{}'", root.display()))?;
    let next = highest_run_index(root)?.map_or(1, |index| index + 1);
    let dir = root.join(format!("{RUN_PREFIX}{next:03}"));
    fs::create_dir(&dir).with_context(|| format!("could not create run directory '{}'", dir.display()))?;
    debug!(run = %dir.display(), "allocated run directory");
    Ok(dir)
}

/// The most recent run directory, when any exists.
pub fn last_run_dir(root: &Path) -> Result<Option<PathBuf>> {
    Ok(highest_run_index(root)?.map(|index| root.join(format!("{RUN_PREFIX}{index:03}"))))
}

/// Resolve an explicit run id: "run-042", "042" and "42" all address the
/// same directory.
pub fn run_dir_by_id(root: &Path, id: &str) -> Result<PathBuf> {
    let digits = id.strip_prefix(RUN_PREFIX).unwrap_or(id);
    let index: u32 = digits
        .parse()
        .with_context(|| format!("'{id}' is not a valid run id"))?;
    let dir = root.join(format!("{RUN_PREFIX}{index:03}"));
    if !dir.is_dir() {
        bail!("run directory '{}' does not exist", dir.display());
    }
    Ok(dir)
}

fn highest_run_index(root: &Path) -> Result<Option<u32>> {
    if !root.is_dir() {
        return Ok(None);
    }
    let mut highest = None;
    for entry in fs::read_dir(root).with_context(|| format!("could not read runs root '{}'", root.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(index) = name
            .to_str()
            .and_then(|name| name.strip_prefix(RUN_PREFIX))
            .and_then(|digits| digits.parse::<u32>().ok())
        else {
            continue;
        };
        if highest.is_none_or(|current| index > current) {
            highest = Some(index);
        }
    }
    Ok(highest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocates_sequential_run_dirs() {
        let root = tempdir().unwrap();
        let first = allocate_run_dir(root.path()).unwrap();
        let second = allocate_run_dir(root.path()).unwrap();
        assert_eq!(first.file_name().unwrap(), "run-001");
        assert_eq!(second.file_name().unwrap(), "run-002");
    }

    #[test]
    fn last_run_picks_highest_index() {
        let root = tempdir().unwrap();
        assert!(last_run_dir(root.path()).unwrap().is_none());
        fs::create_dir(root.path().join("run-001")).unwrap();
        fs::create_dir(root.path().join("run-010")).unwrap();
        fs::create_dir(root.path().join("not-a-run")).unwrap();
        let last = last_run_dir(root.path()).unwrap().unwrap();
        assert_eq!(last.file_name().unwrap(), "run-010");
    }

    #[test]
    fn resolves_run_ids_in_any_spelling() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("run-042")).unwrap();
        for spelling in ["run-042", "042", "42"] {
            let dir = run_dir_by_id(root.path(), spelling).unwrap();
            assert_eq!(dir.file_name().unwrap(), "run-042");
        }
        assert!(run_dir_by_id(root.path(), "99").is_err());
        assert!(run_dir_by_id(root.path(), "bogus").is_err());
    }

    #[test]
    fn root_honors_env_override() {
        temp_env::with_var(WORKDIR_ROOT_ENV, Some("/custom/gauntlet"), || {
            assert_eq!(runs_root(), PathBuf::from("/custom/gauntlet"));
        });
    }
}
