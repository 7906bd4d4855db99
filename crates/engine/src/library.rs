//! Resolver for helper shell libraries declared by tests.
//!
//! A library is a git repository providing `lib.sh` at its root, fetched
//! into the plan's `libraries/` directory and pushed to guests alongside
//! the test data. A `library.yaml` manifest may require further libraries
//! (the whole closure is resolved here) and may declare the files the
//! library provides, restricting what of the fetched tree survives.

use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

use gauntlet_types::{LibraryRequirement, Test};

/// File a fetched library must provide at its root.
pub const LIBRARY_ENTRY_FILE: &str = "lib.sh";
/// Optional manifest declaring further libraries a library needs.
pub const LIBRARY_MANIFEST_FILE: &str = "library.yaml";

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("library name '{name}' refers to both '{first}' and '{second}' (needed by {})", .tests.join(", "))]
    Conflict {
        name: String,
        first: String,
        second: String,
        tests: Vec<String>,
    },
    #[error("library repository '{location}' could not be fetched: {reason} (needed by {})", .tests.join(", "))]
    MissingRepository {
        location: String,
        reason: String,
        tests: Vec<String>,
    },
    #[error("ref '{reference}' does not exist in library repository '{location}' (needed by {})", .tests.join(", "))]
    MissingRef {
        location: String,
        reference: String,
        tests: Vec<String>,
    },
    #[error("library '{name}' from '{location}' does not provide '{file}' (needed by {})", .tests.join(", "))]
    MissingFile {
        name: String,
        location: String,
        file: String,
        tests: Vec<String>,
    },
    #[error("library '{name}' declares dependencies that cannot be read from '{path}': {reason} (needed by {})", .tests.join(", "))]
    MissingDependency {
        name: String,
        path: String,
        reason: String,
        tests: Vec<String>,
    },
    #[error("cannot prepare library directory '{path}': {source}")]
    Workdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LibraryError {
    /// Tests that cannot run because of this error.
    pub fn affected_tests(&self) -> &[String] {
        match self {
            LibraryError::Conflict { tests, .. }
            | LibraryError::MissingRepository { tests, .. }
            | LibraryError::MissingRef { tests, .. }
            | LibraryError::MissingFile { tests, .. }
            | LibraryError::MissingDependency { tests, .. } => tests,
            LibraryError::Workdir { .. } => &[],
        }
    }
}

#[derive(Debug)]
struct FetchRequest {
    name: String,
    /// Location as declared; this is what git clones.
    location: String,
    /// Normalized location used for identity.
    identity: String,
    reference: Option<String>,
    tests: Vec<String>,
}

struct Claim {
    identity: String,
    reference: Option<String>,
    tests: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LibraryManifest {
    #[serde(default)]
    requires: Vec<LibraryRequirement>,
    /// Files the library provides. A declared file must exist, and once
    /// any are declared, everything undeclared is pruned after the fetch.
    #[serde(default)]
    provides: Vec<String>,
}

/// Fetch every library the given tests (transitively) require into `root`.
/// Returns the resolved name-to-path map.
pub async fn fetch<'a, I>(root: &Path, tests: I) -> Result<IndexMap<String, PathBuf>, LibraryError>
where
    I: IntoIterator<Item = &'a Test>,
{
    let mut queue: VecDeque<FetchRequest> = VecDeque::new();
    let mut claims: IndexMap<String, Claim> = IndexMap::new();
    for test in tests {
        for requirement in &test.spec.libraries {
            enqueue(&mut queue, &mut claims, requirement, test.name())?;
        }
    }
    if queue.is_empty() {
        return Ok(IndexMap::new());
    }

    std::fs::create_dir_all(root).map_err(|source| LibraryError::Workdir {
        path: root.to_path_buf(),
        source,
    })?;

    let mut visited: HashMap<(String, Option<String>), PathBuf> = HashMap::new();
    let mut resolved: IndexMap<String, PathBuf> = IndexMap::new();

    while let Some(request) = queue.pop_front() {
        let key = (request.identity.clone(), request.reference.clone());
        if let Some(path) = visited.get(&key) {
            // second logical name for an already-fetched working copy
            if !resolved.contains_key(&request.name) {
                let alias = root.join(&request.name);
                if !alias.exists() {
                    std::os::unix::fs::symlink(path, &alias).map_err(|source| {
                        LibraryError::Workdir {
                            path: alias.clone(),
                            source,
                        }
                    })?;
                }
                resolved.insert(request.name.clone(), alias);
            }
            continue;
        }

        let destination = root.join(&request.name);
        let fetched = if destination.is_dir() {
            debug!(library = %request.name, "reusing cached working copy");
            false
        } else {
            clone(&request, &destination).await?;
            checkout(&request, &destination).await?;
            true
        };

        let manifest = read_manifest(&request, &destination)?;
        let declared = std::iter::once(LIBRARY_ENTRY_FILE)
            .chain(manifest.provides.iter().map(String::as_str));
        for file in declared {
            if !destination.join(file).is_file() {
                return Err(LibraryError::MissingFile {
                    name: request.name.clone(),
                    location: request.location.clone(),
                    file: file.to_string(),
                    tests: request.tests.clone(),
                });
            }
        }
        if fetched {
            prune(&destination, &manifest.provides)?;
            info!(library = %request.name, location = %request.identity, "library fetched");
        }

        for requirement in &manifest.requires {
            for test in &request.tests {
                enqueue(&mut queue, &mut claims, requirement, test)?;
            }
        }

        visited.insert(key, destination.clone());
        resolved.insert(request.name.clone(), destination);
    }
    Ok(resolved)
}

fn enqueue(
    queue: &mut VecDeque<FetchRequest>,
    claims: &mut IndexMap<String, Claim>,
    requirement: &LibraryRequirement,
    test: &str,
) -> Result<(), LibraryError> {
    let identity = normalize_location(&requirement.location);
    let name = requirement
        .name
        .clone()
        .unwrap_or_else(|| derived_name(&identity));

    match claims.get_mut(&name) {
        Some(claim)
            if claim.identity != identity || claim.reference != requirement.reference =>
        {
            let mut tests = claim.tests.clone();
            if !tests.iter().any(|existing| existing == test) {
                tests.push(test.to_string());
            }
            Err(LibraryError::Conflict {
                first: describe(&claim.identity, claim.reference.as_deref()),
                second: describe(&identity, requirement.reference.as_deref()),
                name,
                tests,
            })
        }
        Some(claim) => {
            if !claim.tests.iter().any(|existing| existing == test) {
                claim.tests.push(test.to_string());
            }
            for request in queue.iter_mut() {
                if request.name == name && !request.tests.iter().any(|existing| existing == test) {
                    request.tests.push(test.to_string());
                }
            }
            Ok(())
        }
        None => {
            claims.insert(
                name.clone(),
                Claim {
                    identity: identity.clone(),
                    reference: requirement.reference.clone(),
                    tests: vec![test.to_string()],
                },
            );
            queue.push_back(FetchRequest {
                name,
                location: requirement.location.clone(),
                identity,
                reference: requirement.reference.clone(),
                tests: vec![test.to_string()],
            });
            Ok(())
        }
    }
}

async fn clone(request: &FetchRequest, destination: &Path) -> Result<(), LibraryError> {
    debug!(library = %request.name, "cloning {}", request.location);
    let output = Command::new("git")
        .arg("clone")
        .arg("--quiet")
        .arg(&request.location)
        .arg(destination)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|error| LibraryError::MissingRepository {
            location: request.location.clone(),
            reason: format!("cannot run git: {error}"),
            tests: request.tests.clone(),
        })?;
    if !output.status.success() {
        return Err(LibraryError::MissingRepository {
            location: request.location.clone(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            tests: request.tests.clone(),
        });
    }
    Ok(())
}

async fn checkout(request: &FetchRequest, destination: &Path) -> Result<(), LibraryError> {
    let Some(reference) = &request.reference else {
        return Ok(());
    };
    let literal = match reference.strip_prefix('@') {
        // dynamic ref: a file on the default branch names the real ref
        Some(file) => {
            let path = destination.join(file);
            let content =
                std::fs::read_to_string(&path).map_err(|_| LibraryError::MissingRef {
                    location: request.location.clone(),
                    reference: reference.clone(),
                    tests: request.tests.clone(),
                })?;
            let literal = content.lines().next().unwrap_or("").trim().to_string();
            if literal.is_empty() {
                return Err(LibraryError::MissingRef {
                    location: request.location.clone(),
                    reference: reference.clone(),
                    tests: request.tests.clone(),
                });
            }
            debug!(library = %request.name, "dynamic ref '{reference}' resolves to '{literal}'");
            literal
        }
        None => reference.clone(),
    };
    let output = Command::new("git")
        .arg("-C")
        .arg(destination)
        .arg("checkout")
        .arg("--quiet")
        .arg(&literal)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|error| LibraryError::MissingRepository {
            location: request.location.clone(),
            reason: format!("cannot run git: {error}"),
            tests: request.tests.clone(),
        })?;
    if !output.status.success() {
        return Err(LibraryError::MissingRef {
            location: request.location.clone(),
            reference: literal,
            tests: request.tests.clone(),
        });
    }
    Ok(())
}

/// Repository internals are never part of a dependency. When the manifest
/// declares the provided files, everything undeclared goes with them.
fn prune(destination: &Path, provides: &[String]) -> Result<(), LibraryError> {
    remove_entry(&destination.join(".git"))?;
    if provides.is_empty() {
        return Ok(());
    }
    let mut keep: Vec<PathBuf> = vec![
        PathBuf::from(LIBRARY_ENTRY_FILE),
        PathBuf::from(LIBRARY_MANIFEST_FILE),
    ];
    keep.extend(provides.iter().map(PathBuf::from));
    prune_dir(destination, Path::new(""), &keep)
}

fn prune_dir(root: &Path, relative: &Path, keep: &[PathBuf]) -> Result<(), LibraryError> {
    let dir = root.join(relative);
    let entries = std::fs::read_dir(&dir).map_err(|source| LibraryError::Workdir {
        path: dir.clone(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| LibraryError::Workdir {
            path: dir.clone(),
            source,
        })?;
        let child = relative.join(entry.file_name());
        if keep.contains(&child) {
            continue;
        }
        if keep.iter().any(|kept| kept.starts_with(&child)) {
            // a declared file lives further down this directory
            prune_dir(root, &child, keep)?;
        } else {
            remove_entry(&root.join(&child))?;
        }
    }
    Ok(())
}

fn remove_entry(path: &Path) -> Result<(), LibraryError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(LibraryError::Workdir {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let removed = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    removed.map_err(|source| LibraryError::Workdir {
        path: path.to_path_buf(),
        source,
    })
}

fn read_manifest(
    request: &FetchRequest,
    destination: &Path,
) -> Result<LibraryManifest, LibraryError> {
    let path = destination.join(LIBRARY_MANIFEST_FILE);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LibraryManifest::default());
        }
        Err(error) => {
            return Err(LibraryError::MissingDependency {
                name: request.name.clone(),
                path: path.display().to_string(),
                reason: error.to_string(),
                tests: request.tests.clone(),
            });
        }
    };
    serde_yaml::from_str(&raw).map_err(|error| LibraryError::MissingDependency {
        name: request.name.clone(),
        path: path.display().to_string(),
        reason: error.to_string(),
        tests: request.tests.clone(),
    })
}

/// A trailing `.git` or `/` does not change which repository is meant.
fn normalize_location(location: &str) -> String {
    let trimmed = location.trim().trim_end_matches('/');
    trimmed.strip_suffix(".git").unwrap_or(trimmed).to_string()
}

fn derived_name(identity: &str) -> String {
    let from_url = Url::parse(identity).ok().and_then(|url| {
        url.path_segments()
            .and_then(|segments| segments.filter(|segment| !segment.is_empty()).next_back())
            .map(str::to_string)
    });
    from_url
        .or_else(|| {
            identity
                .rsplit('/')
                .find(|segment| !segment.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| identity.to_string())
}

fn describe(identity: &str, reference: Option<&str>) -> String {
    match reference {
        Some(reference) => format!("{identity}@{reference}"),
        None => identity.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_types::TestSpec;

    fn test_with(yaml: &str) -> Test {
        let spec: TestSpec = serde_yaml::from_str(yaml).unwrap();
        Test {
            spec,
            serial_number: 1,
        }
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_AUTHOR_NAME", "fixture")
            .env("GIT_AUTHOR_EMAIL", "fixture@example.org")
            .env("GIT_COMMITTER_NAME", "fixture")
            .env("GIT_COMMITTER_EMAIL", "fixture@example.org")
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed in {}", dir.display());
    }

    fn repo(root: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        git(&dir, &["init", "--quiet"]);
        for (file, content) in files {
            let path = dir.join(file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        git(&dir, &["add", "."]);
        git(&dir, &["commit", "--quiet", "-m", "seed"]);
        dir
    }

    #[test]
    fn trailing_git_suffix_does_not_change_identity() {
        assert_eq!(
            normalize_location("https://example.org/helpers/lib.git"),
            normalize_location("https://example.org/helpers/lib/")
        );
        assert_eq!(normalize_location("/srv/git/lib.git"), "/srv/git/lib");
    }

    #[test]
    fn names_derive_from_the_last_path_segment() {
        assert_eq!(derived_name("https://example.org/helpers/lib"), "lib");
        assert_eq!(derived_name("file:///srv/git/epel"), "epel");
        assert_eq!(derived_name("/srv/git/epel"), "epel");
    }

    #[tokio::test]
    async fn conflicting_names_are_rejected_before_any_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let first = test_with(
            "name: /one\ntest: 'true'\nlibraries:\n  - {location: /srv/a, name: shared}\n",
        );
        let second = test_with(
            "name: /two\ntest: 'true'\nlibraries:\n  - {location: /srv/b, name: shared}\n",
        );

        let error = fetch(dir.path(), [&first, &second]).await.unwrap_err();
        match error {
            LibraryError::Conflict { name, tests, .. } => {
                assert_eq!(name, "shared");
                assert_eq!(tests, vec!["/one", "/two"]);
            }
            other => panic!("expected a conflict, got {other}"),
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn same_repo_with_and_without_git_suffix_is_fetched_once() {
        let fixtures = tempfile::tempdir().unwrap();
        let repo_dir = repo(fixtures.path(), "lib.git", &[("lib.sh", "helper() { :; }\n")]);
        let location = repo_dir.display().to_string();
        let bare_location = location.trim_end_matches(".git").to_string();

        let first = test_with(&format!(
            "name: /one\ntest: 'true'\nlibraries:\n  - {{location: {location}}}\n"
        ));
        let second = test_with(&format!(
            "name: /two\ntest: 'true'\nlibraries:\n  - {{location: {bare_location}}}\n"
        ));

        let root = tempfile::tempdir().unwrap();
        let resolved = fetch(root.path(), [&first, &second]).await.unwrap();
        assert_eq!(resolved.len(), 1);
        let copy = &resolved["lib"];
        assert!(copy.join(LIBRARY_ENTRY_FILE).is_file());
        assert!(!copy.join(".git").exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn unknown_refs_name_the_affected_tests() {
        let fixtures = tempfile::tempdir().unwrap();
        let repo_dir = repo(fixtures.path(), "lib", &[("lib.sh", "")]);
        let test = test_with(&format!(
            "name: /needs-ref\ntest: 'true'\nlibraries:\n  - {{location: {}, ref: no-such-tag}}\n",
            repo_dir.display()
        ));

        let root = tempfile::tempdir().unwrap();
        let error = fetch(root.path(), [&test]).await.unwrap_err();
        match error {
            LibraryError::MissingRef {
                reference, tests, ..
            } => {
                assert_eq!(reference, "no-such-tag");
                assert_eq!(tests, vec!["/needs-ref"]);
            }
            other => panic!("expected a missing ref, got {other}"),
        }
    }

    #[tokio::test]
    async fn dynamic_refs_read_the_literal_from_the_default_branch() {
        let fixtures = tempfile::tempdir().unwrap();
        let repo_dir = repo(fixtures.path(), "lib", &[("lib.sh", "first\n")]);
        git(&repo_dir, &["tag", "v1"]);
        std::fs::write(repo_dir.join("lib.sh"), "second\n").unwrap();
        std::fs::write(repo_dir.join("LATEST"), "v1\n").unwrap();
        git(&repo_dir, &["add", "."]);
        git(&repo_dir, &["commit", "--quiet", "-m", "advance"]);

        let test = test_with(&format!(
            "name: /pinned\ntest: 'true'\nlibraries:\n  - {{location: {}, ref: '@LATEST'}}\n",
            repo_dir.display()
        ));

        let root = tempfile::tempdir().unwrap();
        let resolved = fetch(root.path(), [&test]).await.unwrap();
        let content = std::fs::read_to_string(resolved["lib"].join(LIBRARY_ENTRY_FILE)).unwrap();
        assert_eq!(content, "first\n");
    }

    #[tokio::test]
    async fn manifests_pull_in_further_libraries() {
        let fixtures = tempfile::tempdir().unwrap();
        let base = repo(fixtures.path(), "base", &[("lib.sh", "base\n")]);
        let outer = repo(
            fixtures.path(),
            "outer",
            &[
                ("lib.sh", "outer\n"),
                (
                    "library.yaml",
                    &format!("requires:\n  - location: {}\n", base.display()),
                ),
            ],
        );

        let test = test_with(&format!(
            "name: /chained\ntest: 'true'\nlibraries:\n  - {{location: {}}}\n",
            outer.display()
        ));

        let root = tempfile::tempdir().unwrap();
        let resolved = fetch(root.path(), [&test]).await.unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved["outer"].join(LIBRARY_ENTRY_FILE).is_file());
        assert!(resolved["base"].join(LIBRARY_ENTRY_FILE).is_file());
    }

    #[tokio::test]
    async fn declared_files_survive_the_prune_and_the_rest_goes() {
        let fixtures = tempfile::tempdir().unwrap();
        let repo_dir = repo(
            fixtures.path(),
            "helpers",
            &[
                ("lib.sh", ". \"$(dirname \"$0\")/scripts/setup.sh\"\n"),
                ("library.yaml", "provides:\n  - scripts/setup.sh\n"),
                ("scripts/setup.sh", "setup() { :; }\n"),
                ("scripts/scratch.sh", "leftover\n"),
                ("notes.txt", "development notes\n"),
            ],
        );
        let test = test_with(&format!(
            "name: /tidy\ntest: 'true'\nlibraries:\n  - {{location: {}}}\n",
            repo_dir.display()
        ));

        let root = tempfile::tempdir().unwrap();
        let resolved = fetch(root.path(), [&test]).await.unwrap();
        let copy = &resolved["helpers"];
        assert!(copy.join(LIBRARY_ENTRY_FILE).is_file());
        assert!(copy.join(LIBRARY_MANIFEST_FILE).is_file());
        assert!(copy.join("scripts/setup.sh").is_file());
        assert!(!copy.join("scripts/scratch.sh").exists());
        assert!(!copy.join("notes.txt").exists());
        assert!(!copy.join(".git").exists());
    }

    #[tokio::test]
    async fn a_missing_declared_file_names_the_file_and_the_tests() {
        let fixtures = tempfile::tempdir().unwrap();
        let repo_dir = repo(
            fixtures.path(),
            "helpers",
            &[
                ("lib.sh", "helper() { :; }\n"),
                ("library.yaml", "provides:\n  - scripts/setup.sh\n"),
            ],
        );
        let test = test_with(&format!(
            "name: /incomplete\ntest: 'true'\nlibraries:\n  - {{location: {}}}\n",
            repo_dir.display()
        ));

        let root = tempfile::tempdir().unwrap();
        let error = fetch(root.path(), [&test]).await.unwrap_err();
        match error {
            LibraryError::MissingFile { file, tests, .. } => {
                assert_eq!(file, "scripts/setup.sh");
                assert_eq!(tests, vec!["/incomplete"]);
            }
            other => panic!("expected a missing file, got {other}"),
        }
    }

    #[tokio::test]
    async fn libraries_without_the_entry_file_are_rejected() {
        let fixtures = tempfile::tempdir().unwrap();
        let repo_dir = repo(fixtures.path(), "broken", &[("README", "not a library\n")]);
        let test = test_with(&format!(
            "name: /broken\ntest: 'true'\nlibraries:\n  - {{location: {}}}\n",
            repo_dir.display()
        ));

        let root = tempfile::tempdir().unwrap();
        let error = fetch(root.path(), [&test]).await.unwrap_err();
        assert!(matches!(error, LibraryError::MissingFile { .. }));
        assert!(error.to_string().contains("/broken"));
    }
}
