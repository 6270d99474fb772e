//! Fixture directory lookup.
//!
//! Fixtures are JSON files whose names encode a method and a path pattern,
//! e.g. `get-users-_id.json`. The directory is scanned on every resolution so
//! fixtures can be added or edited while the server runs.

use crate::keys::{CandidateKey, Segment, DELIMITER, FIXTURE_EXTENSION, WILDCARD};
use bytes::Bytes;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Failure reading the fixture directory or a fixture file.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("failed to list fixture directory {path}: {source}")]
    ListDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read fixture {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Typed form of a fixture filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureKey {
    pub method: String,
    pub segments: Vec<Segment>,
}

impl FixtureKey {
    /// Parse a filename without its extension.
    ///
    /// Any segment after the method that begins with the wildcard sentinel is
    /// collapsed to [`Segment::Wildcard`], so `_id` and `_` are equivalent.
    pub fn parse(stem: &str) -> Self {
        let mut parts = stem.split(DELIMITER);
        let method = parts.next().unwrap_or_default().to_string();
        let segments = parts
            .map(|part| {
                if part.starts_with(WILDCARD) {
                    Segment::Wildcard
                } else {
                    Segment::Literal(part.to_string())
                }
            })
            .collect();
        Self { method, segments }
    }

    pub fn wildcard_count(&self) -> usize {
        self.segments.iter().filter(|s| s.is_wildcard()).count()
    }

    /// Structural equality against a candidate's normalized tokens.
    fn matches(&self, tokens: &[Segment]) -> bool {
        match tokens.split_first() {
            Some((Segment::Literal(method), rest)) => {
                *method == self.method && self.segments == rest
            }
            _ => false,
        }
    }

    /// Whether this fixture answers the given candidate.
    pub fn matches_candidate(&self, candidate: &CandidateKey) -> bool {
        self.matches(&candidate.normalized_tokens())
    }
}

/// A fixture file read from disk.
#[derive(Debug, Clone)]
pub struct Fixture {
    /// Filename including extension
    pub filename: String,
    /// Directory the file was found in
    pub directory: PathBuf,
    /// Raw file contents
    pub body: Bytes,
}

/// A fixture together with the candidate key it answered.
#[derive(Debug, Clone)]
pub struct FixtureMatch {
    pub fixture: Fixture,
    pub candidate: CandidateKey,
}

#[derive(Debug)]
struct FixtureEntry {
    filename: String,
    key: FixtureKey,
}

/// Ordered directories to search. The first directory producing a hit wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPlan {
    directories: Vec<PathBuf>,
}

impl SearchPlan {
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Try each directory in order, returning the first `Some`.
    pub async fn first_hit<T, F, Fut>(&self, mut attempt: F) -> Option<T>
    where
        F: FnMut(PathBuf) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for directory in &self.directories {
            if let Some(hit) = attempt(directory.clone()).await {
                return Some(hit);
            }
        }
        None
    }
}

/// Read-only view over a fixture root directory.
#[derive(Debug, Clone)]
pub struct FixtureStore {
    root: PathBuf,
}

impl FixtureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Build the search order for a request.
    ///
    /// An override naming an existing subdirectory of the root is searched
    /// first; the root is always searched last. Missing or malformed overrides
    /// are dropped silently.
    pub async fn search_plan(&self, directory_override: Option<&str>) -> SearchPlan {
        let mut directories = Vec::with_capacity(2);
        if let Some(name) = directory_override {
            match self.override_directory(name).await {
                Some(dir) => directories.push(dir),
                None => debug!(directory = %name, "Fixture override directory not found, using root"),
            }
        }
        directories.push(self.root.clone());
        SearchPlan { directories }
    }

    async fn override_directory(&self, name: &str) -> Option<PathBuf> {
        if !is_single_component(name) {
            return None;
        }
        let dir = self.root.join(name);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Some(dir),
            _ => None,
        }
    }

    /// Resolve candidates to the best matching fixture.
    ///
    /// Candidates are tried strictly in the order given; the first candidate
    /// with any matching file wins. Within a candidate, fewer wildcards win,
    /// then lexicographic filename order.
    pub async fn resolve(
        &self,
        candidates: &[CandidateKey],
        directory_override: Option<&str>,
    ) -> Option<FixtureMatch> {
        if candidates.is_empty() {
            return None;
        }
        self.search_plan(directory_override)
            .await
            .first_hit(|dir| resolve_in(dir, candidates))
            .await
    }

    /// Look up the body for an injected error, stored as `<status>.json`.
    pub async fn error_fixture(
        &self,
        status: u16,
        directory_override: Option<&str>,
    ) -> Option<Fixture> {
        let filename = format!("{}.{}", status, FIXTURE_EXTENSION);
        self.search_plan(directory_override)
            .await
            .first_hit(|dir| {
                let filename = filename.clone();
                async move {
                    let path = dir.join(&filename);
                    match tokio::fs::metadata(&path).await {
                        Ok(meta) if meta.is_file() => {}
                        _ => return None,
                    }
                    read_fixture(dir, filename).await
                }
            })
            .await
    }
}

fn is_single_component(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

async fn resolve_in(dir: PathBuf, candidates: &[CandidateKey]) -> Option<FixtureMatch> {
    let entries = match scan(&dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "Skipping fixture directory");
            return None;
        }
    };
    resolve_entries(dir, &entries, candidates).await
}

/// Pick the winner for each candidate in turn from an already scanned listing.
///
/// A winner that can no longer be read is skipped along with the rest of its
/// candidate's matches; resolution moves on to the next candidate.
async fn resolve_entries(
    dir: PathBuf,
    entries: &[FixtureEntry],
    candidates: &[CandidateKey],
) -> Option<FixtureMatch> {
    for candidate in candidates {
        let wanted = candidate.normalized_tokens();
        let mut matched: Vec<&FixtureEntry> = entries
            .iter()
            .filter(|entry| entry.key.matches(&wanted))
            .collect();

        matched.sort_by(|a, b| {
            a.key
                .wildcard_count()
                .cmp(&b.key.wildcard_count())
                .then_with(|| a.filename.cmp(&b.filename))
        });

        let Some(winner) = matched.first() else {
            continue;
        };

        debug!(
            candidate = %candidate,
            file = %winner.filename,
            ties = matched.len(),
            "Fixture candidate matched"
        );

        // An unreadable winner counts as no match for this candidate.
        if let Some(fixture) = read_fixture(dir.clone(), winner.filename.clone()).await {
            return Some(FixtureMatch {
                fixture,
                candidate: candidate.clone(),
            });
        }
    }

    None
}

async fn read_fixture(directory: PathBuf, filename: String) -> Option<Fixture> {
    let path = directory.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(content) => Some(Fixture {
            filename,
            directory,
            body: Bytes::from(content),
        }),
        Err(source) => {
            let e = FixtureError::Read { path, source };
            warn!(error = %e, "Fixture unreadable, treating as unmatched");
            None
        }
    }
}

async fn scan(dir: &Path) -> Result<Vec<FixtureEntry>, FixtureError> {
    let list_error = |source| FixtureError::ListDirectory {
        path: dir.to_path_buf(),
        source,
    };

    let mut reader = tokio::fs::read_dir(dir).await.map_err(list_error)?;
    let mut entries = Vec::new();

    while let Some(entry) = reader.next_entry().await.map_err(list_error)? {
        let path = entry.path();
        let is_fixture = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == FIXTURE_EXTENSION);
        if !is_fixture {
            continue;
        }
        // Follows symlinks, unlike DirEntry::file_type
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            _ => continue,
        }
        let (Some(filename), Some(stem)) = (
            path.file_name().and_then(|n| n.to_str()),
            path.file_stem().and_then(|s| s.to_str()),
        ) else {
            continue;
        };
        entries.push(FixtureEntry {
            filename: filename.to_string(),
            key: FixtureKey::parse(stem),
        });
    }

    Ok(entries)
}
