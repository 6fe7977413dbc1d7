//! Shadow workspaces: disposable copies of the repository where PreFlight
//! materializes candidate edits. The real tree is never written.

use std::io;
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::types::FileEdit;

pub struct ShadowWorkspace {
    dir: TempDir,
    cache_dir: PathBuf,
}

impl ShadowWorkspace {
    /// Copy `repo_root` into a fresh temporary directory, skipping paths
    /// matched by `excludes`. Build output for this candidate goes to
    /// `<cache_root>/<candidate_id>`; both are removed on drop.
    pub fn create(repo_root: &Path, excludes: &[String], cache_root: &Path, candidate_id: &str) -> io::Result<Self> {
        let skip = exclude_set(excludes)?;
        let dir = tempfile::Builder::new().prefix("mend-shadow-").tempdir()?;

        let mut copied = 0usize;
        let walker = WalkDir::new(repo_root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !excluded(&skip, repo_root, e.path(), e.file_type().is_dir()));
        for entry in walker {
            let entry = entry.map_err(io::Error::other)?;
            let rel = match entry.path().strip_prefix(repo_root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };
            let dest = dir.path().join(rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                std::fs::create_dir_all(&dest)?;
            } else if file_type.is_file() {
                std::fs::copy(entry.path(), &dest)?;
                copied += 1;
            }
        }

        let cache_dir = cache_root.join(candidate_id);
        std::fs::create_dir_all(&cache_dir)?;
        debug!(
            candidate = candidate_id,
            files = copied,
            path = %dir.path().display(),
            "shadow workspace created"
        );
        Ok(Self { dir, cache_dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Write the candidate's edits into the shadow copy.
    pub fn materialize(&self, edits: &[FileEdit]) -> io::Result<()> {
        for edit in edits {
            let dest = self.dir.path().join(relative_path(&edit.path)?);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(dest, &edit.updated)?;
        }
        Ok(())
    }
}

impl Drop for ShadowWorkspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.cache_dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.cache_dir.display(), error = %e, "failed to remove shadow build cache");
            }
        }
    }
}

fn exclude_set(patterns: &[String]) -> io::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Directories are tested as `dir/*` so `target/**` prunes `target` itself.
fn excluded(skip: &GlobSet, root: &Path, path: &Path, is_dir: bool) -> bool {
    let Ok(rel) = path.strip_prefix(root) else {
        return false;
    };
    if rel.as_os_str().is_empty() {
        return false;
    }
    skip.is_match(rel) || (is_dir && skip.is_match(rel.join("child")))
}

/// A repository-relative path with no root, prefix or `..` components.
pub(crate) fn relative_path(path: &str) -> io::Result<PathBuf> {
    let p = Path::new(path);
    let clean = p.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || !clean {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("edit path escapes the repository: {path}"),
        ));
    }
    Ok(p.to_path_buf())
}
