use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Subdirectories each job regenerates inside the shared corpus directory.
pub const TRANSIENT_DIRS: [&str; 2] = ["coverage", "reproducers"];

/// Errors raised while reclaiming job artifacts.
#[derive(Error, Debug)]
pub enum ReclaimError {
    /// An artifact existed but could not be removed (permissions, I/O).
    #[error("Failed to remove {path:?}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Deletes the transient `coverage/` and `reproducers/` trees from a corpus
/// directory so the next job starts clean.
///
/// The rest of the corpus (the inputs themselves) is left alone.
#[derive(Debug, Clone)]
pub struct ArtifactReclaimer {
    corpus_dir: PathBuf,
}

impl ArtifactReclaimer {
    pub fn new(corpus_dir: impl Into<PathBuf>) -> Self {
        Self {
            corpus_dir: corpus_dir.into(),
        }
    }

    pub fn corpus_dir(&self) -> &Path {
        &self.corpus_dir
    }

    pub fn transient_paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        TRANSIENT_DIRS.iter().map(|name| self.corpus_dir.join(name))
    }

    /// Removes both transient trees. Missing trees are skipped, so repeated
    /// calls are no-ops. Returns how many entries were actually removed.
    pub fn clean(&self) -> Result<usize, ReclaimError> {
        let mut removed = 0;
        for path in self.transient_paths() {
            if remove_entry(&path)? {
                debug!(path = %path.display(), "removed transient artifacts");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Reclaims the transient artifacts under `corpus_dir`.
pub fn clean(corpus_dir: &Path) -> Result<usize, ReclaimError> {
    ArtifactReclaimer::new(corpus_dir).clean()
}

fn remove_entry(path: &Path) -> Result<bool, ReclaimError> {
    let to_err = |source| ReclaimError::Remove {
        path: path.to_path_buf(),
        source,
    };
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(to_err(e)),
    };
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(to_err(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populate(corpus: &Path) {
        fs::create_dir_all(corpus.join("coverage/nested")).unwrap();
        fs::write(corpus.join("coverage/nested/covered.1700000000.txt"), "*r|").unwrap();
        fs::create_dir_all(corpus.join("reproducers")).unwrap();
        fs::write(corpus.join("reproducers/123.txt"), "[]").unwrap();
        fs::write(corpus.join("seed.txt"), "keep me").unwrap();
    }

    #[test]
    fn clean_removes_transient_trees_only() -> Result<(), ReclaimError> {
        let dir = tempdir().unwrap();
        populate(dir.path());

        let removed = clean(dir.path())?;
        assert_eq!(removed, 2);
        assert!(!dir.path().join("coverage").exists());
        assert!(!dir.path().join("reproducers").exists());
        assert!(dir.path().join("seed.txt").exists());
        Ok(())
    }

    #[test]
    fn clean_is_idempotent() -> Result<(), ReclaimError> {
        let dir = tempdir().unwrap();
        populate(dir.path());
        let reclaimer = ArtifactReclaimer::new(dir.path());

        reclaimer.clean()?;
        assert_eq!(reclaimer.clean()?, 0);
        assert_eq!(reclaimer.clean()?, 0);
        Ok(())
    }

    #[test]
    fn clean_on_missing_corpus_dir_is_a_no_op() {
        let dir = tempdir().unwrap();
        let reclaimer = ArtifactReclaimer::new(dir.path().join("never-created"));
        assert_eq!(reclaimer.clean().unwrap(), 0);
    }

    #[test]
    fn clean_removes_plain_file_named_like_artifact_dir() -> Result<(), ReclaimError> {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("coverage"), "stray").unwrap();
        assert_eq!(clean(dir.path())?, 1);
        assert!(!dir.path().join("coverage").exists());
        Ok(())
    }

    #[test]
    fn transient_paths_are_under_corpus_dir() {
        let reclaimer = ArtifactReclaimer::new("/work/echidna-corpus");
        let paths: Vec<_> = reclaimer.transient_paths().collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/work/echidna-corpus/coverage"),
                PathBuf::from("/work/echidna-corpus/reproducers"),
            ]
        );
    }
}
