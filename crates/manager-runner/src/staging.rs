//! Artifact staging: what goes into the container before start and what
//! comes back out after a successful exit.

use crate::error::StagingError;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// One file of an archive: a local source and its path inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInput {
    pub source: PathBuf,
    pub dest: String,
}

/// A set of local files laid out as an archive rooted at the copy destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveInput {
    pub files: Vec<FileInput>,
}

impl ArchiveInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, source: impl Into<PathBuf>, dest: impl Into<String>) -> Self {
        self.files.push(FileInput {
            source: source.into(),
            dest: dest.into(),
        });
        self
    }

    /// Lay the archive out under `root`, returning the staged paths in order.
    pub fn stage_into(&self, root: &Path) -> Result<Vec<PathBuf>, StagingError> {
        let mut staged = Vec::with_capacity(self.files.len());

        for file in &self.files {
            let relative = sanitize_dest(&file.dest)?;
            let target = root.join(relative);

            if !file.source.exists() {
                return Err(StagingError::MissingSource {
                    path: file.source.clone(),
                });
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|source| StagingError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }

            if file.source.is_dir() {
                copy_dir(&file.source, &target)?;
            } else {
                fs::copy(&file.source, &target).map_err(|source| StagingError::Io {
                    path: file.source.clone(),
                    source,
                })?;
            }

            debug!(
                source = %file.source.display(),
                dest = %file.dest,
                "staged archive entry"
            );
            staged.push(target);
        }

        Ok(staged)
    }
}

/// Copy-in directive, executed before the container starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyToContainer {
    pub input: ArchiveInput,
    pub container_path: String,
}

impl CopyToContainer {
    pub fn new(input: ArchiveInput, container_path: impl Into<String>) -> Self {
        Self {
            input,
            container_path: container_path.into(),
        }
    }
}

/// Copy-out directive, executed only after a zero exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFromContainer {
    pub container_path: String,
    pub local_dir: PathBuf,
}

impl CopyFromContainer {
    pub fn new(container_path: impl Into<String>, local_dir: impl Into<PathBuf>) -> Self {
        Self {
            container_path: container_path.into(),
            local_dir: local_dir.into(),
        }
    }
}

fn sanitize_dest(dest: &str) -> Result<PathBuf, StagingError> {
    let mut sanitized = PathBuf::new();
    for comp in Path::new(dest).components() {
        match comp {
            Component::Normal(part) => sanitized.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(StagingError::InvalidDestination {
                    dest: dest.to_string(),
                })
            }
        }
    }

    if sanitized.as_os_str().is_empty() {
        return Err(StagingError::InvalidDestination {
            dest: dest.to_string(),
        });
    }

    Ok(sanitized)
}

fn copy_dir(source: &Path, target: &Path) -> Result<(), StagingError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| StagingError::Io { path, source }
    };

    fs::create_dir_all(target).map_err(io_err(target))?;
    for entry in fs::read_dir(source).map_err(io_err(source))? {
        let entry = entry.map_err(io_err(source))?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(io_err(&from))?;
        }
    }
    Ok(())
}
