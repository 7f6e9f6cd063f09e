use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};
use log::{debug, warn};
use crate::config::MirrorConfig;
use crate::error::SetupError;
use crate::job::{JobSettings, TransferJob};

/// Walks the source tree and maps every file to a [`TransferJob`]
#[derive(Debug, Clone)]
pub struct JobFinder {
    source_root: PathBuf,
    dest_root: PathBuf,
    include_hidden: bool,
    settings: JobSettings,
}

impl JobFinder {
    /// Resolve both roots; fails before any file is looked at
    pub fn new(cfg: &MirrorConfig) -> Result<Self, SetupError> {
        let source = absolutize(&cfg.source_dir)?;
        if !source.exists() {
            return Err(SetupError::SourceNotFound(source));
        }
        if !source.is_dir() {
            return Err(SetupError::SourceNotDirectory(source));
        }
        let source_root = std::fs::canonicalize(&source)
            .map_err(|error| SetupError::Resolve { path: source.clone(), error })?;
        let dest_root = resolve_dest(&cfg.dest_dir)?;

        if dest_root.starts_with(&source_root) || source_root.starts_with(&dest_root) {
            return Err(SetupError::OverlappingRoots {
                source_dir: source_root,
                dest_dir: dest_root,
            });
        }

        Ok(Self {
            source_root,
            dest_root,
            include_hidden: cfg.include_hidden,
            settings: JobSettings::from_config(cfg),
        })
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn dest_root(&self) -> &Path {
        &self.dest_root
    }

    /// Lazily yield one job per regular file under the source root
    pub fn jobs(&self) -> impl Iterator<Item = TransferJob> + '_ {
        let include_hidden = self.include_hidden;
        WalkDir::new(&self.source_root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| include_hidden || !is_hidden(e))
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter_map(move |e| {
                let relative = e.path().strip_prefix(&self.source_root).ok()?;
                Some(TransferJob::new(&self.source_root, &self.dest_root, relative, &self.settings))
            })
    }

    /// Destination files that no source file maps to
    pub fn extraneous(&self, known: &HashSet<PathBuf>) -> Vec<PathBuf> {
        if !self.dest_root.is_dir() {
            return Vec::new();
        }

        let include_hidden = self.include_hidden;
        WalkDir::new(&self.dest_root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| include_hidden || !is_hidden(e))
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    None
                }
            })
            .filter(|e| !e.file_type().is_dir())
            .map(DirEntry::into_path)
            .filter(|p| !known.contains(p))
            .collect()
    }

    /// Remove empty directories below the destination root, deepest first
    pub fn prune_empty_dirs(&self) -> usize {
        let include_hidden = self.include_hidden;
        let mut removed = 0;
        let walker = WalkDir::new(&self.dest_root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_entry(move |e| include_hidden || !is_hidden(e))
            .filter_map(Result::ok);

        for entry in walker {
            // remove_dir refuses non-empty directories
            if entry.file_type().is_dir() && std::fs::remove_dir(entry.path()).is_ok() {
                debug!("Removed empty directory {}", entry.path().display());
                removed += 1;
            }
        }
        removed
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

fn absolutize(path: &Path) -> Result<PathBuf, SetupError> {
    if path.as_os_str().is_empty() {
        return Err(SetupError::InvalidConfig("empty directory path".to_string()));
    }
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|error| SetupError::Resolve { path: path.to_path_buf(), error })
}

/// Canonicalise the longest existing prefix of a path that may not exist yet
fn resolve_dest(path: &Path) -> Result<PathBuf, SetupError> {
    let absolute = absolutize(path)?;
    let mut existing = absolute.as_path();
    let mut missing: Vec<OsString> = Vec::new();

    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(absolute),
        }
    }

    let mut resolved = std::fs::canonicalize(existing)
        .map_err(|error| SetupError::Resolve { path: existing.to_path_buf(), error })?;
    for name in missing.iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}
