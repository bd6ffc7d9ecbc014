//! Knowledge-base filesystem access.
//!
//! Walks the internal and external roots, applies the include/exclude globs
//! and derives stable document IDs (`"<category>/<relative path>"`). Content
//! hashing lives here too, so the watcher and the workers agree on what
//! "changed" means.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::Config;
use crate::models::Category;

/// A candidate document found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub document_id: String,
    pub path: PathBuf,
    pub relative_path: String,
    pub file_name: String,
    pub category: Category,
    pub size: u64,
    pub modified_at: i64,
}

pub struct Scanner {
    roots: Vec<(Category, PathBuf)>,
    include_set: GlobSet,
    exclude_set: GlobSet,
    follow_symlinks: bool,
}

impl Scanner {
    pub fn from_config(config: &Config) -> Result<Self> {
        let kb = &config.knowledge_base;
        let include_set = build_globset(&kb.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/.DS_Store".to_string(),
            "**/~$*".to_string(),
            "**/*.tmp".to_string(),
            "**/*.swp".to_string(),
        ];
        default_excludes.extend(kb.exclude_globs.clone());
        let exclude_set = build_globset(&default_excludes)?;

        Ok(Self {
            roots: vec![
                (Category::Internal, kb.internal_root.clone()),
                (Category::External, kb.external_root.clone()),
            ],
            include_set,
            exclude_set,
            follow_symlinks: kb.follow_symlinks,
        })
    }

    /// Every eligible file under both roots, sorted by document ID.
    ///
    /// A missing root is an error rather than an empty listing, so an
    /// unmounted share never reads as "every document was deleted".
    pub fn scan(&self) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();

        for (category, root) in &self.roots {
            if !root.exists() {
                bail!(
                    "{} knowledge root does not exist: {}",
                    category,
                    root.display()
                );
            }

            let walker = WalkDir::new(root).follow_links(self.follow_symlinks);
            for entry in walker {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(root = %root.display(), error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                if self.nested_in_other_root(*category, entry.path()) {
                    continue;
                }
                let Some(relative) = self.eligible_relative(root, entry.path()) else {
                    continue;
                };

                let metadata = match entry.metadata() {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "cannot stat file");
                        continue;
                    }
                };
                entries.push(make_entry(*category, entry.path(), relative, &metadata));
            }
        }

        entries.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(entries)
    }

    /// Classify a single path. `None` when it is outside both roots or
    /// filtered out by the globs. Works for paths that no longer exist.
    pub fn classify(&self, path: &Path) -> Option<(Category, String)> {
        let mut best: Option<(Category, &PathBuf)> = None;
        for (category, root) in &self.roots {
            if path.starts_with(root)
                && best.map_or(true, |(_, b)| root.components().count() > b.components().count())
            {
                best = Some((*category, root));
            }
        }
        let (category, root) = best?;
        let relative = self.eligible_relative(root, path)?;
        Some((category, document_id(category, &relative)))
    }

    /// Stat an existing file and build its entry if it is eligible.
    pub fn entry_for(&self, path: &Path) -> Option<FileEntry> {
        let (category, _) = self.classify(path)?;
        let root = self
            .roots
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, r)| r)?;
        let relative = self.eligible_relative(root, path)?;
        let metadata = std::fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        Some(make_entry(category, path, relative, &metadata))
    }

    fn eligible_relative(&self, root: &Path, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(root).ok()?;
        let rel_str = relative_to_string(relative);
        if rel_str.is_empty() || self.exclude_set.is_match(&rel_str) {
            return None;
        }
        if !self.include_set.is_match(&rel_str) {
            return None;
        }
        Some(rel_str)
    }

    /// True when `path` belongs to the other root nested inside this one.
    fn nested_in_other_root(&self, category: Category, path: &Path) -> bool {
        let own = self.roots.iter().find(|(c, _)| *c == category);
        self.roots.iter().any(|(c, root)| {
            *c != category
                && path.starts_with(root)
                && own.is_some_and(|(_, own_root)| root.starts_with(own_root))
        })
    }
}

fn make_entry(
    category: Category,
    path: &Path,
    relative_path: String,
    metadata: &std::fs::Metadata,
) -> FileEntry {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    FileEntry {
        document_id: document_id(category, &relative_path),
        path: path.to_path_buf(),
        relative_path,
        file_name,
        category,
        size: metadata.len(),
        modified_at: modified_secs(metadata),
    }
}

/// `"<category>/<relative path>"` with `/` separators on every platform.
pub fn document_id(category: Category, relative_path: &str) -> String {
    format!("{}/{}", category.as_str(), relative_path)
}

fn relative_to_string(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn modified_secs(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a file's contents, streamed.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
