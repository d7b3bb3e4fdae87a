//! Folder Expander (C11): walks a source catalog (a remote folder tree) into
//! a flat list of downloadable files, composing destination paths when
//! structure preservation is enabled.
//!
//! The [`CatalogSource`] trait is the seam external catalog backends plug
//! into: a `Send + Sync` trait dispatched as a `Box<dyn _>` through an
//! `async_trait` object, because native async traits are not object-safe
//! and this crate needs dynamic dispatch over backend implementations
//! chosen at runtime.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

/// Errors a [`CatalogSource`] backend can report.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog entry not found: {id}")]
    NotFound { id: String },

    #[error("catalog backend error: {0}")]
    Backend(String),
}

/// Whether a catalog entry is a folder (to be expanded) or a file (to be
/// queued as a download).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogNodeKind {
    Folder,
    File,
}

/// A single node in the source catalog, as reported by a [`CatalogSource`].
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub kind: CatalogNodeKind,
    /// Present for files; the URL to fetch.
    pub url: Option<String>,
    /// Present for files when known ahead of a probe.
    pub size: Option<u64>,
    pub modified_date: Option<i64>,
}

/// Backend contract for catalog sources (e.g. a remote file listing API).
/// Implementors resolve a single entry by id and list a folder's direct
/// children; the [`FolderExpander`] composes these into a recursive walk.
///
/// # Object Safety
///
/// Dispatched as `Box<dyn CatalogSource>` / `Arc<dyn CatalogSource>`;
/// `async_trait` is required because Rust 2024 native async traits are not
/// object-safe.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Resolves a single entry (file or folder) by id.
    async fn resolve(&self, id: &str) -> Result<CatalogEntry, CatalogError>;

    /// Lists the direct children of a folder entry.
    async fn list_folder(&self, folder_id: &str) -> Result<Vec<CatalogEntry>, CatalogError>;
}

/// One file discovered by a folder expansion, with its composed destination
/// path relative to the download root.
#[derive(Debug, Clone)]
pub struct ExpandedFile {
    pub entry: CatalogEntry,
    pub relative_path: PathBuf,
}

/// Summary of a completed folder expansion.
#[derive(Debug, Clone)]
pub struct ExpandResult {
    pub folder_title: String,
    pub total_files: usize,
    pub added: usize,
    pub skipped: usize,
    pub files: Vec<ExpandedFile>,
}

/// Recursively walks a catalog folder into a flat list of files, skipping
/// entries already present in an `already_queued` set so repeated
/// expansions of the same folder are idempotent.
pub struct FolderExpander<'a> {
    source: &'a dyn CatalogSource,
    preserve_structure: bool,
}

impl<'a> FolderExpander<'a> {
    #[must_use]
    pub fn new(source: &'a dyn CatalogSource, preserve_structure: bool) -> Self {
        Self {
            source,
            preserve_structure,
        }
    }

    /// Expands `folder_id`, skipping any entry whose id is already present
    /// in `already_queued`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] if the root folder or any nested folder
    /// cannot be resolved or listed.
    pub async fn expand(
        &self,
        folder_id: &str,
        already_queued: &HashSet<String>,
    ) -> Result<ExpandResult, CatalogError> {
        let root = self.source.resolve(folder_id).await?;
        let mut files = Vec::new();
        let mut skipped = 0usize;
        self.walk(&root, PathBuf::new(), already_queued, &mut files, &mut skipped)
            .await?;

        Ok(ExpandResult {
            folder_title: root.title,
            total_files: files.len() + skipped,
            added: files.len(),
            skipped,
            files,
        })
    }

    /// Boxed to allow recursion in an `async fn`: the compiler cannot size a
    /// self-referential future, so each recursive call is heap-allocated via
    /// `Box::pin` instead of pulling in a recursion-macro crate.
    fn walk<'f>(
        &'f self,
        node: &'f CatalogEntry,
        prefix: PathBuf,
        already_queued: &'f HashSet<String>,
        out: &'f mut Vec<ExpandedFile>,
        skipped: &'f mut usize,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CatalogError>> + Send + 'f>>
    {
        Box::pin(async move {
            match node.kind {
                CatalogNodeKind::File => {
                    if already_queued.contains(&node.id) {
                        *skipped += 1;
                        return Ok(());
                    }
                    let relative_path = if self.preserve_structure {
                        prefix.join(&node.title)
                    } else {
                        PathBuf::from(&node.title)
                    };
                    out.push(ExpandedFile {
                        entry: node.clone(),
                        relative_path,
                    });
                    Ok(())
                }
                CatalogNodeKind::Folder => {
                    let children = self.source.list_folder(&node.id).await?;
                    let child_prefix = if self.preserve_structure {
                        prefix.join(&node.title)
                    } else {
                        prefix
                    };
                    for child in &children {
                        self.walk(child, child_prefix.clone(), already_queued, out, skipped)
                            .await?;
                    }
                    Ok(())
                }
            }
        })
    }
}
