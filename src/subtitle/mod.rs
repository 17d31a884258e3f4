//! Subtitle font embedding.
//!
//! [`Subsetter`] is the contract the transfer engine programs against: feed
//! it any subtitle path and get back either the same path (nothing to do) or
//! a sibling whose base name gained `.subset` before all extensions. The
//! shipped implementation resolves the faces an ASS script references
//! through the font catalog and embeds them as `[Fonts]` attachments.

pub mod ass;
pub mod catalog;

pub use ass::{AssSubsetter, FontSubsetterConfig};
pub use catalog::{FontCatalog, FontMetaSetStats};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;

/// Marker inserted before the first file-name extension of generated files;
/// its presence is how the transfer engine avoids re-subsetting.
pub const SUBSET_EXT: &str = ".subset";

#[async_trait::async_trait]
pub trait Subsetter: Send + Sync {
    /// Embeds fonts into the subtitle at `path`. Returns the same path when
    /// there is nothing to embed or the file is already a subset.
    async fn subset_font(&self, path: &Path) -> Result<PathBuf>;

    /// A view layering the fonts found under `dir` over the persistent
    /// catalog, used while transferring a magnet task that shipped its own
    /// font files.
    async fn using_temp_font_dir(&self, dir: &Path) -> Result<Arc<dyn Subsetter>>;
}

/// `file.zh.ass` -> `file.subset.zh.ass`.
pub fn subset_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let extensions = crate::util::all_extensions(file_name);
    let base = &file_name[..file_name.len() - extensions.len()];
    path.with_file_name(format!("{base}{SUBSET_EXT}{extensions}"))
}

/// Whether a file already carries the subset marker.
pub fn is_subset_file(path: &str) -> bool {
    path.contains(SUBSET_EXT)
}
