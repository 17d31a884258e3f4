//! Font catalog: scans the font library, persists per-face metadata and
//! answers name lookups for the subsetter.
//!
//! Metadata comes from the font binaries themselves: every face of a
//! TTC/OTC collection is enumerated, names are read from the name table
//! (family, full and PostScript names, plus the Chinese variants fansub
//! scripts reference), weight and slant from the OS/2 table.
//!
//! `init` is guarded by a try-lock; a second concurrent initialization fails
//! fast instead of queueing. Lookups read a shared snapshot and never block
//! on initialization.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use ttf_parser::{name_id, PlatformId};
use walkdir::WalkDir;

use crate::db::fonts::FontMeta;
use crate::db::FontRepository;
use crate::error::{Error, Result};
use crate::util::is_font_file;

#[derive(Debug, Clone, Serialize)]
pub struct FontMetaSetStats {
    pub total: i64,
    #[serde(rename = "initDone")]
    pub init_done: bool,
}

pub struct FontCatalog {
    repo: FontRepository,
    font_dir: PathBuf,
    init_lock: Mutex<()>,
    init_done: AtomicBool,
    by_name: RwLock<Arc<HashMap<String, FontMeta>>>,
}

const SYSTEM_FONT_DIRS: &[&str] = &["/usr/share/fonts", "/usr/local/share/fonts"];

impl FontCatalog {
    pub fn new(font_dir: impl Into<PathBuf>, repo: FontRepository) -> Arc<Self> {
        Arc::new(Self {
            repo,
            font_dir: font_dir.into(),
            init_lock: Mutex::new(()),
            init_done: AtomicBool::new(false),
            by_name: RwLock::new(Arc::new(HashMap::new())),
        })
    }

    /// Rebuilds the catalog from the font library on disk.
    pub async fn init(&self, use_system_fonts: bool) -> Result<()> {
        let Ok(_guard) = self.init_lock.try_lock() else {
            return Err(Error::conflict(
                "font catalog is initializing, retry later",
            ));
        };

        let mut dirs = vec![self.font_dir.clone()];
        if use_system_fonts {
            dirs.extend(SYSTEM_FONT_DIRS.iter().map(PathBuf::from));
        }

        let mut metas = Vec::new();
        for dir in dirs {
            metas.extend(scan_fonts(&dir));
        }
        info!(faces = metas.len(), "font scan finished");

        self.repo.clear().await?;
        let mut by_name = HashMap::new();
        for meta in metas {
            self.repo.save(&meta).await?;
            index_meta(&mut by_name, &meta);
        }
        *self.by_name.write() = Arc::new(by_name);
        self.init_done.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Loads the persisted catalog into memory without rescanning.
    pub async fn warm(&self) -> Result<()> {
        let metas = self.repo.list().await?;
        if metas.is_empty() {
            return Ok(());
        }
        let mut by_name = HashMap::new();
        for meta in &metas {
            index_meta(&mut by_name, meta);
        }
        *self.by_name.write() = Arc::new(by_name);
        self.init_done.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn stats(&self) -> Result<FontMetaSetStats> {
        Ok(FontMetaSetStats {
            total: self.repo.count().await?,
            init_done: self.init_done.load(Ordering::SeqCst),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<FontMeta> {
        self.by_name.read().get(&name.to_lowercase()).cloned()
    }
}

fn index_meta(by_name: &mut HashMap<String, FontMeta>, meta: &FontMeta) {
    for key in [
        &meta.full_name,
        &meta.family,
        &meta.postscript_name,
        &meta.full_name_zh,
        &meta.family_zh,
    ] {
        if !key.is_empty() {
            by_name
                .entry(key.to_lowercase())
                .or_insert_with(|| meta.clone());
        }
    }
}

/// Windows-platform language IDs for the Chinese locales fansub scripts
/// reference fonts by.
fn is_chinese_language(platform_id: PlatformId, language_id: u16) -> bool {
    platform_id == PlatformId::Windows
        && matches!(language_id, 0x0804 | 0x0404 | 0x0C04 | 0x1004 | 0x1404)
}

const WINDOWS_ENGLISH_US: u16 = 0x0409;

/// One [`FontMeta`] per face, read from the font's own tables.
fn face_meta(data: &[u8], index: u32, path: &Path, kind: &str) -> Option<FontMeta> {
    let face = ttf_parser::Face::parse(data, index).ok()?;

    let mut meta = FontMeta {
        path: path.to_string_lossy().to_string(),
        face_index: index as i64,
        weight: face.weight().to_number() as i64,
        italic: face.is_italic(),
        kind: kind.to_string(),
        ..Default::default()
    };

    let names = face.names();
    for i in 0..names.len() {
        let Some(name) = names.get(i) else { continue };
        let Some(value) = name.to_string() else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let chinese = is_chinese_language(name.platform_id, name.language_id);
        let english = name.language_id == WINDOWS_ENGLISH_US;
        match name.name_id {
            name_id::FAMILY => {
                if chinese {
                    if meta.family_zh.is_empty() {
                        meta.family_zh = value;
                    }
                } else if meta.family.is_empty() || english {
                    meta.family = value;
                }
            }
            name_id::FULL_NAME => {
                if chinese {
                    if meta.full_name_zh.is_empty() {
                        meta.full_name_zh = value;
                    }
                } else if meta.full_name.is_empty() || english {
                    meta.full_name = value;
                }
            }
            name_id::POST_SCRIPT_NAME => {
                if meta.postscript_name.is_empty() || english {
                    meta.postscript_name = value;
                }
            }
            _ => {}
        }
    }

    // The catalog is unique on full name; a face without one is unusable.
    if meta.full_name.is_empty() {
        meta.full_name = meta.postscript_name.clone();
    }
    if meta.full_name.is_empty() {
        return None;
    }
    Some(meta)
}

fn font_kind(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("otf") | Some("otc") => "otf",
        _ => "ttf",
    }
}

fn font_metas_from_file(path: &Path) -> Vec<FontMeta> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "read font file failed");
            return Vec::new();
        }
    };
    let kind = font_kind(path);
    // TTC/OTC collections carry several faces; plain files carry one.
    let face_count = ttf_parser::fonts_in_collection(&data).unwrap_or(1);

    let mut metas = Vec::new();
    for index in 0..face_count {
        match face_meta(&data, index, path, kind) {
            Some(meta) => metas.push(meta),
            None => {
                warn!(path = %path.display(), index, "unreadable font face, skipped");
            }
        }
    }
    metas
}

pub(super) fn scan_fonts(dir: &Path) -> Vec<FontMeta> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut metas = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !is_font_file(&path.to_string_lossy()) {
            continue;
        }
        metas.extend(font_metas_from_file(path));
    }
    metas
}

/// In-memory overlay used for magnet tasks that ship their own fonts.
pub(super) fn scan_overlay(dir: &Path) -> HashMap<String, FontMeta> {
    let mut by_name = HashMap::new();
    for meta in scan_fonts(dir) {
        index_meta(&mut by_name, &meta);
    }
    by_name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_skips_files_that_are_not_fonts() {
        let pool = crate::db::open_test_db().await;
        let dir = tempfile::tempdir().unwrap();
        // Right extension, wrong content: the face parser rejects it.
        std::fs::write(dir.path().join("broken.ttf"), b"not a real font").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"not a font at all").unwrap();

        let catalog = FontCatalog::new(dir.path(), FontRepository::new(pool));
        catalog.init(false).await.unwrap();

        let stats = catalog.stats().await.unwrap();
        assert_eq!(stats.total, 0);
        assert!(stats.init_done);
    }

    #[tokio::test]
    async fn warm_indexes_persisted_faces_by_every_name() {
        let pool = crate::db::open_test_db().await;
        let repo = FontRepository::new(pool.clone());
        repo.save(&FontMeta {
            family: "Source Han Sans".to_string(),
            full_name: "Source Han Sans Bold".to_string(),
            postscript_name: "SourceHanSans-Bold".to_string(),
            family_zh: "思源黑体".to_string(),
            full_name_zh: "思源黑体 Bold".to_string(),
            path: "/data/fonts/SourceHanSans.ttc".to_string(),
            face_index: 2,
            weight: 700,
            italic: false,
            kind: "ttf".to_string(),
        })
        .await
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let catalog = FontCatalog::new(dir.path(), FontRepository::new(pool));
        catalog.warm().await.unwrap();

        // Full, family, PostScript and Chinese names all resolve the face.
        for key in [
            "source han sans bold",
            "Source Han Sans",
            "sourcehansans-bold",
            "思源黑体",
            "思源黑体 bold",
        ] {
            let meta = catalog.lookup(key).expect(key);
            assert_eq!(meta.face_index, 2);
            assert_eq!(meta.weight, 700);
        }
        assert!(catalog.lookup("missing font").is_none());
    }

    #[tokio::test]
    async fn concurrent_init_fails_fast() {
        let pool = crate::db::open_test_db().await;
        let dir = tempfile::tempdir().unwrap();
        let catalog = FontCatalog::new(dir.path(), FontRepository::new(pool));

        let _guard = catalog.init_lock.lock().await;
        let err = catalog.init(false).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn chinese_language_ids_cover_the_zh_locales() {
        for id in [0x0804, 0x0404, 0x0C04, 0x1004, 0x1404] {
            assert!(is_chinese_language(PlatformId::Windows, id));
        }
        assert!(!is_chinese_language(PlatformId::Windows, WINDOWS_ENGLISH_US));
        assert!(!is_chinese_language(PlatformId::Unicode, 0x0804));
    }

    #[test]
    fn font_kind_follows_extension() {
        assert_eq!(font_kind(Path::new("a.ttf")), "ttf");
        assert_eq!(font_kind(Path::new("a.TTC")), "ttf");
        assert_eq!(font_kind(Path::new("a.otf")), "otf");
        assert_eq!(font_kind(Path::new("a.otc")), "otf");
    }
}
