//! ASS subtitle font embedding.
//!
//! Collects the faces a script references (`Style:` lines plus inline `\fn`
//! overrides), resolves them through the catalog and writes a copy carrying
//! the fonts as `[Fonts]` attachments in the standard UUEncoding. Scripts
//! that already carry the subset marker, reference no known fonts, or are
//! not ASS at all come back untouched.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Reloadable;
use crate::db::fonts::FontMeta;
use crate::error::{Error, Result};

use super::catalog::{scan_overlay, FontCatalog};
use super::{is_subset_file, subset_path, Subsetter};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontSubsetterConfig {
    /// Allow OpenType faces, not just TrueType.
    #[serde(default = "default_true")]
    pub use_otf: bool,
    /// Fall back to a family-name match when the full name is unknown.
    #[serde(default = "default_true")]
    pub use_similar_font: bool,
    /// Also scan the system font directories during catalog init.
    #[serde(default)]
    pub use_system_fonts_dir: bool,
    /// Re-embed even when the script already has a `[Fonts]` section.
    #[serde(default)]
    pub cover_exist_sub_font: bool,
    /// Write a `.subset` sibling instead of rewriting in place.
    #[serde(default = "default_true")]
    pub generate_new_file: bool,
}

impl Default for FontSubsetterConfig {
    fn default() -> Self {
        Self {
            use_otf: true,
            use_similar_font: true,
            use_system_fonts_dir: false,
            cover_exist_sub_font: false,
            generate_new_file: true,
        }
    }
}

pub struct AssSubsetter {
    catalog: Arc<FontCatalog>,
    config: RwLock<FontSubsetterConfig>,
    overlay: Option<HashMap<String, FontMeta>>,
}

impl AssSubsetter {
    pub fn new(catalog: Arc<FontCatalog>, config: FontSubsetterConfig) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            config: RwLock::new(config),
            overlay: None,
        })
    }

    pub async fn init_font_meta_set(&self) -> Result<()> {
        let use_system = self.config.read().use_system_fonts_dir;
        self.catalog.init(use_system).await
    }

    pub async fn stats(&self) -> Result<super::FontMetaSetStats> {
        self.catalog.stats().await
    }

    fn resolve(&self, name: &str) -> Option<FontMeta> {
        let config = self.config.read();
        let lookup = |key: &str| {
            self.overlay
                .as_ref()
                .and_then(|overlay| overlay.get(&key.to_lowercase()).cloned())
                .or_else(|| self.catalog.lookup(key))
        };
        let mut meta = lookup(name);
        if meta.is_none() && config.use_similar_font {
            // `Source Han Sans Bold` -> try the bare family.
            if let Some(family) = name.split_whitespace().next() {
                meta = lookup(family);
            }
        }
        let meta = meta?;
        if meta.kind == "otf" && !config.use_otf {
            return None;
        }
        Some(meta)
    }
}

#[async_trait::async_trait]
impl Subsetter for AssSubsetter {
    async fn subset_font(&self, path: &Path) -> Result<PathBuf> {
        let name = path.to_string_lossy();
        if is_subset_file(&name) {
            info!(file = %path.display(), "already a subset file, skipping");
            return Ok(path.to_path_buf());
        }
        let is_ass = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("ass") | Some("ssa")
        );
        if !is_ass {
            return Ok(path.to_path_buf());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("read subtitle: {e}")))?;

        if content.contains("[Fonts]") && !self.config.read().cover_exist_sub_font {
            info!(file = %path.display(), "fonts already embedded, skipping");
            return Ok(path.to_path_buf());
        }

        let referenced = referenced_fonts(&content);
        let mut resolved = Vec::new();
        for name in &referenced {
            match self.resolve(name) {
                Some(meta) => resolved.push(meta),
                None => warn!(font = %name, "referenced font not in catalog"),
            }
        }
        resolved.sort_by(|a, b| a.path.cmp(&b.path));
        resolved.dedup_by(|a, b| a.path == b.path);
        if resolved.is_empty() {
            return Ok(path.to_path_buf());
        }

        let mut fonts_section = String::from("\n[Fonts]\n");
        for meta in &resolved {
            let data = tokio::fs::read(&meta.path)
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!("read font {}: {e}", meta.path)))?;
            let attachment_name = format!(
                "{}_0.{}",
                meta.postscript_name.to_lowercase(),
                if meta.kind == "otf" { "otf" } else { "ttf" }
            );
            fonts_section.push_str(&format!("fontname: {attachment_name}\n"));
            fonts_section.push_str(&uu_encode(&data));
            fonts_section.push('\n');
        }

        let target = if self.config.read().generate_new_file {
            subset_path(path)
        } else {
            path.to_path_buf()
        };
        let output = format!("{content}{fonts_section}");
        tokio::fs::write(&target, output)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("write subset file: {e}")))?;
        info!(
            file = %path.display(),
            subset = %target.display(),
            fonts = resolved.len(),
            "fonts embedded"
        );
        Ok(target)
    }

    async fn using_temp_font_dir(&self, dir: &Path) -> Result<Arc<dyn Subsetter>> {
        let mut overlay = scan_overlay(dir);
        if let Some(existing) = &self.overlay {
            for (key, value) in existing {
                overlay.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Ok(Arc::new(AssSubsetter {
            catalog: self.catalog.clone(),
            config: RwLock::new(self.config.read().clone()),
            overlay: Some(overlay),
        }))
    }
}

impl Reloadable for AssSubsetter {
    fn reload(&self, config: serde_yaml::Value) -> anyhow::Result<()> {
        let config: FontSubsetterConfig = serde_yaml::from_value(config)?;
        *self.config.write() = config;
        Ok(())
    }
}

/// Font names referenced by the script: the second field of every `Style:`
/// line plus inline `\fn` overrides. A leading `@` (vertical layout) is not
/// part of the face name.
fn referenced_fonts(content: &str) -> BTreeSet<String> {
    static FN_OVERRIDE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let fn_override =
        FN_OVERRIDE.get_or_init(|| Regex::new(r"\\fn([^\\}]+)").unwrap());

    let mut fonts = BTreeSet::new();
    for line in content.lines() {
        let line = line.trim();
        if let Some(style) = line.strip_prefix("Style:") {
            if let Some(font) = style.split(',').nth(1) {
                let font = font.trim().trim_start_matches('@');
                if !font.is_empty() {
                    fonts.insert(font.to_string());
                }
            }
        } else if line.starts_with("Dialogue:") {
            for caps in fn_override.captures_iter(line) {
                let font = caps.get(1).unwrap().as_str().trim().trim_start_matches('@');
                if !font.is_empty() {
                    fonts.insert(font.to_string());
                }
            }
        }
    }
    fonts
}

/// The ASS attachment encoding: 3 bytes become 4 characters offset from
/// `!` (33), lines wrap at 80 characters.
fn uu_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4 / 3 + data.len() / 60 + 4);
    let mut line_len = 0;
    let mut push = |c: char, out: &mut String, line_len: &mut usize| {
        out.push(c);
        *line_len += 1;
        if *line_len == 80 {
            out.push('\n');
            *line_len = 0;
        }
    };

    for chunk in data.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let group = (b0 << 16) | (b1 << 8) | b2;
        let chars = [
            (group >> 18) & 0x3f,
            (group >> 12) & 0x3f,
            (group >> 6) & 0x3f,
            group & 0x3f,
        ];
        let emit = match chunk.len() {
            3 => 4,
            2 => 3,
            _ => 2,
        };
        for &value in chars.iter().take(emit) {
            push(char::from_u32(value + 33).unwrap(), &mut out, &mut line_len);
        }
    }
    if line_len != 0 {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FontRepository;

    const SCRIPT: &str = "\
[Script Info]
Title: test

[V4+ Styles]
Format: Name, Fontname, Fontsize
Style: Default,Source Han Sans,48
Style: Sign,@Other Font,32

[Events]
Dialogue: 0,0:00:00.00,0:00:01.00,Default,,0,0,0,,{\\fnSpecial Font}hello
";

    #[test]
    fn collects_styles_and_overrides() {
        let fonts = referenced_fonts(SCRIPT);
        assert!(fonts.contains("Source Han Sans"));
        assert!(fonts.contains("Other Font"));
        assert!(fonts.contains("Special Font"));
        assert_eq!(fonts.len(), 3);
    }

    #[test]
    fn uu_encoding_offsets_from_bang() {
        // 0x00 0x00 0x00 -> four `!` characters.
        assert_eq!(uu_encode(&[0, 0, 0]).trim_end(), "!!!!");
        // Trailing short chunk emits len+1 characters.
        assert_eq!(uu_encode(&[0]).trim_end().len(), 2);
        assert_eq!(uu_encode(&[0, 0]).trim_end().len(), 3);
    }

    async fn subsetter_with_font(
        dir: &Path,
    ) -> Arc<AssSubsetter> {
        let pool = crate::db::open_test_db().await;
        let font_path = dir.join("SourceHanSans.ttf");
        std::fs::write(&font_path, b"fontbytes").unwrap();

        // Register the face directly; catalog scanning of real binaries is
        // covered by the catalog tests.
        let repo = FontRepository::new(pool.clone());
        repo.save(&crate::db::fonts::FontMeta {
            family: "SourceHanSans".to_string(),
            full_name: "SourceHanSans".to_string(),
            postscript_name: "SourceHanSans".to_string(),
            path: font_path.to_string_lossy().to_string(),
            weight: 400,
            kind: "ttf".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let catalog = FontCatalog::new(dir, FontRepository::new(pool));
        catalog.warm().await.unwrap();
        AssSubsetter::new(catalog, FontSubsetterConfig::default())
    }

    #[tokio::test]
    async fn embeds_known_fonts_into_subset_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let subsetter = subsetter_with_font(dir.path()).await;

        let script = dir.path().join("ep01.zh.ass");
        std::fs::write(&script, "Style: Default,SourceHanSans,48\n").unwrap();

        let out = subsetter.subset_font(&script).await.unwrap();
        assert_eq!(out, dir.path().join("ep01.subset.zh.ass"));
        let content = std::fs::read_to_string(out).unwrap();
        assert!(content.contains("[Fonts]"));
        assert!(content.contains("fontname: sourcehansans_0.ttf"));
    }

    #[tokio::test]
    async fn unknown_fonts_leave_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let subsetter = subsetter_with_font(dir.path()).await;

        let script = dir.path().join("ep02.ass");
        std::fs::write(&script, "Style: Default,Nonexistent Face,48\n").unwrap();

        let out = subsetter.subset_font(&script).await.unwrap();
        assert_eq!(out, script);
        assert!(!dir.path().join("ep02.subset.ass").exists());
    }

    #[tokio::test]
    async fn subset_files_are_not_reprocessed() {
        let dir = tempfile::tempdir().unwrap();
        let subsetter = subsetter_with_font(dir.path()).await;
        let script = dir.path().join("ep03.subset.ass");
        std::fs::write(&script, "Style: Default,SourceHanSans,48\n").unwrap();
        assert_eq!(subsetter.subset_font(&script).await.unwrap(), script);
    }

    #[tokio::test]
    async fn non_subtitle_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let subsetter = subsetter_with_font(dir.path()).await;
        let srt = dir.path().join("ep04.srt");
        std::fs::write(&srt, "1\n00:00:00,000 --> 00:00:01,000\nhello\n").unwrap();
        assert_eq!(subsetter.subset_font(&srt).await.unwrap(), srt);
    }
}
