//! Filesystem helper endpoints for the UI's directory pickers.

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::is_subtitle_file;

use super::AppState;

#[derive(Debug, Deserialize)]
struct DirsQuery {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DirEntry {
    name: String,
    has_subdir: bool,
    subtitle_count: usize,
}

/// GET /utils/dirs — sub-directories of `path` with a peek inside each.
async fn list_dirs(Query(query): Query<DirsQuery>) -> Result<Json<Vec<DirEntry>>> {
    if query.path.is_empty() {
        return Err(Error::bad_request("path is required"));
    }
    let entries = std::fs::read_dir(&query.path)
        .map_err(|e| Error::bad_request(format!("read directory {}: {e}", query.path)))?;

    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let mut has_subdir = false;
        let mut subtitle_count = 0;
        if let Ok(children) = std::fs::read_dir(entry.path()) {
            for child in children.flatten() {
                match child.file_type() {
                    Ok(t) if t.is_dir() => has_subdir = true,
                    Ok(t) if t.is_file() => {
                        if is_subtitle_file(&child.file_name().to_string_lossy()) {
                            subtitle_count += 1;
                        }
                    }
                    _ => {}
                }
            }
        }
        dirs.push(DirEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            has_subdir,
            subtitle_count,
        });
    }
    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(dirs))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/utils/dirs", get(list_dirs))
}
