//! Episode number extraction from release file names.
//!
//! Fansub naming is loosely structured: `[Group] Title - 05 [1080p]`,
//! `Title S02E05`, `Title 第5話` and friends. The generic parser tries the
//! specific shapes first; subscriptions with odd naming carry an explicit
//! `{ep}` location template instead.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

fn file_base(file_name: &str) -> &str {
    file_name.rsplit('/').next().unwrap_or(file_name)
}

/// Leading bracket tag of a release title, conventionally the group.
pub fn parse_release_group(name: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"^[\[【]([^\]】]+)[\]】]").unwrap());
    re.captures(name)
        .map(|caps| caps.get(1).unwrap().as_str().trim().to_string())
        .unwrap_or_default()
}

/// Show title: the first free-text run once group tags and episode markers
/// are stripped.
pub fn parse_anime_title(name: &str) -> Option<String> {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    static EPISODE_TAIL: OnceLock<Regex> = OnceLock::new();
    let tags = TAGS.get_or_init(|| Regex::new(r"[\[【][^\]】]*[\]】]").unwrap());
    let episode_tail = EPISODE_TAIL
        .get_or_init(|| Regex::new(r"(?i)(\s+-\s+\d{1,4}.*|\s+S\d{1,2}E\d{1,4}.*|\s+第.*)$").unwrap());

    let stripped = tags.replace_all(file_base(name), " ");
    let stripped = episode_tail.replace(stripped.trim(), "");
    let title = stripped.trim().trim_matches('-').trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// `(season, episode)` for a media file; season defaults to 1 when the name
/// carries no season marker.
pub fn parse_file_episode(file_name: &str) -> Result<(i64, i64)> {
    static SEASON_EPISODE: OnceLock<Regex> = OnceLock::new();
    let re = SEASON_EPISODE
        .get_or_init(|| Regex::new(r"(?i)S(\d{1,2})\s*E(\d{1,4})").unwrap());
    let base = file_base(file_name);
    if let Some(caps) = re.captures(base) {
        let season = caps.get(1).unwrap().as_str().parse().unwrap_or(1);
        let episode = caps.get(2).unwrap().as_str().parse().unwrap_or(0);
        return Ok((season, episode));
    }
    Ok((1, parse_episode(file_name)?))
}

/// First episode-number token of the file name.
pub fn parse_episode(file_name: &str) -> Result<i64> {
    static SEASON_EPISODE: OnceLock<Regex> = OnceLock::new();
    static CHINESE_MARKER: OnceLock<Regex> = OnceLock::new();
    static DASH_NUMBER: OnceLock<Regex> = OnceLock::new();
    static BRACKET_NUMBER: OnceLock<Regex> = OnceLock::new();
    static EP_PREFIX: OnceLock<Regex> = OnceLock::new();

    let base = file_base(file_name);

    let season_episode = SEASON_EPISODE
        .get_or_init(|| Regex::new(r"(?i)S\d{1,2}\s*E(\d{1,4})").unwrap());
    if let Some(caps) = season_episode.captures(base) {
        return Ok(caps.get(1).unwrap().as_str().parse().unwrap_or(0));
    }

    let chinese_marker = CHINESE_MARKER.get_or_init(|| {
        Regex::new(r"第\s*(\d{1,4}|[一二三四五六七八九十百千]+)\s*[話话集]").unwrap()
    });
    if let Some(caps) = chinese_marker.captures(base) {
        let token = caps.get(1).unwrap().as_str();
        if let Ok(episode) = token.parse() {
            return Ok(episode);
        }
        if let Some(episode) = chinese_numeral(token) {
            return Ok(episode);
        }
    }

    // `Title - 05`, `Title - 05v2`; the trailing class keeps `- 1080p` out.
    let dash_number = DASH_NUMBER
        .get_or_init(|| Regex::new(r"-\s*(\d{1,4})(?:v\d+)?\s*(?:[\[\(\.\s]|$)").unwrap());
    if let Some(caps) = dash_number.captures(base) {
        return Ok(caps.get(1).unwrap().as_str().parse().unwrap_or(0));
    }

    let bracket_number = BRACKET_NUMBER
        .get_or_init(|| Regex::new(r"[\[\(](\d{1,4})(?:v\d+)?[\]\)]").unwrap());
    if let Some(caps) = bracket_number.captures(base) {
        return Ok(caps.get(1).unwrap().as_str().parse().unwrap_or(0));
    }

    let ep_prefix =
        EP_PREFIX.get_or_init(|| Regex::new(r"(?i)\bEP?\.?\s*(\d{1,4})\b").unwrap());
    if let Some(caps) = ep_prefix.captures(base) {
        return Ok(caps.get(1).unwrap().as_str().parse().unwrap_or(0));
    }

    Err(Error::bad_request(format!(
        "could not recognise an episode number in `{base}`"
    )))
}

/// Episode extraction through a user template: the literal text is escaped
/// and `{ep}` becomes the capture group.
pub fn parse_episode_with_location(name: &str, location: &str) -> Result<i64> {
    let pattern = regex::escape(location).replace(
        r"\{ep\}",
        r"(\d{1,4}|[一二三四五六七八九十百千]+)",
    );
    let re = Regex::new(&pattern)
        .map_err(|e| Error::bad_request(format!("invalid episode location template: {e}")))?;
    let caps = re.captures(name).ok_or_else(|| {
        Error::bad_request(format!("episode location `{location}` did not match `{name}`"))
    })?;
    let token = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    if let Ok(episode) = token.parse() {
        return Ok(episode);
    }
    chinese_numeral(token)
        .ok_or_else(|| Error::bad_request(format!("could not convert episode token `{token}`")))
}

/// Converts 一二三…十百千 compositions (十二 = 12, 二百五 = 250-style forms
/// excluded, plain 二百零五 unsupported; fansub numbering stays small).
fn chinese_numeral(s: &str) -> Option<i64> {
    let digit = |c: char| match c {
        '一' => Some(1),
        '二' => Some(2),
        '三' => Some(3),
        '四' => Some(4),
        '五' => Some(5),
        '六' => Some(6),
        '七' => Some(7),
        '八' => Some(8),
        '九' => Some(9),
        _ => None,
    };
    let unit = |c: char| match c {
        '十' => Some(10),
        '百' => Some(100),
        '千' => Some(1000),
        _ => None,
    };

    let mut total = 0i64;
    let mut current = 0i64;
    let mut any = false;
    for c in s.chars() {
        if let Some(d) = digit(c) {
            current = d;
            any = true;
        } else if let Some(u) = unit(c) {
            total += if current == 0 { 1 } else { current } * u;
            current = 0;
            any = true;
        } else {
            return None;
        }
    }
    any.then_some(total + current)
}
