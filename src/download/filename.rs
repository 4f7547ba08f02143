//! Filename building, sanitization and parsing for downloaded media.
//!
//! Destination names follow `{id}_{title}_{quality}{ext}` (title optional).
//! The id prefix and quality suffix are what the
//! [`FileIndex`](crate::index::FileIndex) parses back to detect existing
//! downloads, so the two functions here must stay symmetric.

use std::path::{Component, Path};

use url::Url;

use crate::item::Quality;

/// Maximum title characters kept in a filename.
const MAX_TITLE_CHARS: usize = 60;

/// Extension used when the link does not carry one.
const DEFAULT_EXTENSION: &str = ".mp4";

/// Builds the destination file name for an item.
#[must_use]
pub fn build_filename(id: u64, title: Option<&str>, quality: Option<Quality>, link: &str) -> String {
    let extension = extension_from_url(link).unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    let mut name = id.to_string();

    if let Some(title) = title {
        let title = sanitize_filename_component(title);
        if !title.is_empty() {
            name.push('_');
            name.push_str(&title);
        }
    }
    if let Some(quality) = quality {
        name.push('_');
        name.push_str(quality.as_str());
    }
    name.push_str(&extension);
    name
}

/// Parses a file name produced by [`build_filename`].
///
/// Returns the id and, when present, the quality suffix. Partial files
/// (`.part`) and sidecars (`.json`) are ignored.
#[must_use]
pub fn parse_filename(name: &str) -> Option<(u64, Option<Quality>)> {
    let (stem, ext) = name.rsplit_once('.')?;
    if ext.eq_ignore_ascii_case("part") || ext.eq_ignore_ascii_case("json") {
        return None;
    }
    let digits_end = stem.find(|c: char| !c.is_ascii_digit()).unwrap_or(stem.len());
    if digits_end == 0 {
        return None;
    }
    let rest = &stem[digits_end..];
    if !rest.is_empty() && !rest.starts_with('_') {
        return None;
    }
    let id = stem[..digits_end].parse().ok()?;
    let quality = rest
        .rsplit_once('_')
        .and_then(|(_, tail)| tail.parse::<Quality>().ok());
    Some((id, quality))
}

/// Extracts a lowercased extension (with leading dot) from the last URL path segment.
pub(crate) fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

/// Sanitizes free text into a filename component: whitespace becomes `_`,
/// anything else outside `[A-Za-z0-9_-]` is dropped, and the result is
/// truncated.
pub(crate) fn sanitize_filename_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_underscore = false;
    for c in value.trim().chars() {
        if c.is_whitespace() || c == '_' {
            if !last_underscore && !out.is_empty() {
                out.push('_');
                last_underscore = true;
            }
        } else if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            last_underscore = false;
        }
        if out.chars().count() >= MAX_TITLE_CHARS {
            break;
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Sanitizes a filename for safe filesystem use.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
