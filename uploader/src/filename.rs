use chrono::{DateTime, Utc};

const FALLBACK_NAME: &str = "video";

fn allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-'
}

fn clean_part(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        let c = if allowed(c) { c } else { '_' };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }

    out.trim_matches('_').to_string()
}

/// Replace everything outside `[A-Za-z0-9.-]` with `_`, without repeated `_`
/// and without `_` at the edges of the name or of its extension.
/// `"my video!.webm"` becomes `"my_video.webm"`.
pub fn sanitize_filename(filename: &str) -> String {
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    };

    let mut stem = clean_part(stem);
    if stem.is_empty() {
        stem = FALLBACK_NAME.to_string();
    }

    match ext.map(clean_part).filter(|e| !e.is_empty()) {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    }
}

/// Remote object path: `videos/{user}/{timestamp}_{filename}`, the timestamp
/// being ISO-8601 UTC with `:` and `.` turned into `-`.
pub fn storage_path(user_id: &str, now: DateTime<Utc>, filename: &str) -> String {
    format!(
        "videos/{}/{}_{}",
        user_id,
        now.format("%Y-%m-%dT%H-%M-%S-%3fZ"),
        sanitize_filename(filename)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn replaces_and_collapses() {
        assert_eq!(sanitize_filename("my video!.webm"), "my_video.webm");
        assert_eq!(sanitize_filename("a  b##c.mp4"), "a_b_c.mp4");
        assert_eq!(sanitize_filename("__lead and trail__.webm"), "lead_and_trail.webm");
    }

    #[test]
    fn keeps_allowed_characters() {
        assert_eq!(sanitize_filename("clip-01.v2.webm"), "clip-01.v2.webm");
    }

    #[test]
    fn handles_degenerate_names() {
        assert_eq!(sanitize_filename("!!!.webm"), "video.webm");
        assert_eq!(sanitize_filename("no extension here"), "no_extension_here");
        assert_eq!(sanitize_filename(".hidden"), ".hidden");
        assert_eq!(sanitize_filename("été.webm"), "t.webm");
    }

    #[test]
    fn builds_storage_path() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 12, 30, 45).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(
            storage_path("user-1", now, "my video!.webm"),
            "videos/user-1/2024-01-15T12-30-45-123Z_my_video.webm"
        );
    }
}
