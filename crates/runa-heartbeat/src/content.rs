// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `HEARTBEAT.md` content handling.
//!
//! The wake gate only cares whether the file says anything actionable:
//! YAML front-matter and HTML-style comments are annotation, not content.

/// Strip a leading `---` … `---` YAML front-matter fence.
fn strip_front_matter(s: &str) -> &str {
    let rest = s.trim_start_matches('\n');
    let Some(after_open) = rest.strip_prefix("---") else {
        return s;
    };
    match after_open.find("\n---") {
        Some(close) => {
            let body = &after_open[close + 4..];
            // Skip the remainder of the closing fence line.
            match body.find('\n') {
                Some(nl) => &body[nl + 1..],
                None => "",
            }
        }
        None => s,
    }
}

/// Remove every `<!-- … -->` comment (unterminated comments run to EOF).
fn strip_html_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("<!--") {
        out.push_str(&rest[..open]);
        match rest[open..].find("-->") {
            Some(close) => rest = &rest[open + close + 3..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// The actionable content of a HEARTBEAT.md: front-matter and comments
/// removed, surrounding whitespace trimmed.
pub fn effective_content(raw: &str) -> String {
    strip_html_comments(strip_front_matter(raw)).trim().to_string()
}

/// True when the file carries no actionable content.
pub fn is_effectively_empty(raw: &str) -> bool {
    effective_content(raw).is_empty()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_content_passes_through() {
        assert_eq!(effective_content("check the deploys"), "check the deploys");
    }

    #[test]
    fn front_matter_is_stripped() {
        let raw = "---\nenabled: true\n---\ncheck things";
        assert_eq!(effective_content(raw), "check things");
    }

    #[test]
    fn front_matter_only_is_empty() {
        assert!(is_effectively_empty("---\nenabled: true\n---\n"));
    }

    #[test]
    fn html_comments_are_stripped() {
        let raw = "<!-- reminder to self -->\ncheck things\n<!-- done -->";
        assert_eq!(effective_content(raw), "check things");
    }

    #[test]
    fn comments_only_is_empty() {
        assert!(is_effectively_empty("<!-- nothing yet -->"));
        assert!(is_effectively_empty("<!-- a -->\n  <!-- b -->\n"));
    }

    #[test]
    fn unterminated_comment_runs_to_eof() {
        assert!(is_effectively_empty("<!-- forgot to close"));
        assert_eq!(effective_content("text <!-- forgot"), "text");
    }

    #[test]
    fn front_matter_and_comments_combined() {
        let raw = "---\na: 1\n---\n<!-- hidden -->\n";
        assert!(is_effectively_empty(raw));
    }

    #[test]
    fn whitespace_only_is_empty() {
        assert!(is_effectively_empty("   \n\n  "));
        assert!(is_effectively_empty(""));
    }

    #[test]
    fn dashes_inside_body_are_not_front_matter() {
        let raw = "check things\n---\nmore things";
        assert_eq!(effective_content(raw), raw);
    }
}
