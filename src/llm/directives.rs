//! Bracketed tags in reply text
//!
//! `[IMAGE: a scene description]` asks for an image. It is hidden from the
//! displayed reply and from the stored message. Any other bracketed tag (e.g.
//! `[laugh]`) stays visible but is never spoken.

use regex::Regex;
use std::sync::LazyLock;

const IMAGE_PREFIX: &str = "[IMAGE:";

/// Tags longer than this are treated as plain text
const MAX_TAG_LEN: usize = 600;

static IMAGE_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[IMAGE:\s*([^\]]+)\]").expect("valid image directive regex")
});

static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]+\]").expect("valid tag regex"));

/// Every image description requested in `text`, in order
pub fn find_image_directives(text: &str) -> Vec<String> {
    IMAGE_DIRECTIVE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Remove image directives, keeping every other tag
pub fn strip_image_directives(text: &str) -> String {
    IMAGE_DIRECTIVE.replace_all(text, "").trim().to_string()
}

/// Remove all bracketed tags before synthesis
pub fn strip_tags(text: &str) -> String {
    let stripped = ANY_TAG.replace_all(text, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Result of feeding one delta through the scanner
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanOutput {
    /// Text safe to show the user
    pub display: String,
    /// Image descriptions completed by this delta
    pub directives: Vec<String>,
}

/// Streaming scanner that holds back a possible `[IMAGE: ...]` tag until it
/// closes, so a directive split across tokens never leaks into the display.
#[derive(Clone, Debug, Default)]
pub struct DirectiveScanner {
    /// Text from an unclosed `[` that may still become an image directive
    held: String,
}

impl DirectiveScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, delta: &str) -> ScanOutput {
        let mut out = ScanOutput::default();

        for ch in delta.chars() {
            if self.held.is_empty() {
                if ch == '[' {
                    self.held.push(ch);
                } else {
                    out.display.push(ch);
                }
                continue;
            }

            self.held.push(ch);
            if ch == ']' {
                let tag = std::mem::take(&mut self.held);
                match find_image_directives(&tag).into_iter().next() {
                    Some(description) => out.directives.push(description),
                    None => out.display.push_str(&tag),
                }
            } else if !could_be_image_tag(&self.held) || self.held.len() > MAX_TAG_LEN {
                out.display.push_str(&std::mem::take(&mut self.held));
            }
        }

        out
    }

    /// Release anything still held at the end of the reply
    pub fn flush(&mut self) -> ScanOutput {
        ScanOutput {
            display: std::mem::take(&mut self.held),
            directives: Vec::new(),
        }
    }
}

/// Whether `held` is still a case-insensitive prefix of `[IMAGE:` or extends it
fn could_be_image_tag(held: &str) -> bool {
    let n = held.len().min(IMAGE_PREFIX.len());
    held.is_char_boundary(n) && held[..n].eq_ignore_ascii_case(&IMAGE_PREFIX[..n])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(deltas: &[&str]) -> ScanOutput {
        let mut scanner = DirectiveScanner::new();
        let mut total = ScanOutput::default();
        for delta in deltas {
            let out = scanner.feed(delta);
            total.display.push_str(&out.display);
            total.directives.extend(out.directives);
        }
        total.display.push_str(&scanner.flush().display);
        total
    }

    #[test]
    fn test_find_directives() {
        let text = "Here you go! [IMAGE: smiling at camera, beach] And [image:sunset]";
        assert_eq!(
            find_image_directives(text),
            vec!["smiling at camera, beach", "sunset"]
        );
        assert!(find_image_directives("no images [laugh]").is_empty());
    }

    #[test]
    fn test_strip_helpers() {
        assert_eq!(
            strip_image_directives("Sure! [IMAGE: selfie] [laugh]"),
            "Sure!  [laugh]"
        );
        assert_eq!(strip_tags("Sure! [IMAGE: selfie] [laugh] Enjoy."), "Sure! Enjoy.");
    }

    #[test]
    fn test_scanner_hides_split_directive() {
        let out = scan_all(&["Here is one ", "[IMA", "GE: red ", "dress, studio]", " done."]);
        assert_eq!(out.display, "Here is one  done.");
        assert_eq!(out.directives, vec!["red dress, studio"]);
    }

    #[test]
    fn test_scanner_passes_other_tags_through() {
        let out = scan_all(&["Ha [la", "ugh] that's [1] funny"]);
        assert_eq!(out.display, "Ha [laugh] that's [1] funny");
        assert!(out.directives.is_empty());
    }

    #[test]
    fn test_scanner_releases_unclosed_tag_on_flush() {
        let out = scan_all(&["Look [IMAGE: never closed"]);
        assert_eq!(out.display, "Look [IMAGE: never closed");
        assert!(out.directives.is_empty());
    }

    #[test]
    fn test_scanner_empty_directive_is_displayed() {
        let out = scan_all(&["[IMAGE:]"]);
        assert_eq!(out.display, "[IMAGE:]");
        assert!(out.directives.is_empty());
    }
}
