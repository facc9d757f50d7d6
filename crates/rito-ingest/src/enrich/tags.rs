//! Tag canonicalization.

use rito_core::VERIFIED_TAG;

/// Longest tag kept, in characters.
pub const MAX_TAG_CHARS: usize = 64;

/// Most tags kept per bookmark.
pub const MAX_TAGS: usize = 10;

/// Canonicalize user-supplied tags.
///
/// Trims, strips leading `#`, collapses internal whitespace, truncates to
/// [`MAX_TAG_CHARS`], drops empties, dedupes case-insensitively keeping the
/// first spelling, and keeps at most [`MAX_TAGS`]. `Verified` is reserved for
/// the pipeline and dropped in any casing.
pub fn canonicalize_tags(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len().min(MAX_TAGS));

    for tag in raw {
        let stripped = tag.trim().trim_start_matches('#');
        let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
        let name: String = collapsed.chars().take(MAX_TAG_CHARS).collect();
        let name = name.trim_end().to_string();

        if name.is_empty() || name.eq_ignore_ascii_case(VERIFIED_TAG) {
            continue;
        }

        let lower = name.to_lowercase();
        if out.iter().any(|t| t.to_lowercase() == lower) {
            continue;
        }

        out.push(name);
        if out.len() == MAX_TAGS {
            break;
        }
    }

    out
}
