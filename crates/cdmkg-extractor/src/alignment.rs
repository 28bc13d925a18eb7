//! Locating reported evidence spans in their segment

use std::ops::Range;

use cdmkg_core::{Alignment, Segment};

/// Find `evidence` in `segment`
///
/// The returned range is in byte offsets of the full source text, like
/// [`Segment::source_range`]. A verbatim occurrence wins; otherwise the
/// span is searched again with whitespace collapsed and case ignored.
pub fn align(segment: &Segment, evidence: &str) -> (Alignment, Option<Range<usize>>) {
    let evidence = evidence.trim();
    if evidence.is_empty() {
        return (Alignment::Unaligned, None);
    }

    if let Some(offset) = segment.text.find(evidence) {
        let start = segment.start + offset;
        return (Alignment::Exact, Some(start..start + evidence.len()));
    }

    match find_normalized(&segment.text, evidence) {
        Some(span) => (
            Alignment::Fuzzy,
            Some(segment.start + span.start..segment.start + span.end),
        ),
        None => (Alignment::Unaligned, None),
    }
}

/// Case-folded characters with whitespace runs collapsed to one space,
/// each paired with the byte range it came from
fn normalize(text: &str) -> Vec<(char, Range<usize>)> {
    let mut normalized = Vec::with_capacity(text.len());
    let mut space: Option<Range<usize>> = None;

    for (i, c) in text.char_indices() {
        let range = i..i + c.len_utf8();
        if c.is_whitespace() {
            space = Some(match space {
                Some(run) => run.start..range.end,
                None => range,
            });
            continue;
        }

        // Leading and trailing runs are dropped
        if let Some(run) = space.take() {
            if !normalized.is_empty() {
                normalized.push((' ', run));
            }
        }
        for folded in c.to_lowercase() {
            normalized.push((folded, range.clone()));
        }
    }
    normalized
}

fn find_normalized(haystack: &str, needle: &str) -> Option<Range<usize>> {
    let haystack = normalize(haystack);
    let needle: Vec<char> = normalize(needle).into_iter().map(|(c, _)| c).collect();
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }

    haystack
        .windows(needle.len())
        .find(|window| window.iter().map(|(c, _)| c).eq(needle.iter()))
        .map(|window| window[0].1.start..window[window.len() - 1].1.end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment() -> Segment {
        Segment::new(
            6,
            1000,
            "MILESTONE 7 In-Block\nDefinition AIBT -\nActual  In-Block Time\nACARS = IN",
        )
    }

    #[test]
    fn test_exact_span() {
        let segment = segment();
        let (alignment, span) = align(&segment, "ACARS = IN");
        assert_eq!(alignment, Alignment::Exact);

        let span = span.unwrap();
        let local = span.start - segment.start..span.end - segment.start;
        assert_eq!(&segment.text[local], "ACARS = IN");
    }

    #[test]
    fn test_fuzzy_span_ignores_case_and_line_breaks() {
        let segment = segment();
        let (alignment, span) = align(&segment, "definition AIBT - actual in-block time");
        assert_eq!(alignment, Alignment::Fuzzy);

        let span = span.unwrap();
        let local = span.start - segment.start..span.end - segment.start;
        assert_eq!(
            &segment.text[local],
            "Definition AIBT -\nActual  In-Block Time"
        );
    }

    #[test]
    fn test_unaligned_evidence() {
        let segment = segment();
        assert_eq!(align(&segment, "Take Off from outstation"), (Alignment::Unaligned, None));
        assert_eq!(align(&segment, "   "), (Alignment::Unaligned, None));
    }
}
