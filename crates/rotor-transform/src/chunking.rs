/// Tunable fake-stream chunking policy. The contract is fixed (chunks
/// reassemble exactly, cuts never land inside a code point, more than one
/// meaningfully-sized chunk for long text); the sizes are not.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPolicy {
    /// Upper bound on the number of emitted segments.
    pub max_segments: usize,
    /// A segment is only split off once at least this many chars remain.
    pub min_chunk_chars: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_segments: 12,
            min_chunk_chars: 40,
        }
    }
}

/// Split `text` into at most `policy.max_segments` pieces of roughly even
/// size, preferring to cut just after whitespace or punctuation near the
/// target length. Concatenating the pieces in order reproduces `text`
/// exactly.
pub fn split_chunks(text: &str, policy: &ChunkPolicy) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    let min_chunk = policy.min_chunk_chars.max(1);
    let max_segments = policy.max_segments.max(1);
    let total_chars = text.chars().count();
    let segments = total_chars.div_ceil(min_chunk).clamp(1, max_segments);
    let target_chars = total_chars.div_ceil(segments);

    let mut chunks = Vec::with_capacity(segments);
    let mut rest = text;
    let mut rest_chars = total_chars;
    while rest_chars > 0 {
        if chunks.len() + 1 == segments || rest_chars <= target_chars {
            chunks.push(rest.to_string());
            break;
        }
        let cut = cut_index(rest, target_chars);
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.to_string());
        rest_chars -= head.chars().count();
        rest = tail;
    }
    chunks
}

/// Byte index to cut at: the char boundary closest to `target_chars` whose
/// preceding char is whitespace or punctuation, searched backward then
/// forward within half a target length; falls back to the target boundary
/// itself. Always a valid char boundary, never 0 or `text.len()` unless the
/// text is that short.
fn cut_index(text: &str, target_chars: usize) -> usize {
    let mut boundaries: Vec<usize> = text.char_indices().map(|(idx, _)| idx).collect();
    boundaries.push(text.len());
    let total = boundaries.len() - 1;
    let target = target_chars.clamp(1, total);
    if target == total {
        return text.len();
    }

    let breaks_after = |k: usize| {
        text[boundaries[k - 1]..boundaries[k]]
            .chars()
            .next()
            .is_some_and(|ch| ch.is_whitespace() || ch.is_ascii_punctuation())
    };

    let window = (target / 2).max(1);
    for k in (target.saturating_sub(window).max(1)..=target).rev() {
        if breaks_after(k) {
            return boundaries[k];
        }
    }
    for k in target + 1..(target + window).min(total) {
        if breaks_after(k) {
            return boundaries[k];
        }
    }
    boundaries[target]
}
