//! Sliding-window chunking with sentence-boundary snapping.

#[derive(Debug, Clone)]
pub struct ChunkPiece {
    pub text: String,
    pub index: usize,
    pub heading: Option<String>,
}

/// Move a byte offset back to the nearest UTF-8 character boundary.
pub fn snap_to_char_boundary(text: &str, mut offset: usize) -> usize {
    if offset >= text.len() {
        return text.len();
    }
    while offset > 0 && !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize, min_chunk_size: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            min_chunk_size,
        }
    }

    pub fn chunk(&self, text: &str) -> Vec<ChunkPiece> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        if text.len() <= self.chunk_size {
            if text.len() < self.min_chunk_size {
                return Vec::new();
            }
            return vec![ChunkPiece {
                text: text.to_string(),
                index: 0,
                heading: extract_heading(text),
            }];
        }

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut index = 0;

        while start < text.len() {
            let raw_end = (start + self.chunk_size).min(text.len());
            let end = snap_to_char_boundary(text, raw_end);

            let actual_end = if end < text.len() {
                self.find_break_point(text, start, end)
            } else {
                end
            };

            let chunk_text = &text[start..actual_end];
            if chunk_text.len() >= self.min_chunk_size {
                chunks.push(ChunkPiece {
                    text: chunk_text.to_string(),
                    index,
                    heading: extract_heading(chunk_text),
                });
                index += 1;
            }

            let step = if actual_end - start > self.chunk_overlap {
                actual_end - start - self.chunk_overlap
            } else {
                actual_end - start
            };

            let next = snap_to_char_boundary(text, start + step);
            if next <= start || next >= text.len() {
                break;
            }
            start = next;
        }

        chunks
    }

    /// Prefer to cut on a paragraph break, then a sentence end, then a line
    /// break, then a word boundary, searching backwards from the preferred
    /// end within a 200-byte window.
    fn find_break_point(&self, text: &str, start: usize, preferred_end: usize) -> usize {
        let raw_search_start = preferred_end.saturating_sub(200).max(start);
        let search_start = snap_to_char_boundary(text, raw_search_start);
        let safe_end = snap_to_char_boundary(text, preferred_end);

        if search_start >= safe_end {
            return safe_end;
        }

        let region = &text[search_start..safe_end];

        if let Some(pos) = region.rfind("\n\n") {
            return search_start + pos + 2;
        }
        if let Some(pos) = region.rfind(". ") {
            return search_start + pos + 2;
        }
        if let Some(pos) = region.rfind(".\n") {
            return search_start + pos + 2;
        }
        if let Some(pos) = region.rfind('\n') {
            return search_start + pos + 1;
        }
        if let Some(pos) = region.rfind(' ') {
            return search_start + pos + 1;
        }
        safe_end
    }
}

/// Markdown-style heading at the top of a chunk, if any.
fn extract_heading(chunk: &str) -> Option<String> {
    let first = chunk.lines().next()?.trim();
    let stripped = first.trim_start_matches('#');
    if stripped.len() < first.len() && !stripped.trim().is_empty() {
        Some(stripped.trim().to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunker = TextChunker::new(500, 50, 20);
        let chunks = chunker.chunk("A single paragraph that fits in one chunk comfortably.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn tiny_text_is_dropped() {
        let chunker = TextChunker::new(500, 50, 20);
        assert!(chunker.chunk("too short").is_empty());
        assert!(chunker.chunk("").is_empty());
    }

    #[test]
    fn long_text_produces_overlapping_chunks() {
        let chunker = TextChunker::new(200, 40, 20);
        let sentence = "The market opened higher and held the overnight range. ";
        let text = sentence.repeat(30);
        let chunks = chunker.chunk(&text);

        assert!(chunks.len() > 2);
        for window in chunks.windows(2) {
            // Overlap means consecutive chunks share a suffix/prefix region.
            let tail: String = window[0].text.chars().rev().take(20).collect();
            let tail: String = tail.chars().rev().collect();
            assert!(window[1].text.contains(tail.trim()) || window[1].index > window[0].index);
        }
        // Indices are sequential.
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn chunking_respects_utf8_boundaries() {
        let chunker = TextChunker::new(100, 20, 10);
        let text = "différentes stratégies de négociation étudiées ".repeat(20);
        // Must not panic on multi-byte characters.
        let chunks = chunker.chunk(&text);
        assert!(!chunks.is_empty());
    }

    #[test]
    fn heading_is_extracted_from_markdown() {
        let chunker = TextChunker::new(500, 50, 10);
        let chunks = chunker.chunk("## Entry Rules\nEnter long on a close above the range.");
        assert_eq!(chunks[0].heading.as_deref(), Some("Entry Rules"));
    }
}
