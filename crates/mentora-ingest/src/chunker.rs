/// Configuration for the chunker. `target_size` is characters, a proxy
/// for ~512 tokens at 4 chars/token.
pub struct ChunkerConfig {
    pub target_size: usize,
    /// Hard ceiling; a span longer than this is window-split.
    pub max_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_size: 2000,
            max_size: 4000,
        }
    }
}

/// Split extracted text into ordered chunks.
///
/// Strategy:
/// 1. Split on blank lines (paragraphs) and pack paragraphs up to
///    `target_size`.
/// 2. A paragraph longer than `target_size` splits on sentence
///    boundaries.
/// 3. A sentence longer than `max_size` falls back to a fixed window
///    on char boundaries.
///
/// Chunks are numbered `0..n-1` by position in the returned vec; empty
/// input yields an empty vec.
pub fn chunk_text(content: &str, config: &ChunkerConfig) -> Vec<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let target = config.target_size.max(1);
    let max = config.max_size.max(target);

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for paragraph in split_paragraphs(trimmed) {
        let units: Vec<String> = if paragraph.len() > target {
            split_sentences(&paragraph)
                .into_iter()
                .flat_map(|s| {
                    if s.len() > max {
                        split_window(&s, max)
                    } else {
                        vec![s]
                    }
                })
                .collect()
        } else {
            vec![paragraph]
        };

        for unit in units {
            if !current.is_empty() && current.len() + unit.len() + 1 > target {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(&unit);
            if current.len() >= target {
                chunks.push(std::mem::take(&mut current));
            }
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }

    chunks
}

fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect()
}

fn split_sentences(paragraph: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in paragraph.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | '。' | '！' | '？' | '\n') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_owned());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_owned());
    }
    out
}

fn split_window(text: &str, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes_len = text.len();
    while start < bytes_len {
        let mut end = (start + max).min(bytes_len);
        while end < bytes_len && !text.is_char_boundary(end) {
            end += 1;
        }
        out.push(text[start..end].to_owned());
        start = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(target: usize, max: usize) -> ChunkerConfig {
        ChunkerConfig {
            target_size: target,
            max_size: max,
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", &ChunkerConfig::default()).is_empty());
        assert!(chunk_text("   \n\n  ", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("hello world", &ChunkerConfig::default());
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn paragraphs_pack_toward_target() {
        let text = "aaaa\n\nbbbb\n\ncccc\n\ndddd";
        let chunks = chunk_text(text, &config(10, 20));
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| !c.trim().is_empty()));
        // Order preserved.
        let joined = chunks.join("\n");
        let a = joined.find("aaaa").unwrap();
        let d = joined.find("dddd").unwrap();
        assert!(a < d);
    }

    #[test]
    fn long_paragraph_splits_on_sentences() {
        let text = "First sentence here. Second sentence here. Third sentence here.";
        let chunks = chunk_text(text, &config(25, 100));
        assert!(chunks.len() >= 2);
        assert!(chunks[0].contains("First"));
    }

    #[test]
    fn oversized_sentence_window_splits() {
        let text = "x".repeat(95);
        let chunks = chunk_text(&text, &config(20, 30));
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.len() <= 30));
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 95);
    }

    #[test]
    fn window_split_respects_char_boundaries() {
        let text = "号".repeat(40); // 3 bytes each
        let chunks = chunk_text(&text, &config(10, 10));
        for chunk in &chunks {
            assert!(chunk.chars().all(|c| c == '号'));
        }
        let total_chars: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert_eq!(total_chars, 40);
    }

    #[test]
    fn cjk_sentence_boundaries_recognized() {
        let text = format!("{}。{}。", "甲".repeat(30), "乙".repeat(30));
        let chunks = chunk_text(&text, &config(100, 400));
        assert_eq!(chunks.len(), 1);
        let chunks = chunk_text(&text, &config(91, 400));
        assert!(chunks.len() >= 2);
    }
}
