//! Splitting outbound text to fit Telegram's message limit.
//!
//! Telegram rejects messages over 4096 characters; chunks stay under 4000 so
//! HTML entities added by the renderer never push one over.

/// Maximum characters per outbound chunk.
pub const CHUNK_MAX: usize = 4000;

/// Split `text` into chunks of at most `max` characters.
///
/// Breaks prefer line boundaries, then spaces; a single word longer than
/// `max` is cut at a character boundary.
pub fn split_chunks(text: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    if text.chars().count() <= max {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let cost = if current.is_empty() { line_len } else { line_len + 1 };

        if current_len + cost <= max {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            current_len += cost;
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len <= max {
            current.push_str(line);
            current_len = line_len;
        } else {
            let mut pieces = split_long_line(line, max);
            if let Some(last) = pieces.pop() {
                chunks.extend(pieces);
                current_len = last.chars().count();
                current = last;
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_long_line(line: &str, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = line;
    while rest.chars().count() > max {
        // byte offset of the first char past the limit
        let limit = rest.char_indices().nth(max).map(|(i, _)| i).unwrap_or(rest.len());
        let cut = match rest[..limit].rfind(' ') {
            Some(space) if space > 0 => space,
            _ => limit,
        };
        out.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start_matches(' ');
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}
