/// Token budget estimation and truncation for packed repair context.
///
/// Estimates size in tokens (approximation: 1 token ≈ 4 chars) and trims
/// section bodies when they exceed what is left of the budget.

const CHARS_PER_TOKEN: usize = 4;

/// Estimate token count from a string.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Keep leading lines of `text` that fit within `max_tokens`.
/// Returns (kept_text, dropped_line_count). Keeps nothing if even the
/// first line does not fit.
pub fn truncate_lines(text: &str, max_tokens: usize) -> (String, usize) {
    let lines: Vec<&str> = text.lines().collect();
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    let mut kept: Vec<&str> = Vec::new();
    let mut total_chars = 0;

    for (i, line) in lines.iter().enumerate() {
        let line_chars = line.len() + 1; // +1 for newline
        if total_chars + line_chars > max_chars {
            return (kept.join("\n"), lines.len() - i);
        }
        total_chars += line_chars;
        kept.push(line);
    }

    (kept.join("\n"), 0)
}
