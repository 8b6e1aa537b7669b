pub fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

/// Cuts `input` to at most `max_chars` characters, never splitting a char.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect()
}

/// Cuts `input` to at most `max_chars` characters at a word boundary. Falls
/// back to a plain character cut when the first word alone is too long.
pub fn truncate_words(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let cut: String = input.chars().take(max_chars).collect();
    let next_is_space = input
        .chars()
        .nth(max_chars)
        .map(char::is_whitespace)
        .unwrap_or(true);
    if next_is_space {
        return cut.trim_end().to_string();
    }
    match cut.rfind(char::is_whitespace) {
        Some(index) => cut[..index].trim_end().to_string(),
        None => cut,
    }
}

/// Collapses runs of whitespace into single spaces and trims the ends.
pub fn squash_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_respects_multibyte_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn truncate_words_never_splits_a_word() {
        assert_eq!(truncate_words("soft bounce fill light", 15), "soft bounce");
        assert_eq!(truncate_words("soft bounce fill light", 11), "soft bounce");
        assert_eq!(truncate_words("soft bounce", 40), "soft bounce");
        assert_eq!(truncate_words("floodlight", 5), "flood");
    }

    #[test]
    fn squash_whitespace_flattens_newlines() {
        assert_eq!(squash_whitespace("  a\n\n b\t c "), "a b c");
    }
}
