pub fn truncate_string(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut truncated = String::new();
    for ch in text.chars() {
        if truncated.len() + ch.len_utf8() > max_bytes {
            break;
        }
        truncated.push(ch);
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_string_respects_char_boundaries() {
        let text = "ab\u{00e9}cd";
        let truncated = truncate_string(text, 3);
        assert_eq!(truncated, "ab");
    }

    #[test]
    fn truncate_string_returns_short_input_unchanged() {
        assert_eq!(truncate_string("short", 64), "short");
    }
}
