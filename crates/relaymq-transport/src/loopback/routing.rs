use crate::session::ExchangeKind;

/// Whether a binding with `binding_key` on an exchange of `kind` accepts
/// a message published with `routing_key`.
pub(crate) fn binding_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
    }
}

/// Dotted-word pattern match: `*` is exactly one word, `#` zero or more.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_requires_exact_key() {
        assert!(binding_matches(ExchangeKind::Direct, "users", "users"));
        assert!(!binding_matches(ExchangeKind::Direct, "users", "users.get"));
    }

    #[test]
    fn fanout_ignores_key() {
        assert!(binding_matches(ExchangeKind::Fanout, "", "anything"));
        assert!(binding_matches(ExchangeKind::Fanout, "x", ""));
    }

    #[test]
    fn topic_star_matches_one_word() {
        assert!(topic_matches("users.*", "users.get"));
        assert!(!topic_matches("users.*", "users"));
        assert!(!topic_matches("users.*", "users.get.by-id"));
        assert!(topic_matches("*.get", "users.get"));
    }

    #[test]
    fn topic_hash_matches_zero_or_more_words() {
        assert!(topic_matches("users.#", "users"));
        assert!(topic_matches("users.#", "users.get.by-id"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("a.#.c", "a.c"));
        assert!(topic_matches("a.#.c", "a.b.b.c"));
        assert!(!topic_matches("a.#.c", "a.b.d"));
    }
}
