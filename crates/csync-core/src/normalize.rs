//! Phone/email canonicalisation and display-name parsing.
//!
//! Mirrors the original service's `normalize_phone`, `normalize_email`, and
//! `parse_display_name` helpers exactly, so stored match keys stay comparable
//! across languages during a migration window.

/// Minimum digit count for a phone to be considered valid (invariant I4).
const MIN_PHONE_DIGITS: usize = 10;

/// Strip everything but digits, fold the Russian trunk-prefix `8` to `+7`,
/// drop a leading international `00`, and reject anything under
/// [`MIN_PHONE_DIGITS`] digits. Returns `None` rather than a malformed key.
pub fn normalise_phone(raw: &str) -> Option<String> {
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if let Some(stripped) = digits.strip_prefix("00") {
        digits = stripped.to_string();
    }

    if digits.len() == 11 && digits.starts_with('8') {
        digits.replace_range(0..1, "7");
    }

    if digits.len() < MIN_PHONE_DIGITS {
        return None;
    }

    Some(format!("+{digits}"))
}

/// Trim and lowercase. Validity is a permissive `[^@]+@[^@]+\.[^@]+` shape —
/// callers that need to filter invalid addresses should call
/// [`is_valid_email`] separately.
pub fn normalise_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// `true` iff `email` has exactly one `@` with a dotted domain, after the
/// same trim the caller is expected to have already applied via
/// [`normalise_email`].
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty() && !domain.is_empty() && !domain.contains('@') && domain.contains('.')
}

/// Split a display name on the first run of whitespace: `given` is the first
/// token, `family` is the remainder (`None` for a single-token name).
pub fn parse_display_name(raw: &str) -> (String, String, Option<String>) {
    let trimmed = raw.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((given, rest)) => {
            let family = rest.trim();
            (
                trimmed.to_string(),
                given.to_string(),
                if family.is_empty() {
                    None
                } else {
                    Some(family.to_string())
                },
            )
        }
        None => (trimmed.to_string(), trimmed.to_string(), None),
    }
}

/// Preserve first-seen order, drop duplicates and empty strings.
pub fn unique<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let item = item.into();
        if item.is_empty() {
            continue;
        }
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_with_punctuation_and_leading_8() {
        assert_eq!(
            normalise_phone("8 (999) 111-22-33"),
            Some("+79991112233".to_string())
        );
    }

    #[test]
    fn phone_with_international_00_prefix() {
        assert_eq!(
            normalise_phone("0049 89 1234567"),
            Some("+49891234567".to_string())
        );
    }

    #[test]
    fn phone_too_short_is_rejected() {
        assert_eq!(normalise_phone("abc"), None);
        assert_eq!(normalise_phone("123"), None);
    }

    #[test]
    fn phone_result_matches_e164_shape() {
        let raw_inputs = ["+1 (234) 567-8901", "8 999 111 22 33", "123456789012"];
        for raw in raw_inputs {
            if let Some(normalised) = normalise_phone(raw) {
                assert!(normalised.starts_with('+'));
                assert!(normalised[1..].chars().all(|c| c.is_ascii_digit()));
                assert!(normalised.len() > MIN_PHONE_DIGITS);
            }
        }
    }

    #[test]
    fn email_is_trimmed_and_lowercased() {
        assert_eq!(normalise_email("  USER@Mail.COM "), "user@mail.com");
    }

    #[test]
    fn normalised_email_has_no_uppercase_or_surrounding_whitespace() {
        let normalised = normalise_email("  Mixed.Case@Example.COM  ");
        assert_eq!(normalised, normalised.trim());
        assert!(!normalised.chars().any(|c| c.is_ascii_uppercase()));
    }

    #[test]
    fn valid_email_shape() {
        assert!(is_valid_email("user@mail.com"));
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("user@@mail.com"));
    }

    #[test]
    fn display_name_splits_on_first_whitespace() {
        assert_eq!(
            parse_display_name("  Alice   Bob Carter "),
            ("Alice   Bob Carter".to_string(), "Alice".to_string(), Some("Bob Carter".to_string()))
        );
    }

    #[test]
    fn single_token_name_has_no_family() {
        assert_eq!(
            parse_display_name("Cher"),
            ("Cher".to_string(), "Cher".to_string(), None)
        );
    }

    #[test]
    fn unique_preserves_order_and_drops_empties_and_dupes() {
        assert_eq!(
            unique(["b", "", "a", "b", "c", "a"]),
            vec!["b".to_string(), "a".to_string(), "c".to_string()]
        );
    }
}
