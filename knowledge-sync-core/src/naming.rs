//! Mapping from local directory names to collection display names.

use regex::Regex;
use std::sync::OnceLock;

fn separators() -> &'static Regex {
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    SEPARATORS.get_or_init(|| Regex::new(r"[-_\s]+").expect("separator pattern is valid"))
}

/// Turns a directory name into the collection's display name.
///
/// Splits on hyphens, underscores and whitespace, capitalises every token and joins
/// them with single spaces: `company-policies` becomes `Company Policies`.
pub fn collection_display_name(dir_name: &str) -> String {
    separators()
        .split(dir_name)
        .filter(|token| !token.is_empty())
        .map(capitalise)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Description attached to collections this tool creates.
pub fn collection_description(dir_name: &str) -> String {
    format!("Auto-created by knowledge-sync from {dir_name}")
}

fn capitalise(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hyphenated_names() {
        assert_eq!(collection_display_name("company-policies"), "Company Policies");
        assert_eq!(collection_display_name("career-data"), "Career Data");
    }

    #[test]
    fn test_underscored_names() {
        assert_eq!(
            collection_display_name("sample_collection"),
            "Sample Collection"
        );
    }

    #[test]
    fn test_mixed_and_repeated_separators() {
        assert_eq!(collection_display_name("hr__on-boarding"), "Hr On Boarding");
        assert_eq!(collection_display_name("-leading_trailing-"), "Leading Trailing");
        assert_eq!(collection_display_name("two words"), "Two Words");
    }

    #[test]
    fn test_case_is_normalised_per_token() {
        assert_eq!(collection_display_name("API-REFERENCE"), "Api Reference");
        assert_eq!(collection_display_name("notes"), "Notes");
    }

    #[test]
    fn test_malformed_input_passes_through() {
        assert_eq!(collection_display_name(""), "");
        assert_eq!(collection_display_name("---"), "");
        assert_eq!(collection_display_name("2024"), "2024");
        assert_eq!(collection_display_name("ünïcode-dir"), "Ünïcode Dir");
    }

    #[test]
    fn test_description_mentions_directory() {
        assert_eq!(
            collection_description("company-policies"),
            "Auto-created by knowledge-sync from company-policies"
        );
    }
}
