//! Detection of credential requirements in command output.

use crate::core::heuristics::SecretFamily;
use crate::core::types::SecretHint;

/// Scan `output` for the first secret family with a matching phrase.
///
/// Matching is case-insensitive. The hint context is the first `snippet_chars`
/// characters of the raw output, so identical output yields identical hints.
pub fn detect_secret_hint(
    output: &str,
    families: &[SecretFamily],
    snippet_chars: usize,
) -> Option<SecretHint> {
    if output.is_empty() {
        return None;
    }
    let lower = output.to_lowercase();
    let family = families.iter().find(|family| {
        family
            .patterns
            .iter()
            .any(|pattern| lower.contains(&pattern.to_lowercase()))
    })?;
    Some(SecretHint {
        name: family.name.clone(),
        context: output.chars().take(snippet_chars).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::heuristics::Heuristics;

    fn detect(output: &str) -> Option<SecretHint> {
        let heuristics = Heuristics::default();
        detect_secret_hint(
            output,
            &heuristics.secret_families,
            heuristics.secret_snippet_chars,
        )
    }

    #[test]
    fn openai_variable_name_normalizes_to_fixed_key() {
        let hint = detect("KeyError: 'OPENAI_API_KEY'\n").expect("hint");
        assert_eq!(hint.name, "OPENAI_API_KEY");
        assert_eq!(hint.context, "KeyError: 'OPENAI_API_KEY'\n");
    }

    #[test]
    fn first_matching_family_wins() {
        let hint = detect("invalid api key; also access token expired").expect("hint");
        assert_eq!(hint.name, "OPENAI_API_KEY");
    }

    #[test]
    fn access_token_family_is_detected() {
        let hint = detect("401: Token required for this endpoint").expect("hint");
        assert_eq!(hint.name, "ACCESS_TOKEN");
    }

    #[test]
    fn context_is_truncated_by_characters() {
        let output = format!("{}ANTHROPIC_API_KEY missing", "é".repeat(300));
        let hint = detect(&output).expect("hint");
        assert_eq!(hint.name, "ANTHROPIC_API_KEY");
        assert_eq!(hint.context.chars().count(), 200);
    }

    #[test]
    fn unrelated_output_has_no_hint() {
        assert!(detect("Successfully installed requests-2.32.0").is_none());
        assert!(detect("").is_none());
    }
}
