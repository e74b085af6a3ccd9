//! Parsing of ReAct-formatted oracle replies (`Thought:` / `Action:` / `Final Answer:`).

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{OracleReply, TerminalOutcome, Usage};

const FINAL_MARKER: &str = "Final Answer:";
const SUCCESS_MARKER: &str = "Final Answer: Success";
const OBSERVATION_MARKER: &str = "\nObservation:";

/// A tag starts a new section when it opens a line (`\nWord:` or `\nTwo Words:`).
static NEXT_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\w+(?: \w+)?:").expect("tag regex should be valid"));

/// Parse a free-text reply into a structured proposal.
///
/// Only `Final Answer: Success` counts as a success terminal; any other final
/// answer ends the run as a failure.
pub fn parse_reply(text: &str, usage: Usage) -> OracleReply {
    let terminal = if text.contains(SUCCESS_MARKER) {
        Some(TerminalOutcome::Success)
    } else if text.contains(FINAL_MARKER) {
        Some(TerminalOutcome::Failure)
    } else {
        None
    };
    OracleReply {
        thought: extract_tag(text, "Thought"),
        action: extract_tag(text, "Action")
            .map(|action| clean_action(&action))
            .filter(|action| !action.is_empty()),
        terminal,
        raw: text.to_string(),
        usage,
    }
}

/// Text after `Tag:` up to the next line-leading tag, trimmed.
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let needle = format!("{tag}:");
    let start = text.find(&needle)? + needle.len();
    let rest = &text[start..];
    let end = NEXT_TAG_RE.find(rest).map_or(rest.len(), |m| m.start());
    let value = rest[..end].trim();
    if value.is_empty() {
        return None;
    }
    Some(value.to_string())
}

/// Normalize a proposed command: cut anything after an `Observation:` line,
/// strip code fences and a wrapping pair of backticks.
pub fn clean_action(action: &str) -> String {
    let mut content = action;
    if let Some(idx) = content.find(OBSERVATION_MARKER) {
        content = &content[..idx];
    }
    let mut content = content.trim();
    for fence in ["```bash", "```sh", "```"] {
        if let Some(stripped) = content.strip_prefix(fence) {
            content = stripped.trim_start_matches([' ', '\t']);
            content = content.strip_prefix('\n').unwrap_or(content);
            break;
        }
    }
    if let Some(stripped) = content.strip_suffix("```") {
        content = stripped.trim_end();
    }
    let content = content.trim();
    if content.len() >= 2 && content.starts_with('`') && content.ends_with('`') {
        return content[1..content.len() - 1].trim().to_string();
    }
    content.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_thought_and_action() {
        let reply = parse_reply(
            "Thought: check dependencies\nAction: cat requirements.txt",
            Usage::default(),
        );
        assert_eq!(reply.thought.as_deref(), Some("check dependencies"));
        assert_eq!(reply.action.as_deref(), Some("cat requirements.txt"));
        assert_eq!(reply.terminal, None);
    }

    #[test]
    fn text_after_observation_is_not_part_of_action() {
        let reply = parse_reply(
            "Thought: install\nAction: pip install -e .\nObservation: Successfully installed",
            Usage::default(),
        );
        assert_eq!(reply.action.as_deref(), Some("pip install -e ."));
    }

    #[test]
    fn code_fences_and_backticks_are_stripped() {
        assert_eq!(clean_action("```bash\npip install .\n```"), "pip install .");
        assert_eq!(clean_action("```\nls -la\n```"), "ls -la");
        assert_eq!(clean_action("`make build`"), "make build");
        assert_eq!(clean_action("echo `date`"), "echo `date`");
    }

    #[test]
    fn success_final_answer_is_success_terminal() {
        let reply = parse_reply("Thought: done\nFinal Answer: Success", Usage::default());
        assert_eq!(reply.thought.as_deref(), Some("done"));
        assert_eq!(reply.terminal, Some(TerminalOutcome::Success));
        assert_eq!(reply.action, None);
    }

    #[test]
    fn other_final_answers_are_failure_terminal() {
        let reply = parse_reply(
            "Thought: blocked\nFinal Answer: cannot install CUDA",
            Usage::default(),
        );
        assert_eq!(reply.terminal, Some(TerminalOutcome::Failure));
    }

    #[test]
    fn missing_action_is_none() {
        let reply = parse_reply("Thought: hmm\nAction:   \n", Usage::default());
        assert_eq!(reply.action, None);
        let reply = parse_reply("I am not sure what to do.", Usage::default());
        assert_eq!(reply.thought, None);
        assert_eq!(reply.action, None);
    }
}
