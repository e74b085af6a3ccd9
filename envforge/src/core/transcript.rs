//! Conversation history handed to the oracle on every step.

use serde::Serialize;

/// One completed loop step as the oracle will see it next time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub step: u32,
    /// The oracle's reply text for this step.
    pub reply: String,
    /// What the loop fed back (command output or a corrective message).
    pub observation: Option<String>,
}

/// Append-only history of oracle replies and observations for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transcript {
    repo_url: String,
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            turns: Vec::new(),
        }
    }

    pub fn repo_url(&self) -> &str {
        &self.repo_url
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn push_reply(&mut self, step: u32, reply: &str) {
        self.turns.push(Turn {
            step,
            reply: reply.to_string(),
            observation: None,
        });
    }

    /// Attach the observation to the most recent reply.
    pub fn attach_observation(&mut self, observation: &str) {
        if let Some(last) = self.turns.last_mut() {
            last.observation = Some(observation.to_string());
        }
    }
}

/// Keep the last `limit` bytes of `text` (on a char boundary), marking the cut.
pub fn tail_bytes(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {start} bytes omitted ...]\n{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observations_attach_to_latest_turn() {
        let mut transcript = Transcript::new("https://example.com/repo.git");
        transcript.attach_observation("ignored without a turn");
        transcript.push_reply(1, "Action: ls");
        transcript.attach_observation("README.md");
        transcript.push_reply(2, "Action: cat README.md");

        let turns = transcript.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].observation.as_deref(), Some("README.md"));
        assert_eq!(turns[1].observation, None);
    }

    #[test]
    fn tail_bytes_keeps_end_and_respects_char_boundaries() {
        assert_eq!(tail_bytes("short", 10), "short");
        let text = format!("{}end", "ü".repeat(10));
        let tail = tail_bytes(&text, 6);
        assert!(tail.ends_with("üend") || tail.ends_with("end"));
        assert!(tail.starts_with("[... "));
    }
}
