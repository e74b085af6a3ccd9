//! Oracle prompt rendering.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::transcript::{Transcript, tail_bytes};

const ORACLE_TEMPLATE: &str = include_str!("prompts/oracle.md");

/// Reply format the oracle backend expects the model to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFormat {
    /// Structured JSON constrained by the reply schema.
    Json,
    /// Free text with `Thought:` / `Action:` / `Final Answer:` tags.
    React,
}

impl ReplyFormat {
    fn as_str(self) -> &'static str {
        match self {
            ReplyFormat::Json => "json",
            ReplyFormat::React => "react",
        }
    }
}

/// Sandbox facts the prompt tells the oracle about.
#[derive(Debug, Clone)]
pub struct PromptEnvironment {
    pub base_image: String,
    pub workdir: String,
    /// Per-observation cap; the tail of longer outputs is kept.
    pub observation_limit_bytes: usize,
}

#[derive(Debug, Serialize)]
struct TurnContext<'a> {
    step: u32,
    reply: &'a str,
    observation: Option<String>,
}

/// Render the full prompt for the next oracle call.
pub fn render_oracle_prompt(
    env: &PromptEnvironment,
    transcript: &Transcript,
    step: u32,
    max_steps: u32,
    format: ReplyFormat,
) -> Result<String> {
    let mut jinja = Environment::new();
    jinja.add_template("oracle", ORACLE_TEMPLATE)?;
    let turns: Vec<TurnContext<'_>> = transcript
        .turns()
        .iter()
        .map(|turn| TurnContext {
            step: turn.step,
            reply: turn.reply.trim(),
            observation: turn
                .observation
                .as_deref()
                .map(|obs| tail_bytes(obs.trim_end(), env.observation_limit_bytes)),
        })
        .collect();
    let rendered = jinja.get_template("oracle")?.render(context! {
        repo_url => transcript.repo_url(),
        workdir => env.workdir.as_str(),
        base_image => env.base_image.as_str(),
        format => format.as_str(),
        step => step,
        max_steps => max_steps,
        turns => turns,
    })?;
    debug!(bytes = rendered.len(), turns = transcript.turns().len(), "rendered oracle prompt");
    Ok(rendered)
}
