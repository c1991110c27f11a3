//! The ask-for-value collaborator.
//!
//! Callers hold the single asker by `&mut`, so at most one prompt is ever
//! outstanding and the pipeline cannot move on while it waits.

use std::collections::VecDeque;

use dialoguer::Input;
use tracing::warn;

pub trait Ask {
    /// `None` when the value is declined or left empty.
    fn ask(&mut self, prompt: &str) -> Option<String>;
}

/// Prompts on the terminal.
#[derive(Default)]
pub struct TerminalAsk;

impl Ask for TerminalAsk {
    fn ask(&mut self, prompt: &str) -> Option<String> {
        let answer = Input::<String>::new()
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text();
        match answer {
            Ok(s) => normalize(s),
            Err(e) => {
                warn!("Prompt failed, treating as declined: {}", e);
                None
            }
        }
    }
}

/// Declines everything; used when nobody is at the keyboard.
#[derive(Default)]
pub struct DenyAll;

impl Ask for DenyAll {
    fn ask(&mut self, _prompt: &str) -> Option<String> {
        None
    }
}

/// Replays a fixed list of answers and records every prompt it was shown.
#[derive(Default)]
pub struct ScriptedAsk {
    answers: VecDeque<Option<String>>,
    pub prompts: Vec<String>,
}

impl ScriptedAsk {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(|a| a.map(Into::into)).collect(),
            prompts: Vec::new(),
        }
    }

    /// Reads answers one per line; a blank line declines.
    pub fn from_lines(text: &str) -> Self {
        Self::new(text.lines().map(|l| Some(l.to_string())))
    }
}

impl Ask for ScriptedAsk {
    fn ask(&mut self, prompt: &str) -> Option<String> {
        self.prompts.push(prompt.to_string());
        self.answers.pop_front().flatten().and_then(normalize)
    }
}

fn normalize(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
