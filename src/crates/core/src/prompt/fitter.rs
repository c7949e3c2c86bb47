//! Context fitting.
//!
//! Keeps every fixed segment and as many of the most recent prunable
//! segments as the token budget allows.

use log::debug;
use regex::Regex;
use std::sync::OnceLock;
use tavern_proxy_core_types::PromptSegment;

fn repeated_spaces() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r" {2,}").expect("constant regex"))
}

fn repeated_newlines() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{2,}").expect("constant regex"))
}

/// Collapses runs of spaces and runs of newlines to a single character.
pub fn collapse_whitespace(text: &str) -> String {
    let text = repeated_spaces().replace_all(text, " ");
    repeated_newlines().replace_all(&text, "\n").into_owned()
}

/// Applies [`collapse_whitespace`] to every segment and left-trims the first.
pub fn clean_segment_whitespace(segments: &mut [PromptSegment]) {
    for (index, segment) in segments.iter_mut().enumerate() {
        let mut content = collapse_whitespace(&segment.content);
        if index == 0 {
            content = content.trim_start().to_string();
        }
        segment.content = content;
    }
}

pub fn total_tokens(segments: &[PromptSegment]) -> usize {
    segments.iter().map(|segment| segment.token_count).sum()
}

/// Selects the segments that fit in `max_context - max_new - 1` tokens.
///
/// Walks from the end: fixed segments always stay, except a dialogue
/// delimiter directly preceding another kept delimiter. Prunable segments
/// are taken until the first one that does not fit; nothing older is
/// considered after that.
pub fn fit(segments: Vec<PromptSegment>, max_context: u32, max_new: u32) -> Vec<PromptSegment> {
    let budget = max_context as i64 - max_new as i64 - 1;
    let fixed_size: i64 = segments
        .iter()
        .filter(|segment| !segment.prunable)
        .map(|segment| segment.token_count as i64)
        .sum();

    let mut current_size = fixed_size;
    let mut try_to_fit_more = true;
    let mut dropped = 0usize;
    let mut kept: Vec<PromptSegment> = Vec::with_capacity(segments.len());

    for segment in segments.into_iter().rev() {
        if !segment.prunable {
            let follows_delimiter = kept
                .last()
                .is_some_and(|next| next.kind.is_dialogue_delimiter());
            if segment.kind.is_dialogue_delimiter() && follows_delimiter {
                current_size -= segment.token_count as i64;
                dropped += 1;
            } else {
                kept.push(segment);
            }
        } else if try_to_fit_more && current_size + segment.token_count as i64 <= budget {
            current_size += segment.token_count as i64;
            kept.push(segment);
        } else {
            try_to_fit_more = false;
            dropped += 1;
        }
    }

    kept.reverse();
    debug!(
        "Context fit: {} tokens of {} budget, {} segments kept, {} dropped",
        current_size,
        budget,
        kept.len(),
        dropped
    );
    kept
}

/// Joins fitted segments into the final prompt text.
pub fn render(segments: &[PromptSegment]) -> String {
    let joined: String = segments
        .iter()
        .map(|segment| segment.content.as_str())
        .collect();
    collapse_whitespace(&joined)
}
