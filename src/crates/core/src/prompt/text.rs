//! Text helpers shared by templates and output post-processing.

use log::debug;
use tavern_proxy_core_types::RoleNames;

const SENTENCE_TERMINATORS: [char; 9] = ['.', '?', '!', ';', ')', ']', '>', '"', '”'];

/// Values substituted into configured text such as the bias or impersonation prompt.
#[derive(Debug, Clone, Default)]
pub struct Placeholders<'a> {
    pub user: &'a str,
    pub char: &'a str,
    pub jailbreak: &'a str,
    pub impersonation_prompt: &'a str,
}

impl<'a> Placeholders<'a> {
    pub fn from_roles(roles: &'a RoleNames) -> Self {
        Self {
            user: &roles.user,
            char: &roles.assistant,
            ..Self::default()
        }
    }
}

/// Expands `{{impersonationPrompt}}`, `{{jailbreak}}`, `{{user}}` and `{{char}}`.
///
/// Prompt placeholders go first so names inside them are expanded too.
pub fn replace_templates(text: &str, values: &Placeholders<'_>) -> String {
    text.replace("{{impersonationPrompt}}", values.impersonation_prompt)
        .replace("{{jailbreak}}", values.jailbreak)
        .replace("{{user}}", values.user)
        .replace("{{char}}", values.char)
}

pub fn format_stopping_strings(strings: &[String], roles: &RoleNames) -> Vec<String> {
    strings
        .iter()
        .map(|stop| stop.replace("{{user}}", &roles.user).replace("{{char}}", &roles.assistant))
        .collect()
}

/// Byte offset of the earliest stop string in `text`.
pub fn find_stop_position(text: &str, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter(|stop| !stop.is_empty())
        .filter_map(|stop| text.find(stop.as_str()))
        .min()
}

/// Cleans up a complete generated reply.
///
/// Cuts at the first stop string and, when `drop_unfinished` is set, drops a
/// trailing sentence fragment.
pub fn truncate_generated_text(text: &str, stops: &[String], drop_unfinished: bool) -> String {
    let mut text = text.trim_end();

    if let Some(pos) = find_stop_position(text, stops) {
        debug!("Cutting generated text at stop string (offset {})", pos);
        text = text[..pos].trim_end();
    }

    let ends_mid_sentence = text
        .chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_alphanumeric());
    if drop_unfinished && ends_mid_sentence {
        let last_terminator = text
            .char_indices()
            .filter(|(_, c)| SENTENCE_TERMINATORS.contains(c))
            .last();
        if let Some((pos, c)) = last_terminator {
            if pos > 5 {
                debug!("Dropping unfinished sentence after offset {}", pos);
                text = &text[..pos + c.len_utf8()];
            }
        }
    }

    text.to_string()
}
