//! Segment assembly shared by every template style.
//!
//! A style only supplies text: delimiters, fixed lines and instructions.
//! The walk over classified messages, the placement of the injection point
//! and the terminal reply logic live here.

use super::TemplateOptions;
use crate::prompt::classifier::ClassifiedConversation;
use crate::prompt::text::{replace_templates, Placeholders};
use log::debug;
use tavern_proxy_core_types::{
    BackendKind, ChatRole, GenerationParams, PromptSegment, SegmentKind,
};

/// Number of trailing chat turns re-appended after the reply instruction.
const LIVE_TAIL_TURNS: usize = 2;

#[derive(Debug, Clone)]
pub struct Delimiters {
    pub before_system: String,
    pub after_system: String,
    pub before_user: String,
    pub after_user: String,
    pub before_assistant: String,
    pub after_assistant: String,
}

impl Delimiters {
    /// Blank line before every block, newline after.
    pub fn paragraphs() -> Self {
        Self {
            before_system: "\n\n".to_string(),
            after_system: "\n".to_string(),
            before_user: "\n\n".to_string(),
            after_user: "\n".to_string(),
            before_assistant: "\n\n".to_string(),
            after_assistant: "\n".to_string(),
        }
    }

    fn before(&self, role: ChatRole) -> &str {
        match role {
            ChatRole::System => &self.before_system,
            ChatRole::User => &self.before_user,
            ChatRole::Assistant => &self.before_assistant,
        }
    }

    fn after(&self, role: ChatRole) -> &str {
        match role {
            ChatRole::System => &self.after_system,
            ChatRole::User => &self.after_user,
            ChatRole::Assistant => &self.after_assistant,
        }
    }
}

/// How a speaker's name is written in front of a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameStyle {
    None,
    /// `#### {name}{example_suffix}:\n`, the suffix only on example turns.
    Heading { example_suffix: &'static str },
    /// `{name}:\n`
    Plain,
    /// `{section}:\n#### {name}:\n`, where the section heading depends on
    /// the speaker's role.
    Sectioned {
        user: &'static str,
        assistant: &'static str,
    },
}

impl NameStyle {
    pub fn render(&self, role: ChatRole, name: &str, is_example: bool) -> String {
        match self {
            NameStyle::None => String::new(),
            NameStyle::Heading { example_suffix } => {
                let suffix = if is_example { *example_suffix } else { "" };
                format!("#### {}{}:\n", name, suffix)
            }
            NameStyle::Plain => format!("{}:\n", name),
            NameStyle::Sectioned { user, assistant } => {
                let section = if role == ChatRole::User { user } else { assistant };
                format!("{}:\n#### {}:\n", section, name)
            }
        }
    }
}

/// Inputs a style needs to produce its text.
#[derive(Debug, Clone)]
pub struct StyleContext<'a> {
    pub user: &'a str,
    pub assistant: &'a str,
    /// Speaker of the reply being generated.
    pub you: &'a str,
    pub other: &'a str,
    pub impersonating: bool,
    /// Configured reply attributes, placeholders already expanded.
    pub reply_attributes: &'a str,
    pub backend: Option<BackendKind>,
}

/// Text table of one prompt format.
#[derive(Debug, Clone)]
pub struct TemplateStyle {
    pub system_prompt: String,
    pub new_conversation: String,
    pub new_example: String,
    pub context: String,
    pub context_response: String,
    pub delimiters: Delimiters,
    pub names: NameStyle,
    /// Complete segment text, delimiters included.
    pub reply_instruction: Option<String>,
    /// Complete segment text, placed right before the open reply.
    pub final_instruction: Option<String>,
    /// Name line of the open reply.
    pub reply_header: String,
    /// Trim the end of the open reply prefix before the bias is appended.
    pub trim_reply_prefix: bool,
    pub stopping_strings: Vec<String>,
    pub always_keep_first_example: bool,
}

impl TemplateStyle {
    fn wrap(&self, role: ChatRole, body: &str) -> String {
        format!(
            "{}{}{}",
            self.delimiters.before(role),
            body,
            self.delimiters.after(role)
        )
    }

    fn turn(&self, role: ChatRole, name: &str, is_example: bool, content: &str) -> String {
        format!(
            "{}{}{}{}",
            self.delimiters.before(role),
            self.names.render(role, name, is_example),
            content,
            self.delimiters.after(role)
        )
    }
}

pub(crate) fn last_chat_turn(prompt: &[PromptSegment]) -> Option<&PromptSegment> {
    prompt.iter().rev().find(|segment| segment.kind.is_chat_turn())
}

/// Removes the trailing `count` chat turns, and anything interleaved with
/// them, returning them in chronological order.
///
/// Stops at the live conversation delimiter or the fixed head of the prompt.
pub(crate) fn pop_last_chat_messages(
    prompt: &mut Vec<PromptSegment>,
    count: usize,
) -> Vec<PromptSegment> {
    let mut popped = Vec::new();
    let mut turns = 0;
    while turns < count {
        let Some(segment) = prompt.last() else {
            break;
        };
        if matches!(
            segment.kind,
            SegmentKind::NewConversation
                | SegmentKind::SystemPrompt
                | SegmentKind::Context
                | SegmentKind::ContextResponse
        ) {
            break;
        }
        if segment.kind.is_chat_turn() {
            turns += 1;
        }
        if let Some(segment) = prompt.pop() {
            popped.push(segment);
        }
    }
    popped.reverse();
    popped
}

pub(crate) fn pop_last_assistant_message(prompt: &mut Vec<PromptSegment>) -> Option<PromptSegment> {
    let index = prompt
        .iter()
        .rposition(|segment| segment.kind == SegmentKind::AssistantMsg)?;
    Some(prompt.remove(index))
}

/// Builds the ordered segment list for `conversation`.
///
/// Impersonation lowers `params.max_length` and the style's stop strings are
/// added to `params.stopping_strings`; nothing else is written to `params`.
pub fn assemble(
    style_for: impl Fn(&StyleContext<'_>) -> TemplateStyle,
    conversation: &ClassifiedConversation,
    options: &TemplateOptions,
    params: &mut GenerationParams,
) -> Vec<PromptSegment> {
    let roles = &conversation.roles;
    let impersonating = conversation.is_impersonation();
    let (you, other) = if impersonating {
        (roles.user.as_str(), roles.assistant.as_str())
    } else {
        (roles.assistant.as_str(), roles.user.as_str())
    };

    let jailbreak = conversation
        .jailbreak
        .as_deref()
        .unwrap_or(&options.jailbreak);
    let base = Placeholders {
        jailbreak,
        ..Placeholders::from_roles(roles)
    };
    let impersonation_prompt = replace_templates(
        conversation
            .impersonation_prompt
            .as_deref()
            .unwrap_or(&options.impersonation_prompt),
        &base,
    );
    let values = Placeholders {
        impersonation_prompt: &impersonation_prompt,
        ..base
    };
    let character_bias = replace_templates(&options.character_bias, &values);
    let silent_message = replace_templates(&options.silent_message, &values);
    let reply_attributes = replace_templates(&options.reply_attributes, &values);

    let style = style_for(&StyleContext {
        user: &roles.user,
        assistant: &roles.assistant,
        you,
        other,
        impersonating,
        reply_attributes: &reply_attributes,
        backend: options.backend,
    });
    let keep_first_example =
        options.always_keep_first_assistant_example || style.always_keep_first_example;

    let mut prompt = Vec::with_capacity(conversation.messages.len() + 8);
    if !style.system_prompt.is_empty() {
        prompt.push(PromptSegment::fixed(
            ChatRole::System,
            SegmentKind::SystemPrompt,
            style.wrap(ChatRole::System, &style.system_prompt),
        ));
    }

    let mut extension_prompt = None;
    for msg in &conversation.messages {
        let content = msg.content.trim();
        match msg.kind {
            SegmentKind::NewConversation => {
                if !style.new_conversation.is_empty() {
                    prompt.push(PromptSegment::fixed(
                        ChatRole::System,
                        msg.kind,
                        style.wrap(ChatRole::System, &style.new_conversation),
                    ));
                }
            }
            SegmentKind::NewExampleDialogue => {
                if !style.new_example.is_empty() && msg.meta.chat_index == Some(0) {
                    prompt.push(PromptSegment::fixed(
                        ChatRole::System,
                        msg.kind,
                        style.wrap(ChatRole::System, &style.new_example),
                    ));
                }
            }
            SegmentKind::Context => {
                let body = format!("{}{}", style.context, content);
                prompt.push(PromptSegment::fixed(
                    ChatRole::System,
                    msg.kind,
                    style.wrap(ChatRole::System, &body),
                ));
                if !style.context_response.is_empty() {
                    prompt.push(PromptSegment::fixed(
                        ChatRole::Assistant,
                        SegmentKind::ContextResponse,
                        style.wrap(ChatRole::Assistant, &style.context_response),
                    ));
                }
            }
            SegmentKind::ExampleAssistant => {
                let keep = options.keep_example_messages
                    || (keep_first_example && msg.meta.example_assistant_index == Some(0));
                prompt.push(PromptSegment::new(
                    ChatRole::Assistant,
                    msg.kind,
                    !keep,
                    style.turn(ChatRole::Assistant, &roles.assistant, true, content),
                ));
            }
            SegmentKind::ExampleUser => {
                prompt.push(PromptSegment::new(
                    ChatRole::User,
                    msg.kind,
                    !options.keep_example_messages,
                    style.turn(ChatRole::User, &roles.user, true, content),
                ));
            }
            SegmentKind::Other | SegmentKind::Jailbreak => {
                prompt.push(PromptSegment::fixed(
                    ChatRole::System,
                    msg.kind,
                    style.wrap(ChatRole::System, content),
                ));
            }
            SegmentKind::ExtensionPrompt => {
                extension_prompt = Some(PromptSegment::fixed(
                    ChatRole::System,
                    msg.kind,
                    style.wrap(ChatRole::System, content),
                ));
            }
            SegmentKind::AssistantMsg => {
                prompt.push(PromptSegment::new(
                    ChatRole::Assistant,
                    msg.kind,
                    true,
                    style.turn(ChatRole::Assistant, &roles.assistant, false, content),
                ));
            }
            SegmentKind::UserMsg => {
                prompt.push(PromptSegment::new(
                    ChatRole::User,
                    msg.kind,
                    true,
                    style.turn(ChatRole::User, &roles.user, false, content),
                ));
            }
            _ => {}
        }
    }

    let last_role = last_chat_turn(&prompt).map(|segment| segment.role);
    let live_tail = pop_last_chat_messages(&mut prompt, LIVE_TAIL_TURNS);

    prompt.push(PromptSegment::new(
        ChatRole::System,
        SegmentKind::InjectionPoint,
        true,
        "",
    ));
    if let Some(instruction) = &style.reply_instruction {
        prompt.push(PromptSegment::fixed(
            ChatRole::System,
            SegmentKind::ReplyInstruction,
            instruction.clone(),
        ));
    }
    prompt.extend(live_tail);

    let needs_open_reply =
        impersonating || last_role != Some(ChatRole::Assistant) || !silent_message.is_empty();
    let continued = if needs_open_reply {
        None
    } else {
        pop_last_assistant_message(&mut prompt)
    };

    match continued {
        Some(mut segment) => {
            if let Some(stripped) = segment.content.strip_suffix(&style.delimiters.after_assistant) {
                segment.content = stripped.to_string();
            }
            segment.prunable = false;
            debug!("Continuing the last assistant message");
            prompt.push(segment);
        }
        None => {
            if last_role == Some(ChatRole::Assistant) && !silent_message.is_empty() {
                prompt.push(PromptSegment::fixed(
                    ChatRole::User,
                    SegmentKind::SilentMessage,
                    style.turn(ChatRole::User, &roles.user, false, &silent_message),
                ));
            }
            if impersonating {
                prompt.push(PromptSegment::fixed(
                    ChatRole::System,
                    SegmentKind::ImpersonationPrompt,
                    style.wrap(ChatRole::System, &impersonation_prompt),
                ));
            }
            if let Some(instruction) = &style.final_instruction {
                prompt.push(PromptSegment::fixed(
                    ChatRole::System,
                    SegmentKind::ReplyInstruction,
                    instruction.clone(),
                ));
            }

            let role = if impersonating {
                ChatRole::User
            } else {
                ChatRole::Assistant
            };
            let mut opening = format!("{}{}", style.delimiters.before(role), style.reply_header);
            if style.trim_reply_prefix {
                opening.truncate(opening.trim_end().len());
            }
            opening.push_str(&character_bias);
            prompt.push(PromptSegment::fixed(
                role,
                SegmentKind::ReplyToComplete,
                opening,
            ));
        }
    }

    if impersonating {
        params.max_length = options.impersonation_max_new_tokens;
    }
    if let Some(segment) = extension_prompt {
        prompt.push(segment);
    }
    params.add_stopping_strings(style.stopping_strings.iter().cloned());

    prompt
}
