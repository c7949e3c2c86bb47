//! Message classification.
//!
//! Tavern sends the whole chat as a flat list of messages: character card,
//! example dialogues, live turns and a few control messages. This module
//! finds the two role names, normalizes example messages and tags every
//! message with a [`SegmentKind`] so templates can lay them out.

use crate::util::errors::{ProxyError, ProxyResult};
use log::debug;
use tavern_proxy_core_types::{
    ChatMessage, ChatRole, MessageMetadata, RoleNames, SegmentKind, TaggedMessage,
};

pub const IMPERSONATION_MARKER: &str = "IMPERSONATION_PROMPT";
pub const EXTENSION_OBJECTIVE_MARKER: &str =
    "Pause your roleplay. Determine if this task is completed:";
pub const NEW_CHAT_MARKER: &str = "[Start a new chat]";

const EXAMPLE_ASSISTANT_NAME: &str = "example_assistant";
const EXAMPLE_USER_NAME: &str = "example_user";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationStats {
    pub messages: usize,
    pub example_chats: usize,
    pub example_user_messages: usize,
    pub example_assistant_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub chat_messages: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedConversation {
    pub roles: RoleNames,
    pub messages: Vec<TaggedMessage>,
    /// Text following the impersonation marker, when the client sent one.
    pub impersonation_prompt: Option<String>,
    /// Content of a trailing free-form system message.
    pub jailbreak: Option<String>,
    pub stats: ConversationStats,
}

impl ClassifiedConversation {
    pub fn is_impersonation(&self) -> bool {
        self.messages
            .iter()
            .any(|msg| msg.kind == SegmentKind::ImpersonationPrompt)
    }
}

fn is_control_message(content: &str) -> bool {
    content.starts_with(IMPERSONATION_MARKER) || content.starts_with(EXTENSION_OBJECTIVE_MARKER)
}

fn first_line(content: &str) -> &str {
    match content.find('\n') {
        Some(pos) => content[..pos].trim(),
        None => content,
    }
}

/// Splits `"Alice|Bob"` or `"Alice\\nBob"` (escaped newline) into two names.
fn split_name_pair(line: &str) -> Option<(String, String)> {
    let mut parts: Vec<&str> = line.split("\\n").collect();
    if parts.len() == 1 {
        parts = line.split('|').collect();
    }
    match parts.as_slice() {
        [assistant, user] => Some((assistant.trim().to_string(), user.trim().to_string())),
        _ => None,
    }
}

enum NameSource {
    FirstLine,
    WholeMessage,
}

/// Locates the role-name pair and strips it from its message.
///
/// Search order: the first line of the first system message, then the
/// first line of the last message (stepping back over a trailing control
/// message) when that one is a system message, then that same message
/// holding exactly two lines.
fn extract_role_names(messages: &mut Vec<ChatMessage>) -> RoleNames {
    let first_system = messages.iter().position(|msg| msg.role == ChatRole::System);

    let mut last = messages.len().checked_sub(1);
    if let Some(index) = last {
        let msg = &messages[index];
        if msg.role == ChatRole::System && is_control_message(&msg.content) {
            last = index.checked_sub(1);
        }
    }
    let last_system = last.filter(|&index| messages[index].role == ChatRole::System);

    let mut found: Option<(usize, (String, String), NameSource)> = None;
    for index in [first_system, last_system].into_iter().flatten() {
        if let Some(pair) = split_name_pair(first_line(messages[index].content.trim())) {
            found = Some((index, pair, NameSource::FirstLine));
            break;
        }
    }
    if found.is_none() {
        if let Some(index) = last_system {
            let lines: Vec<&str> = messages[index].content.trim().split('\n').collect();
            if let [assistant, user] = lines.as_slice() {
                let pair = (assistant.trim().to_string(), user.trim().to_string());
                found = Some((index, pair, NameSource::WholeMessage));
            }
        }
    }

    let Some((index, (assistant, user), source)) = found else {
        debug!("No role names found, using defaults");
        return RoleNames::default();
    };

    let content = messages[index].content.trim();
    let remaining = match (source, content.find('\n')) {
        (NameSource::FirstLine, Some(pos)) => content[pos + 1..].trim_start().to_string(),
        _ => String::new(),
    };
    if remaining.is_empty() {
        messages.remove(index);
    } else {
        messages[index].content = remaining;
    }

    debug!("Role names: user={:?}, assistant={:?}", user, assistant);
    RoleNames::new(user, assistant)
}

/// Example messages may pack several turns as `"...\n{name}: ..."`; joins them
/// into one turn with plain newlines.
fn fix_example_messages(messages: &mut [ChatMessage], roles: &RoleNames) {
    for msg in messages.iter_mut() {
        if msg.role != ChatRole::System {
            continue;
        }
        let speaker = match msg.name.as_deref() {
            Some(EXAMPLE_ASSISTANT_NAME) => &roles.assistant,
            Some(EXAMPLE_USER_NAME) => &roles.user,
            _ => continue,
        };
        let separator = format!("\n{}:", speaker);
        msg.content = msg
            .content
            .split(separator.as_str())
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("\n");
    }
}

fn tag_messages(messages: Vec<ChatMessage>) -> ClassifiedConversation {
    let total = messages.len();
    let mut tagged = Vec::with_capacity(total);
    let mut impersonation_prompt = None;
    let mut jailbreak = None;

    let mut context_found = false;
    let mut new_chat_count = 0usize;
    let mut example_msg_count = 0usize;
    let mut example_user_count = 0usize;
    let mut example_assistant_count = 0usize;
    let mut chat_msg_count = 0usize;
    let mut user_msg_count = 0usize;
    let mut assistant_msg_count = 0usize;
    let mut other_count = 0usize;

    for (index, msg) in messages.into_iter().enumerate() {
        let ChatMessage { role, mut content, name } = msg;
        let mut meta = MessageMetadata {
            index,
            ..MessageMetadata::default()
        };

        let kind = match role {
            ChatRole::System => {
                if content.trim() == NEW_CHAT_MARKER {
                    meta.chat_index = Some(new_chat_count);
                    new_chat_count += 1;
                    SegmentKind::NewExampleDialogue
                } else if !context_found {
                    context_found = true;
                    SegmentKind::Context
                } else if content.starts_with(IMPERSONATION_MARKER) {
                    content = content
                        .replacen(IMPERSONATION_MARKER, "", 1)
                        .trim_start()
                        .to_string();
                    if !content.is_empty() {
                        impersonation_prompt = Some(content.clone());
                    }
                    SegmentKind::ImpersonationPrompt
                } else if content.starts_with(EXTENSION_OBJECTIVE_MARKER) {
                    SegmentKind::ExtensionPrompt
                } else if name.as_deref() == Some(EXAMPLE_ASSISTANT_NAME) {
                    meta.chat_index = new_chat_count.checked_sub(1);
                    meta.example_msg_index = Some(example_msg_count);
                    meta.example_assistant_index = Some(example_assistant_count);
                    example_msg_count += 1;
                    example_assistant_count += 1;
                    SegmentKind::ExampleAssistant
                } else if name.as_deref() == Some(EXAMPLE_USER_NAME) {
                    meta.chat_index = new_chat_count.checked_sub(1);
                    meta.example_msg_index = Some(example_msg_count);
                    meta.example_user_index = Some(example_user_count);
                    example_msg_count += 1;
                    example_user_count += 1;
                    SegmentKind::ExampleUser
                } else if index + 1 == total {
                    if !content.is_empty() {
                        jailbreak = Some(content.clone());
                    }
                    other_count += 1;
                    SegmentKind::Jailbreak
                } else {
                    meta.other_index = Some(other_count);
                    other_count += 1;
                    SegmentKind::Other
                }
            }
            ChatRole::Assistant => {
                meta.chat_msg_index = Some(chat_msg_count);
                meta.assistant_msg_index = Some(assistant_msg_count);
                chat_msg_count += 1;
                assistant_msg_count += 1;
                SegmentKind::AssistantMsg
            }
            ChatRole::User => {
                meta.chat_msg_index = Some(chat_msg_count);
                meta.user_msg_index = Some(user_msg_count);
                chat_msg_count += 1;
                user_msg_count += 1;
                SegmentKind::UserMsg
            }
        };

        tagged.push(TaggedMessage {
            role,
            content,
            name,
            kind,
            meta,
        });
    }

    if let Some(last_delimiter) = tagged
        .iter_mut()
        .rev()
        .find(|msg| msg.kind == SegmentKind::NewExampleDialogue)
    {
        last_delimiter.kind = SegmentKind::NewConversation;
        last_delimiter.meta.chat_index = None;
    }

    ClassifiedConversation {
        roles: RoleNames::default(),
        messages: tagged,
        impersonation_prompt,
        jailbreak,
        stats: ConversationStats {
            messages: total,
            example_chats: new_chat_count.saturating_sub(1),
            example_user_messages: example_user_count,
            example_assistant_messages: example_assistant_count,
            user_messages: user_msg_count,
            assistant_messages: assistant_msg_count,
            chat_messages: chat_msg_count,
        },
    }
}

/// Extracts role names and tags every message.
pub fn classify(mut messages: Vec<ChatMessage>) -> ProxyResult<ClassifiedConversation> {
    if messages.is_empty() {
        return Err(ProxyError::invalid_request("messages must not be empty"));
    }

    let roles = extract_role_names(&mut messages);
    fix_example_messages(&mut messages, &roles);

    let mut conversation = tag_messages(messages);
    conversation.roles = roles;
    debug!("Classified conversation: {:?}", conversation.stats);
    Ok(conversation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(conversation: &ClassifiedConversation) -> Vec<SegmentKind> {
        conversation.messages.iter().map(|msg| msg.kind).collect()
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = classify(Vec::new()).unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn pipe_names_on_first_line_are_extracted() {
        let conversation = classify(vec![ChatMessage::system("Alice|Bob\nHello")]).unwrap();
        assert_eq!(conversation.roles.assistant, "Alice");
        assert_eq!(conversation.roles.user, "Bob");
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0].content, "Hello");
        assert_eq!(conversation.messages[0].kind, SegmentKind::Context);
    }

    #[test]
    fn escaped_newline_separator_is_supported() {
        let conversation = classify(vec![
            ChatMessage::system("Alice\\nBob\nCard text"),
            ChatMessage::user("Hi"),
        ])
        .unwrap();
        assert_eq!(conversation.roles, RoleNames::new("Bob", "Alice"));
        assert_eq!(conversation.messages[0].content, "Card text");
    }

    #[test]
    fn name_only_message_is_removed() {
        let conversation = classify(vec![
            ChatMessage::system("Card text"),
            ChatMessage::user("Hi"),
            ChatMessage::system("Alice|Bob"),
        ])
        .unwrap();
        assert_eq!(conversation.roles, RoleNames::new("Bob", "Alice"));
        assert_eq!(
            kinds(&conversation),
            vec![SegmentKind::Context, SegmentKind::UserMsg]
        );
    }

    #[test]
    fn names_found_before_trailing_impersonation_marker() {
        let conversation = classify(vec![
            ChatMessage::system("Card text"),
            ChatMessage::assistant("Hello"),
            ChatMessage::system("Alice\nBob"),
            ChatMessage::system("IMPERSONATION_PROMPT Write as Bob."),
        ])
        .unwrap();
        assert_eq!(conversation.roles, RoleNames::new("Bob", "Alice"));
        assert_eq!(
            kinds(&conversation),
            vec![
                SegmentKind::Context,
                SegmentKind::AssistantMsg,
                SegmentKind::ImpersonationPrompt
            ]
        );
        assert_eq!(conversation.impersonation_prompt.as_deref(), Some("Write as Bob."));
        assert!(conversation.is_impersonation());
    }

    #[test]
    fn defaults_when_no_pair() {
        let conversation = classify(vec![
            ChatMessage::system("A long card\nwith\nmany lines"),
            ChatMessage::user("Hi"),
        ])
        .unwrap();
        assert_eq!(conversation.roles, RoleNames::default());
        assert_eq!(conversation.messages[0].content, "A long card\nwith\nmany lines");
    }

    #[test]
    fn example_turns_are_joined() {
        let conversation = classify(vec![
            ChatMessage::system("Alice|Bob\nCard"),
            ChatMessage::system("[Start a new chat]"),
            ChatMessage::system("Hi there\nAlice: How are you?").with_name("example_assistant"),
        ])
        .unwrap();
        assert_eq!(conversation.messages[2].content, "Hi there\nHow are you?");
    }

    #[test]
    fn tags_full_conversation() {
        let conversation = classify(vec![
            ChatMessage::system("Alice|Bob\nCard"),
            ChatMessage::system("[Start a new chat]"),
            ChatMessage::system("Hello").with_name("example_user"),
            ChatMessage::system("Hi!").with_name("example_assistant"),
            ChatMessage::system("[Start a new chat]"),
            ChatMessage::system("Yo").with_name("example_user"),
            ChatMessage::system("Hey").with_name("example_assistant"),
            ChatMessage::system("[Start a new chat]"),
            ChatMessage::system("Scenario note"),
            ChatMessage::assistant("Welcome."),
            ChatMessage::user("Thanks."),
            ChatMessage::system("Stay in character."),
        ])
        .unwrap();

        assert_eq!(
            kinds(&conversation),
            vec![
                SegmentKind::Context,
                SegmentKind::NewExampleDialogue,
                SegmentKind::ExampleUser,
                SegmentKind::ExampleAssistant,
                SegmentKind::NewExampleDialogue,
                SegmentKind::ExampleUser,
                SegmentKind::ExampleAssistant,
                SegmentKind::NewConversation,
                SegmentKind::Other,
                SegmentKind::AssistantMsg,
                SegmentKind::UserMsg,
                SegmentKind::Jailbreak,
            ]
        );

        let msgs = &conversation.messages;
        assert_eq!(msgs[1].meta.chat_index, Some(0));
        assert_eq!(msgs[4].meta.chat_index, Some(1));
        assert_eq!(msgs[7].meta.chat_index, None);
        assert_eq!(msgs[5].meta.chat_index, Some(1));
        assert_eq!(msgs[5].meta.example_msg_index, Some(2));
        assert_eq!(msgs[5].meta.example_user_index, Some(1));
        assert_eq!(msgs[6].meta.example_assistant_index, Some(1));
        assert_eq!(msgs[8].meta.other_index, Some(0));
        assert_eq!(msgs[10].meta.chat_msg_index, Some(1));
        assert_eq!(msgs[10].meta.user_msg_index, Some(0));
        assert_eq!(conversation.jailbreak.as_deref(), Some("Stay in character."));
        assert_eq!(conversation.stats.example_chats, 2);
        assert_eq!(conversation.stats.chat_messages, 2);
    }

    #[test]
    fn extension_prompt_is_tagged() {
        let conversation = classify(vec![
            ChatMessage::system("Card"),
            ChatMessage::user("Hi"),
            ChatMessage::system(format!("{} find the key", EXTENSION_OBJECTIVE_MARKER)),
        ])
        .unwrap();
        assert_eq!(conversation.messages[2].kind, SegmentKind::ExtensionPrompt);
        assert!(conversation.jailbreak.is_none());
    }
}
