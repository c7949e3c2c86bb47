use crate::chat::ChatRole;
use serde::{Deserialize, Serialize};

/// Semantic label attached to classified messages and prompt segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SegmentKind {
    SystemPrompt,
    NewConversation,
    NewExampleDialogue,
    Context,
    ContextResponse,
    ExampleAssistant,
    ExampleUser,
    Other,
    Jailbreak,
    ImpersonationPrompt,
    ExtensionPrompt,
    AssistantMsg,
    UserMsg,
    ReplyInstruction,
    ReplyToComplete,
    SilentMessage,
    InjectionPoint,
    InjectedContext,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::SystemPrompt => "system-prompt",
            SegmentKind::NewConversation => "new-conversation",
            SegmentKind::NewExampleDialogue => "new-example-dialogue",
            SegmentKind::Context => "context",
            SegmentKind::ContextResponse => "context-response",
            SegmentKind::ExampleAssistant => "example-assistant",
            SegmentKind::ExampleUser => "example-user",
            SegmentKind::Other => "other",
            SegmentKind::Jailbreak => "jailbreak",
            SegmentKind::ImpersonationPrompt => "impersonation-prompt",
            SegmentKind::ExtensionPrompt => "extension-prompt",
            SegmentKind::AssistantMsg => "assistant-msg",
            SegmentKind::UserMsg => "user-msg",
            SegmentKind::ReplyInstruction => "reply-instruction",
            SegmentKind::ReplyToComplete => "reply-to-complete",
            SegmentKind::SilentMessage => "silent-message",
            SegmentKind::InjectionPoint => "injection-point",
            SegmentKind::InjectedContext => "injected-context",
        }
    }

    /// Live conversation turns (not examples).
    pub fn is_chat_turn(&self) -> bool {
        matches!(self, SegmentKind::AssistantMsg | SegmentKind::UserMsg)
    }

    pub fn is_example(&self) -> bool {
        matches!(self, SegmentKind::ExampleAssistant | SegmentKind::ExampleUser)
    }

    /// Separators between example dialogues and the live conversation.
    pub fn is_dialogue_delimiter(&self) -> bool {
        matches!(
            self,
            SegmentKind::NewConversation | SegmentKind::NewExampleDialogue
        )
    }
}

/// Ordinals assigned while walking the conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub index: usize,
    /// Enclosing example dialogue block.
    pub chat_index: Option<usize>,
    pub example_msg_index: Option<usize>,
    pub example_assistant_index: Option<usize>,
    pub example_user_index: Option<usize>,
    /// Position among live chat turns of either role.
    pub chat_msg_index: Option<usize>,
    pub assistant_msg_index: Option<usize>,
    pub user_msg_index: Option<usize>,
    pub other_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMessage {
    pub role: ChatRole,
    pub content: String,
    pub name: Option<String>,
    pub kind: SegmentKind,
    pub meta: MessageMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSegment {
    pub role: ChatRole,
    pub kind: SegmentKind,
    pub prunable: bool,
    pub content: String,
    /// Filled in after tokenization; zero until then.
    pub token_count: usize,
}

impl PromptSegment {
    pub fn new(role: ChatRole, kind: SegmentKind, prunable: bool, content: impl Into<String>) -> Self {
        Self {
            role,
            kind,
            prunable,
            content: content.into(),
            token_count: 0,
        }
    }

    pub fn fixed(role: ChatRole, kind: SegmentKind, content: impl Into<String>) -> Self {
        Self::new(role, kind, false, content)
    }

    pub fn with_tokens(mut self, token_count: usize) -> Self {
        self.token_count = token_count;
        self
    }
}
