//! Long-context expansion through a SuperBIG service.
//!
//! When the prompt overflows, remembered passages are fetched and spliced
//! in at the injection point as prunable segments, so the fitter keeps as
//! many of them as there is room for.

use crate::infrastructure::tokenizer::TokenCounter;
use crate::prompt::fitter::total_tokens;
use log::{debug, error};
use tavern_proxy_ai_adapters::SuperBigClient;
use tavern_proxy_core_types::{ChatRole, PromptSegment, SegmentKind};

fn flatten(content: &str) -> String {
    content.replace('#', "").replace('\n', " ").trim().to_string()
}

/// Splits dialogue segments into `(chatlog, last_messages)`.
pub fn build_chatlog(segments: &[PromptSegment]) -> (String, String) {
    let mut lines: Vec<String> = segments
        .iter()
        .filter(|segment| segment.kind.is_example() || segment.kind.is_chat_turn())
        .map(|segment| flatten(&segment.content))
        .collect();
    let last = lines.pop().unwrap_or_default();
    (lines.join("\n"), last)
}

fn injection_point(segments: &[PromptSegment]) -> Option<usize> {
    segments
        .iter()
        .rposition(|segment| segment.kind == SegmentKind::InjectionPoint)
}

/// Inserts one injected-context segment per non-empty line of `text` before
/// the injection point. Returns how many were inserted.
pub fn splice_injected_context(
    segments: &mut Vec<PromptSegment>,
    text: &str,
    counter: &dyn TokenCounter,
) -> usize {
    let Some(position) = injection_point(segments) else {
        return 0;
    };
    let injected: Vec<PromptSegment> = text
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            let content = format!("{}\n", line);
            let tokens = counter.count(&content);
            PromptSegment::new(ChatRole::System, SegmentKind::InjectedContext, true, content)
                .with_tokens(tokens)
        })
        .collect();
    let count = injected.len();
    segments.splice(position..position, injected);
    count
}

/// Asks the service for extra context when `segments` exceed `budget`.
///
/// Failures are logged and leave the prompt untouched.
pub async fn expand_context(
    client: &SuperBigClient,
    segments: &mut Vec<PromptSegment>,
    budget: i64,
    counter: &dyn TokenCounter,
) {
    if injection_point(segments).is_none() || total_tokens(segments) as i64 <= budget {
        return;
    }

    let (chatlog, last_messages) = build_chatlog(segments);
    match client.get_messages(&chatlog, &last_messages).await {
        Ok(text) => {
            let count = splice_injected_context(segments, &text, counter);
            debug!("Injected {} context lines", count);
        }
        Err(e) => {
            error!("SuperBIG request failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::tokenizer::EstimatingCounter;

    fn segment(kind: SegmentKind, content: &str) -> PromptSegment {
        PromptSegment::new(ChatRole::User, kind, true, content).with_tokens(1)
    }

    #[test]
    fn chatlog_uses_dialogue_only() {
        let segments = vec![
            segment(SegmentKind::Context, "card"),
            segment(SegmentKind::ExampleUser, "\n\n#### Bob:\nHi\n"),
            segment(SegmentKind::AssistantMsg, "\n\n#### Alice:\nHello\nthere\n"),
            segment(SegmentKind::UserMsg, "\n\n#### Bob:\nBye\n"),
        ];
        let (chatlog, last) = build_chatlog(&segments);
        assert_eq!(chatlog, "Bob: Hi\nAlice: Hello there");
        assert_eq!(last, "Bob: Bye");
    }

    #[test]
    fn lines_are_spliced_before_injection_point() {
        let mut segments = vec![
            segment(SegmentKind::UserMsg, "hi"),
            segment(SegmentKind::InjectionPoint, ""),
            segment(SegmentKind::ReplyToComplete, "reply"),
        ];
        let count = splice_injected_context(&mut segments, "fact one\n\nfact two", &EstimatingCounter);
        assert_eq!(count, 2);
        let kinds: Vec<SegmentKind> = segments.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SegmentKind::UserMsg,
                SegmentKind::InjectedContext,
                SegmentKind::InjectedContext,
                SegmentKind::InjectionPoint,
                SegmentKind::ReplyToComplete,
            ]
        );
        assert_eq!(segments[1].content, "fact one\n");
        assert!(segments[1].prunable);
        assert_eq!(segments[2].token_count, 3);
    }

    #[test]
    fn nothing_spliced_without_injection_point() {
        let mut segments = vec![segment(SegmentKind::UserMsg, "hi")];
        assert_eq!(splice_injected_context(&mut segments, "x", &EstimatingCounter), 0);
        assert_eq!(segments.len(), 1);
    }
}
