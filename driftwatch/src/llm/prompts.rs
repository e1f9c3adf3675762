//! Prompt templates for the relevance judge and segment summaries.

use crate::models::Message;

/// Characters kept from each context message.
pub const CONTEXT_MESSAGE_CHARS: usize = 500;
/// Characters kept from the message being classified.
pub const TARGET_MESSAGE_CHARS: usize = 2000;

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

fn format_context(context: &[Message]) -> String {
    if context.is_empty() {
        return "(no earlier messages)".to_string();
    }

    context
        .iter()
        .map(|m| {
            format!(
                "{}: {}",
                m.role.to_string().to_uppercase(),
                truncate(&m.content, CONTEXT_MESSAGE_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Ask how one message relates to the conversation's anchor topic.
///
/// `context` is the window of messages immediately before `message`; callers
/// pass at most the last five.
///
/// # Example
/// ```
/// use driftwatch::llm::prompts::relevance_prompt;
/// use driftwatch::models::Message;
///
/// let context = vec![Message::user("How do I tune postgres autovacuum?")];
/// let prompt = relevance_prompt(
///     "postgres autovacuum tuning",
///     &context,
///     &Message::user("Unrelated, what is a good pasta recipe?"),
/// );
/// assert!(prompt.contains("pasta"));
/// assert!(prompt.contains("is_segment_break"));
/// ```
pub fn relevance_prompt(anchor_topic: &str, context: &[Message], message: &Message) -> String {
    let context = format_context(context);
    let role = message.role.to_string().to_uppercase();
    let content = truncate(&message.content, TARGET_MESSAGE_CHARS);

    format!(
        r#"Analyze how this message relates to the conversation's original topic.

Original topic:
{anchor_topic}

Recent messages:
{context}

Message to classify:
{role}: {content}

Classify the message as exactly one of:
- CONTINUING: directly addresses the original topic
- CLARIFYING: asks for or gives clarification on the topic
- DRILLING: goes deeper into a narrower subtopic
- BRANCHING: starts a new, different topic
- TANGENT: a brief aside, likely to return
- CONCLUDING: wraps up the current topic
- RETURNING: comes back to an earlier topic after a departure

Also give a relevance score from 0 (unrelated) to 10 (fully on topic), whether this
message should start a new segment, and one or two sentences of reasoning.

Respond with valid JSON only:
{{"category": "...", "relevance_score": 0, "is_segment_break": false, "reasoning": "..."}}"#
    )
}

/// Ask for a one-sentence summary of a conversation segment.
///
/// # Example
/// ```
/// use driftwatch::llm::prompts::segment_summary_prompt;
/// use driftwatch::models::Message;
///
/// let span = vec![Message::user("Let's plan the database migration")];
/// let prompt = segment_summary_prompt(&span, 40);
/// assert!(prompt.contains("40 words"));
/// ```
pub fn segment_summary_prompt(messages: &[Message], max_words: usize) -> String {
    let transcript = format_context(messages);

    format!(
        r#"Summarize what the following part of a conversation is about in {max_words} words or less.
Name the topic, not the speakers.

Conversation:
{transcript}

Respond with only the summary, no preamble."#
    )
}
