//! System prompt assembly.

use chrono::{DateTime, Utc};

use super::intent::Intent;

/// Per-turn values interpolated into the system prompt.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub tenant_name: String,
    pub user_name: String,
    pub now: DateTime<Utc>,
    pub available_tools: Vec<String>,
}

const CAPABILITIES: &str = r"## Core Capabilities & Instructions

### 1. Memory Management
You have access to a persistent memory system that can store and retrieve:
- **Notes**: General information, thoughts, reminders
- **Tasks**: Action items with optional due dates
- **Events**: Scheduled activities with timestamps
- **Messages**: Conversation history and important exchanges

Store important information the user shares, categorise it (note/task/event/msg)
with tags and timestamps where useful, and search memory before answering
questions about the user.

### 2. Tool Usage Policy
Only call tools when the request actually needs them:
- save/store/remember something: upsert_item
- search/find/recall something: search
- update/modify stored information: update_item
- external data (weather, API calls): call_api

Do not call tools for general conversation, explanations, greetings,
acknowledgements or questions about your capabilities.

### 3. Communication Style
Be conversational and concise. Confirm actions after completing them,
summarise search findings, ask clarifying questions when needed and answer in
the user's language.

### 4. Memory Context
When memory context is provided, reference it naturally without repeating it
verbatim, and mention when information comes from earlier conversations.";

const REMINDERS: &str = r"## Important Reminders
1. Search memory before storing to avoid duplicates.
2. Only call tools when necessary, not for every message.
3. Focus on what the user needs, not on demonstrating tools.
4. Acknowledge successful storage or updates briefly.";

fn tool_line(name: &str) -> String {
    let summary = match name {
        "upsert_item" => "Store new information (notes, tasks, events)",
        "search" => "Find relevant information from memory",
        "get_by_id" => "Retrieve specific memory items",
        "update_item" => "Modify existing memory items",
        "delete_item" => "Remove memory items",
        "call_api" => "Make external API calls to configured services",
        _ => "Additional capability",
    };
    format!("- **{name}**: {summary}")
}

/// One-line steer appended for intents that map to a specific tool.
pub fn intent_focus(intent: Intent) -> Option<&'static str> {
    match intent {
        Intent::MemoryStore => Some(
            "**Current Focus**: The user wants to store information. Use upsert_item to save it with appropriate categorization.",
        ),
        Intent::MemorySearch => Some(
            "**Current Focus**: The user wants to find stored information. Use search to find relevant memories.",
        ),
        Intent::MemoryUpdate => Some(
            "**Current Focus**: The user wants to update existing information. First search for the item, then use update_item.",
        ),
        Intent::ApiCall => Some(
            "**Current Focus**: The user needs external API interaction. Use call_api with the appropriate configured service.",
        ),
        Intent::Schedule => Some(
            "**Current Focus**: The user wants to be reminded of something. Store it as an event with a time using upsert_item.",
        ),
        Intent::Conversational => None,
    }
}

/// The base assistant prompt: persona, current context, policy and tools.
pub fn main_prompt(ctx: &PromptContext) -> String {
    let mut prompt = format!(
        "You are a helpful personal assistant with perfect memory capabilities. \
         Your role is to help users manage their tasks, notes, events, and provide assistance through various tools.\n\n\
         ## Current Context\n\
         - Current time: {}\n\
         - User: {}\n\
         - Tenant: {}\n\n\
         {CAPABILITIES}\n\n\
         ## Available Tools",
        ctx.now.format("%Y-%m-%d %H:%M:%S UTC"),
        ctx.user_name,
        ctx.tenant_name,
    );

    if ctx.available_tools.is_empty() {
        prompt.push_str("\nNo tools are available for this conversation.");
    } else {
        prompt.push_str("\nYou have access to the following tools:");
        for tool in &ctx.available_tools {
            prompt.push('\n');
            prompt.push_str(&tool_line(tool));
        }
    }

    prompt.push_str("\n\n");
    prompt.push_str(REMINDERS);
    prompt
}

/// Full system prompt: base prompt, optional memory context block and the
/// intent focus line.
pub fn system_prompt(ctx: &PromptContext, intent: Intent, memory_context: &str) -> String {
    let mut prompt = main_prompt(ctx);
    if !memory_context.is_empty() {
        prompt.push_str("\n\n## Relevant Memory Context\n");
        prompt.push_str(memory_context);
    }
    if let Some(focus) = intent_focus(intent) {
        prompt.push_str("\n\n");
        prompt.push_str(focus);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(tools: &[&str]) -> PromptContext {
        PromptContext {
            tenant_name: "tenant_a".into(),
            user_name: "alice".into(),
            now: Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap(),
            available_tools: tools.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_main_prompt_lists_context_and_tools() {
        let prompt = main_prompt(&ctx(&["upsert_item", "search"]));
        assert!(prompt.contains("- Current time: 2025-03-01 12:30:00 UTC"));
        assert!(prompt.contains("- User: alice"));
        assert!(prompt.contains("- **upsert_item**: Store new information"));
        assert!(prompt.contains("- **search**: Find relevant information"));
        assert!(!prompt.contains("call_api**"));
    }

    #[test]
    fn test_system_prompt_adds_memory_and_focus() {
        let prompt = system_prompt(&ctx(&[]), Intent::MemorySearch, "Relevant context from your memory:\n- task");
        assert!(prompt.contains("## Relevant Memory Context\nRelevant context from your memory:"));
        assert!(prompt.ends_with("Use search to find relevant memories."));

        let plain = system_prompt(&ctx(&[]), Intent::Conversational, "");
        assert!(!plain.contains("Relevant Memory Context"));
        assert!(!plain.contains("Current Focus"));
    }
}
