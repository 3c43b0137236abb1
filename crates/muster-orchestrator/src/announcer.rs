//! Turns an [`AggregatedToolSet`] into the agent's instruction context.
//! Pure: the same set always renders the same text.

use crate::aggregator::AggregatedToolSet;
use serde::Serialize;
use std::collections::BTreeMap;

/// Opening line used when no base instructions are configured.
pub const DEFAULT_BASE_INSTRUCTIONS: &str =
    "You are a helpful assistant with multiple capabilities.";

const CLOSING_GUIDANCE: &str = "Always use the most appropriate tool for each task. \
When working with files or technical tasks, use the available tools rather than explaining manual steps. \
Confirm when operations have been completed successfully.";

/// A capability sentence and the tool names that unlock it.
struct Hint {
    tools: &'static [&'static str],
    sentence: &'static str,
}

const HINTS: &[Hint] = &[
    Hint {
        tools: &["get_weather"],
        sentence: "You can provide weather information for any city using the 'get_weather' tool.",
    },
    Hint {
        tools: &[
            "read_file", "write_file", "list_directory", "create_directory", "search_files",
            "get_file_info", "move_file", "edit_file", "list_files", "read_file_content",
            "write_file_content", "create_dir", "search_for_files",
        ],
        sentence: "You can work with files and directories: list, read, write, create, search, move and edit them.",
    },
    Hint {
        tools: &[
            "search", "fetch_content", "firecrawl_search", "firecrawl_scrape", "firecrawl_map",
            "firecrawl_crawl", "firecrawl_extract", "firecrawl_deep_research",
        ],
        sentence: "You can search the web and fetch page content.",
    },
    Hint {
        tools: &[
            "read_graph", "search_nodes", "create_entities", "create_relations", "add_observations",
            "delete_entities", "delete_observations", "delete_relations", "open_nodes",
        ],
        sentence: "You can store and retrieve information using knowledge graph memory tools.",
    },
    Hint {
        tools: &[
            "search_repositories", "create_repository", "get_file_contents", "create_or_update_file",
            "push_files", "create_issue", "create_pull_request", "create_branch", "fork_repository",
            "list_commits", "list_issues", "search_code", "get_pull_request", "merge_pull_request",
        ],
        sentence: "You can interact with GitHub to manage repositories, files, code, issues and pull requests.",
    },
    Hint {
        tools: &[
            "browserbase_create_session", "browserbase_navigate", "browser_navigate", "browser_click",
            "browser_type", "browser_snapshot", "browser_take_screenshot", "browser_close",
        ],
        sentence: "You can control a web browser to navigate websites, fill forms, click elements and take screenshots.",
    },
    Hint {
        tools: &["list_events", "create_event", "find_free_slots", "delete_event", "update_event", "get_calendars"],
        sentence: "You can manage calendar events, schedule meetings and find free time slots.",
    },
    Hint {
        tools: &["send_email", "draft_email", "read_email", "search_emails", "modify_email", "delete_email"],
        sentence: "You can send, read, search and manage emails.",
    },
    Hint {
        tools: &["airbnb_search", "airbnb_listing_details"],
        sentence: "You can search for Airbnb listings and get details about specific properties.",
    },
    Hint {
        tools: &["text_to_speech", "speech_to_text", "text_to_sound_effects", "search_voices", "voice_clone"],
        sentence: "You can convert between text and speech, clone voices and create sound effects using ElevenLabs.",
    },
];

/// The agent-facing description of what is currently available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentInstructionContext {
    /// Text the rendered instructions start with.
    pub base_instructions: String,
    /// Tool names grouped by owning provider.
    pub providers: BTreeMap<String, Vec<String>>,
    /// Capability sentences, in a fixed order.
    pub hints: Vec<String>,
    /// Fully rendered instruction text.
    pub text: String,
}

impl AgentInstructionContext {
    /// Tools across every provider.
    pub fn tool_count(&self) -> usize {
        self.providers.values().map(Vec::len).sum()
    }
}

/// Render the instruction context for `tools`.
pub fn render(tools: &AggregatedToolSet, base_instructions: &str) -> AgentInstructionContext {
    let base = if base_instructions.trim().is_empty() {
        DEFAULT_BASE_INSTRUCTIONS.to_string()
    } else {
        base_instructions.trim().to_string()
    };

    let providers: BTreeMap<String, Vec<String>> = tools
        .by_provider()
        .into_iter()
        .map(|(p, names)| (p.to_string(), names.into_iter().map(str::to_string).collect()))
        .collect();

    let hints: Vec<String> = HINTS
        .iter()
        .filter(|h| h.tools.iter().any(|t| tools.contains(t)))
        .map(|h| h.sentence.to_string())
        .collect();

    let mut text = base.clone();
    text.push_str("\n\n");
    if providers.is_empty() {
        text.push_str("No tools are currently available.\n");
    } else {
        text.push_str("Available tools by provider:\n");
        for (provider, names) in &providers {
            text.push_str(&format!("- {provider}: {}\n", names.join(", ")));
        }
    }
    if !hints.is_empty() {
        text.push_str("\nCapabilities:\n");
        for hint in &hints {
            text.push_str(&format!("- {hint}\n"));
        }
    }
    text.push('\n');
    text.push_str(CLOSING_GUIDANCE);
    text.push('\n');

    AgentInstructionContext {
        base_instructions: base,
        providers,
        hints,
        text,
    }
}
