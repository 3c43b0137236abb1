use crate::aggregator::AggregatedToolSet;
use muster_core::ToolDescriptor;
use serde_json::json;

/// Provider name that owns every fallback tool.
pub const FALLBACK_PROVIDER: &str = "builtin";

/// Base instructions used when the fallback set replaces external providers.
pub const FALLBACK_INSTRUCTIONS: &str = "You are a helpful assistant with built-in weather and \
file management capabilities. External tool providers are unavailable for this session.";

/// Static, dependency-free capability set substituted when no external
/// provider is usable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackProvider;

impl FallbackProvider {
    /// The built-in tool set.
    pub fn capabilities() -> AggregatedToolSet {
        let string = |desc: &str| json!({"type": "string", "description": desc});
        let tool = |name: &str, description: &str, properties: serde_json::Value, required: &[&str]| {
            ToolDescriptor::new(name, FALLBACK_PROVIDER, description).with_schema(json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }))
        };

        AggregatedToolSet::from_tools([
            tool(
                "get_weather",
                "Retrieves the current weather report for a specified city.",
                json!({"city": string("The name of the city")}),
                &["city"],
            ),
            tool(
                "list_files",
                "Lists all files in the specified directory.",
                json!({"directory_path": string("Directory to list")}),
                &["directory_path"],
            ),
            tool(
                "read_file_content",
                "Reads and returns the content of a text file.",
                json!({"file_path": string("File to read")}),
                &["file_path"],
            ),
            tool(
                "write_file_content",
                "Writes content to a text file, creating parent directories.",
                json!({
                    "file_path": string("File to write"),
                    "content": string("Text to write"),
                }),
                &["file_path", "content"],
            ),
            tool(
                "create_dir",
                "Creates a new directory.",
                json!({"directory_path": string("Directory to create")}),
                &["directory_path"],
            ),
            tool(
                "search_for_files",
                "Searches for files matching a glob pattern under a directory.",
                json!({
                    "directory_path": string("Directory to search"),
                    "pattern": string("Glob pattern, e.g. *.txt"),
                }),
                &["directory_path", "pattern"],
            ),
        ])
    }

    /// Instructions used with the built-in set.
    pub fn base_instructions() -> &'static str {
        FALLBACK_INSTRUCTIONS
    }
}
