//! MCP protocol types
//!
//! JSON-RPC 2.0 framing plus the typed params/results for the MCP methods
//! envctl speaks on both sides of the aggregator: `initialize`,
//! `tools/list`, `tools/call`, `resources/list`, `resources/read`,
//! `prompts/list`, `prompts/get`.

mod messages;
mod types;

pub use messages::{
    InitializeParams, InitializeResult, JsonRpcError, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, PromptsGetParams, PromptsGetResult, PromptsListResult,
    RequestId, ResourcesListResult, ResourcesReadParams, ResourcesReadResult, ToolsCallParams,
    ToolsListResult,
};
pub use types::{
    ClientCapabilities, Content, Info, Prompt, PromptArgument, PromptMessage, Resource,
    ResourceContents, ServerCapabilities, Tool,
};
