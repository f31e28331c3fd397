pub mod chat;
pub mod gemini;
pub mod openai;

pub use chat::{
    CanonicalResponse, ChatMessage, ContentPart, FileAttachment, FunctionCall, FunctionSchema,
    ImageUrl, MessageContent, ResponseChoice, ResponseMessage, Role, ToolCall, ToolDefinition,
    Usage,
};
pub use openai::{EmbeddingItem, EmbeddingResponse, EmbeddingUsage};
