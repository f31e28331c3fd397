use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use qproxy_common::now_epoch_ms;
use qproxy_protocol::chat::{
    CanonicalResponse, ChatMessage, ContentPart, FunctionCall as ChatFunctionCall, MessageContent,
    ResponseChoice, ResponseMessage, Role, ToolCall, ToolDefinition, Usage,
};
use qproxy_protocol::gemini::{
    BatchEmbedContentsRequest, BatchEmbedContentsResponse, Content, ContentRole,
    EmbedContentRequest, FunctionCall, FunctionDeclaration, FunctionResponse, GenerateContentRequest,
    GenerateContentResponse, GenerationConfig, Part, Tool,
};
use qproxy_protocol::openai::{EmbeddingItem, EmbeddingResponse, EmbeddingUsage};
use qproxy_protocol::FileAttachment;

use crate::http::{build_client, ensure_success, fetch_image};
use crate::{ChatRequest, OutputFormat, Provider, ProviderError, ProviderResult};

/// Surfaced instead of an error when a candidate is suppressed by a safety
/// filter. Treated as a successful reply end to end.
pub const SAFETY_PLACEHOLDER: &str = "⚠️ I cannot answer this due to safety filters.";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
}

pub struct GeminiProvider {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> ProviderResult<Self> {
        Ok(Self {
            config,
            client: build_client()?,
        })
    }

    fn api_key(&self) -> ProviderResult<&str> {
        self.config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(ProviderError::MissingCredentials("gemini"))
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn has_credentials(&self) -> bool {
        self.config
            .api_key
            .as_deref()
            .is_some_and(|key| !key.is_empty())
    }

    async fn invoke(&self, request: &ChatRequest) -> ProviderResult<CanonicalResponse> {
        let key = self.api_key()?.to_string();
        let contents = build_contents(&self.client, &request.messages, &request.files).await;
        let body = GenerateContentRequest {
            contents,
            tools: map_tools(request.tools.as_deref()),
            generation_config: Some(GenerationConfig {
                temperature: Some(request.temperature),
                response_mime_type: match request.output_format {
                    OutputFormat::Json => Some("application/json".to_string()),
                    OutputFormat::Text => None,
                },
            }),
        };

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url, self.config.model
        );
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await?;
        let reply: GenerateContentResponse = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;
        Ok(canonical_from_gemini(reply))
    }

    async fn embed(&self, inputs: &[String]) -> ProviderResult<EmbeddingResponse> {
        let key = self.api_key()?.to_string();
        let model = format!("models/{}", self.config.embedding_model);
        let body = BatchEmbedContentsRequest {
            requests: inputs
                .iter()
                .map(|text| EmbedContentRequest {
                    model: model.clone(),
                    content: Content {
                        parts: vec![Part::text(text.clone())],
                        role: None,
                    },
                })
                .collect(),
        };

        let url = format!(
            "{}/v1beta/models/{}:batchEmbedContents",
            self.config.base_url, self.config.embedding_model
        );
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await?;
        let reply: BatchEmbedContentsResponse = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;

        Ok(EmbeddingResponse {
            object: "list".to_string(),
            data: reply
                .embeddings
                .into_iter()
                .enumerate()
                .map(|(index, embedding)| EmbeddingItem {
                    object: "embedding".to_string(),
                    embedding: embedding.values,
                    index: index as u32,
                })
                .collect(),
            model: self.config.embedding_model.clone(),
            usage: EmbeddingUsage::default(),
        })
    }
}

/// Outbound translation. Images referenced by URL are downloaded and sent
/// as inline data; a failed download skips the image and the message still
/// proceeds.
async fn build_contents(
    client: &reqwest::Client,
    messages: &[ChatMessage],
    files: &[FileAttachment],
) -> Vec<Content> {
    let last_user = messages.iter().rposition(|m| m.role == Role::User);
    let mut contents = Vec::new();

    for (index, message) in messages.iter().enumerate() {
        if message.role == Role::Tool {
            contents.push(tool_result_content(message));
            continue;
        }

        if message.role == Role::Assistant {
            if let Some(calls) = message.tool_calls.as_ref().filter(|calls| !calls.is_empty()) {
                contents.push(tool_call_content(calls));
                continue;
            }
        }

        let mut parts = Vec::new();
        match &message.content {
            Some(MessageContent::Parts(items)) => {
                for item in items {
                    match item {
                        ContentPart::Text { text } => parts.push(Part::text(text.clone())),
                        ContentPart::ImageUrl { image_url } => {
                            match fetch_image(client, &image_url.url).await {
                                Ok((mime, data)) => parts.push(Part::inline_data(mime, data)),
                                Err(err) => {
                                    warn!(event = "image_fetch_failed", url = %image_url.url, error = %err);
                                }
                            }
                        }
                    }
                }
            }
            Some(MessageContent::Text(text)) => parts.push(Part::text(text.clone())),
            None => {}
        }

        if Some(index) == last_user {
            append_file_parts(client, files, &mut parts).await;
        }

        if parts.is_empty() {
            continue;
        }
        let role = if message.role == Role::Assistant {
            ContentRole::Model
        } else {
            ContentRole::User
        };
        contents.push(Content {
            parts,
            role: Some(role),
        });
    }

    contents
}

fn tool_result_content(message: &ChatMessage) -> Content {
    let name = message
        .name
        .clone()
        .or_else(|| message.tool_call_id.clone())
        .unwrap_or_default();
    let output = message
        .content
        .as_ref()
        .map(MessageContent::flattened_text)
        .unwrap_or_default();
    Content {
        parts: vec![Part {
            function_response: Some(FunctionResponse {
                name,
                response: json!({ "content": output }),
            }),
            ..Part::default()
        }],
        role: Some(ContentRole::User),
    }
}

fn tool_call_content(calls: &[ToolCall]) -> Content {
    let parts = calls
        .iter()
        .map(|call| Part {
            function_call: Some(FunctionCall {
                name: call.function.name.clone(),
                args: Some(
                    serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| JsonValue::String(call.function.arguments.clone())),
                ),
            }),
            ..Part::default()
        })
        .collect();
    Content {
        parts,
        role: Some(ContentRole::Model),
    }
}

async fn append_file_parts(
    client: &reqwest::Client,
    files: &[FileAttachment],
    parts: &mut Vec<Part>,
) {
    for file in files {
        if !file.is_image() {
            continue;
        }
        if let Some(data) = &file.data {
            let mime = file.mime_type.as_deref().unwrap_or("image/jpeg");
            parts.push(Part::inline_data(mime, data.clone()));
            continue;
        }
        let Some(url) = &file.url else { continue };
        match fetch_image(client, url).await {
            Ok((mime, data)) => parts.push(Part::inline_data(mime, data)),
            Err(err) => warn!(event = "image_fetch_failed", url = %url, error = %err),
        }
    }
}

fn map_tools(tools: Option<&[ToolDefinition]>) -> Option<Vec<Tool>> {
    let tools = tools.filter(|tools| !tools.is_empty())?;
    let declarations = tools
        .iter()
        .map(|tool| FunctionDeclaration {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            parameters: tool.function.parameters.clone(),
        })
        .collect();
    Some(vec![Tool {
        function_declarations: Some(declarations),
    }])
}

/// Inbound translation of the first candidate into the canonical shape.
fn canonical_from_gemini(response: GenerateContentResponse) -> CanonicalResponse {
    let usage = response
        .usage_metadata
        .map(|usage| Usage {
            prompt_tokens: usage.prompt_token_count.unwrap_or(0),
            completion_tokens: usage.candidates_token_count.unwrap_or(0),
        })
        .unwrap_or_default();

    let parts = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts)
        .unwrap_or_default();

    let calls: Vec<&FunctionCall> = parts
        .iter()
        .filter_map(|part| part.function_call.as_ref())
        .collect();
    if !calls.is_empty() {
        let stamp = now_epoch_ms();
        let tool_calls = calls
            .iter()
            .enumerate()
            .map(|(index, call)| ToolCall {
                id: format!("call_{stamp}_{index}"),
                kind: "function".to_string(),
                function: ChatFunctionCall {
                    name: call.name.clone(),
                    arguments: call
                        .args
                        .as_ref()
                        .map(|args| args.to_string())
                        .unwrap_or_else(|| "{}".to_string()),
                },
            })
            .collect();
        return CanonicalResponse {
            choices: vec![ResponseChoice {
                message: ResponseMessage {
                    role: Role::Assistant,
                    content: None,
                    tool_calls: Some(tool_calls),
                },
            }],
            usage,
        };
    }

    let text = parts
        .iter()
        .find_map(|part| part.text.clone())
        .unwrap_or_else(|| SAFETY_PLACEHOLDER.to_string());
    CanonicalResponse::from_text(text, usage)
}
