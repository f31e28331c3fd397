use async_trait::async_trait;
use tracing::debug;

use qproxy_protocol::chat::{
    CanonicalResponse, ChatMessage, ContentPart, ImageUrl, MessageContent, Role,
};
use qproxy_protocol::openai::{
    ChatCompletionRequest, EmbeddingRequest, EmbeddingResponse, ResponseFormat,
    TranscriptionResponse,
};
use qproxy_protocol::FileAttachment;

use crate::http::{build_client, ensure_success};
use crate::{ChatRequest, OutputFormat, Provider, ProviderError, ProviderResult};

const OCR_SYSTEM_PROMPT: &str = "You extract text from images. Return every piece of visible \
     text, preserving line breaks. If the image contains no readable text, reply with exactly \
     [NO_TEXT_DETECTED].";
const OCR_USER_PROMPT: &str = "Extract only the text found in the image. Output text only, no extras.";

pub const NO_TEXT_SENTINEL: &str = "[NO_TEXT_DETECTED]";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub chat_model: String,
    pub vision_model: String,
    pub embedding_model: String,
}

pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> ProviderResult<Self> {
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
            .ok_or(ProviderError::MissingCredentials("openai"))
    }

    async fn chat_completion(
        &self,
        body: &ChatCompletionRequest,
    ) -> ProviderResult<CanonicalResponse> {
        let key = self.api_key()?;
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(key)
            .json(body)
            .send()
            .await?;
        ensure_success(response)
            .await?
            .json::<CanonicalResponse>()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))
    }

    /// Download audio bytes from a URL and transcribe them.
    pub async fn transcribe_audio(&self, url: &str, model: Option<&str>) -> ProviderResult<String> {
        let key = self.api_key()?;
        let audio = ensure_success(self.client.get(url).send().await?).await?;
        let bytes = audio.bytes().await?;

        let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name("audio.mp3");
        let form = reqwest::multipart::Form::new()
            .text("model", model.unwrap_or("whisper-1").to_string())
            .part("file", part);

        let url = format!("{}/v1/audio/transcriptions", self.config.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(key)
            .multipart(form)
            .send()
            .await?;
        let transcript: TranscriptionResponse = ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;
        Ok(transcript.text)
    }

    /// OCR via the vision model with a fixed prompt pair. The caller maps
    /// the `[NO_TEXT_DETECTED]` sentinel to its placeholder.
    pub async fn extract_image_text(&self, image_url: &str) -> ProviderResult<String> {
        let messages = vec![
            ChatMessage::text(Role::System, OCR_SYSTEM_PROMPT),
            ChatMessage {
                role: Role::User,
                content: Some(MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: OCR_USER_PROMPT.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: image_url.to_string(),
                        },
                    },
                ])),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            },
        ];
        let body = ChatCompletionRequest {
            model: self.config.vision_model.clone(),
            messages,
            temperature: Some(0.0),
            tools: None,
            tool_choice: None,
            response_format: None,
        };
        let response = self.chat_completion(&body).await?;
        Ok(response.first_text().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn has_credentials(&self) -> bool {
        self.config
            .api_key
            .as_deref()
            .is_some_and(|key| !key.is_empty())
    }

    async fn invoke(&self, request: &ChatRequest) -> ProviderResult<CanonicalResponse> {
        let mut messages = request.messages.clone();
        if !request.files.is_empty() {
            fold_files_into_last_user(&mut messages, &request.files);
        }

        let model = if needs_vision(&messages, &request.files) {
            self.config.vision_model.clone()
        } else {
            self.config.chat_model.clone()
        };

        let body = ChatCompletionRequest {
            model,
            messages,
            temperature: Some(request.temperature),
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
            response_format: match request.output_format {
                OutputFormat::Json => Some(ResponseFormat::json_object()),
                OutputFormat::Text => None,
            },
        };
        self.chat_completion(&body).await
    }

    async fn embed(&self, inputs: &[String]) -> ProviderResult<EmbeddingResponse> {
        let key = self.api_key()?;
        let body = EmbeddingRequest {
            model: self.config.embedding_model.clone(),
            input: inputs.to_vec(),
        };
        let url = format!("{}/v1/embeddings", self.config.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;
        ensure_success(response)
            .await?
            .json::<EmbeddingResponse>()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))
    }
}

fn needs_vision(messages: &[ChatMessage], files: &[FileAttachment]) -> bool {
    files.iter().any(FileAttachment::is_image)
        || messages
            .iter()
            .any(|message| message.content.as_ref().is_some_and(MessageContent::has_image_part))
}

/// Fold a legacy `files` list into the last user message: its content
/// becomes an ordered sequence of text + image-URL parts.
fn fold_files_into_last_user(messages: &mut [ChatMessage], files: &[FileAttachment]) {
    let Some(message) = messages.iter_mut().rev().find(|m| m.role == Role::User) else {
        return;
    };

    let mut parts = match message.content.take() {
        Some(MessageContent::Parts(parts)) => parts,
        Some(MessageContent::Text(text)) => vec![ContentPart::Text { text }],
        None => Vec::new(),
    };

    for file in files {
        if !file.is_image() {
            debug!(event = "file_skipped", kind = %file.kind);
            continue;
        }
        let url = match (&file.url, &file.data) {
            (Some(url), _) => url.clone(),
            (None, Some(data)) => format!(
                "data:{};base64,{}",
                file.mime_type.as_deref().unwrap_or("image/jpeg"),
                data
            ),
            (None, None) => continue,
        };
        parts.push(ContentPart::ImageUrl {
            image_url: ImageUrl { url },
        });
    }

    message.content = Some(MessageContent::Parts(parts));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_file(url: &str) -> FileAttachment {
        FileAttachment {
            kind: "image".to_string(),
            url: Some(url.to_string()),
            data: None,
            mime_type: None,
        }
    }

    #[test]
    fn vision_is_selected_for_image_files_and_parts() {
        let plain = vec![ChatMessage::text(Role::User, "hi")];
        assert!(!needs_vision(&plain, &[]));
        assert!(needs_vision(&plain, &[image_file("https://host/x.jpg")]));

        let with_part = vec![ChatMessage {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://host/x.jpg".to_string(),
                },
            }])),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }];
        assert!(needs_vision(&with_part, &[]));
    }

    #[test]
    fn files_fold_into_last_user_message() {
        let mut messages = vec![
            ChatMessage::text(Role::System, "be brief"),
            ChatMessage::text(Role::User, "first"),
            ChatMessage::text(Role::Assistant, "ok"),
            ChatMessage::text(Role::User, "what is this?"),
        ];
        fold_files_into_last_user(
            &mut messages,
            &[
                image_file("https://host/x.jpg"),
                FileAttachment {
                    kind: "pdf".to_string(),
                    url: Some("https://host/doc.pdf".to_string()),
                    data: None,
                    mime_type: None,
                },
            ],
        );

        let Some(MessageContent::Parts(parts)) = &messages[3].content else {
            panic!("last user message should hold parts");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], ContentPart::Text { text } if text == "what is this?"));
        assert!(
            matches!(&parts[1], ContentPart::ImageUrl { image_url } if image_url.url == "https://host/x.jpg")
        );
        // Untouched earlier user message.
        assert_eq!(
            messages[1].content,
            Some(MessageContent::Text("first".to_string()))
        );
    }

    #[test]
    fn inline_file_data_becomes_a_data_url() {
        let mut messages = vec![ChatMessage::text(Role::User, "look")];
        fold_files_into_last_user(
            &mut messages,
            &[FileAttachment {
                kind: "image".to_string(),
                url: None,
                data: Some("aGVsbG8=".to_string()),
                mime_type: Some("image/png".to_string()),
            }],
        );
        let Some(MessageContent::Parts(parts)) = &messages[0].content else {
            panic!("expected parts");
        };
        assert!(matches!(
            &parts[1],
            ContentPart::ImageUrl { image_url } if image_url.url == "data:image/png;base64,aGVsbG8="
        ));
    }
}
