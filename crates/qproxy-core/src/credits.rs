use qproxy_common::ProviderKind;
use qproxy_protocol::{ChatMessage, FileAttachment, MessageContent, Role, Usage};

const COMPLEX_QUERY_MIN_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    BasicQuery,
    FileSearch,
    DocumentAnalysis,
    ImageAnalysis,
    ComplexQuery,
    Embedding,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::BasicQuery => "basic_query",
            QueryType::FileSearch => "file_search",
            QueryType::DocumentAnalysis => "document_analysis",
            QueryType::ImageAnalysis => "image_analysis",
            QueryType::ComplexQuery => "complex_query",
            QueryType::Embedding => "embedding",
        }
    }

    /// Fixed credit table.
    pub fn credits(&self) -> f64 {
        match self {
            QueryType::BasicQuery => 1.0,
            QueryType::FileSearch => 2.0,
            QueryType::DocumentAnalysis => 3.0,
            QueryType::ImageAnalysis => 4.0,
            QueryType::ComplexQuery => 5.0,
            QueryType::Embedding => 0.5,
        }
    }
}

/// Classify a chat job for credit accounting: image content wins, then pdf
/// documents, then the text length of the last user message.
pub fn detect_query_type(messages: &[ChatMessage], files: &[FileAttachment]) -> QueryType {
    let has_image = files.iter().any(FileAttachment::is_image)
        || messages
            .iter()
            .any(|m| m.content.as_ref().is_some_and(MessageContent::has_image_part));
    if has_image {
        return QueryType::ImageAnalysis;
    }
    if files.iter().any(FileAttachment::is_pdf) {
        return QueryType::DocumentAnalysis;
    }

    let text_len = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .and_then(|m| m.content.as_ref())
        .map(|content| content.flattened_text().chars().count())
        .unwrap_or(0);
    if text_len > COMPLEX_QUERY_MIN_LEN {
        QueryType::ComplexQuery
    } else {
        QueryType::BasicQuery
    }
}

/// USD per token, per provider family.
#[derive(Debug, Clone, Copy)]
pub struct CostRates {
    pub input: f64,
    pub output: f64,
    pub embedding: f64,
}

pub fn cost_rates(kind: ProviderKind) -> CostRates {
    match kind {
        ProviderKind::OpenAi => CostRates {
            input: 1.5e-7,
            output: 6e-7,
            embedding: 2e-8,
        },
        ProviderKind::Gemini => CostRates {
            input: 7.5e-8,
            output: 3e-7,
            embedding: 2.5e-8,
        },
    }
}

pub fn chat_cost_usd(kind: ProviderKind, usage: &Usage) -> f64 {
    let rates = cost_rates(kind);
    usage.prompt_tokens as f64 * rates.input + usage.completion_tokens as f64 * rates.output
}

pub fn embedding_cost_usd(kind: ProviderKind, prompt_tokens: u32) -> f64 {
    prompt_tokens as f64 * cost_rates(kind).embedding
}

#[cfg(test)]
mod tests {
    use super::*;
    use qproxy_protocol::{ContentPart, ImageUrl};

    fn user(text: &str) -> ChatMessage {
        ChatMessage::text(Role::User, text)
    }

    fn image_file() -> FileAttachment {
        FileAttachment {
            kind: "image".to_string(),
            url: Some("https://host/x.jpg".to_string()),
            data: None,
            mime_type: None,
        }
    }

    #[test]
    fn image_content_wins_over_everything() {
        let messages = vec![ChatMessage {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "x".repeat(500),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "https://host/x.jpg".to_string(),
                    },
                },
            ])),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }];
        assert_eq!(detect_query_type(&messages, &[]), QueryType::ImageAnalysis);
        assert_eq!(
            detect_query_type(&[user("hi")], &[image_file()]),
            QueryType::ImageAnalysis
        );
    }

    #[test]
    fn pdf_files_mean_document_analysis() {
        let pdf = FileAttachment {
            kind: "pdf".to_string(),
            url: Some("https://host/doc.pdf".to_string()),
            data: None,
            mime_type: None,
        };
        assert_eq!(
            detect_query_type(&[user("summarize")], &[pdf]),
            QueryType::DocumentAnalysis
        );
    }

    #[test]
    fn text_length_buckets() {
        assert_eq!(detect_query_type(&[user("hi")], &[]), QueryType::BasicQuery);
        let mid = "x".repeat(120);
        assert_eq!(detect_query_type(&[user(&mid)], &[]), QueryType::BasicQuery);
        let long = "x".repeat(300);
        assert_eq!(
            detect_query_type(&[user(&long)], &[]),
            QueryType::ComplexQuery
        );
    }

    #[test]
    fn credit_table_values() {
        assert_eq!(QueryType::BasicQuery.credits(), 1.0);
        assert_eq!(QueryType::FileSearch.credits(), 2.0);
        assert_eq!(QueryType::DocumentAnalysis.credits(), 3.0);
        assert_eq!(QueryType::ImageAnalysis.credits(), 4.0);
        assert_eq!(QueryType::ComplexQuery.credits(), 5.0);
        assert_eq!(QueryType::Embedding.credits(), 0.5);
    }

    #[test]
    fn chat_cost_uses_per_provider_rates() {
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 500,
        };
        let openai = chat_cost_usd(ProviderKind::OpenAi, &usage);
        assert!((openai - (1000.0 * 1.5e-7 + 500.0 * 6e-7)).abs() < 1e-12);
        let gemini = chat_cost_usd(ProviderKind::Gemini, &usage);
        assert!((gemini - (1000.0 * 7.5e-8 + 500.0 * 3e-7)).abs() < 1e-12);
        assert!(gemini < openai);
    }
}
