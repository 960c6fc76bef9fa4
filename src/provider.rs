// provider.rs - Language Model Provider Abstraction
// Defines the text-chat capability boundary consumed by the solve pipeline,
// a registry that resolves providers by id with a session-default fallback,
// and the OpenAI-compatible HTTP implementation used for both the solver
// and the OCR role.
//
// Key Features:
// - ChatProvider trait: prompt + prior context + system prompt + image
//   locators + optional model override -> completion text
// - ProviderRegistry: lookup by preferred id, session default fallback,
//   capability check that never raises into the caller
// - OpenAiChatProvider: non-streaming /v1/chat/completions with multimodal
//   content blocks; image locators are downloaded and inlined as base64
//   data URIs (GIFs converted to a PNG first frame for compatibility)

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::config::SolveConfig;
use crate::error::ProviderError;

// Multimodal message structures for the chat completions wire format.
#[derive(Serialize, Deserialize, Clone)]
pub struct MultimodalChatMessage {
    pub role: String,                 // "system", "user", or "assistant"
    pub content: Vec<MessageContent>, // List of content blocks (text/image)
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum MessageContent {
    Text {
        #[serde(rename = "type")]
        content_type: String,
        text: String,
    },
    Image {
        #[serde(rename = "type")]
        content_type: String,
        image_url: ImageUrl,
    },
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ImageUrl {
    pub url: String, // Data URI or external URL
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<MultimodalChatMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

/// Result of a text chat call: the completion text, possibly empty.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub completion_text: String,
}

/// Arguments for one text chat invocation. The prior context is always
/// empty in this pipeline but is part of the capability contract.
pub struct TextChatRequest<'a> {
    pub prompt: &'a str,
    pub context: &'a [MultimodalChatMessage],
    pub system_prompt: &'a str,
    pub image_urls: &'a [String],
    pub model: Option<&'a str>,
}

/// The chat capability boundary. Providers are looked up, never owned, by
/// the pipeline; their lifecycle belongs to the registry built at startup.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn id(&self) -> &str;
    fn api_base(&self) -> &str;
    /// Model the backend prefers when the caller passes no override.
    fn model_hint(&self) -> Option<&str> {
        None
    }
    fn supports_text_chat(&self) -> bool {
        true
    }
    async fn text_chat(&self, req: TextChatRequest<'_>) -> Result<ChatCompletion, ProviderError>;
}

/// OpenAI-compatible chat backend (LM Studio, OpenRouter, vLLM, ...).
pub struct OpenAiChatProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl OpenAiChatProvider {
    pub fn new(id: String, base_url: String, api_key: Option<String>, timeout_secs: u64) -> Self {
        Self {
            id,
            base_url,
            api_key,
            timeout_secs,
        }
    }

    fn build_messages(
        &self,
        req: &TextChatRequest<'_>,
        user_blocks: Vec<MessageContent>,
    ) -> Vec<MultimodalChatMessage> {
        let mut messages = Vec::with_capacity(req.context.len() + 2);
        if !req.system_prompt.is_empty() {
            messages.push(MultimodalChatMessage {
                role: "system".to_string(),
                content: vec![MessageContent::Text {
                    content_type: "text".to_string(),
                    text: req.system_prompt.to_string(),
                }],
            });
        }
        messages.extend(req.context.iter().cloned());
        messages.push(MultimodalChatMessage {
            role: "user".to_string(),
            content: user_blocks,
        });
        messages
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn api_base(&self) -> &str {
        &self.base_url
    }

    async fn text_chat(&self, req: TextChatRequest<'_>) -> Result<ChatCompletion, ProviderError> {
        let mut user_blocks = vec![MessageContent::Text {
            content_type: "text".to_string(),
            text: req.prompt.to_string(),
        }];

        for locator in req.image_urls {
            let (base64_image, content_type) =
                process_image_locator(locator, self.timeout_secs).await?;
            user_blocks.push(MessageContent::Image {
                content_type: "image_url".to_string(),
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", content_type, base64_image),
                },
            });
        }

        let request = ChatCompletionRequest {
            model: req.model.map(String::from),
            messages: self.build_messages(&req, user_blocks),
            stream: false,
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()?;

        let mut http_request = client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)?;
        let completion_text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(ChatCompletion { completion_text })
    }
}

/// Fetch an image locator (http(s) URL or local path) and encode it as
/// base64 for a multimodal request. Animated GIFs are converted to a PNG
/// first frame, which vision backends accept far more reliably. Downloads
/// use the same timeout as the chat call so a stalled CDN cannot hang the
/// whole request.
pub async fn process_image_locator(
    locator: &str,
    timeout_secs: u64,
) -> Result<(String, String), ProviderError> {
    let attachment_err = |detail: String| ProviderError::Attachment {
        locator: locator.to_string(),
        detail,
    };

    let bytes: Vec<u8> = if locator.starts_with("http://") || locator.starts_with("https://") {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        let response = client.get(locator).send().await?;
        response.bytes().await?.to_vec()
    } else {
        std::fs::read(locator).map_err(|e| attachment_err(e.to_string()))?
    };

    // Strip query parameters before guessing the type from the extension.
    let path_part = locator.split('?').next().unwrap_or(locator);
    let content_type = mime_guess::from_path(path_part)
        .first_or(mime_guess::mime::IMAGE_JPEG)
        .to_string();

    let (processed_bytes, final_content_type) = if content_type == "image/gif" {
        match gif_first_frame_as_png(&bytes) {
            Ok(png_bytes) => (png_bytes, "image/png".to_string()),
            Err(e) => {
                log::warn!("⚠️ GIF conversion failed for {}, sending raw bytes: {}", locator, e);
                (bytes, content_type)
            }
        }
    } else {
        (bytes, content_type)
    };

    let base64_image = general_purpose::STANDARD.encode(&processed_bytes);
    Ok((base64_image, final_content_type))
}

fn gif_first_frame_as_png(gif_bytes: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory_with_format(gif_bytes, ImageFormat::Gif)?;
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)?;
    Ok(png_bytes)
}

/// Registry of chat backends built once at startup. Resolution never
/// errors into the caller: an unusable provider is simply "unavailable".
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
    default_id: String,
}

impl ProviderRegistry {
    pub fn new(default_id: String) -> Self {
        Self {
            providers: HashMap::new(),
            default_id,
        }
    }

    pub fn from_config(config: &SolveConfig) -> Self {
        let mut registry = ProviderRegistry::new(config.default_provider_id.clone());
        for (id, provider_config) in &config.providers {
            registry.insert(Arc::new(OpenAiChatProvider::new(
                id.clone(),
                provider_config.base_url.clone(),
                provider_config.api_key.clone(),
                config.request_timeout_secs,
            )));
        }
        registry
    }

    pub fn insert(&mut self, provider: Arc<dyn ChatProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Resolve a usable chat provider: lookup by the preferred id first,
    /// fall back to the session default when the id is empty or unknown,
    /// and reject any handle lacking the text chat capability.
    pub fn resolve(&self, preferred_id: &str) -> Option<Arc<dyn ChatProvider>> {
        let candidate = if preferred_id.is_empty() {
            None
        } else {
            self.providers.get(preferred_id)
        };
        let candidate = candidate.or_else(|| self.providers.get(&self.default_id));

        match candidate {
            Some(provider) if !provider.supports_text_chat() => {
                log::warn!(
                    "⚠️ Provider '{}' ({}) does not support text chat, ignoring",
                    provider.id(),
                    provider.api_base()
                );
                None
            }
            Some(provider) => Some(Arc::clone(provider)),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProvider {
        id: String,
        chat_capable: bool,
    }

    #[async_trait]
    impl ChatProvider for FakeProvider {
        fn id(&self) -> &str {
            &self.id
        }
        fn api_base(&self) -> &str {
            "http://fake"
        }
        fn supports_text_chat(&self) -> bool {
            self.chat_capable
        }
        async fn text_chat(
            &self,
            _req: TextChatRequest<'_>,
        ) -> Result<ChatCompletion, ProviderError> {
            Ok(ChatCompletion {
                completion_text: "ok".to_string(),
            })
        }
    }

    fn registry_with(providers: Vec<FakeProvider>, default_id: &str) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new(default_id.to_string());
        for provider in providers {
            registry.insert(Arc::new(provider));
        }
        registry
    }

    #[test]
    fn test_resolve_prefers_requested_id() {
        let registry = registry_with(
            vec![
                FakeProvider { id: "a".into(), chat_capable: true },
                FakeProvider { id: "b".into(), chat_capable: true },
            ],
            "a",
        );
        let resolved = registry.resolve("b").expect("provider b should resolve");
        assert_eq!(resolved.id(), "b");
    }

    #[test]
    fn test_resolve_falls_back_to_session_default() {
        let registry = registry_with(
            vec![FakeProvider { id: "a".into(), chat_capable: true }],
            "a",
        );
        // Empty preferred id and unknown preferred id both fall back.
        assert_eq!(registry.resolve("").expect("default").id(), "a");
        assert_eq!(registry.resolve("missing").expect("default").id(), "a");
    }

    #[test]
    fn test_resolve_rejects_provider_without_chat_capability() {
        let registry = registry_with(
            vec![FakeProvider { id: "vision-only".into(), chat_capable: false }],
            "vision-only",
        );
        assert!(registry.resolve("vision-only").is_none());
        assert!(registry.resolve("").is_none());
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let registry = registry_with(
            vec![FakeProvider { id: "a".into(), chat_capable: true }],
            "a",
        );
        let first = registry.resolve("a");
        let second = registry.resolve("a");
        assert_eq!(first.is_some(), second.is_some());
        assert_eq!(
            first.map(|p| p.id().to_string()),
            second.map(|p| p.id().to_string())
        );
    }

    #[test]
    fn test_resolve_empty_registry_is_none() {
        let registry = ProviderRegistry::new("a".to_string());
        assert!(registry.resolve("a").is_none());
    }

    #[test]
    fn test_role_ids_resolve_regardless_of_config_casing() {
        // Role ids written with the same casing as their PROVIDER_ lines
        // must still hit the right backend, not the session default.
        let map: HashMap<String, String> = [
            ("PROVIDER_ALPHA", "http://localhost:1111"),
            ("PROVIDER_BETA", "http://localhost:2222"),
            ("DEFAULT_PROVIDER_ID", "alpha"),
            ("OCR_PROVIDER_ID", "Beta"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = SolveConfig::from_map(&map);
        let registry = ProviderRegistry::from_config(&config);
        let resolved = registry
            .resolve(&config.ocr_provider_id)
            .expect("ocr provider should resolve");
        assert_eq!(resolved.id(), "beta");
    }

    #[tokio::test]
    async fn test_image_download_respects_timeout() {
        use tokio::net::TcpListener;

        // A server that accepts the connection and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let url = format!("http://{}/stalled.png", addr);
        let result = process_image_locator(&url, 1).await;
        assert!(matches!(result, Err(ProviderError::Http(_))));

        server.abort();
    }

    #[test]
    fn test_message_content_serializes_to_openai_shape() {
        let block = MessageContent::Image {
            content_type: "image_url".to_string(),
            image_url: ImageUrl {
                url: "data:image/png;base64,AAAA".to_string(),
            },
        };
        let json = serde_json::to_value(&block).expect("serialize");
        assert_eq!(json["type"], "image_url");
        assert_eq!(json["image_url"]["url"], "data:image/png;base64,AAAA");
    }
}
