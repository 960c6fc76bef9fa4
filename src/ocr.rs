// ocr.rs - Vision-Based Question Extraction (OCR Stage)
// Uses a vision-capable chat model (not a classical OCR algorithm) to
// transcribe the textual and mathematical content of attached images into
// editable text with KaTeX-compatible math markup.
//
// Failure policy: this stage never aborts the pipeline. Missing images,
// missing provider, or a failed model call all degrade to an empty string.

use std::sync::Arc;

use crate::provider::{ChatProvider, TextChatRequest};

/// Extraction prompt for the vision model. Demands verbatim transcription,
/// KaTeX-renderable math delimiters, preserved reading order, and no
/// commentary.
pub const OCR_PROMPT: &str = r#"You are a vision model whose only task is to extract every piece of meaningful written content from the image: problem text, symbols, formulas, labels, and table entries.

Requirements:
1. Transcribe all written content as completely and accurately as possible.
2. Output mathematical formulas in LaTeX, preserving their original structure (do not simplify or rewrite).
3. Preserve the layout order of the problem (top to bottom, left to right), adding line breaks where appropriate.
4. If the image contains tables, figure labels, or numbering, keep their text.
5. Do not explain the content and do not perform any reasoning.
6. Flag unreadable regions inline as `[possibly: ...]`.

Output format:
[OCR_TEXT]
(the extracted text and formulas go here)

Notes:
- **Never wrap anything in \( \) or \[ \]; use the dollar delimiters instead.**
- Inline math uses `$ ... $` with a space on each side, e.g. "the radius is $ r $".
- Keep inline math short; anything complex belongs in `$$ ... $$`.
- Correct examples:
  - "the range is $ g(x) \in [a,b] $"
  - "let $ a = 1 $ and $ b = 2 $"
  - "on the interval $ x \in (0, 1) $"
- **Incorrect examples** (will not render):
  - "(g(x) \in [a,b])"  <- missing $ delimiters
  - "$g(x) \in [a,b]$"  <- glued to the text, missing spaces
  - "\( R \)"           <- \( \) syntax breaks the final rendering

Integrals, sums, fractions, matrices, and aligned derivations use display blocks:

$$
...
$$

- On their own line with a blank line above and below.
- `aligned`, `cases`, and similar environments are fine inside a block.
- Never nest `$...$` inside a display block.

### Other rules
**Do not output any extra commentary, prefixes, or suffixes.**
**Emit the LaTeX exactly as read; do not clean or escape any characters.**
"#;

/// Short system instruction summarizing the task.
pub const OCR_SYSTEM_PROMPT: &str =
    "OCR: transcribe the problem shown in the image(s) into editable text.";

/// Run the vision extraction stage.
///
/// Preconditions: at least one image locator AND a resolved OCR provider;
/// otherwise the stage is skipped and contributes an empty string with no
/// error. Any provider failure is logged and likewise degrades to empty.
pub async fn run_ocr_stage(
    provider: Option<Arc<dyn ChatProvider>>,
    image_urls: &[String],
    model: Option<&str>,
) -> String {
    if image_urls.is_empty() {
        return String::new();
    }
    let Some(provider) = provider else {
        return String::new();
    };
    let model = model.or_else(|| provider.model_hint());

    println!(
        "[OCR] Extracting text from {} image(s) via provider '{}'",
        image_urls.len(),
        provider.id()
    );

    let request = TextChatRequest {
        prompt: OCR_PROMPT,
        context: &[],
        system_prompt: OCR_SYSTEM_PROMPT,
        image_urls,
        model,
    };

    match provider.text_chat(request).await {
        Ok(response) => {
            let text = response.completion_text.trim().to_string();
            println!("[OCR] Extracted {} characters", text.len());
            text
        }
        Err(e) => {
            log::error!("❌ OCR request failed, continuing with text input only: {}", e);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::ChatCompletion;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: Arc<AtomicUsize>,
        reply: Result<&'static str, ()>,
    }

    #[async_trait]
    impl ChatProvider for CountingProvider {
        fn id(&self) -> &str {
            "counting"
        }
        fn api_base(&self) -> &str {
            "http://fake"
        }
        async fn text_chat(
            &self,
            _req: TextChatRequest<'_>,
        ) -> Result<ChatCompletion, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Ok(text) => Ok(ChatCompletion {
                    completion_text: text.to_string(),
                }),
                Err(()) => Err(ProviderError::Api {
                    status: 500,
                    body: "boom".to_string(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_skipped_without_images() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider: Arc<dyn ChatProvider> = Arc::new(CountingProvider {
            calls: Arc::clone(&calls),
            reply: Ok("should not be called"),
        });
        let text = run_ocr_stage(Some(provider), &[], None).await;
        assert_eq!(text, "");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skipped_without_provider() {
        let urls = vec!["https://cdn.example/p.png".to_string()];
        let text = run_ocr_stage(None, &urls, None).await;
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn test_provider_failure_degrades_to_empty() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider: Arc<dyn ChatProvider> = Arc::new(CountingProvider {
            calls: Arc::clone(&calls),
            reply: Err(()),
        });
        let urls = vec!["https://cdn.example/p.png".to_string()];
        let text = run_ocr_stage(Some(provider), &urls, None).await;
        assert_eq!(text, "");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successful_extraction_is_trimmed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider: Arc<dyn ChatProvider> = Arc::new(CountingProvider {
            calls: Arc::clone(&calls),
            reply: Ok("  [OCR_TEXT]\nsolve $ x^2 = 4 $  \n"),
        });
        let urls = vec!["https://cdn.example/p.png".to_string()];
        let text = run_ocr_stage(Some(provider), &urls, None).await;
        assert_eq!(text, "[OCR_TEXT]\nsolve $ x^2 = 4 $");
    }
}
