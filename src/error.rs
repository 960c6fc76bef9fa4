// error.rs - Error Taxonomy for the Solve Pipeline
// Typed errors for the three seams of the question-resolution pipeline:
// provider calls, rendering, and the solver stage itself. The orchestrator
// in solve.rs decides per variant whether to emit a tailored diagnostic,
// degrade, or bubble the error up to the outermost boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a chat provider call (HTTP transport, API status,
/// response decoding, or attachment preparation).
///
/// Display text deliberately preserves the upstream response body: the
/// solver stage classifies failures by the error's string form, the same
/// way the original pipeline matched on exception messages.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("chat API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("chat API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("failed to parse chat completion JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to prepare image attachment '{locator}': {detail}")]
    Attachment { locator: String, detail: String },
}

/// Errors raised by one render strategy. Never terminal on their own:
/// the fallback wrapper swaps strategies once, and the command falls back
/// to plain text when both strategies fail.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("remote render service is not configured (set RENDER_SERVICE_URL in solveconf.txt)")]
    RemoteUnconfigured,

    #[error("remote render request failed: {0}")]
    Remote(String),

    #[error("document template rendering failed: {0}")]
    Template(#[from] minijinja::Error),

    #[error("headless browser error: {0}")]
    Browser(String),

    #[error("failed to write render artifact {}: {}", path.display(), source)]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Outcome of the solver stage, classified by error shape so the command
/// can emit the right diagnostic without retrying.
#[derive(Debug, Error)]
pub enum SolveError {
    /// The upstream API answered with something that was not a chat
    /// completion (JSON parse complaint). Tailored diagnostic, no retry.
    #[error("model response could not be parsed (provider: {provider_id}, model: {model}): {detail}")]
    ResponseParse {
        provider_id: String,
        model: String,
        detail: String,
    },

    /// The requested model is unknown to or not authorized on the provider.
    #[error("model not available (provider: {provider_id}, model: {model}, api base: {api_base})")]
    ModelNotFound {
        provider_id: String,
        model: String,
        api_base: String,
    },

    /// The call succeeded but the completion text was empty.
    #[error("the solver model returned no content")]
    EmptyCompletion,

    /// Any other provider failure; propagated to the outermost boundary.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}
