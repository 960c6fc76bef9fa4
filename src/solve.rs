// solve.rs - Solve Command and Pipeline Orchestration
// The ^solve (alias ^g) command: decomposes the incoming message, runs the
// vision extraction stage on attached images, merges the question sources,
// asks the solver model, and renders the Markdown answer to an image.
//
// Degradation ladder:
// - no OCR provider        -> images ignored, text-only question
// - classified solver error -> tailored diagnostic, no retry
// - both render strategies fail -> chunked plain-text answer
// - anything unclassified  -> outermost boundary replies "An error occurred"

use serenity::{
    client::Context,
    framework::standard::{macros::command, Args, CommandResult},
    model::channel::{AttachmentType, Message},
};
use std::sync::Arc;

use crate::error::SolveError;
use crate::message::{
    collect_image_urls, collect_plain_text, decode_message, extract_command_argument,
};
use crate::ocr::run_ocr_stage;
use crate::render::{render_answer, RenderArtifact, RenderData};
use crate::solver::run_solver;
use crate::{ProviderRegistryKey, SolveConfigKey};

const COMMAND_ALIASES: [&str; 2] = ["solve", "g"];
const USAGE_HINT: &str =
    "Please provide a question or attach an image of one! Usage: `^solve <problem>` (alias: `^g`)";
const DISCORD_MESSAGE_LIMIT: usize = 1900;

#[command]
#[aliases("g")]
pub async fn solve(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    // Outermost error boundary: nothing below may take the bot down.
    if let Err(e) = handle_solve_request(ctx, msg, &args).await {
        log::error!("❌ Solve command failed: {}", e);
        let _ = msg.reply(ctx, format!("An error occurred: {}", e)).await;
    }
    Ok(())
}

async fn handle_solve_request(
    ctx: &Context,
    msg: &Message,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _typing = ctx.http.start_typing(msg.channel_id.0)?;

    let (config, registry) = {
        let data = ctx.data.read().await;
        let config = data
            .get::<SolveConfigKey>()
            .cloned()
            .ok_or("solve configuration was not initialized at startup")?;
        let registry = data
            .get::<ProviderRegistryKey>()
            .cloned()
            .ok_or("provider registry was not initialized at startup")?;
        (config, registry)
    };

    // The solver provider is mandatory; OCR is best effort.
    let Some(solver_provider) = registry.resolve(&config.solver_provider_id) else {
        msg.reply(
            ctx,
            "❌ No solver provider available. Add at least one `PROVIDER_<ID>=base_url|api_key` line to `solveconf.txt` (see `example_solveconf.txt`).",
        )
        .await?;
        return Ok(());
    };
    let ocr_provider = registry.resolve(&config.ocr_provider_id);

    let parts = decode_message(msg);
    let mut raw_text = collect_plain_text(&parts);
    if raw_text.is_empty() {
        raw_text = msg.content.clone();
    }
    let image_urls = collect_image_urls(&parts);

    if !image_urls.is_empty() && ocr_provider.is_none() {
        log::warn!("⚠️ Images attached but no OCR provider is configured");
        msg.reply(
            ctx,
            "⚠️ No OCR provider is configured, the attached image(s) will be ignored.",
        )
        .await?;
    }

    let ocr_text = run_ocr_stage(ocr_provider, &image_urls, config.ocr_model.as_deref()).await;

    let caller_arg = args.message().trim();
    let parser_derived = extract_command_argument(&raw_text, &COMMAND_ALIASES);
    let question = merge_question(caller_arg, &parser_derived, &ocr_text);

    if question.is_empty() {
        msg.reply(ctx, USAGE_HINT).await?;
        return Ok(());
    }

    println!(
        "[SOLVE] Question assembled ({} chars, {} image(s)) for {}",
        question.len(),
        image_urls.len(),
        msg.author.name
    );

    let mut status = msg
        .channel_id
        .send_message(&ctx.http, |m| {
            m.content("📚 Got it! Working on the problem...")
        })
        .await?;

    let answer = match run_solver(&solver_provider, &question, config.solver_model.as_deref()).await
    {
        Ok(answer) => answer,
        Err(SolveError::ResponseParse {
            provider_id,
            model,
            detail,
        }) => {
            let diagnostic = format!(
                "❌ The reply from provider '{}' (model: {}) could not be decoded as a chat completion.\nDetail: {}\n\nThe endpoint may be down, answering with an error page, or not OpenAI-compatible. Check the provider's base URL in `solveconf.txt`.",
                provider_id, model, detail
            );
            status.edit(&ctx.http, |m| m.content(&diagnostic)).await?;
            return Ok(());
        }
        Err(SolveError::ModelNotFound {
            provider_id,
            model,
            api_base,
        }) => {
            let diagnostic = format!(
                "❌ Provider '{}' does not serve the model '{}' (endpoint: {}).\nSet `SOLVER_MODEL` in `solveconf.txt` to a model the endpoint actually offers, or remove it to use the provider default.",
                provider_id, model, api_base
            );
            status.edit(&ctx.http, |m| m.content(&diagnostic)).await?;
            return Ok(());
        }
        Err(SolveError::EmptyCompletion) => {
            status
                .edit(&ctx.http, |m| {
                    m.content("❌ The solver model returned no content. Try rephrasing the question.")
                })
                .await?;
            return Ok(());
        }
        // Unclassified failures bubble to the outermost boundary.
        Err(SolveError::Provider(e)) => return Err(e.into()),
    };

    status
        .edit(&ctx.http, |m| {
            m.content("✅ Answer ready, rendering the solution...")
        })
        .await?;

    let data = RenderData {
        question: question.clone(),
        content: answer.clone(),
    };

    match render_answer(&config, &data).await {
        Ok(RenderArtifact::File(path)) => {
            msg.channel_id
                .send_message(&ctx.http, |m| {
                    m.add_file(AttachmentType::Path(&path));
                    m
                })
                .await?;
            let _ = status.delete(&ctx.http).await;
        }
        Ok(RenderArtifact::Url(url)) => {
            msg.channel_id
                .send_message(&ctx.http, |m| m.embed(|e| e.image(&url)))
                .await?;
            let _ = status.delete(&ctx.http).await;
        }
        Err(e) => {
            log::error!("❌ All render strategies failed: {}", e);
            send_plain_text_answer(ctx, &mut status, msg, &question, &answer).await?;
        }
    }

    Ok(())
}

/// Last-resort delivery when no image could be produced: the answer goes
/// out as chunked plain text, first chunk replacing the status message.
async fn send_plain_text_answer(
    ctx: &Context,
    status: &mut Message,
    msg: &Message,
    question: &str,
    answer: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let full = format!(
        "⚠️ Could not render the answer as an image, sending plain text.\n\n**Question:**\n{}\n\n{}",
        question, answer
    );
    let chunks = split_message(&full, DISCORD_MESSAGE_LIMIT);
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            status.edit(&ctx.http, |m| m.content(chunk)).await?;
        } else {
            msg.channel_id.say(&ctx.http, chunk).await?;
        }
    }
    Ok(())
}

/// Combine the three question sources.
///
/// The parser-derived text replaces the caller argument when it is strictly
/// longer or extends it; this recovers words the framework's argument
/// splitting drops (quoting, reflowed whitespace) without ever shortening
/// what the caller typed. The OCR text is then appended on its own line.
pub fn merge_question(caller_arg: &str, parser_derived: &str, ocr_text: &str) -> String {
    let caller_arg = caller_arg.trim();
    let parser_derived = parser_derived.trim();
    let ocr_text = ocr_text.trim();

    let base = if parser_derived.len() > caller_arg.len()
        || (!caller_arg.is_empty() && parser_derived.starts_with(caller_arg))
    {
        parser_derived
    } else {
        caller_arg
    };

    match (base.is_empty(), ocr_text.is_empty()) {
        (false, false) => format!("{}\n{}", base, ocr_text),
        (false, true) => base.to_string(),
        (true, false) => ocr_text.to_string(),
        (true, true) => String::new(),
    }
}

// Split long messages on line boundaries; a single line longer than the
// limit is kept whole and left to the platform to reject.
fn split_message(content: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        if current.len() + line.len() + 1 > max_len && !current.is_empty() {
            chunks.push(current.trim().to_string());
            current = String::new();
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }

    if !current.is_empty() {
        chunks.push(current.trim().to_string());
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_parser_text_wins_when_it_extends_caller_arg() {
        assert_eq!(merge_question("abc", "abc and more", ""), "abc and more");
    }

    #[test]
    fn test_merge_caller_arg_kept_when_parser_text_diverges() {
        assert_eq!(merge_question("xyz", "abc", ""), "xyz");
    }

    #[test]
    fn test_merge_appends_ocr_on_new_line() {
        assert_eq!(
            merge_question("solve this", "solve this", "$ x^2 = 4 $"),
            "solve this\n$ x^2 = 4 $"
        );
    }

    #[test]
    fn test_merge_ocr_only() {
        assert_eq!(merge_question("", "", "$ x^2 = 4 $"), "$ x^2 = 4 $");
    }

    #[test]
    fn test_merge_all_empty_is_empty() {
        assert_eq!(merge_question("  ", "", "  \n"), "");
    }

    #[test]
    fn test_merge_parser_text_used_when_caller_arg_missing() {
        assert_eq!(merge_question("", "from the parser", ""), "from the parser");
    }

    #[test]
    fn test_split_message_respects_line_boundaries() {
        let content = "aaaa\nbbbb\ncccc\ndddd";
        let chunks = split_message(content, 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb", "cccc\ndddd"]);
    }

    #[test]
    fn test_split_message_short_content_single_chunk() {
        let chunks = split_message("short", 100);
        assert_eq!(chunks, vec!["short"]);
    }

    #[test]
    fn test_split_message_keeps_overlong_line_whole() {
        let long_line = "x".repeat(50);
        let chunks = split_message(&long_line, 10);
        assert_eq!(chunks, vec![long_line]);
    }
}
