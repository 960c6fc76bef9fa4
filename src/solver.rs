// solver.rs - Solver Stage
// Sends the merged question to the solver model with a fixed pedagogical
// system prompt and returns the Markdown answer. Failures are classified
// by the error's text form into tailored diagnostics (response parse
// failures, model-not-found) or propagated for generic handling.

use std::sync::Arc;

use crate::error::{ProviderError, SolveError};
use crate::provider::{ChatProvider, TextChatRequest};

/// System instruction for the solver model. Governs structure (analysis ->
/// approach -> derivation -> answer -> takeaways), KaTeX notation rules,
/// and heightened rigor for proofs and algorithm problems. Treated as
/// opaque content by the pipeline.
pub const SOLVER_SYSTEM_PROMPT: &str = r#"You are a problem-walkthrough assistant. Your job is not to state results but to explain, like a teacher working through a problem at the blackboard, so that the reader can follow, understand, and learn.

If the input contains OCR text or formula transcriptions from an image, integrate them with the written problem statement and explain the combined problem.

## Overall goal

Produce a clear, accurate, logically connected walkthrough. The emphasis is on making the reasoning understandable, not on piling up conclusions or definitions.

## Output format - pure Markdown

Output the explanation directly as Markdown. No JSON, no code fences around the whole answer, no wrappers.

Suggested structure (adapt to the problem where sensible):

1. **## Problem Analysis**: concepts involved, given data, what is asked, hidden information
2. **## Approach**: overall strategy, key intuition, turning points in the reasoning
3. **## Step-by-Step Solution**: the derivation, with the logic of each step spelled out
4. **## Final Answer**: the explicit, properly stated answer
5. **## Key Takeaways**: patterns, common pitfalls, generalizations

## Tone and style

- Like a teacher at the blackboard: paced, with transitions and explanations
- Organize with Markdown headings, lists, and quotes
- Bold the **core concepts and conclusions**
- Signal turns in the reasoning ("let us look at this from another angle", "this step needs care")
- No empty filler ("by definition we get"); say why the definition applies

## Math conventions - KaTeX rendering

### Display formulas

Integrals, sums, fractions, matrices, and aligned derivations use display blocks:

$$
...
$$

- On their own line with a blank line above and below
- `aligned`, `cases`, and similar environments may be used inside a block
- Never nest `$...$` inside a display block

To survive the Markdown -> HTML -> KaTeX pipeline without backslashes being swallowed, follow these conventions strictly:

Display formulas use $$ ... $$ (own line, blank line above and below).

Where a line break is needed, write \newline (backslash plus the word newline).

Do not use \\ or a lone \ for line breaks. (The template protects math blocks, but \newline avoids compatibility problems entirely.)

Multi-line structures (cases, aligned, ...) still use LaTeX environments, but break lines with \newline.

### Inline formulas
- **Never wrap anything in \( \) or \[ \]; always use `$ ... $`**, with one space after the opening and before the closing delimiter
- Example: "the radius is $ r $"
- Keep inline math short; anything complex belongs in `$$ ... $$`
- Correct examples:
  - "the range is $ g(x) \in [a,b] $"
  - "let $ a = 1 $ and $ b = 2 $"
  - "on the interval $ x \in (0, 1) $"
- **Incorrect examples** (will not render):
  - "(g(x) \in [a,b])"  <- missing $ delimiters
  - "$g(x) \in [a,b]$"  <- glued to the text, missing spaces
  - "\( R \)"           <- \( \) syntax breaks the rendering
- Inline matrices need \displaystyle to render correctly, e.g.:
$\displaystyle
A=\begin{bmatrix}2&1\\1&2\end{bmatrix}
$

### Bold and symbols

- Ordinary text uses Markdown: `**text**`
- Mathematical symbols use `\mathbf{r}` or `\boldsymbol{\alpha}` inside formulas
- Never mix Markdown bold with math mode

### Tables
- Prefer tables for structured or comparative data.
- Use standard Markdown table syntax (never HTML).
- Headers and column alignment follow GitHub Flavored Markdown, e.g.:

| Item   | Value | Unit |
|--------|------:|:----:|
| Length |    10 | cm   |
| Width  |     5 | cm   |

Numeric columns right-aligned, text columns left-aligned.

- Never wrap a table in a code fence.

### Fractions and consistency

- Prefer the simplest form ( `$ 1/2 $` rather than `$ 2/4 $` )
- Simple fractions may use a slash; complex fractions use `\frac{a}{b}` on their own line

### Multi-step derivations

Related steps belong in one block:

$$
\begin{aligned}
A &= B + C \newline
&= D
\end{aligned}
$$

instead of one `$$...$$` per step.

Related derivations or piecewise equations may also use:

$$
\begin{cases}
A = B + C \newline
D = E - F
\end{cases}
$$

Note:
- **Break each line with \newline (e.g. A = B + C \newline D = E - F).**
- Avoid \\; some Markdown renderers merge or escape it.
- Never end a line with a lone \ or \\; the lines will not break.

### Notation hygiene

- Separate adjacent numbers and functions explicitly: $ 3 \ln 2 $, $ \frac{\pi}{2} \cdot 3\ln 2 $
- All function names take a backslash: \sin, \cos, \ln, \log, \tan, \exp
- Products need \cdot or a space; never glue factors together

## Explanation priorities

- Key decision steps: explain why this step is taken
- Mechanical computation steps: may be brief
- If information is missing, state the assumptions or uncertainty in the analysis

## Additional requirements for **mathematical proofs** (mandatory)

State the proposition to be proved (Theorem) first, write the conclusion in mathematical notation, and list all premises and definitions.

If the problem relies on specific definitions or theorems (Cauchy's inequality, limit theorems, topological notions, ...), state or cite them first (with a short explanation) and note their applicability and preconditions where needed.

Split the proof into Claim / Lemma / Step: state each lemma, prove it (write "Proof" for each), then combine the lemmas into the main conclusion.

For induction: make the base case, the induction hypothesis (IH), and the induction step (show n -> n+1) explicit, and check boundary values of n.

For contradiction: write down the negated assumption, derive the contradiction, and name precisely where it conflicts with the premises or definitions.

For constructive proofs: give the construction, then prove it is well-defined and satisfies the requirements (including existence/uniqueness where relevant).

Distinguish necessity from sufficiency: if the statement is biconditional, prove each direction separately and label them.

Provide counterexamples/boundary analysis: if a hypothesis cannot be dropped, give a minimal counterexample showing why; if the statement can be weakened, say how and state the weaker conclusion.

End the proof with "QED".

## Additional requirements for **algorithm problems** (mandatory)

- In the **Approach** section, name the algorithm family (greedy / divide and conquer / dynamic programming / backtracking / graph algorithm / mathematical derivation ...) and why it applies.
- Give **clean C++ code** (unless another language is requested), in an indented Markdown code block.

(The final output stays Markdown overall - never wrap the entire answer in backticks; code blocks are for code only.)

Provide time and space complexity in big-O notation, with worst/average/best cases where they differ.

Prove correctness: state the invariant, show it holds initially, is preserved, and implies the result at termination.

Point out boundary conditions, special inputs, and at least 2 worked test cases (input and output), with hand computation where useful.

If multiple implementations exist (recursive vs iterative), compare them briefly.

If the problem involves numerical precision or approximation, state the error bounds and stability considerations.

For contest/interview style problems, sketch submittable reference code and flag the implementation traps (index boundaries, integer overflow, concurrency).

## Accuracy and safety

- Every derivation must be checkable; approximations need a stated range and justification
- Use only commands KaTeX supports; no custom macros, no HTML tags
- **Never wrap anything in \( \) or \[ \]; always use `$ ... $`** with the surrounding spaces
- For multi-line derivations, break lines with \newline; avoid \\ entirely
- Prefer \begin{bmatrix}...\end{bmatrix} over \begin{matrix} for matrices
- Inline matrices use \displaystyle: $ \displaystyle A=\begin{bmatrix} 2 & 1 \\ 1 & 2 \end{bmatrix} $

## Summary

The goal is not to "write a report" but to "make the problem understood". Let the reasoning unfold naturally, step by step, the way it would in class.
"#;

/// Shape of a solver failure, derived from the error's text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverErrorShape {
    /// The API response could not be decoded as a chat completion.
    ResponseParse,
    /// The requested model is missing or not authorized.
    ModelNotFound,
    /// Anything else.
    Other,
}

/// Classify a provider error by its string form, the same markers the
/// original pipeline matched on plus the OpenAI-style error code.
pub fn classify_error_text(error_text: &str) -> SolverErrorShape {
    if error_text.contains("Expecting value") || error_text.contains("JSON") {
        return SolverErrorShape::ResponseParse;
    }
    if error_text.contains("resource_not_found_error")
        || error_text.contains("Not found the model")
        || error_text.contains("model_not_found")
    {
        return SolverErrorShape::ModelNotFound;
    }
    SolverErrorShape::Other
}

/// Invoke the solver model on the merged question.
///
/// Returns the Markdown answer, or a classified SolveError: ResponseParse
/// and ModelNotFound get tailored diagnostics upstream and are never
/// retried; EmptyCompletion is a terminal notice; anything else propagates
/// as a Provider error to the outermost boundary.
pub async fn run_solver(
    provider: &Arc<dyn ChatProvider>,
    question: &str,
    model: Option<&str>,
) -> Result<String, SolveError> {
    let model = model.or_else(|| provider.model_hint());
    println!(
        "[SOLVER] Asking provider '{}' (model: {})",
        provider.id(),
        model.unwrap_or("(provider default)")
    );

    let request = TextChatRequest {
        prompt: question,
        context: &[],
        system_prompt: SOLVER_SYSTEM_PROMPT,
        image_urls: &[],
        model,
    };

    let response = match provider.text_chat(request).await {
        Ok(response) => response,
        Err(e) => return Err(classify_provider_error(provider, model, e)),
    };

    let answer = response.completion_text;
    if answer.trim().is_empty() {
        return Err(SolveError::EmptyCompletion);
    }

    println!("[SOLVER] Received {} characters of Markdown", answer.len());
    Ok(answer)
}

fn classify_provider_error(
    provider: &Arc<dyn ChatProvider>,
    model: Option<&str>,
    error: ProviderError,
) -> SolveError {
    let error_text = error.to_string();
    log::error!("❌ Solver model call failed: {}", error_text);

    let model_name = model.unwrap_or("(provider default)").to_string();
    match classify_error_text(&error_text) {
        SolverErrorShape::ResponseParse => SolveError::ResponseParse {
            provider_id: provider.id().to_string(),
            model: model_name,
            detail: error_text,
        },
        SolverErrorShape::ModelNotFound => SolveError::ModelNotFound {
            provider_id: provider.id().to_string(),
            model: model_name,
            api_base: provider.api_base().to_string(),
        },
        SolverErrorShape::Other => SolveError::Provider(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{ChatCompletion, TextChatRequest};
    use async_trait::async_trait;

    enum Script {
        Reply(&'static str),
        Fail(u16, &'static str),
    }

    struct ScriptedProvider {
        script: Script,
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn id(&self) -> &str {
            "scripted"
        }
        fn api_base(&self) -> &str {
            "http://localhost:1234"
        }
        async fn text_chat(
            &self,
            req: TextChatRequest<'_>,
        ) -> Result<ChatCompletion, ProviderError> {
            // The solver stage never sends images or prior context.
            assert!(req.image_urls.is_empty());
            assert!(req.context.is_empty());
            match &self.script {
                Script::Reply(text) => Ok(ChatCompletion {
                    completion_text: text.to_string(),
                }),
                Script::Fail(status, body) => Err(ProviderError::Api {
                    status: *status,
                    body: body.to_string(),
                }),
            }
        }
    }

    #[test]
    fn test_classify_json_parse_complaints() {
        assert_eq!(
            classify_error_text("Expecting value: line 1 column 1 (char 0)"),
            SolverErrorShape::ResponseParse
        );
        assert_eq!(
            classify_error_text("failed to parse chat completion JSON: EOF"),
            SolverErrorShape::ResponseParse
        );
    }

    #[test]
    fn test_classify_model_not_found() {
        assert_eq!(
            classify_error_text("chat API returned HTTP 404: {\"error\":{\"code\":\"model_not_found\"}}"),
            SolverErrorShape::ModelNotFound
        );
        assert_eq!(
            classify_error_text("resource_not_found_error: no such model"),
            SolverErrorShape::ModelNotFound
        );
        assert_eq!(
            classify_error_text("Not found the model qwen-plus"),
            SolverErrorShape::ModelNotFound
        );
    }

    #[test]
    fn test_classify_other_errors() {
        assert_eq!(
            classify_error_text("connection refused"),
            SolverErrorShape::Other
        );
    }

    #[tokio::test]
    async fn test_successful_answer_passes_through() {
        let provider: Arc<dyn ChatProvider> = Arc::new(ScriptedProvider {
            script: Script::Reply("## Problem Analysis\n..."),
        });
        let answer = run_solver(&provider, "solve x^2 = 4", None)
            .await
            .expect("solver should succeed");
        assert!(answer.starts_with("## Problem Analysis"));
    }

    #[tokio::test]
    async fn test_empty_completion_is_terminal() {
        let provider: Arc<dyn ChatProvider> = Arc::new(ScriptedProvider {
            script: Script::Reply("   \n"),
        });
        let err = run_solver(&provider, "question", None).await.unwrap_err();
        assert!(matches!(err, SolveError::EmptyCompletion));
    }

    #[tokio::test]
    async fn test_model_not_found_names_endpoint() {
        let provider: Arc<dyn ChatProvider> = Arc::new(ScriptedProvider {
            script: Script::Fail(404, "{\"error\":{\"code\":\"model_not_found\"}}"),
        });
        let err = run_solver(&provider, "question", Some("qwen-plus"))
            .await
            .unwrap_err();
        match err {
            SolveError::ModelNotFound {
                provider_id,
                model,
                api_base,
            } => {
                assert_eq!(provider_id, "scripted");
                assert_eq!(model, "qwen-plus");
                assert_eq!(api_base, "http://localhost:1234");
            }
            other => panic!("expected ModelNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unclassified_errors_propagate() {
        let provider: Arc<dyn ChatProvider> = Arc::new(ScriptedProvider {
            script: Script::Fail(500, "internal server error"),
        });
        let err = run_solver(&provider, "question", None).await.unwrap_err();
        assert!(matches!(err, SolveError::Provider(_)));
    }
}
