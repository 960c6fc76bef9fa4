// render.rs - Answer Rendering Pipeline
// Turns {question, Markdown answer} into a PNG image via two interchangeable
// strategies with the same output contract:
// - RemoteRenderer: delegates template + data to a host render service
// - LocalRenderer: materializes the HTML to a temp file and screenshots it
//   in a scoped headless Chromium instance
//
// Key Features:
// - Offline-first asset resolution (local KaTeX/marked.js with CDN fallback)
// - Custom @font-face injection from configured font directories
// - Bounded, non-fatal waits for web fonts and the KaTeX DOM marker
// - Automatic strategy swap on failure; the caller degrades to plain text
//   only when both strategies fail
//
// Markdown and math are rendered client-side, inside the page: the raw
// Markdown is embedded in a script[type="text/plain"] container so that
// tag-like substrings (e.g. code samples mentioning <iostream>) are never
// parsed as markup before marked.js runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::config::SolveConfig;
use crate::error::RenderError;

/// HTML document template. Placeholders are filled with the question, the
/// raw Markdown content, and the resolved asset tags; marked.js and KaTeX
/// auto-render run client-side after DOMContentLoaded.
pub const DOC_TEMPLATE: &str = r#"
<!doctype html>
<html>
    <head>
        <meta charset="utf-8" />
        <meta name="viewport" content="width=device-width, initial-scale=1" />
        {{ KATEX_CSS | safe }}
        <style>
            :root { --font: 'Noto Sans', 'Noto Serif CJK SC',-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,'Helvetica Neue',Arial; }
            body { font-family: var(--font); background: #fff; color: #222; padding: 32px; font-size: 16px; line-height: 1.7;}
            .card { background: white; border-radius: 12px; padding: 32px; box-shadow: 0 10px 24px rgba(20,20,20,0.08); width: 1100px; margin: 0 auto; }
            .header { margin-bottom: 24px; }
            .header h1 { font-size: 24px; margin: 0 0 8px 0; }
            .header .small { color: #666; font-size: 13px; }
            .question-box { background: #f8f9fa; border-left: 4px solid #007bff; padding: 16px 20px; margin: 20px 0; border-radius: 4px; }
            .question-box h2 { font-size: 18px; margin: 0 0 8px 0; color: #007bff; }
            .question-text { font-size: 15px; white-space: pre-wrap; word-break: break-word; color: #333; }
            .content { font-size: 16px; line-height: 1.8; }
            .content h1 { font-size: 22px; margin: 28px 0 12px 0; border-bottom: 2px solid #e0e0e0; padding-bottom: 8px; }
            .content h2 { font-size: 20px; margin: 24px 0 10px 0; color: #333; }
            .content h3 { font-size: 18px; margin: 20px 0 8px 0; color: #555; }
            .content p { margin: 12px 0; }
            .content ul, .content ol { padding-left: 28px; margin: 12px 0; }
            .content li { margin: 6px 0; }
            .content strong { font-weight: 600; color: #000; }
            .content em { font-style: italic; color: #555; }
            .content code { background: #f5f5f5; padding: 2px 6px; border-radius: 3px; font-family: 'Consolas', 'Monaco', monospace; font-size: 14px; }
            .content pre { background: #f5f5f5; padding: 16px; border-radius: 6px; overflow: auto; margin: 16px 0; }
            .content pre code { background: none; padding: 0; }
            .content blockquote { border-left: 4px solid #ddd; padding-left: 16px; margin: 16px 0; color: #666; font-style: italic; }
            .content hr { border: none; border-top: 1px solid #e0e0e0; margin: 24px 0; }
            .content table {border-collapse: collapse;margin: 16px 0;width: 100%;}
            .content th, .content td {border: 1px solid #ddd;padding: 8px 12px;text-align: left;}
            .content th {background: #f2f2f2;font-weight: 600;}
            .content tr:nth-child(even) {background: #fafafa;}
            .katex .mtable {border-collapse: separate !important;border-spacing: 0 0.5em !important;}

        </style>
        {{ KATEX_JS | safe }}
        {{ AUTORENDER_JS | safe }}
        {{ MARKED_JS | safe }}
        <script>
            document.addEventListener('DOMContentLoaded', function() {
                // Read the raw Markdown out of the script[type="text/plain"]
                // container so the browser never parses it as HTML.
                const sourceEl = document.getElementById('markdown-source');
                const contentEl = document.getElementById('markdown-content');

                if (sourceEl && contentEl && window.marked) {
                    const mdText = sourceEl.textContent;

                    // marked.js escapes HTML inside code blocks itself.
                    const htmlResult = marked.parse(mdText);

                    contentEl.innerHTML = htmlResult;
                }

                // Typeset the math with KaTeX after the Markdown pass.
                if (window.renderMathInElement) {
                    renderMathInElement(document.body, {
                        delimiters: [
                            {left: '$$', right: '$$', display: true},
                            {left: '$', right: '$', display: false}
                        ],
                        throwOnError: false
                    });
                }
            });
        </script>
    </head>
    <body>
        <div class="card">
            <div class="header">
                <h1>📚 Problem Walkthrough</h1>
                <div class="small">generated by <strong>tutor_bot_rust</strong></div>
            </div>

            <div class="question-box">
                <h2>📝 Problem</h2>
                <div class="question-text">{{ question }}</div>
            </div>

            <!-- Raw Markdown lives in a non-executing text container. -->
            <script type="text/plain" id="markdown-source">{{ content }}</script>
            <div class="content" id="markdown-content"></div>
        </div>
    </body>
    </html>
"#;

const CDN_KATEX_CSS: &str = r#"<link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/katex@0.16.9/dist/katex.min.css" crossorigin="anonymous">"#;
const CDN_KATEX_JS: &str = r#"<script defer src="https://cdn.jsdelivr.net/npm/katex@0.16.9/dist/katex.min.js" crossorigin="anonymous"></script>"#;
const CDN_AUTORENDER_JS: &str = r#"<script defer src="https://cdn.jsdelivr.net/npm/katex@0.16.9/dist/contrib/auto-render.min.js" crossorigin="anonymous"></script>"#;
const CDN_MARKED_JS: &str = r#"<script src="https://cdn.jsdelivr.net/npm/marked@11.1.0/marked.min.js"></script>"#;

const FONT_EXTENSIONS: [&str; 4] = ["ttf", "otf", "woff", "woff2"];

/// The {question, content} pair handed to the render pipeline. The content
/// is the solver's raw Markdown and is treated as opaque text throughout.
#[derive(Debug, Clone)]
pub struct RenderData {
    pub question: String,
    pub content: String,
}

/// A produced image artifact: a fetchable URL (remote strategy) or a local
/// file path (local strategy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderArtifact {
    Url(String),
    File(PathBuf),
}

/// Resolved asset tags for the document template: each is either a
/// file:// reference to a local resource or a pinned CDN reference.
#[derive(Debug, Clone)]
pub struct AssetTags {
    pub katex_css: String,
    pub katex_js: String,
    pub autorender_js: String,
    pub marked_js: String,
}

impl AssetTags {
    /// Resolve the four asset families against the configuration: prefer
    /// local files when the offline toggles are set and the files exist,
    /// otherwise fall back to the CDN with a warning.
    pub fn resolve(config: &SolveConfig) -> AssetTags {
        let mut tags = AssetTags {
            katex_css: CDN_KATEX_CSS.to_string(),
            katex_js: CDN_KATEX_JS.to_string(),
            autorender_js: CDN_AUTORENDER_JS.to_string(),
            marked_js: CDN_MARKED_JS.to_string(),
        };

        if config.offline_katex_assets {
            let assets_dir = &config.katex_assets_dir;
            let css_path = assets_dir.join("katex.min.css");
            let js_path = assets_dir.join("katex.min.js");
            let auto_path = assets_dir.join("auto-render.min.js");
            let fonts_dir = assets_dir.join("fonts");

            if css_path.exists() && js_path.exists() && auto_path.exists() {
                if !fonts_dir.exists() {
                    log::warn!(
                        "⚠️ Offline KaTeX font directory missing, system fonts will be used (expected: {})",
                        fonts_dir.display()
                    );
                }
                tags.katex_css = format!(r#"<link rel="stylesheet" href="{}">"#, file_url(&css_path));
                tags.katex_js = format!(r#"<script defer src="{}"></script>"#, file_url(&js_path));
                tags.autorender_js =
                    format!(r#"<script defer src="{}"></script>"#, file_url(&auto_path));
            } else {
                log::warn!(
                    "⚠️ Offline KaTeX assets missing or incomplete under {}, falling back to CDN",
                    assets_dir.display()
                );
            }
        }

        if config.offline_marked_assets {
            let marked_path = &config.marked_assets_path;
            if marked_path.exists() {
                tags.marked_js = format!(r#"<script src="{}"></script>"#, file_url(marked_path));
            } else {
                log::warn!(
                    "⚠️ Offline marked.js not found at {}, falling back to CDN",
                    marked_path.display()
                );
            }
        }

        tags
    }
}

/// Build a file:// URL for a local path, normalized to forward slashes.
fn file_url(path: &Path) -> String {
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", absolute.to_string_lossy().replace('\\', "/"))
}

/// Fill the document template. Autoescaping is off: the Markdown content is
/// embedded verbatim in its text/plain container, as the template expects.
pub fn render_document(data: &RenderData, tags: &AssetTags) -> Result<String, RenderError> {
    let env = minijinja::Environment::new();
    let template = env.template_from_str(DOC_TEMPLATE)?;
    let html = template.render(minijinja::context! {
        question => data.question,
        content => data.content,
        KATEX_CSS => tags.katex_css,
        KATEX_JS => tags.katex_js,
        AUTORENDER_JS => tags.autorender_js,
        MARKED_JS => tags.marked_js,
    })?;
    Ok(html)
}

/// One way to turn the document into an image. Both implementations share
/// the same output contract and are interchangeable.
#[async_trait]
pub trait RenderStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn render(
        &self,
        data: &RenderData,
        tags: &AssetTags,
        config: &SolveConfig,
    ) -> Result<RenderArtifact, RenderError>;
}

// Wire format for the host render service.
#[derive(Serialize)]
struct RemoteRenderData<'a> {
    question: &'a str,
    content: &'a str,
    #[serde(rename = "KATEX_CSS")]
    katex_css: &'a str,
    #[serde(rename = "KATEX_JS")]
    katex_js: &'a str,
    #[serde(rename = "AUTORENDER_JS")]
    autorender_js: &'a str,
    #[serde(rename = "MARKED_JS")]
    marked_js: &'a str,
}

#[derive(Serialize)]
struct RemoteRenderOptions {
    full_page: bool,
    #[serde(rename = "type")]
    output_type: &'static str,
    scale: &'static str,
}

#[derive(Serialize)]
struct RemoteRenderRequest<'a> {
    tmpl: &'a str,
    data: RemoteRenderData<'a>,
    options: RemoteRenderOptions,
}

#[derive(Deserialize)]
struct RemoteRenderReply {
    url: String,
}

/// Delegates rendering to the host-provided render service, which fills
/// the template itself and answers with a fetchable image URL.
pub struct RemoteRenderer;

#[async_trait]
impl RenderStrategy for RemoteRenderer {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn render(
        &self,
        data: &RenderData,
        tags: &AssetTags,
        config: &SolveConfig,
    ) -> Result<RenderArtifact, RenderError> {
        let service_url = config
            .render_service_url
            .as_deref()
            .ok_or(RenderError::RemoteUnconfigured)?;

        let payload = RemoteRenderRequest {
            tmpl: DOC_TEMPLATE,
            data: RemoteRenderData {
                question: &data.question,
                content: &data.content,
                katex_css: &tags.katex_css,
                katex_js: &tags.katex_js,
                autorender_js: &tags.autorender_js,
                marked_js: &tags.marked_js,
            },
            options: RemoteRenderOptions {
                full_page: true,
                output_type: "png",
                scale: "device",
            },
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RenderError::Remote(e.to_string()))?;

        let response = client
            .post(format!("{}/render", service_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| RenderError::Remote(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RenderError::Remote(format!("HTTP {}: {}", status, body)));
        }

        let reply: RemoteRenderReply = response
            .json()
            .await
            .map_err(|e| RenderError::Remote(e.to_string()))?;

        println!("[RENDER] Remote render service returned {}", reply.url);
        Ok(RenderArtifact::Url(reply.url))
    }
}

/// One headless-browser lifetime: launched, asked for exactly one capture,
/// then closed. `close` must run whether the capture succeeded or not.
#[async_trait]
trait BrowserSession: Send {
    async fn capture(
        &mut self,
        html_path: &Path,
        out_path: &Path,
        config: &SolveConfig,
    ) -> Result<(), RenderError>;
    async fn close(&mut self);
}

#[async_trait]
trait BrowserLauncher: Send + Sync {
    async fn launch(&self, config: &SolveConfig) -> Result<Box<dyn BrowserSession>, RenderError>;
}

struct ChromiumLauncher;

struct ChromiumSession {
    browser: Browser,
    driver: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, config: &SolveConfig) -> Result<Box<dyn BrowserSession>, RenderError> {
        let viewport = Viewport {
            width: 1280,
            height: 800,
            device_scale_factor: Some(f64::from(config.local_device_scale)),
            ..Default::default()
        };
        let browser_config = BrowserConfig::builder()
            .no_sandbox()
            .viewport(viewport)
            .build()
            .map_err(RenderError::Browser)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| RenderError::Browser(e.to_string()))?;
        let driver = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(ChromiumSession { browser, driver }))
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn capture(
        &mut self,
        html_path: &Path,
        out_path: &Path,
        config: &SolveConfig,
    ) -> Result<(), RenderError> {
        capture_page(&self.browser, html_path, out_path, config).await
    }

    async fn close(&mut self) {
        let _ = self.browser.close().await;
        let _ = self.browser.wait().await;
        self.driver.abort();
    }
}

/// Renders the document in a locally launched headless Chromium. The HTML
/// is written to a temp file first: file:// asset references (offline KaTeX
/// CSS/JS and its fonts/) do not load from an about:blank page.
pub struct LocalRenderer {
    launcher: Box<dyn BrowserLauncher>,
}

impl LocalRenderer {
    pub fn new() -> Self {
        Self {
            launcher: Box::new(ChromiumLauncher),
        }
    }

    #[cfg(test)]
    fn with_launcher(launcher: Box<dyn BrowserLauncher>) -> Self {
        Self { launcher }
    }
}

#[async_trait]
impl RenderStrategy for LocalRenderer {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn render(
        &self,
        data: &RenderData,
        tags: &AssetTags,
        config: &SolveConfig,
    ) -> Result<RenderArtifact, RenderError> {
        let html = render_document(data, tags)?;

        // Unique names so concurrent renders never collide. The files are
        // left behind for the OS temp-dir hygiene to collect.
        let stamp = chrono::Utc::now().timestamp_millis();
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let temp_dir = std::env::temp_dir();
        let html_path = temp_dir.join(format!("tutor_bot_{}_{}.html", stamp, tag));
        let out_path = temp_dir.join(format!("tutor_bot_{}_{}.png", stamp, tag));

        std::fs::write(&html_path, &html).map_err(|source| RenderError::Io {
            path: html_path.clone(),
            source,
        })?;

        // The browser and its driver task must be released on every exit
        // path, so the capture happens through the session and close runs
        // unconditionally afterwards.
        let mut session = self.launcher.launch(config).await?;
        let result = session.capture(&html_path, &out_path, config).await;
        session.close().await;

        result?;
        println!("[RENDER] Local render complete: {}", out_path.display());
        Ok(RenderArtifact::File(out_path))
    }
}

async fn capture_page(
    browser: &Browser,
    html_path: &Path,
    out_path: &Path,
    config: &SolveConfig,
) -> Result<(), RenderError> {
    let page = browser
        .new_page(file_url(html_path))
        .await
        .map_err(|e| RenderError::Browser(e.to_string()))?;
    page.wait_for_navigation()
        .await
        .map_err(|e| RenderError::Browser(e.to_string()))?;

    inject_custom_fonts(&page, &config.custom_font_dirs).await;

    // Bounded best-effort waits: an expired timeout skips the wait, it
    // never fails the render.
    let _ = tokio::time::timeout(Duration::from_millis(1500), wait_for_fonts_loaded(&page)).await;
    let _ = tokio::time::timeout(Duration::from_millis(2000), wait_for_selector(&page, ".katex")).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let screenshot = ScreenshotParams::builder()
        .format(CaptureScreenshotFormat::Png)
        .full_page(true)
        .build();
    page.save_screenshot(screenshot, out_path)
        .await
        .map_err(|e| RenderError::Browser(e.to_string()))?;

    Ok(())
}

/// Scan the configured font directories for recognized font files and
/// inject matching @font-face declarations into the page. Best effort:
/// missing directories only produce warnings.
async fn inject_custom_fonts(page: &Page, font_dirs: &[PathBuf]) {
    if font_dirs.is_empty() {
        return;
    }

    let mut font_files = Vec::new();
    for dir in font_dirs {
        if !dir.is_dir() {
            log::warn!("⚠️ Custom font directory does not exist: {}", dir.display());
            continue;
        }
        collect_font_files(dir, &mut font_files);
    }

    if font_files.is_empty() {
        return;
    }

    let css = build_font_face_css(&font_files);
    let script = format!(
        "(() => {{ const s = document.createElement('style'); s.textContent = {}; document.head.appendChild(s); }})()",
        serde_json::to_string(&css).unwrap_or_default()
    );
    match page.evaluate(script).await {
        Ok(_) => println!("[RENDER] Injected {} custom font face(s)", font_files.len()),
        Err(e) => log::warn!("⚠️ Custom font injection failed: {}", e),
    }
}

fn collect_font_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        // file_type() does not follow symlinks; skipping them keeps a
        // cyclic link under a font dir from recursing forever.
        if file_type.is_symlink() {
            continue;
        }
        let path = entry.path();
        if file_type.is_dir() {
            collect_font_files(&path, out);
        } else if is_font_file(&path) {
            out.push(path);
        }
    }
}

fn is_font_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| FONT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// One @font-face per file; the family name is the file stem.
fn build_font_face_css(font_files: &[PathBuf]) -> String {
    let mut css = String::new();
    for font_file in font_files {
        let family = font_file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        if family.is_empty() {
            continue;
        }
        css.push_str(&format!(
            "@font-face {{ font-family: '{}'; src: url('{}'); }}\n",
            family,
            file_url(font_file)
        ));
    }
    css
}

async fn wait_for_fonts_loaded(page: &Page) {
    loop {
        if let Ok(eval) = page
            .evaluate("document.fonts && document.fonts.status === 'loaded'")
            .await
        {
            if eval.into_value::<bool>().unwrap_or(false) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn wait_for_selector(page: &Page, selector: &str) {
    loop {
        if page.find_element(selector).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Try the primary strategy; when it fails, log and try the secondary
/// exactly once. The error of the second attempt is returned when both
/// fail, so the caller can degrade to plain text.
pub async fn render_with_fallback(
    primary: &dyn RenderStrategy,
    secondary: &dyn RenderStrategy,
    data: &RenderData,
    tags: &AssetTags,
    config: &SolveConfig,
) -> Result<RenderArtifact, RenderError> {
    match primary.render(data, tags, config).await {
        Ok(artifact) => Ok(artifact),
        Err(e) => {
            log::warn!(
                "⚠️ {} render failed ({}), trying {} render...",
                primary.name(),
                e,
                secondary.name()
            );
            secondary.render(data, tags, config).await
        }
    }
}

/// Render the answer with the configured strategy preference and the
/// automatic swap-on-failure policy.
pub async fn render_answer(
    config: &SolveConfig,
    data: &RenderData,
) -> Result<RenderArtifact, RenderError> {
    let tags = AssetTags::resolve(config);
    let remote = RemoteRenderer;
    let local = LocalRenderer::new();
    let (primary, secondary): (&dyn RenderStrategy, &dyn RenderStrategy) =
        if config.prefer_local_render {
            (&local, &remote)
        } else {
            (&remote, &local)
        };
    render_with_fallback(primary, secondary, data, &tags, config).await
}
