// config.rs - Solve Pipeline Configuration
// Loads solveconf.txt (KEY=VALUE format) into an immutable SolveConfig that
// is created once at startup and passed by reference into every pipeline
// stage. Follows the same multi-path search, BOM stripping, and comment
// handling as botconfig.txt loading in main.rs.
//
// Recognized keys (all optional, defaults below):
// - OFFLINE_KATEX_ASSETS / OFFLINE_MARKED_ASSETS - prefer local assets over CDN
// - KATEX_ASSETS_DIR / MARKED_ASSETS_PATH        - local asset locations
// - SOLVER_PROVIDER_ID / OCR_PROVIDER_ID         - preferred provider per role
// - SOLVER_MODEL / OCR_MODEL                     - model override per role
// - PREFER_LOCAL_RENDER                          - try headless browser first
// - LOCAL_DEVICE_SCALE                           - device scale factor (default 2)
// - CUSTOM_FONT_DIRS                             - comma-separated font directories
// - RENDER_SERVICE_URL                           - remote render service endpoint
// - REQUEST_TIMEOUT                              - provider call timeout (seconds)
// - DEFAULT_PROVIDER_ID                          - session-default backend id
// - PROVIDER_<ID>=base_url[|api_key]             - OpenAI-compatible backend

use std::collections::HashMap;
use std::path::PathBuf;

/// Connection details for one OpenAI-compatible chat backend.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Process-wide, read-only configuration for the solve pipeline.
#[derive(Debug, Clone)]
pub struct SolveConfig {
    pub offline_katex_assets: bool,
    pub offline_marked_assets: bool,
    pub katex_assets_dir: PathBuf,
    pub marked_assets_path: PathBuf,
    pub solver_provider_id: String,
    pub ocr_provider_id: String,
    pub solver_model: Option<String>,
    pub ocr_model: Option<String>,
    pub prefer_local_render: bool,
    pub local_device_scale: u32,
    pub custom_font_dirs: Vec<PathBuf>,
    pub render_service_url: Option<String>,
    pub request_timeout_secs: u64,
    pub default_provider_id: String,
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            offline_katex_assets: true,
            offline_marked_assets: true,
            katex_assets_dir: PathBuf::from("assets/katex"),
            marked_assets_path: PathBuf::from("assets/marked.min.js"),
            solver_provider_id: String::new(),
            ocr_provider_id: String::new(),
            solver_model: None,
            ocr_model: None,
            prefer_local_render: false,
            local_device_scale: 2,
            custom_font_dirs: Vec::new(),
            render_service_url: None,
            request_timeout_secs: 120,
            default_provider_id: String::new(),
            providers: HashMap::new(),
        }
    }
}

impl SolveConfig {
    /// Build a config from parsed KEY=VALUE pairs. Unknown keys are ignored,
    /// missing keys keep their defaults, and unparsable values fall back to
    /// the default for that key with a warning.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut config = SolveConfig::default();

        if let Some(v) = map.get("OFFLINE_KATEX_ASSETS") {
            config.offline_katex_assets = parse_bool(v, config.offline_katex_assets);
        }
        if let Some(v) = map.get("OFFLINE_MARKED_ASSETS") {
            config.offline_marked_assets = parse_bool(v, config.offline_marked_assets);
        }
        if let Some(v) = map.get("KATEX_ASSETS_DIR") {
            if !v.is_empty() {
                config.katex_assets_dir = PathBuf::from(v);
            }
        }
        if let Some(v) = map.get("MARKED_ASSETS_PATH") {
            if !v.is_empty() {
                config.marked_assets_path = PathBuf::from(v);
            }
        }
        // Provider ids are case-insensitive everywhere: registry keys are
        // lowercased, so the role ids must be too.
        if let Some(v) = map.get("SOLVER_PROVIDER_ID") {
            config.solver_provider_id = v.to_lowercase();
        }
        if let Some(v) = map.get("OCR_PROVIDER_ID") {
            config.ocr_provider_id = v.to_lowercase();
        }
        if let Some(v) = map.get("SOLVER_MODEL") {
            if !v.is_empty() {
                config.solver_model = Some(v.clone());
            }
        }
        if let Some(v) = map.get("OCR_MODEL") {
            if !v.is_empty() {
                config.ocr_model = Some(v.clone());
            }
        }
        if let Some(v) = map.get("PREFER_LOCAL_RENDER") {
            config.prefer_local_render = parse_bool(v, config.prefer_local_render);
        }
        if let Some(v) = map.get("LOCAL_DEVICE_SCALE") {
            match v.parse::<u32>() {
                Ok(scale) if scale > 0 => config.local_device_scale = scale,
                _ => log::warn!("⚠️ Invalid LOCAL_DEVICE_SCALE '{}', using default", v),
            }
        }
        if let Some(v) = map.get("CUSTOM_FONT_DIRS") {
            config.custom_font_dirs = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(v) = map.get("RENDER_SERVICE_URL") {
            if !v.is_empty() {
                config.render_service_url = Some(v.trim_end_matches('/').to_string());
            }
        }
        if let Some(v) = map.get("REQUEST_TIMEOUT") {
            match v.parse::<u64>() {
                Ok(secs) if secs > 0 => config.request_timeout_secs = secs,
                _ => log::warn!("⚠️ Invalid REQUEST_TIMEOUT '{}', using default", v),
            }
        }
        if let Some(v) = map.get("DEFAULT_PROVIDER_ID") {
            config.default_provider_id = v.to_lowercase();
        }

        // PROVIDER_<ID>=base_url[|api_key] lines define chat backends.
        for (key, value) in map {
            if let Some(raw_id) = key.strip_prefix("PROVIDER_") {
                let id = raw_id.to_lowercase();
                if id.is_empty() || value.is_empty() {
                    continue;
                }
                let mut pieces = value.splitn(2, '|');
                let base_url = pieces.next().unwrap_or("").trim().trim_end_matches('/');
                if base_url.is_empty() {
                    log::warn!("⚠️ Provider '{}' has an empty base URL, skipping", id);
                    continue;
                }
                let api_key = pieces
                    .next()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from);
                config.providers.insert(
                    id,
                    ProviderConfig {
                        base_url: base_url.to_string(),
                        api_key,
                    },
                );
            }
        }

        // With a single backend defined, it doubles as the session default.
        if config.default_provider_id.is_empty() && config.providers.len() == 1 {
            if let Some(id) = config.providers.keys().next() {
                config.default_provider_id = id.clone();
            }
        }

        config
    }
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default,
    }
}

/// Parse KEY=VALUE content into a map, skipping comments and blank lines.
fn parse_key_value_content(content: &str) -> HashMap<String, String> {
    // Remove BOM if present
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut map = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(equals_pos) = line.find('=') {
            let key = line[..equals_pos].trim().to_string();
            let value = line[equals_pos + 1..].trim().to_string();
            map.insert(key, value);
        }
    }

    map
}

/// Load the solve configuration from solveconf.txt, searching the same
/// locations as the other config files. A missing file is not an error:
/// the pipeline runs with defaults (and no providers) until one is created.
pub async fn load_solve_config() -> SolveConfig {
    load_solve_config_from(&[
        "solveconf.txt",
        "../solveconf.txt",
        "../../solveconf.txt",
        "src/solveconf.txt",
    ])
    .await
}

async fn load_solve_config_from(config_paths: &[&str]) -> SolveConfig {
    for config_path in config_paths {
        match tokio::fs::read_to_string(config_path).await {
            Ok(content) => {
                let map = parse_key_value_content(&content);
                let config = SolveConfig::from_map(&map);
                println!(
                    "✅ Solve configuration loaded from {} ({} provider(s))",
                    config_path,
                    config.providers.len()
                );
                return config;
            }
            Err(_) => continue,
        }
    }

    log::warn!(
        "⚠️ solveconf.txt not found in any expected location (., .., ../.., src/) - using defaults"
    );
    SolveConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_when_map_empty() {
        let config = SolveConfig::from_map(&HashMap::new());
        assert!(config.offline_katex_assets);
        assert!(config.offline_marked_assets);
        assert_eq!(config.katex_assets_dir, PathBuf::from("assets/katex"));
        assert_eq!(config.local_device_scale, 2);
        assert!(!config.prefer_local_render);
        assert!(config.providers.is_empty());
        assert!(config.render_service_url.is_none());
    }

    #[test]
    fn test_provider_lines_define_backends() {
        let map = map_of(&[
            ("PROVIDER_LMSTUDIO", "http://localhost:1234"),
            ("PROVIDER_OPENROUTER", "https://openrouter.ai/api|sk-test-key"),
            ("DEFAULT_PROVIDER_ID", "lmstudio"),
        ]);
        let config = SolveConfig::from_map(&map);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.default_provider_id, "lmstudio");

        let lmstudio = &config.providers["lmstudio"];
        assert_eq!(lmstudio.base_url, "http://localhost:1234");
        assert!(lmstudio.api_key.is_none());

        let openrouter = &config.providers["openrouter"];
        assert_eq!(openrouter.base_url, "https://openrouter.ai/api");
        assert_eq!(openrouter.api_key.as_deref(), Some("sk-test-key"));
    }

    #[test]
    fn test_role_ids_lowercased_like_provider_ids() {
        let map = map_of(&[
            ("PROVIDER_ALPHA", "http://localhost:1111"),
            ("PROVIDER_BETA", "http://localhost:2222"),
            ("SOLVER_PROVIDER_ID", "Alpha"),
            ("OCR_PROVIDER_ID", "BETA"),
        ]);
        let config = SolveConfig::from_map(&map);
        assert_eq!(config.solver_provider_id, "alpha");
        assert_eq!(config.ocr_provider_id, "beta");
        // The lowercased role ids must hit the (lowercased) provider table.
        assert!(config.providers.contains_key(&config.solver_provider_id));
        assert!(config.providers.contains_key(&config.ocr_provider_id));
    }

    #[tokio::test]
    async fn test_load_reads_first_existing_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let conf_path = temp.path().join("solveconf.txt");
        std::fs::write(&conf_path, "PROVIDER_LOCAL=http://localhost:1234\nLOCAL_DEVICE_SCALE=3\n")
            .expect("write conf");

        let missing = temp.path().join("missing.txt");
        let config = load_solve_config_from(&[
            missing.to_str().expect("utf8 path"),
            conf_path.to_str().expect("utf8 path"),
        ])
        .await;
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.local_device_scale, 3);
    }

    #[tokio::test]
    async fn test_load_falls_back_to_defaults_when_no_file_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("missing.txt");
        let config = load_solve_config_from(&[missing.to_str().expect("utf8 path")]).await;
        assert!(config.providers.is_empty());
        assert_eq!(config.request_timeout_secs, 120);
    }

    #[test]
    fn test_single_provider_becomes_session_default() {
        let map = map_of(&[("PROVIDER_LOCAL", "http://localhost:1234")]);
        let config = SolveConfig::from_map(&map);
        assert_eq!(config.default_provider_id, "local");
    }

    #[test]
    fn test_font_dirs_split_and_trimmed() {
        let map = map_of(&[("CUSTOM_FONT_DIRS", " /usr/share/fonts , ./fonts ,, ")]);
        let config = SolveConfig::from_map(&map);
        assert_eq!(
            config.custom_font_dirs,
            vec![PathBuf::from("/usr/share/fonts"), PathBuf::from("./fonts")]
        );
    }

    #[test]
    fn test_invalid_numbers_keep_defaults() {
        let map = map_of(&[
            ("LOCAL_DEVICE_SCALE", "banana"),
            ("REQUEST_TIMEOUT", "0"),
        ]);
        let config = SolveConfig::from_map(&map);
        assert_eq!(config.local_device_scale, 2);
        assert_eq!(config.request_timeout_secs, 120);
    }

    #[test]
    fn test_key_value_parsing_skips_comments_and_bom() {
        let content = "\u{feff}# comment line\nSOLVER_MODEL=qwen2.5-math\n\nBROKEN LINE\nPREFER_LOCAL_RENDER=true\n";
        let map = parse_key_value_content(content);
        assert_eq!(map.get("SOLVER_MODEL").map(String::as_str), Some("qwen2.5-math"));
        assert_eq!(map.len(), 2);

        let config = SolveConfig::from_map(&map);
        assert_eq!(config.solver_model.as_deref(), Some("qwen2.5-math"));
        assert!(config.prefer_local_render);
    }
}
