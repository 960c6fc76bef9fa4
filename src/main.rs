mod config;
mod error;
mod message;
mod ocr;
mod provider;
mod render;
mod solve;
mod solver;

use serenity::{
    async_trait,
    client::{Client, Context, EventHandler},
    framework::standard::{macros::group, StandardFramework},
    model::gateway::Ready,
    prelude::GatewayIntents,
    prelude::TypeMapKey,
};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::sync::Arc;
use tokio::signal;

use crate::config::SolveConfig;
use crate::provider::ProviderRegistry;

// Import the command constant generated by the #[command] macro
use crate::solve::SOLVE_COMMAND;

// TypeMap key for the solve pipeline configuration (read-only after startup)
pub struct SolveConfigKey;
impl TypeMapKey for SolveConfigKey {
    type Value = Arc<SolveConfig>;
}

// TypeMap key for the chat provider registry
pub struct ProviderRegistryKey;
impl TypeMapKey for ProviderRegistryKey {
    type Value = Arc<ProviderRegistry>;
}

// Command group declaration
#[group]
#[commands(solve)]
struct General;

// Event handler implementation
struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _: Context, ready: Ready) {
        println!("✅ Bot connected as {}!", ready.user.name);
    }
}

// Function to read configuration from botconfig.txt with multi-path fallback
fn load_bot_config() -> Result<HashMap<String, String>, String> {
    let config_paths = [
        "botconfig.txt",
        "../botconfig.txt",
        "../../botconfig.txt",
        "src/botconfig.txt",
    ];

    // Clear any existing relevant environment variables
    env::remove_var("DISCORD_TOKEN");
    env::remove_var("PREFIX");

    for config_path in &config_paths {
        match fs::read_to_string(config_path) {
            Ok(content) => {
                // Remove BOM if present
                let content = content.strip_prefix('\u{feff}').unwrap_or(&content);
                let mut config = HashMap::new();

                for line in content.lines() {
                    let line = line.trim();

                    // Skip empty lines and comments
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }

                    // Parse KEY=VALUE format
                    if let Some(equals_pos) = line.find('=') {
                        let key = line[..equals_pos].trim().to_string();
                        let value = line[equals_pos + 1..].trim().to_string();

                        // Set environment variable for compatibility
                        env::set_var(&key, &value);
                        config.insert(key, value);
                    }
                }

                println!("✅ Configuration loaded from {}", config_path);
                return Ok(config);
            }
            Err(_) => {
                // Try next path
                continue;
            }
        }
    }

    Err("No botconfig.txt file found in any expected location (., .., ../.., src/)".to_string())
}

#[tokio::main]
async fn main() {
    // Initialize logger - must be done before any logging calls
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("error"))
        .format_timestamp_secs()
        .init();

    // Load configuration from botconfig.txt file
    match load_bot_config() {
        Ok(_) => {
            println!("✅ Configuration loaded from botconfig.txt");
        }
        Err(error) => {
            log::error!("❌ Failed to load botconfig.txt: {}", error);
            eprintln!("❌ Failed to load botconfig.txt: {}", error);
            eprintln!("Create a botconfig.txt file in the project root with: DISCORD_TOKEN=your_token_here and PREFIX=^");
            return;
        }
    };

    // Get Discord token from configuration
    let token = match env::var("DISCORD_TOKEN") {
        Ok(token) => {
            // Validate token is not placeholder
            if token == "YOUR_BOT_TOKEN_HERE" || token.is_empty() {
                log::error!("❌ DISCORD_TOKEN in botconfig.txt is set to placeholder value");
                eprintln!("❌ DISCORD_TOKEN in botconfig.txt is set to placeholder! Replace with your actual Discord bot token.");
                return;
            }
            token
        }
        Err(_) => {
            log::error!("❌ DISCORD_TOKEN not found in botconfig.txt file");
            eprintln!("❌ DISCORD_TOKEN not found in botconfig.txt file!");
            return;
        }
    };

    // Get command prefix from configuration
    let prefix = env::var("PREFIX").unwrap_or_else(|_| "^".to_string());
    println!("🤖 Starting bot with prefix: '{}'", prefix);

    // Load the solve pipeline configuration and build the provider registry
    let solve_config = Arc::new(config::load_solve_config().await);
    let registry = Arc::new(ProviderRegistry::from_config(&solve_config));
    if registry.is_empty() {
        log::warn!(
            "⚠️ No chat providers configured - the solve command will refuse requests until solveconf.txt defines one"
        );
    } else {
        println!("✅ Provider registry initialized ({} provider(s))", registry.len());
    }

    // Set up command framework
    let framework = StandardFramework::new()
        .configure(|c| {
            c.prefix(&prefix)
                .case_insensitivity(true)
                .no_dm_prefix(true)
                .with_whitespace(true)
        })
        .after(|_ctx, msg, command_name, result| {
            Box::pin(async move {
                if let Err(e) = result {
                    log::error!(
                        "❌ Command '{}' failed for user {} ({}): {:?}",
                        command_name,
                        msg.author.name,
                        msg.author.id,
                        e
                    );
                }
            })
        })
        .group(&GENERAL_GROUP);

    // Configure bot intents
    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    // Create and start client
    let mut client = match Client::builder(token, intents)
        .event_handler(Handler)
        .framework(framework)
        .await
    {
        Ok(client) => client,
        Err(e) => {
            log::error!("❌ Error creating Discord client: {:?}", e);
            eprintln!("❌ Error creating Discord client: {:?}", e);
            eprintln!("Check your token in botconfig.txt file");
            return;
        }
    };

    // Make the pipeline configuration and registry visible to commands
    {
        let mut data = client.data.write().await;
        data.insert::<SolveConfigKey>(Arc::clone(&solve_config));
        data.insert::<ProviderRegistryKey>(Arc::clone(&registry));
    }

    // Set up graceful shutdown on CTRL+C
    println!("🚀 Bot is running... press Ctrl+C to stop");
    tokio::select! {
        _ = signal::ctrl_c() => {
            println!("\n⏹️ Stopping bot gracefully...");
        }
        result = client.start() => {
            if let Err(why) = result {
                log::error!("❌ Client error: {:?}", why);
                eprintln!("❌ Client error: {:?}", why);
            }
        }
    }

    println!("✅ Bot stopped");
}
