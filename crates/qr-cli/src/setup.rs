use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use crate::config::Config;

const CONFIG_TEMPLATE: &str = r#"# qr configuration
#
# API keys are read from environment variables by default:
#   OPENAI_API_KEY, ANTHROPIC_API_KEY, GOOGLE_API_KEY (or GEMINI_API_KEY),
#   TAVILY_API_KEY
# You can also set them directly in this file (not recommended).
# Any value can be overridden with QR_<SECTION>__<KEY>, e.g. QR_SERVER__BIND.

# Model used by sessions that don't choose one
default_model = "openai"

# ── Models ───────────────────────────────────────────────────────
# Sessions select a model by the section name. Provider type is
# inferred from the name (anthropic/claude, gemini/google/google_genai,
# anything else is OpenAI-compatible) unless `provider` is set.

[models.openai]
model = "gpt-4"
temperature = 0.0
# api_key = "sk-..."

[models.anthropic]
model = "claude-3-opus-20240229"
temperature = 0.0
# api_key = "sk-ant-..."

[models.google_genai]
model = "gemini-pro"
# api_key = "AIza..."

# [models.local]
# provider = "openai"
# base_url = "http://localhost:11434/v1"
# model = "llama3"

# ── Search ───────────────────────────────────────────────────────
[search]
# api_key = "tvly-..."
max_results = 5
search_depth = "advanced"

# ── Fetching ─────────────────────────────────────────────────────
[fetch]
timeout_secs = 10
max_chars = 50000

# ── Agent ────────────────────────────────────────────────────────
[agent]
# Chat re-entries allowed in one user turn before it fails
max_reentries = 10
model_timeout_secs = 120

# ── HTTP server (qr serve) ───────────────────────────────────────
[server]
bind = "127.0.0.1:8000"
allowed_origins = ["http://localhost:3000"]
"#;

pub fn run() -> Result<()> {
    let config_dir = Config::config_dir()?;
    let config_path = config_dir.join("config.toml");

    // Create directory if needed
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;

    if config_path.exists() {
        println!("Existing config file found:");
        println!("  {}", config_path.display());
        print!("\nOverwrite? (The existing file will be backed up) [y/N] ");

        // Flush stdout so the prompt appears before reading
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Setup cancelled.");
            return Ok(());
        }

        backup_file(&config_path)?;
    }

    std::fs::write(&config_path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Created {}", config_path.display());

    println!("\nNext steps:");
    println!("  1. Set your API keys:  export OPENAI_API_KEY=\"sk-...\" TAVILY_API_KEY=\"tvly-...\"");
    println!("  2. Start researching:  qr chat");
    println!("  3. Or run the server:  qr serve");

    Ok(())
}

/// Back up a file to <name>.bak, appending a timestamp if .bak already exists.
fn backup_file(path: &Path) -> Result<()> {
    let mut backup = path.with_extension("toml.bak");

    if backup.exists() {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        backup = path.with_extension(format!("toml.bak.{}", timestamp));
    }

    std::fs::rename(path, &backup)
        .with_context(|| format!("Failed to back up {} to {}", path.display(), backup.display()))?;
    println!("  Backed up to {}", backup.display());

    Ok(())
}
