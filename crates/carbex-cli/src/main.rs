//! 🚀 carbex-cli — the front door, the bouncer, the maitre d' of carbex.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that parses args, sets up
//! logging, loads config, and then lets the real code do the heavy lifting.
//! Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "carbex.toml";

/// 📡 Carbon plaintext lines in, Elasticsearch documents out.
#[derive(Debug, Parser)]
#[command(name = "carbex", version, about)]
struct Args {
    /// Path to a TOML config file. Defaults to ./carbex.toml when it exists;
    /// otherwise configuration comes from CARBEX_* environment variables alone.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

/// 🚀 main() — where it all begins. The genesis. The big bang.
///
/// 🔧 Steps:
/// 1. Init tracing (so we can see what goes wrong, and when)
/// 2. Parse args
/// 3. Load config (the moment of truth)
/// 4. Run the thing (send it and pray 🙏)
/// 5. Handle errors (cry, then exit 1)
#[tokio::main]
async fn main() {
    // 📡 Set up tracing — because println! debugging is a lifestyle choice
    // we're trying to move past, like flip phones and cargo shorts
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Err(err) = load_and_run(args).await {
        report(&err);
        // 🗑️ Exit with prejudice. Process exitus maximus.
        std::process::exit(1);
    }
    // ✅ If we got here, everything worked. Pop the champagne. 🍾
}

async fn load_and_run(args: Args) -> Result<()> {
    let config_file = match args.config {
        Some(path) => {
            // 🔒 An explicitly named file that isn't there is a typo, not a default
            let exists = path.try_exists().with_context(|| {
                format!("💀 Couldn't check whether '{}' exists", path.display())
            })?;
            anyhow::ensure!(
                exists,
                "💀 Configuration file '{}' does not exist. If it's a relative path, \
                 check your cwd, or use an absolute path to be absolutely certain.",
                path.display()
            );
            Some(path)
        }
        // 🔧 default: the ol' reliable, but only if it's actually there
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.try_exists().unwrap_or(false).then_some(default)
        }
    };

    // 🔧 Load the config — this is the moment where we find out if the TOML is valid
    // or if someone put a tab where a space should be (looking at you, Kevin)
    let app_config = carbex::app_config::load_config(config_file.as_deref()).context(
        "💀 We couldn't load the configuration. Take a look at the file and the CARBEX_* \
         environment variables, and make sure you didn't forget something obvious.",
    )?;

    // 🚀 SEND IT. No take-backs. This is not a drill.
    carbex::run(app_config).await
}

/// 💀 Print the error and its causes in a way that's helpful at 3am.
fn report(err: &anyhow::Error) {
    error!("💀 error: {}", err);
    // -- 🧅 peel the onion of sadness, one tear-jerking layer at a time
    let mut the_vibes_are_giving_connection_issues = false;
    for cause in err.chain().skip(1) {
        error!("⚠️  cause: {}", cause);
        if looks_like_connection_trouble(&cause.to_string()) {
            the_vibes_are_giving_connection_issues = true;
        }
    }

    // -- 📡 if it smells like a connection problem, it's probably a connection problem
    if the_vibes_are_giving_connection_issues {
        error!(
            "🔧 hint: looks like Elasticsearch isn't reachable. Double-check that it's \
             actually running and that host/port/scheme in sink_config match. If you're \
             using Docker, try `docker ps` to see what's up, or `docker compose up -d` \
             to resurrect it. Even servers need a nudge sometimes. ☕"
        );
    }
}

// -- 🕵️ sniff the cause like a truffle pig hunting for connection problems
fn looks_like_connection_trouble(cause: &str) -> bool {
    [
        "error sending request",
        "connection refused",
        "Connection refused",
        "tcp connect error",
        "dns error",
        "Could not reach Elasticsearch",
    ]
    .iter()
    .any(|needle| cause.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_the_truffle_pig_smells_a_refused_connection() {
        assert!(looks_like_connection_trouble(
            "error sending request for url (http://localhost:9200/)"
        ));
        assert!(looks_like_connection_trouble("tcp connect error: Connection refused (os error 111)"));
        assert!(!looks_like_connection_trouble("invalid type: string, expected u16"));
    }

    #[test]
    fn the_one_where_the_config_flag_is_optional() {
        let args = Args::try_parse_from(["carbex"]).expect("💀 bare invocation must parse");
        assert!(args.config.is_none());

        let args = Args::try_parse_from(["carbex", "--config", "/etc/carbex.toml"])
            .expect("💀 --config must parse");
        assert_eq!(args.config, Some(PathBuf::from("/etc/carbex.toml")));
    }
}
