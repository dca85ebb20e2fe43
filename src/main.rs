use clap::Parser;

use voicelink::settings::{self, ClientSettings};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket endpoint of the voice server
    #[arg(long)]
    server_url: Option<String>,

    /// Base URL of the session control API
    #[arg(long)]
    control_url: Option<String>,

    /// Samples per outbound capture block (16kHz)
    #[arg(long)]
    block_size: Option<usize>,

    /// Upper bound on queued playback audio in ms (0 = unbounded)
    #[arg(long)]
    max_queued_ms: Option<u64>,

    /// Wait for the `connect` command instead of connecting on startup
    #[arg(long)]
    no_connect: bool,

    /// Settings file (default: <config dir>/voicelink/settings.json)
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Write the effective settings to the settings file and exit
    #[arg(long)]
    save_settings: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn apply(&self, settings: &mut ClientSettings) {
        if let Some(url) = &self.server_url {
            settings.server_url = url.clone();
        }
        if let Some(url) = &self.control_url {
            settings.control_url = url.clone();
        }
        if let Some(size) = self.block_size {
            settings.block_size = size;
        }
        if let Some(ms) = self.max_queued_ms {
            settings.max_queued_ms = ms;
        }
        if self.no_connect {
            settings.auto_connect = false;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    voicelink::init_logging(if args.verbose { "debug" } else { "info" });

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let mut settings = match &args.config {
        Some(path) => settings::load_settings_from(path),
        None => settings::load_settings(),
    };
    settings.apply_env_overrides();
    args.apply(&mut settings);
    settings.sanitize();

    if args.save_settings {
        let saved = match &args.config {
            Some(path) => settings::save_settings_to(path, &settings).map(|_| path.clone()),
            None => settings::save_settings(&settings),
        };
        match saved {
            Ok(path) => println!("Settings written to {}", path.display()),
            Err(e) => {
                eprintln!("Failed to save settings: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = voicelink::run(settings).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
