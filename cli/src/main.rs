mod backend;
mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "zstudio")]
#[command(author, version, about = "Local text-to-image studio for Z-Image-Turbo", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the web UI and API server
    Serve {
        /// Port to listen on (default from config: 7860)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (default from config: 127.0.0.1)
        #[arg(long)]
        host: Option<String>,

        /// Do not open the browser
        #[arg(long)]
        no_browser: bool,

        /// Run on CPU instead of GPU
        #[arg(long)]
        cpu: bool,
    },

    /// Generate one image from a text prompt
    Generate {
        /// Text prompt for image generation
        prompt: String,

        /// Number of inference steps
        #[arg(short, long)]
        steps: Option<u32>,

        /// Random seed, -1 for a random one
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        seed: i64,

        /// Image width in pixels
        #[arg(long)]
        width: Option<u32>,

        /// Image height in pixels
        #[arg(long)]
        height: Option<u32>,

        /// LoRA adapter file name inside the adapters folder
        #[arg(long)]
        lora: Option<String>,

        /// LoRA strength (0.0 - 2.0)
        #[arg(long, default_value_t = 1.0)]
        lora_weight: f32,

        /// Run on CPU instead of GPU
        #[arg(long)]
        cpu: bool,
    },

    /// List LoRA adapters
    #[command(alias = "loras")]
    Adapters,

    /// Show GPU, system load and directories
    Status,

    /// View or set configuration
    Config {
        /// Config key (e.g., "server.port", "generation.steps")
        key: Option<String>,

        /// Value to set (if omitted, shows current value)
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            host,
            no_browser,
            cpu,
        } => {
            commands::serve::execute(port, host, no_browser, cpu).await?;
        }
        Commands::Generate {
            prompt,
            steps,
            seed,
            width,
            height,
            lora,
            lora_weight,
            cpu,
        } => {
            let args = commands::generate::GenerateArgs {
                prompt,
                steps,
                seed,
                width,
                height,
                lora,
                lora_weight,
                cpu,
            };
            commands::generate::execute(args).await?;
        }
        Commands::Adapters => {
            commands::adapters::execute()?;
        }
        Commands::Status => {
            commands::status::execute()?;
        }
        Commands::Config { key, value } => {
            commands::config::execute(key.as_deref(), value.as_deref())?;
        }
    }

    Ok(())
}
