use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::process::Command;
use std::time::Duration;
use zstudio_core::Config;

use crate::backend::{load_backend, print_gpu_banner};

pub async fn execute(
    port: Option<u16>,
    host: Option<String>,
    no_browser: bool,
    cpu: bool,
) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    if no_browser {
        config.server.open_browser = false;
    }
    if cpu {
        config.model.use_gpu = false;
    }
    config.ensure_dirs()?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;

    println!("Starting zstudio...");
    print_gpu_banner();
    println!("Outputs:  {}", config.paths.output_dir.display());
    println!("Adapters: {}", config.paths.adapters_dir.display());

    let loader_config = config.clone();
    let backend = tokio::task::spawn_blocking(move || load_backend(&loader_config)).await??;

    let url = browser_url(&addr);
    println!("\nListening on {}", url);
    println!("\nAPI endpoints:");
    println!("  GET  /                     - Web UI");
    println!("  POST /api/generate         - Generate an image");
    println!("  GET  /api/adapters         - List LoRA adapters");
    println!("  GET  /api/system/stats     - CPU / RAM / VRAM");
    println!("  POST /api/shutdown         - Stop the server");
    println!("\nPress Ctrl+C to stop.\n");

    if config.server.open_browser {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Err(e) = open_in_browser(&url) {
                tracing::warn!("Could not open browser: {}", e);
            }
        });
    }

    zstudio_daemon::run_server(addr, &config, backend).await?;

    Ok(())
}

fn browser_url(addr: &SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        format!("http://127.0.0.1:{}", addr.port())
    } else {
        format!("http://{}", addr)
    }
}

fn open_in_browser(url: &str) -> std::io::Result<()> {
    let mut command = if cfg!(target_os = "macos") {
        Command::new("open")
    } else if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", "start", ""]);
        c
    } else {
        Command::new("xdg-open")
    };
    command.arg(url).spawn()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_url() {
        let any: SocketAddr = "0.0.0.0:7860".parse().unwrap();
        assert_eq!(browser_url(&any), "http://127.0.0.1:7860");
        let local: SocketAddr = "127.0.0.1:8000".parse().unwrap();
        assert_eq!(browser_url(&local), "http://127.0.0.1:8000");
    }
}
