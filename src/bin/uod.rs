use anyhow::{Context, Result};
use uod::config::ServerConfig;
use uod::core::{shutdown_signal, Server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/uod.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: uod [--conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    eprintln!("Error: --conf requires a FILE argument");
                    return Ok(());
                }
            }
            _ => {}
        }
        i += 1;
    }

    let config = ServerConfig::from_file(&conf_file)
        .with_context(|| format!("Cannot load config: {}", conf_file))?;

    let server = Server::bind(config).await?;
    tracing::info!(
        "[server] [started] login={} game={}",
        server.login_addr(),
        server.game_addr()
    );

    server
        .serve(async {
            let signal = shutdown_signal().await;
            tracing::info!("[server] [signal] {:?}, shutting down", signal);
        })
        .await?;

    tracing::info!("[server] [stopped]");
    Ok(())
}
