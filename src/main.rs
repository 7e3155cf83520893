use std::env;

use storefront_server::ServeExit;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" {
        eprintln!("Usage: storefront serve --config <path> [--log-json]");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    let mut log_json = false;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(v) = args.next() {
                    config_path = v;
                }
            }
            "--log-json" => log_json = true,
            _ => {}
        }
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    loop {
        let cfg = match storefront_config::load_and_validate(&config_path) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("failed to load config: {e}");
                std::process::exit(1);
            }
        };

        match storefront_server::serve(cfg).await {
            Ok(ServeExit::Restart) => {
                tracing::info!(config = %config_path, "reloading after restart request");
            }
            Ok(ServeExit::Shutdown) => break,
            Err(e) => {
                eprintln!("server exited with error: {e}");
                std::process::exit(1);
            }
        }
    }
}
