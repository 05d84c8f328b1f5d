use clap::Parser;
use kindlewise::cli;
use kindlewise::config::{Cli, Config};
use tracing_subscriber::EnvFilter;

fn init_tracing(cli: &Cli, cfg: &Config) {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.app.log_level))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if cli.json_logs {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let args = Cli::parse();

    let cfg = Config::from_cli(&args).unwrap_or_else(|e| {
        eprintln!("failed to load config file: {:#}", e);
        std::process::exit(1);
    });

    init_tracing(&args, &cfg);
    for name in cfg.unset_env_vars() {
        tracing::warn!(variable = %name, "config references an unset environment variable");
    }
    tracing::debug!(config_dir = ?cfg.base_dir(), "kindlewise starting");

    let code = cli::run(&args, &cfg).await.unwrap_or_else(|e| {
        tracing::error!(error = %format!("{:#}", e), "command failed");
        eprintln!("Error: {:#}", e);
        1
    });

    std::process::exit(code);
}
