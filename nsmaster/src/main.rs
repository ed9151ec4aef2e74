use anyhow::Result;
use clap::Parser;
use nsmaster::cli::{Cli, Commands};
use nsmaster::config::load_config;
use nsmaster::daemon;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config)?;
            println!("[nsmaster] journal at {}", cfg.journal_dir.display());
            daemon::start(cfg).await?;
        }
        Commands::Checkpoint { config } => {
            let seq = daemon::checkpoint(load_config(config)?).await?;
            println!("checkpoint written through sequence {seq}");
        }
        Commands::Check { config, path } => {
            let report = daemon::check(load_config(config)?, path).await?;
            if report.is_consistent() {
                println!("{path} is consistent with UFS");
            } else {
                print!("{}", serde_yaml::to_string(&report)?);
                std::process::exit(1);
            }
        }
        Commands::Ls {
            config,
            path,
            recursive,
        } => {
            let infos = daemon::list(load_config(config)?, path, *recursive).await?;
            for line in daemon::format_listing(&infos) {
                println!("{line}");
            }
        }
    }

    Ok(())
}
