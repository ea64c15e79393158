use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use caption_studio::CaptionStudio;
use cli_interface::{
    format_outcome, format_summary, format_variant_table, BatchBar, Cli, Command, DownloadBar,
};
use common::models::BatchSummary;
use config::ConfigManager;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_manager = ConfigManager::load(cli.config.clone()).context("loading configuration")?;
    let mut logging_config = config_manager.config().logging.clone();
    if cli.verbose {
        logging_config.level = "debug".to_string();
    }
    let _logging = logging::init(&logging_config)?;

    let studio = CaptionStudio::new(config_manager)?;

    // Ctrl+C cancels whatever is running
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::List { json } => {
            let variants = studio.list_variants()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&variants)?);
            } else {
                print!("{}", format_variant_table(&variants));
                println!("\nAccelerator: {}", studio.accelerator());
            }
        }

        Command::Download { variant } => {
            let bar = DownloadBar::new(cli.quiet);
            let result = studio
                .download(&variant, &|progress| bar.update(&progress), &cancel)
                .await;

            match result {
                Ok(true) => bar.finish(&format!("{} ready", variant)),
                Ok(false) => {
                    bar.abandon("download failed");
                    bail!("download of {} failed", variant);
                }
                Err(e) => {
                    bar.abandon("download stopped");
                    return Err(e.into());
                }
            }
        }

        Command::Delete { variant } => {
            studio.delete(&variant).await?;
            println!("Deleted {}", variant);
        }

        Command::Caption(args) => {
            let job = args.into_job(studio.default_settings(), studio.default_destination());
            let bar = BatchBar::new(job.images.len(), cli.quiet);

            let outcomes = match studio
                .generate_many(&job, &|event| bar.update(&event), &cancel)
                .await
            {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    bar.abandon("stopped");
                    return Err(e.into());
                }
            };

            let summary = BatchSummary::from_outcomes(&outcomes);
            bar.finish(&summary.to_string());

            if !cli.quiet {
                for outcome in &outcomes {
                    println!("{}", format_outcome(outcome));
                }
            }
            println!("{}", format_summary(&summary));

            if summary.failed > 0 {
                bail!("{} image(s) failed", summary.failed);
            }
        }
    }

    studio.unload().await;
    Ok(())
}
