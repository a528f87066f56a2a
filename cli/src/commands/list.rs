use anyhow::{Result, bail};
use clap::Args;
use debpool_core::PackagePool;
use tracing::info;

use crate::progress::BarProgress;

#[derive(Args)]
pub struct ListCommand {
    #[arg(long, conflicts_with = "pool", help = "Name of the configured storage to list")]
    storage: Option<String>,

    #[arg(long, help = "List every object in the package pool instead")]
    pool: bool,

    #[arg(default_value = "", help = "Prefix to list below")]
    prefix: String,
}

impl ListCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &crate::config::Config) -> Result<()> {
        let files = if self.pool {
            let progress = BarProgress::new("Listing pool", cli.quiet);
            config.open_pool().filepath_list(&progress).await?
        } else {
            let Some(name) = &self.storage else {
                bail!("Either --storage or --pool is required");
            };
            config.open_storage(name).await?.filelist(&self.prefix).await?
        };

        info!(count = files.len(), "Listed files");
        for file in files {
            println!("{}", file);
        }
        Ok(())
    }
}
