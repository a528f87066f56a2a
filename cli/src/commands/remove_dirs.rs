use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::progress::BarProgress;

#[derive(Args)]
pub struct RemoveDirsCommand {
    #[arg(long, help = "Name of the configured storage")]
    storage: String,

    #[arg(help = "Directory to delete, relative to the storage root")]
    path: String,
}

impl RemoveDirsCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &crate::config::Config) -> Result<()> {
        let storage = config.open_storage(&self.storage).await?;
        let progress = BarProgress::new("Deleting", cli.quiet);

        storage.remove_dirs(&self.path, &progress).await?;

        info!(storage = %self.storage, path = %self.path, "Removed directory tree");
        Ok(())
    }
}
