use anyhow::{Context, Result, anyhow};
use clap::Args;
use debpool_core::{ChecksumSet, PackagePool};
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct ImportCommand {
    #[arg(required = true, help = "Package files to import")]
    files: Vec<PathBuf>,

    #[arg(long = "move", help = "Remove the source files after importing")]
    move_source: bool,
}

impl ImportCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &crate::config::Config) -> Result<()> {
        let pool = config.open_pool();
        let cache = config.open_checksum_cache().await?;

        let mut failed = 0usize;
        for file in &self.files {
            let basename = super::basename(file)?;
            let mut checksums = ChecksumSet::default();
            match pool
                .import(file, &basename, &mut checksums, self.move_source, cache.as_ref())
                .await
                .with_context(|| format!("Importing {}", file.display()))
            {
                Ok(pool_path) => {
                    info!(file = %file.display(), pool_path, "Imported");
                    if !cli.quiet {
                        println!("{}  {}", pool_path, file.display());
                    }
                }
                Err(e) => {
                    eprintln!("{:#}", e);
                    failed += 1;
                }
            }
        }

        cache.flush().await?;
        if failed > 0 {
            return Err(anyhow!("{} of {} files failed to import", failed, self.files.len()));
        }
        Ok(())
    }
}
