use anyhow::{Result, bail};
use clap::Args;
use debpool_core::{ChecksumSet, PackagePool};
use std::path::PathBuf;
use tracing::debug;

#[derive(Args)]
pub struct VerifyCommand {
    #[arg(required = true, help = "Package files to look up in the pool")]
    files: Vec<PathBuf>,
}

impl VerifyCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &crate::config::Config) -> Result<()> {
        let pool = config.open_pool();
        let cache = config.open_checksum_cache().await?;

        let mut missing = 0usize;
        for file in &self.files {
            let basename = super::basename(file)?;
            let mut checksums = ChecksumSet::for_file(file).await?;
            let (pool_path, found) = pool
                .verify(None, &basename, &mut checksums, cache.as_ref())
                .await?;
            debug!(file = %file.display(), pool_path, found, "Verified");

            if !found {
                missing += 1;
            }
            if !cli.quiet || !found {
                let status = if found { "ok" } else { "MISSING" };
                println!("{:<8} {}  {}", status, pool_path, file.display());
            }
        }

        cache.flush().await?;
        if missing > 0 {
            bail!("{} of {} files are not in the pool", missing, self.files.len());
        }
        Ok(())
    }
}
