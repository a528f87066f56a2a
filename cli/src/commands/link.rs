use anyhow::{Context, Result, bail};
use clap::Args;
use debpool_backends::LinkRequest;
use debpool_core::paths::{join_key, published_pool_dir};
use debpool_core::{ChecksumSet, PackagePool};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Args)]
pub struct LinkCommand {
    #[arg(long, help = "Name of the configured storage to publish to")]
    storage: String,

    #[arg(long, default_value = "", help = "Published repository prefix")]
    prefix: String,

    #[arg(long, default_value = "main", help = "Archive component")]
    component: String,

    #[arg(long, help = "Source package the files belong to")]
    source: String,

    #[arg(required = true, help = "Package files, already imported into the pool")]
    files: Vec<PathBuf>,

    #[arg(long, help = "Replace published files with different content")]
    force: bool,

    #[arg(long, help = "Keep files in the published directory that were not linked")]
    skip_cleanup: bool,
}

impl LinkCommand {
    pub async fn run(&self, cli: &crate::Cli, config: &crate::config::Config) -> Result<()> {
        let pool = config.open_pool();
        let cache = config.open_checksum_cache().await?;
        let storage = config.open_storage(&self.storage).await?;
        let force = self.force || config.defaults.force;
        let skip_cleanup = self.skip_cleanup || config.defaults.skip_cleanup;

        let rel_path = published_pool_dir(&self.component, &self.source)?;
        let mut linked = BTreeSet::new();

        for file in &self.files {
            let basename = super::basename(file)?;
            let mut checksums = ChecksumSet::for_file(file).await?;
            let (pool_path, found) = pool
                .verify(None, &basename, &mut checksums, cache.as_ref())
                .await?;
            if !found {
                bail!("{} is not in the pool; import it first", file.display());
            }

            storage
                .link_from_pool(LinkRequest {
                    published_prefix: &self.prefix,
                    published_rel_path: &rel_path,
                    file_name: &basename,
                    pool: &pool,
                    pool_path: &pool_path,
                    checksums: &checksums,
                    force,
                })
                .await
                .with_context(|| format!("Publishing {}", basename))?;

            if !cli.quiet {
                println!("{}", join_key(&[self.prefix.as_str(), rel_path.as_str(), &basename]));
            }
            linked.insert(basename);
        }

        cache.flush().await?;

        if !skip_cleanup {
            let dir = join_key(&[self.prefix.as_str(), rel_path.as_str()]);
            let stale: Vec<String> = storage
                .filelist(&dir)
                .await?
                .into_iter()
                .filter(|name| !name.contains('/') && !linked.contains(name))
                .collect();
            for name in &stale {
                let path = join_key(&[dir.as_str(), name.as_str()]);
                warn!(path, "Removing file no longer referenced");
                storage.remove(&path).await?;
            }
        }

        info!(
            storage = %self.storage,
            files = linked.len(),
            directory = %rel_path,
            "Published files"
        );
        Ok(())
    }
}
