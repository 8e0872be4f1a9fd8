use std::path::PathBuf;
use std::time::Duration;

use ferry_proxy::{ProxyManager, ProxyRule, UpstreamProxy};
use ferry_settings::{ConfigLoader, ContainerProxy, FerryConfig};

use crate::cli::RunArgs;
use crate::error::CliError;

pub async fn run(args: RunArgs, cwd: PathBuf) -> Result<(), CliError> {
    // 1. Load and merge config.
    // --no-config skips global/project config files but --config <extra> still applies.
    let mut config = if args.no_config {
        FerryConfig::default()
    } else {
        ConfigLoader::load(&cwd)
    };
    if let Some(ref extra) = args.extra_config {
        let extra_cfg = FerryConfig::load(extra)?;
        config = config.merge(extra_cfg);
    }

    // 2. Merge CLI-provided containers into config; a --container entry
    // replaces a configured container with the same id.
    for entry in &args.containers {
        let (id, descriptor) = entry.split_once('=').ok_or_else(|| {
            CliError::Other(format!(
                "Invalid --container entry (expected ID=URL): {entry}"
            ))
        })?;
        let rule = ProxyRule::parse(descriptor)?;
        config.containers.insert(
            id.to_string(),
            ContainerProxy {
                kind: rule.scheme.as_str().to_string(),
                host: rule.host.clone(),
                port: rule.port,
                username: rule.credentials.as_ref().map(|c| c.username.clone()),
                password: rule.credentials.as_ref().map(|c| c.password.clone()),
            },
        );
    }

    if config.containers.is_empty() {
        return Err(CliError::Other(
            "No containers configured; add [containers.<id>] to ferry.toml or pass --container"
                .to_string(),
        ));
    }

    // 3. Build the manager with forwarder tunables from config.
    let mut manager = ProxyManager::new();
    if let Some(secs) = config.forwarder.connect_timeout_secs {
        manager = manager.with_connect_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = config.forwarder.pool_idle_timeout_secs {
        manager = manager.with_pool_idle_timeout(Duration::from_secs(secs));
    }

    // 4. Start one forwarder per container and print the URL each container
    // should be pointed at.
    for (id, container) in &config.containers {
        let upstream = UpstreamProxy {
            kind: container.kind.clone(),
            host: container.host.clone(),
            port: container.port,
            username: container.username.clone(),
            password: container.password.clone(),
        };
        let url = manager.create_proxy(id, upstream).await?;
        println!("{id}: {url}");
    }

    println!(
        "{} container(s) configured; press Ctrl-C to stop",
        config.containers.len()
    );

    // 5. Run until interrupted, then stop every forwarder.
    tokio::signal::ctrl_c().await?;
    if let Err(e) = manager.stop_all().await {
        tracing::warn!(error = %e, "Failed to stop all forwarders cleanly");
    }
    Ok(())
}
