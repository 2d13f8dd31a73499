//! Run command - one fetch, reconcile and publish cycle

use anyhow::{Context, Result};
use crossposter_adapters::{
    bluesky::{BlueskyClient, BlueskyPostSource, BlueskyPublisher},
    mastodon::{MastodonClient, MastodonPostSource, MastodonPublisher},
    media::FsMediaStore,
    outbox::{OutboxPublisher, OutboxWriter},
    state::{FsActivityRepo, FsLedgerRepo, FsRateLimitGate},
    twitter::TwitterPublisher,
};
use crossposter_domain::{
    PostSource, Publisher, Service, SystemClock, usecases::RunLoop,
};
use std::path::PathBuf;
use std::sync::Arc;

use crate::args::RunArgs;
use crate::config::{AppConfig, load_secret};

pub async fn execute(args: RunArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::load(config_path.as_deref())?;
    let dry_run = args.dry_run || config.general.dry_run;

    let input = config.input_service()?;
    let outputs = config.output_services()?;
    let loop_config = config.run_loop_config(dry_run)?;

    tracing::info!(
        dry_run = dry_run,
        input = %input,
        outputs = ?outputs,
        "Starting crossposter run"
    );

    if outputs.is_empty() {
        tracing::warn!("No destinations enabled; the run will only refresh the ledger");
    }

    // Clients are built once and shared by the source and publisher of a service
    let mut clients = Clients::default();

    let post_source = build_post_source(&config, input, &mut clients).await?;

    let publishers = if dry_run {
        let writer = OutboxWriter::new(args.outbox.clone())
            .await
            .context("Failed to initialize outbox writer")?;
        tracing::info!(outbox = %writer.path().display(), "[DRY RUN] Writing to outbox");
        outputs
            .iter()
            .map(|&service| {
                Arc::new(OutboxPublisher::new(writer.clone(), service)) as Arc<dyn Publisher>
            })
            .collect()
    } else {
        let mut publishers = Vec::with_capacity(outputs.len());
        for &service in &outputs {
            publishers.push(build_publisher(&config, service, &mut clients)?);
        }
        publishers
    };

    let run_loop = RunLoop::new(
        post_source,
        publishers,
        Arc::new(FsLedgerRepo::new(&config.paths.ledger, &config.paths.backup).read_only(dry_run)),
        Arc::new(FsActivityRepo::new(&config.paths.activity_cache)),
        Arc::new(FsRateLimitGate::new(&config.paths.rate_limit)),
        Arc::new(FsMediaStore::new(&config.paths.media_dir)),
        Arc::new(SystemClock),
        loop_config,
    );

    let summary = run_loop.run_once().await.context("Run failed")?;

    if summary.paused {
        tracing::info!("Paused by rate limit; nothing sent");
    } else {
        tracing::info!(
            fetched = summary.fetched,
            queued = summary.queued,
            sent = summary.sent,
            failed = summary.failed,
            "crossposter run completed"
        );
    }
    Ok(())
}

#[derive(Default)]
struct Clients {
    mastodon: Option<Arc<MastodonClient>>,
    bluesky: Option<Arc<BlueskyClient>>,
}

impl Clients {
    fn mastodon(&mut self, config: &AppConfig) -> Result<Arc<MastodonClient>> {
        if let Some(client) = &self.mastodon {
            return Ok(client.clone());
        }
        let token = load_secret(&config.mastodon.token_env, Service::Mastodon)?;
        let client = Arc::new(MastodonClient::new(
            &config.mastodon.instance,
            &config.mastodon.handle,
            token,
        ));
        self.mastodon = Some(client.clone());
        Ok(client)
    }

    fn bluesky(&mut self, config: &AppConfig) -> Result<Arc<BlueskyClient>> {
        if let Some(client) = &self.bluesky {
            return Ok(client.clone());
        }
        let password = load_secret(&config.bluesky.password_env, Service::Bluesky)?;
        let client = Arc::new(BlueskyClient::new(
            &config.bluesky.pds,
            &config.bluesky.handle,
            password,
        ));
        self.bluesky = Some(client.clone());
        Ok(client)
    }
}

async fn build_post_source(
    config: &AppConfig,
    input: Service,
    clients: &mut Clients,
) -> Result<Arc<dyn PostSource>> {
    match input {
        Service::Mastodon => {
            let source = MastodonPostSource::connect(clients.mastodon(config)?)
                .await
                .context("Failed to look up Mastodon account")?;
            Ok(Arc::new(source))
        }
        Service::Bluesky => Ok(Arc::new(BlueskyPostSource::new(clients.bluesky(config)?))),
        Service::Twitter => anyhow::bail!("Twitter cannot be used as input"),
    }
}

fn build_publisher(
    config: &AppConfig,
    service: Service,
    clients: &mut Clients,
) -> Result<Arc<dyn Publisher>> {
    Ok(match service {
        Service::Mastodon => Arc::new(MastodonPublisher::new(clients.mastodon(config)?)),
        Service::Bluesky => Arc::new(BlueskyPublisher::new(clients.bluesky(config)?)),
        Service::Twitter => {
            let token = load_secret(&config.twitter.token_env, Service::Twitter)?;
            Arc::new(TwitterPublisher::with_base_url(
                token,
                config.twitter.base_url.clone(),
                config.twitter.retweets,
            ))
        }
    })
}
