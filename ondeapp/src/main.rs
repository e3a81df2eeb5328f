//! ondeplay : le démon de lecture.
//!
//! Assemble le pipeline permanent (encodeur → mux éventuel → sink), le
//! player qui le nourrit piste après piste, et le plan de contrôle sur
//! socket Unix. Un seul argument optionnel : le chemin du fichier de
//! configuration.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ondecatalog::{Catalog, CatalogMedia};
use ondecontrol::ControlServer;
use ondeplayer::{Media, MediaOptions, Player};
use ondestream::{Output, Volume};
use ondeutils::media_url::MediaUrl;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    tracing::info!(
        "ondeplay: sink {} encoder {} catalog {}",
        config.sink,
        config.encoder,
        config.catalog.display()
    );

    if let Some(parent) = config.catalog.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let catalog = Catalog::open(&config.catalog).context("opening catalog")?;
    let mut cursor = CatalogMedia::new(catalog.clone());
    cursor.set_options(MediaOptions {
        loop_enabled: config.loop_enabled,
        random: config.random,
    });

    let volume = Volume::new(config.volume);

    // Chaîne de sortie permanente : encodeur → (mux) → sink.
    let sink_url = MediaUrl::parse(&config.sink).context("parsing sink URL")?;
    let mut output = Output::build(&sink_url, &config.encoder, volume.clone())
        .await
        .context("building output chain")?;
    let mut encoder = ondecodec::build_encoder(&config.encoder, config.latency_ms)
        .context("building encoder")?;
    encoder.run(output.input()).await.context("starting encoder")?;
    output.run().await.context("starting sink")?;

    let mut player = Player::new(Box::new(cursor));
    if config.stats {
        player = player.with_stats_filter();
    }
    player.subscribe_output(encoder.input_jitter().await);
    let handle = player.handle();

    let stop = CancellationToken::new();
    let control = ControlServer::new(&config.control_socket, handle.clone(), catalog, volume);
    let control_stop = stop.clone();
    let control_task = tokio::spawn(async move { control.run(control_stop).await });

    let mut player_task = tokio::spawn(async move { player.run().await });
    tokio::select! {
        result = &mut player_task => {
            result.context("joining player")?.context("player loop")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ondeplay: interrupted, shutting down");
            handle.terminate();
            let _ = (&mut player_task).await;
        }
    }

    stop.cancel();
    let _ = control_task.await;
    encoder.shutdown().await;
    output.shutdown().await;
    Ok(())
}
