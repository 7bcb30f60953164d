#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use stream_resolver::{
    cache::ShowCache,
    models::Stream,
    providers::Vidstreaming,
    query::{self, Params},
    registry::Registry,
    store::JsonDirStore,
    util::{init_http_client, spawn_ct_watcher},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Resolves shows, episodes and playable streams, caching what it finds
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory where resolved shows are persisted
    #[arg(long, env = "STREAM_RESOLVER_STATE_DIR", default_value = "./state")]
    state_dir: PathBuf,

    /// Timeout of a single HTTP request, in seconds
    #[arg(long, env = "STREAM_RESOLVER_TIMEOUT", default_value_t = 10)]
    timeout: u64,

    /// Additional host handled by the Vidstreaming provider (repeatable)
    #[arg(long = "vidstreaming-host", value_name = "HOST")]
    vidstreaming_hosts: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a show by its URL
    Show {
        url: String,

        #[command(flatten)]
        selection: Selection,
    },
    /// Resolve a previously resolved show by its uid
    Get {
        uid: String,

        #[command(flatten)]
        selection: Selection,
    },
    /// Resolve a single embed URL
    Stream { url: String },
}

#[derive(clap::Args, Debug)]
struct Selection {
    /// Episode index
    #[arg(short, long)]
    episode: Option<usize>,

    /// Stream candidate index within the episode
    #[arg(short, long, requires = "episode", conflicts_with = "source")]
    stream: Option<usize>,

    /// Link index within the episode
    #[arg(long, requires = "episode")]
    source: Option<usize>,
}

impl Selection {
    fn params(&self, uid: String) -> Params {
        let mut params = Params::from([("uid".to_string(), uid)]);
        for (name, value) in [
            ("episode", self.episode),
            ("stream", self.stream),
            ("source", self.source),
        ] {
            if let Some(value) = value {
                params.insert(name.to_string(), value.to_string());
            }
        }
        params
    }
}

async fn describe(
    cache: &ShowCache,
    selection: &Selection,
    uid: String,
    ct: &CancellationToken,
) -> stream_resolver::Result<Value> {
    let params = selection.params(uid);
    debug!("Resolving {params:?}");

    if selection.episode.is_none() {
        return query::get_show(cache, &params).await?.to_dict(ct).await;
    }
    if selection.source.is_some() {
        return Ok(Value::String(query::get_source(cache, &params, ct).await?));
    }
    if selection.stream.is_some() {
        return Ok(query::get_stream(cache, &params, ct).await?.to_dict(ct).await);
    }
    query::get_episode(cache, &params, ct).await?.to_dict(ct).await
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let client = init_http_client(Duration::from_secs(args.timeout));
    let ct = CancellationToken::new();

    spawn_ct_watcher(ct.clone());

    let registry = Arc::new(Registry::with_defaults(
        client,
        Vidstreaming::with_hosts(args.vidstreaming_hosts),
    ));
    info!("Persisting state in {:?}", args.state_dir);
    let cache = Arc::new(ShowCache::new(
        registry.clone(),
        Arc::new(JsonDirStore::new(args.state_dir)),
    ));

    let output = match args.command {
        Command::Show { url, selection } => {
            let show = cache
                .show_for_url(&url, &ct)
                .await
                .with_context(|| format!("Unable to resolve show {url}"))?;
            let uid = show.uid(&ct).await?;
            describe(&cache, &selection, uid, &ct).await
        }
        Command::Get { uid, selection } => describe(&cache, &selection, uid, &ct).await,
        Command::Stream { url } => {
            let Some(stream) = Stream::for_url(&registry, &url) else {
                bail!("No provider handles {url}");
            };
            Ok(stream.to_dict(&ct).await)
        }
    };

    // Whatever got resolved is kept, even if the request itself failed
    let saved = cache
        .save_dirty_later()
        .await
        .context("Persistence task failed")?;
    info!("Saved {saved} show(s)");

    let output = output.context("Unable to resolve request")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Unable to format output")?
    );

    Ok(())
}
