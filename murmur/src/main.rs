//! Command line client for murmur.
//!
//! This handles only the CLI and config file loading, the engine lives in [`murmur::Engine`].

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use futures_lite::StreamExt;
use murmur::{
    Config, Engine, EventTemplate, Filter, Kind, PublicKey, RelayUrl, SecretKey,
    reconcile::Reconcile, signer::LocalSigner,
};
use tracing::debug;
use tracing_subscriber::{EnvFilter, prelude::*};

/// A client for open relay networks.
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[clap(long, short)]
    config: Option<PathBuf>,
    /// Relay to use, may be repeated.
    ///
    /// Overrides the relays from the configuration file.
    #[clap(long = "relay", short)]
    relays: Vec<RelayUrl>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Fetches and prints the profile of an author.
    Profile {
        /// Hex encoded public key of the author.
        pubkey: PublicKey,
    },
    /// Publishes a text note and prints the outcome per relay.
    Post {
        /// The text of the note.
        text: String,
    },
    /// Prints a freshly generated secret key.
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    if !cli.relays.is_empty() {
        config.relays = cli.relays.clone();
    }
    debug!(relays = ?config.relays, "loaded config");

    match cli.command {
        Command::Keygen => {
            let key = SecretKey::generate(&mut rand::rngs::OsRng);
            println!("secret key: {}", data_encoding::HEXLOWER.encode(&key.to_bytes()));
            println!("public key: {}", key.public());
            Ok(())
        }
        Command::Profile { pubkey } => profile(&config, pubkey).await,
        Command::Post { text } => post(&config, text).await,
    }
}

fn engine(config: &Config) -> Result<Engine> {
    if config.relays.is_empty() {
        bail!("no relays configured, pass --relay or set relays in the config file");
    }
    let mut builder = Engine::builder().options(config.engine_options());
    if let Some(key) = &config.secret_key {
        builder = builder.signer(LocalSigner::new(key.clone()));
    }
    builder.build().context("failed to start engine")
}

async fn profile(config: &Config, pubkey: PublicKey) -> Result<()> {
    let engine = engine(config)?;
    let filter = Filter::new()
        .author(pubkey)
        .kinds([Kind::METADATA, Kind::CONTACTS]);
    let loaded = engine.load(vec![filter]).await;

    // Give the pipeline the ticks it needs to dispatch everything loaded.
    let options = &engine.options().worker;
    let ticks = loaded.len() / options.batch_size.max(1) + 2;
    tokio::time::sleep(options.delay * ticks as u32).await;

    let projections = engine
        .projections()
        .context("engine runs without projections")?;
    match projections.profiles.get(&pubkey) {
        Some(profile) => {
            println!("name:    {}", profile.display().unwrap_or("-"));
            if let Some(about) = profile.about.get() {
                println!("about:   {about}");
            }
            if let Some(nip05) = profile.nip05.get() {
                println!("nip05:   {nip05}");
            }
            println!("updated: {}", profile.updated_at());
        }
        None => println!("no profile found for {pubkey}"),
    }
    let follows = projections
        .graph
        .follows()
        .get(&pubkey)
        .map(|list| list.len())
        .unwrap_or(0);
    println!("follows: {follows}");
    engine.shutdown();
    Ok(())
}

async fn post(config: &Config, text: String) -> Result<()> {
    if config.secret_key.is_none() {
        bail!("posting requires a secret_key in the config file");
    }
    let engine = engine(config)?;
    let (event, mut progress) = engine
        .publish(EventTemplate::new(Kind::TEXT_NOTE, text))
        .await?;
    println!("published {}", event.id);
    while let Some((relay, outcome)) = progress.next().await {
        println!("  {relay}: {outcome:?}");
    }
    engine.shutdown();
    Ok(())
}
