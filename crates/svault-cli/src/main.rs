//! svault: slicevault command-line interface
//!
//! Commands:
//!   slice <path>           - pack, compress, encrypt and upload a file or folder
//!   resume <id>            - finish an interrupted batch
//!   assemble <id> <out>    - download, verify and restore a batch
//!   verify <id>            - check every chunk against its recorded hash
//!   delete <id>            - tombstone a batch (and optionally its blobs)
//!   list / stats           - query the local metadata index
//!   sync                   - rebuild the index from the card history
//!   backup [<file>]        - upload (and optionally copy) the metadata index
//!   config show / health   - inspect configuration and destinations

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use svault_archive::{Engine, EngineSettings, MetadataIndex, Progress, SliceOptions};
use svault_core::config::{expand_tilde, SvaultConfig};
use svault_core::{format_bytes, BatchFilter, BatchStatus, SvaultError, SyncMode};
use svault_storage::OpendalTransport;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "svault",
    version,
    about = "Encrypted, chunked archives over blob destinations",
    long_about = "svault: slice files into encrypted chunks, spread them across destinations, \
                  and assemble them back"
)]
struct Cli {
    /// Path to svault.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SVAULT_CONFIG",
        default_value = "~/.config/svault/config.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Archive a file or folder as a new batch
    ///
    /// The encryption secret is read from SVAULT_SECRET (or the variable
    /// named by crypto.secret_env), falling back to crypto.secret_file.
    Slice {
        /// Local path (file or directory)
        path: PathBuf,
        #[arg(long)]
        title: Option<String>,
        /// Comma-separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        description: Option<String>,
        /// Pin the batch to one configured destination
        #[arg(long, short = 'd')]
        destination: Option<String>,
    },

    /// Upload the chunks an interrupted batch still owes
    Resume {
        batch_id: String,
    },

    /// Download, verify and restore a batch into a directory
    Assemble {
        batch_id: String,
        /// Output directory (created if missing)
        output: PathBuf,
        /// Drop the downloaded chunks once the restore succeeds
        #[arg(long)]
        evict: bool,
    },

    /// Check every stored chunk of a batch without restoring it
    Verify {
        batch_id: String,
    },

    /// Mark a batch deleted
    Delete {
        batch_id: String,
        /// Also delete chunk and manifest blobs, then forget the batch locally
        #[arg(long)]
        remote: bool,
    },

    /// List batches in the local index
    List {
        #[arg(long)]
        status: Option<BatchStatus>,
        #[arg(long)]
        destination: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },

    /// Show totals per status and destination
    Stats,

    /// Reconcile the local index with the card history
    Sync {
        /// Discard every local row first and rebuild from cards
        #[arg(long)]
        reset: bool,
    },

    /// Upload a snapshot of the metadata index to the backup destination
    Backup {
        /// Also write the snapshot to this local file
        file: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Check that storage and every destination are reachable
    Health,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let (config, from_file) = load_config(&config_path).await?;
    init_logging(&config.log.level, &config.log.format);
    if !from_file {
        warn!(
            "config file not found at {}, using defaults",
            config_path.display()
        );
    }

    match cli.command {
        Commands::Slice {
            path,
            title,
            tags,
            description,
            destination,
        } => {
            let options = SliceOptions {
                title,
                tags,
                description,
                destination,
                cancel: None,
            };
            cmd_slice(&config, &path, options).await
        }
        Commands::Resume { batch_id } => cmd_resume(&config, &batch_id).await,
        Commands::Assemble {
            batch_id,
            output,
            evict,
        } => cmd_assemble(&config, &batch_id, &output, evict).await,
        Commands::Verify { batch_id } => cmd_verify(&config, &batch_id).await,
        Commands::Delete { batch_id, remote } => cmd_delete(&config, &batch_id, remote).await,
        Commands::List {
            status,
            destination,
            tag,
        } => cmd_list(
            &config,
            &BatchFilter {
                status,
                destination,
                tag,
            },
        ),
        Commands::Stats => cmd_stats(&config),
        Commands::Sync { reset } => cmd_sync(&config, reset).await,
        Commands::Backup { file } => cmd_backup(&config, file.as_deref()).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, from_file),
        Commands::Health => cmd_health(&config).await,
    }
}

// ── Config, logging, engine ───────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<(SvaultConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((SvaultConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env("SVAULT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Whether the command needs the encryption secret.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Secret {
    Required,
    NotNeeded,
}

fn open_engine(config: &SvaultConfig, secret: Secret) -> Result<Engine> {
    let settings = EngineSettings::from_config(config).context("invalid configuration")?;
    let secret = match secret {
        Secret::Required => config
            .crypto
            .load_secret()
            .context("loading encryption secret")?,
        // Commands that never derive keys still build a full engine.
        Secret::NotNeeded => config
            .crypto
            .load_secret()
            .unwrap_or_else(|_| SecretString::from(String::new())),
    };

    let index_path = expand_tilde(&config.index.path);
    let index = MetadataIndex::open(&index_path)
        .with_context(|| format!("opening metadata index: {}", index_path.display()))?;

    let op = svault_storage::build_operator(&config.storage).context("building storage operator")?;
    let transport = Arc::new(OpendalTransport::new(op));

    Ok(Engine::new(
        settings,
        secret,
        Arc::new(index),
        transport.clone(),
        transport,
    ))
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted, finishing in-flight chunks (resume later to continue)");
            token.cancel();
        }
    });
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Engine progress events drive `pb`.
fn attach_progress(engine: Engine, pb: &ProgressBar) -> Engine {
    let pb = pb.clone();
    engine.with_progress(Arc::new(move |event: &Progress| match event {
        Progress::Scanned {
            files,
            bytes,
            estimated_chunks,
            ..
        } => {
            pb.set_length(*estimated_chunks);
            pb.set_message(format!("{files} files, {}", format_bytes(*bytes)));
        }
        Progress::ChunkUploaded { uploaded, .. } => pb.set_position(*uploaded),
        Progress::ChunkFailed { index, error, .. } => {
            pb.println(format!("  chunk {index} failed: {error}"));
        }
        Progress::ChunkFetched { fetched, total, .. } => {
            pb.set_length(*total);
            pb.set_position(*fetched);
        }
        Progress::Unpacked { files, .. } => pb.set_message(format!("{files} files restored")),
    }))
}

/// Print guidance for errors the user can act on, then pass the error on.
fn explain(err: SvaultError) -> anyhow::Error {
    match &err {
        SvaultError::PartialUpload {
            batch_id, failed, ..
        } => {
            eprintln!(
                "{} chunk(s) failed; run `svault resume {batch_id}` to retry them",
                failed.len()
            );
        }
        SvaultError::Cancelled { batch_id, .. } => {
            eprintln!("run `svault resume {batch_id}` to continue");
        }
        SvaultError::KeyMismatch { .. } => {
            eprintln!("the configured secret is not the one this batch was sliced with");
        }
        _ => {}
    }
    anyhow::Error::new(err)
}

// ── `svault slice` / `svault resume` ──────────────────────────────────────────

async fn cmd_slice(config: &SvaultConfig, path: &Path, mut options: SliceOptions) -> Result<()> {
    let engine = open_engine(config, Secret::Required)?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    options.cancel = Some(cancel);

    println!("Slicing {}", path.display());
    let pb = make_progress_bar(0, "slice");
    let engine = attach_progress(engine, &pb);
    let result = engine.slice(path, options).await;
    pb.finish_and_clear();

    let batch_id = result.map_err(explain)?;
    let batch = engine.index().get_batch(&batch_id)?;
    println!();
    println!("Batch {batch_id} complete:");
    println!("  files:       {}", batch.file_count);
    println!("  size:        {}", format_bytes(batch.total_size));
    println!("  stored:      {}", format_bytes(batch.stored_size));
    println!("  chunks:      {}", batch.chunk_count);
    println!("  destination: {}", batch.destination);
    Ok(())
}

async fn cmd_resume(config: &SvaultConfig, batch_id: &str) -> Result<()> {
    let engine = open_engine(config, Secret::Required)?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let pb = make_progress_bar(0, "resume");
    if let Ok(batch) = engine.index().get_batch(batch_id) {
        pb.set_length(batch.chunk_count);
    }
    let engine = attach_progress(engine, &pb);
    let result = engine.resume_with(batch_id, cancel).await;
    pb.finish_and_clear();
    result.map_err(explain)?;

    let batch = engine.index().get_batch(batch_id)?;
    println!("Batch {batch_id} complete ({} chunks)", batch.chunk_count);
    Ok(())
}

// ── `svault assemble` / `svault verify` ───────────────────────────────────────

async fn cmd_assemble(
    config: &SvaultConfig,
    batch_id: &str,
    output: &Path,
    evict: bool,
) -> Result<()> {
    let engine = open_engine(config, Secret::Required)?;
    let pb = make_progress_bar(0, "assemble");
    let engine = attach_progress(engine, &pb);
    let result = engine.assemble(batch_id, output).await;
    pb.finish_and_clear();
    let report = result.map_err(explain)?;

    println!("Assembled {}:", report.batch_id);
    println!("  output:     {}", report.output.display());
    println!("  files:      {}", report.files);
    println!("  size:       {}", format_bytes(report.bytes));
    println!("  downloaded: {} chunks", report.downloaded);
    println!("  cached:     {} chunks", report.cached);
    if evict && engine.evict_cache(batch_id).await? {
        println!("  chunk cache dropped");
    }
    Ok(())
}

async fn cmd_verify(config: &SvaultConfig, batch_id: &str) -> Result<()> {
    let engine = open_engine(config, Secret::NotNeeded)?;
    let report = engine.verify(batch_id).await.map_err(explain)?;

    if report.is_ok() {
        println!(
            "Batch {}: all {} chunks intact",
            report.batch_id, report.chunks_checked
        );
        return Ok(());
    }
    println!(
        "Batch {}: {} of {} chunks bad",
        report.batch_id,
        report.mismatches.len(),
        report.chunks_checked
    );
    for m in &report.mismatches {
        println!("  chunk {:>6}: expected {} got {}", m.index, m.expected, m.actual);
    }
    anyhow::bail!("verification failed for {}", report.batch_id)
}

// ── `svault delete` ───────────────────────────────────────────────────────────

async fn cmd_delete(config: &SvaultConfig, batch_id: &str, remote: bool) -> Result<()> {
    let engine = open_engine(config, Secret::NotNeeded)?;
    engine.delete(batch_id, remote).await?;
    if remote {
        println!("Deleted {batch_id} and its remote blobs");
    } else {
        println!("Marked {batch_id} deleted (blobs kept; use --remote to remove them)");
    }
    Ok(())
}

// ── `svault list` / `svault stats` ────────────────────────────────────────────

fn cmd_list(config: &SvaultConfig, filter: &BatchFilter) -> Result<()> {
    let engine = open_engine(config, Secret::NotNeeded)?;
    let batches = engine.list_batches(filter);
    if batches.is_empty() {
        println!("No batches");
        return Ok(());
    }

    println!(
        "{:<28} {:<10} {:>10} {:>7}  {:<16} NAME",
        "BATCH", "STATUS", "SIZE", "CHUNKS", "DESTINATION"
    );
    for b in &batches {
        let name = b.title.as_deref().unwrap_or(&b.original_name);
        println!(
            "{:<28} {:<10} {:>10} {:>7}  {:<16} {}",
            b.batch_id,
            b.status.as_str(),
            format_bytes(b.total_size),
            b.chunk_count,
            b.destination,
            name
        );
    }
    Ok(())
}

fn cmd_stats(config: &SvaultConfig) -> Result<()> {
    let engine = open_engine(config, Secret::NotNeeded)?;
    let stats = engine.stats();

    println!("Batches: {}", stats.batch_count);
    println!("  files:   {}", stats.file_count);
    println!("  chunks:  {}", stats.chunk_count);
    println!("  size:    {}", format_bytes(stats.total_size));
    println!("  stored:  {}", format_bytes(stats.stored_size));
    if !stats.by_status.is_empty() {
        println!();
        println!("By status:");
        for (status, count) in &stats.by_status {
            println!("  {status:<10} {count}");
        }
    }
    if !stats.by_destination.is_empty() {
        println!();
        println!("By destination:");
        for (dest, totals) in &stats.by_destination {
            println!(
                "  {dest:<16} {} batches, {}",
                totals.batches,
                format_bytes(totals.stored_size)
            );
        }
    }
    Ok(())
}

// ── `svault sync` / `svault backup` ───────────────────────────────────────────

async fn cmd_sync(config: &SvaultConfig, reset: bool) -> Result<()> {
    let engine = open_engine(config, Secret::NotNeeded)?;
    let mode = if reset {
        SyncMode::Reset
    } else {
        SyncMode::Augment
    };
    let report = engine.sync(mode).await?;

    println!("Sync ({}) complete:", if reset { "reset" } else { "augment" });
    println!("  inserted:        {}", report.inserted);
    println!("  already present: {}", report.already_present);
    println!("  incomplete:      {}", report.incomplete);
    println!("  deleted:         {}", report.tombstoned);
    println!("  skipped:         {}", report.skipped);
    Ok(())
}

async fn cmd_backup(config: &SvaultConfig, file: Option<&Path>) -> Result<()> {
    let engine = open_engine(config, Secret::NotNeeded)?;
    if let Some(file) = file {
        engine
            .index()
            .backup_to(file)
            .with_context(|| format!("writing backup: {}", file.display()))?;
        println!("Index copied to {}", file.display());
    }
    let locator = engine.backup_index().await?;
    println!("Index uploaded: {locator}");
    Ok(())
}

// ── `svault config show` / `svault health` ────────────────────────────────────

fn cmd_config_show(config: &SvaultConfig, config_path: &Path, from_file: bool) -> Result<()> {
    if from_file {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    if let Err(e) = config.validate() {
        println!();
        println!("# WARNING: {e}");
    }
    Ok(())
}

async fn cmd_health(config: &SvaultConfig) -> Result<()> {
    config.validate().context("invalid configuration")?;
    let op = svault_storage::build_operator(&config.storage).context("building storage operator")?;
    svault_storage::check_health(&op).await?;
    println!("storage: ok ({})", config.storage.backend);

    let transport = OpendalTransport::new(op);
    let mut names = config.distribution.destinations.clone();
    names.push(config.distribution.index_destination.clone());
    let report = svault_storage::check_destinations(&transport, &names).await;

    let mut unreachable = 0;
    for d in &report {
        match &d.error {
            None => println!("  {:<16} ok ({} blobs)", d.destination, d.blobs),
            Some(e) => {
                unreachable += 1;
                println!("  {:<16} unreachable: {e}", d.destination);
            }
        }
    }
    if unreachable > 0 {
        anyhow::bail!("{unreachable} destination(s) unreachable");
    }
    Ok(())
}
