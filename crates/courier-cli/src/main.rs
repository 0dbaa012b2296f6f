//! courier: end-to-end encrypted file transfer CLI
//!
//! Identity commands:
//!   keygen --id <id>               - generate and store an RSA key pair
//!   keys list | import | export    - manage published public keys
//!
//! Transfer commands:
//!   send <file> --from <id> --to <id>     - encrypt for a recipient and upload to the relay
//!   inbox --id <id>                       - list transfers waiting for an identity
//!   receive <filename> --id <id>          - download, verify, and decrypt a transfer
//!   delete <filename> --id <id>           - remove a transfer from the relay
//!
//! Relay commands:
//!   status                         - show relay status
//!   config show                    - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, warn};

use courier_chunks::ChunkSize;
use courier_core::config::{CourierConfig, RelayConfig};
use courier_core::proto::{
    relay_client::RelayClient, DeleteRequest, FetchRequest, ListRequest, StatusRequest,
    StoreRequest,
};
use courier_core::{validate_filename, TransferRecord, TransferSummary, WireRecord};
use courier_crypto::{
    decode_transfer_with_progress, FsKeyDirectory, KeyPair, PrivateKeySource, ProgressFn,
    PublicKeyDirectory, TransferEncoder,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "courier",
    version,
    about = "End-to-end encrypted file transfer",
    long_about = "courier: send files through an untrusted relay, readable only by their recipient"
)]
struct Cli {
    /// Path to courier.toml configuration file
    #[arg(long, short = 'c', env = "COURIER_CONFIG", default_value = "~/.config/courier/courier.toml")]
    config: PathBuf,

    /// Relay URL (overrides relay.endpoint)
    #[arg(long, env = "COURIER_RELAY")]
    relay: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate an RSA key pair for an identity
    Keygen {
        #[arg(long)]
        id: String,
        /// Modulus size in bits
        #[arg(long, default_value_t = 2048)]
        bits: usize,
    },

    /// Public key directory management
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Encrypt a file for a recipient and upload it to the relay
    Send {
        /// File to send
        file: PathBuf,
        /// Sender identity
        #[arg(long)]
        from: String,
        /// Recipient identity (their public key must be in the key directory)
        #[arg(long)]
        to: String,
        /// Name the recipient sees (default: the file's own name)
        #[arg(long)]
        name: Option<String>,
        /// Plaintext bytes per chunk (overrides transfer.chunk_size)
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// List transfers waiting for an identity
    Inbox {
        #[arg(long)]
        id: String,
    },

    /// Download, verify, and decrypt a transfer
    ///
    /// Nothing is written unless every chunk verifies and decrypts.
    Receive {
        /// Filename as shown by `courier inbox`
        filename: String,
        /// Recipient identity (whose private key decrypts the transfer)
        #[arg(long)]
        id: String,
        /// Output path (default: ./<filename>)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        /// Remove the transfer from the relay after a successful receive
        #[arg(long)]
        delete: bool,
    },

    /// Remove a transfer from the relay without downloading it
    Delete {
        filename: String,
        #[arg(long)]
        id: String,
    },

    /// Show relay status
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeysAction {
    /// List identities with a published public key
    List,
    /// Publish someone's public key (SPKI or PKCS#1 PEM) under an identity
    Import { id: String, file: PathBuf },
    /// Print an identity's public key as PEM
    Export { id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let mut config = load_config(&config_path).await?;
    if let Some(relay) = cli.relay {
        config.relay.endpoint = relay;
    }

    init_logging(&config.logging.level, &config.logging.format);
    init_workers(config.transfer.workers);

    match cli.command {
        Commands::Keygen { id, bits } => cmd_keygen(&config, &id, bits).await,
        Commands::Keys { action: KeysAction::List } => cmd_keys_list(&config),
        Commands::Keys { action: KeysAction::Import { id, file } } => {
            cmd_keys_import(&config, &id, &file)
        }
        Commands::Keys { action: KeysAction::Export { id } } => cmd_keys_export(&config, &id),
        Commands::Send { file, from, to, name, chunk_size } => {
            cmd_send(&config, &file, &from, &to, name.as_deref(), chunk_size).await
        }
        Commands::Inbox { id } => cmd_inbox(&config, &id).await,
        Commands::Receive { filename, id, out, delete } => {
            cmd_receive(&config, &filename, &id, out.as_deref(), delete).await
        }
        Commands::Delete { filename, id } => cmd_delete(&config, &filename, &id).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<CourierConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        CourierConfig::from_toml(&content)
            .with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(CourierConfig::default())
    }
}

/// Diagnostics go to stderr so stdout stays clean for command output.
fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Size the global rayon pool used for chunk encryption (0 = one per core).
fn init_workers(workers: usize) {
    if workers == 0 {
        return;
    }
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("courier-chunk-{i}"))
        .build_global()
    {
        warn!("worker pool already initialised: {e}");
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(format!("{home}/{rest}"))
    } else {
        path.to_path_buf()
    }
}

fn key_directory(config: &CourierConfig) -> FsKeyDirectory {
    FsKeyDirectory::new(expand_tilde(&config.keys.dir))
        .with_min_rsa_bits(config.transfer.min_rsa_bits)
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

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Chunk-level progress callback driving `pb` from rayon workers.
fn chunk_progress(pb: &ProgressBar) -> Box<ProgressFn> {
    let pb = pb.clone();
    Box::new(move |done, total| {
        pb.set_length(total);
        pb.set_position(done);
    })
}

// ── `courier keygen` / `courier keys` ─────────────────────────────────────────

async fn cmd_keygen(config: &CourierConfig, id: &str, bits: usize) -> Result<()> {
    let directory = key_directory(config);
    // Fail on an existing key before spending seconds on generation
    let private_path = directory.private_key_path(id)?;
    if private_path.exists() {
        anyhow::bail!(
            "a private key for '{id}' already exists: {}",
            private_path.display()
        );
    }

    let pb = make_spinner("keygen");
    pb.set_message(format!("generating {bits}-bit RSA key for {id}..."));
    let pair = tokio::task::spawn_blocking(move || KeyPair::generate(bits))
        .await
        .context("key generation task failed")??;
    pb.finish_with_message("done".to_string());

    directory.save_key_pair(id, &pair)?;
    println!("Key pair for '{id}':");
    println!("  private:     {}", private_path.display());
    println!("  public:      {}", directory.public_key_path(id)?.display());
    println!("  fingerprint: {}", pair.public_key().fingerprint()?);
    println!();
    println!("Share the public key with senders: courier keys export {id}");
    Ok(())
}

fn cmd_keys_list(config: &CourierConfig) -> Result<()> {
    let directory = key_directory(config);
    let ids = directory.identities()?;
    if ids.is_empty() {
        println!("No public keys in {}", directory.dir().display());
        return Ok(());
    }
    println!("{:<24} {:<6} FINGERPRINT", "IDENTITY", "BITS");
    for id in ids {
        match directory.public_key(&id) {
            Ok(key) => println!("{:<24} {:<6} {}", id, key.bits(), key.fingerprint()?),
            Err(e) => println!("{id:<24} {:<6} ({e})", "-"),
        }
    }
    Ok(())
}

fn cmd_keys_import(config: &CourierConfig, id: &str, file: &Path) -> Result<()> {
    let pem = std::fs::read_to_string(file)
        .with_context(|| format!("reading public key: {}", file.display()))?;
    let key = key_directory(config).import_public_key(id, &pem)?;
    println!("Imported {}-bit key for '{id}' ({})", key.bits(), key.fingerprint()?);
    Ok(())
}

fn cmd_keys_export(config: &CourierConfig, id: &str) -> Result<()> {
    let key = key_directory(config).public_key(id)?;
    print!("{}", key.to_pem()?);
    Ok(())
}

// ── `courier send` ────────────────────────────────────────────────────────────

async fn cmd_send(
    config: &CourierConfig,
    file: &Path,
    from: &str,
    to: &str,
    name: Option<&str>,
    chunk_size: Option<usize>,
) -> Result<()> {
    let filename = match name {
        Some(name) => name.to_string(),
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("no file name in {}", file.display()))?,
    };
    validate_filename(&filename)?;

    let mut encoder = TransferEncoder::from_config(&config.transfer)?;
    if let Some(bytes) = chunk_size {
        encoder = encoder.with_chunk_size(ChunkSize::new(bytes)?);
    }

    // Resolve the recipient before reading or encrypting anything
    let recipient_key = key_directory(config).public_key(to)?;

    let plaintext = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let plaintext_len = plaintext.len() as u64;

    println!(
        "Sending {} → {to} as '{filename}' (relay: {})",
        file.display(),
        config.relay.endpoint
    );

    let pb = make_progress_bar(0, "encrypt");
    pb.set_message(filename.clone());
    let progress = chunk_progress(&pb);

    let (from_id, to_id, name) = (from.to_string(), to.to_string(), filename.clone());
    let record = tokio::task::spawn_blocking(move || {
        encoder.encode_with_progress(
            &plaintext,
            &from_id,
            &to_id,
            &name,
            &recipient_key,
            Some(progress.as_ref()),
        )
    })
    .await
    .context("encryption task failed")??;
    pb.finish_with_message("encrypted".to_string());

    let chunks = record.chunk_count();
    let ciphertext_len = record.ciphertext_len();

    let spinner = make_spinner("upload");
    spinner.set_message(format!("{chunks} chunks, {}", fmt_bytes(ciphertext_len)));
    let mut client = connect_relay(&config.relay).await?;
    let summary = client
        .store(StoreRequest {
            record: Some(WireRecord::from(&record).into()),
        })
        .await
        .context("store RPC failed")?
        .into_inner()
        .summary
        .map(TransferSummary::from);
    spinner.finish_with_message("stored".to_string());

    println!();
    println!("Sent:");
    println!("  to:         {to}");
    println!("  filename:   {filename}");
    println!("  chunks:     {chunks}");
    println!("  plaintext:  {}", fmt_bytes(plaintext_len));
    println!("  ciphertext: {}", fmt_bytes(ciphertext_len));
    if let Some(summary) = summary {
        println!("  stored_at:  {}", summary.stored_at);
    }
    Ok(())
}

// ── `courier inbox` ───────────────────────────────────────────────────────────

async fn cmd_inbox(config: &CourierConfig, id: &str) -> Result<()> {
    courier_core::validate_identity(id)?;
    let mut client = connect_relay(&config.relay).await?;
    let transfers: Vec<TransferSummary> = client
        .list(ListRequest {
            recipient: id.to_string(),
        })
        .await
        .context("list RPC failed")?
        .into_inner()
        .transfers
        .into_iter()
        .map(Into::into)
        .collect();

    if transfers.is_empty() {
        println!("No transfers waiting for '{id}'");
        return Ok(());
    }

    println!("{:<32} {:<16} {:>7} {:>12}", "FILENAME", "FROM", "CHUNKS", "STORED_AT");
    for t in &transfers {
        println!(
            "{:<32} {:<16} {:>7} {:>12}",
            t.filename, t.sender_id, t.chunk_count, t.stored_at
        );
    }
    println!();
    println!("{} transfer(s). Receive with: courier receive <filename> --id {id}", transfers.len());
    Ok(())
}

// ── `courier receive` ─────────────────────────────────────────────────────────

async fn cmd_receive(
    config: &CourierConfig,
    filename: &str,
    id: &str,
    out: Option<&Path>,
    delete: bool,
) -> Result<()> {
    validate_filename(filename)?;
    let private_key = key_directory(config).private_key(id)?;
    let out_path = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(filename));

    let spinner = make_spinner("fetch");
    spinner.set_message(filename.to_string());
    let mut client = connect_relay(&config.relay).await?;
    let envelope = client
        .fetch(FetchRequest {
            recipient: id.to_string(),
            filename: filename.to_string(),
        })
        .await
        .context("fetch RPC failed")?
        .into_inner()
        .record
        .context("relay returned an empty record")?;
    spinner.finish_with_message("fetched".to_string());

    let record = TransferRecord::try_from(WireRecord::from(envelope))?;
    check_fetched(&record, id, filename)?;
    let sender = record.sender_id.clone();
    debug!(from = %sender, chunks = record.chunk_count(), "decoding transfer");

    let pb = make_progress_bar(record.chunk_count() as u64, "decrypt");
    pb.set_message(filename.to_string());
    let progress = chunk_progress(&pb);

    let plaintext = tokio::task::spawn_blocking(move || {
        decode_transfer_with_progress(&record, &private_key, Some(progress.as_ref()))
    })
    .await
    .context("decryption task failed")?;

    let plaintext = match plaintext {
        Ok(bytes) => bytes,
        Err(e) => {
            pb.abandon_with_message(format!("failed ({})", e.kind()));
            return Err(e).context(format!("transfer '{filename}' from '{sender}' rejected"));
        }
    };
    pb.finish_with_message("verified".to_string());

    let written = plaintext.len() as u64;
    write_output(&out_path, plaintext)
        .await
        .with_context(|| format!("writing {}", out_path.display()))?;

    println!();
    println!("Received:");
    println!("  from:   {sender}");
    println!("  local:  {}", out_path.display());
    println!("  bytes:  {}", fmt_bytes(written));

    if delete {
        let deleted = delete_remote(&mut client, id, filename).await?;
        println!("  relay:  {}", if deleted { "deleted" } else { "already gone" });
    }
    Ok(())
}

/// Reject a record the relay returned for some other (recipient, filename).
fn check_fetched(record: &TransferRecord, id: &str, filename: &str) -> Result<()> {
    if record.recipient_id != id || record.filename != filename {
        anyhow::bail!(
            "relay returned '{}' for '{}' when '{filename}' for '{id}' was requested; refusing to decode",
            record.filename,
            record.recipient_id
        );
    }
    Ok(())
}

/// Write through a temp file in the destination directory, then rename.
async fn write_output(out_path: &Path, contents: Vec<u8>) -> Result<()> {
    let out_path = out_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::Write;

        let dir = match out_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".courier-")
            .suffix(".partial")
            .tempfile_in(&dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&out_path)
            .map_err(|e| e.error)
            .with_context(|| format!("renaming into {}", out_path.display()))?;
        Ok(())
    })
    .await
    .context("write task failed")?
}

// ── `courier delete` ──────────────────────────────────────────────────────────

async fn cmd_delete(config: &CourierConfig, filename: &str, id: &str) -> Result<()> {
    let mut client = connect_relay(&config.relay).await?;
    if delete_remote(&mut client, id, filename).await? {
        println!("Deleted '{filename}' from {id}'s mailbox");
    } else {
        println!("No transfer '{filename}' for {id}");
    }
    Ok(())
}

async fn delete_remote(client: &mut RelayClient<Channel>, id: &str, filename: &str) -> Result<bool> {
    Ok(client
        .delete(DeleteRequest {
            recipient: id.to_string(),
            filename: filename.to_string(),
        })
        .await
        .context("delete RPC failed")?
        .into_inner()
        .deleted)
}

// ── `courier status` ──────────────────────────────────────────────────────────

async fn cmd_status(config: &CourierConfig) -> Result<()> {
    let mut client = connect_relay(&config.relay).await?;

    let status = client
        .status(tonic::Request::new(StatusRequest {}))
        .await
        .context("status RPC failed")?
        .into_inner();

    println!("courierd v{}", status.version);
    println!("  uptime:   {}", format_uptime(status.uptime_secs));
    println!("  relay:    {}", config.relay.endpoint);
    println!(
        "  storage:  {} [{}]",
        status.storage_backend,
        if status.storage_ok { "ok" } else { "UNREACHABLE" }
    );
    Ok(())
}

// ── gRPC connection ───────────────────────────────────────────────────────────

async fn connect_relay(relay: &RelayConfig) -> Result<RelayClient<Channel>> {
    let mut endpoint = Endpoint::from_shared(relay.endpoint.clone())
        .with_context(|| format!("invalid relay endpoint: {}", relay.endpoint))?
        .connect_timeout(Duration::from_secs(10));

    if relay.endpoint.starts_with("https://") {
        let tls = match &relay.ca_cert {
            Some(ca_path) => {
                let pem = tokio::fs::read(ca_path)
                    .await
                    .with_context(|| format!("reading CA certificate {}", ca_path.display()))?;
                ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem))
            }
            None => ClientTlsConfig::new().with_native_roots(),
        };
        endpoint = endpoint.tls_config(tls).context("relay TLS config")?;
    } else if relay.enforce_tls {
        anyhow::bail!(
            "relay endpoint uses plaintext HTTP ({}), but enforce_tls is enabled",
            relay.endpoint
        );
    } else {
        warn!(endpoint = %relay.endpoint, "relay connection is not encrypted in transit");
    }

    let channel = endpoint.connect().await.with_context(|| {
        format!(
            "connecting to courierd at {}\n       Is courierd running?  Try: courierd --config /etc/courier/courier.toml",
            relay.endpoint
        )
    })?;

    Ok(RelayClient::new(channel)
        .max_decoding_message_size(relay.max_message_bytes)
        .max_encoding_message_size(relay.max_message_bytes))
}

// ── `courier config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &CourierConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Utilities ─────────────────────────────────────────────────────────────────

fn format_uptime(secs: i64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
