//! chunkstore - upload and download chunked files from the command line
//!
//! Storage backend, cache and metadata locations come from `CHUNKSTORE_*`
//! environment variables.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use chunkstore::client::{download_to, upload_stream};
use chunkstore::{storage, Config, DiskCache, JsonMetadataStore, TransferService};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Upload an encrypted chunk stream
    Put { path: PathBuf, name: String },
    /// Download a stored file
    Get { file_id: String, out: PathBuf },
    /// Show stored metadata for a file
    Info { file_id: String },
    /// Delete a file from storage, cache and metadata
    Rm { file_id: String },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"chunkstore - Chunked encrypted file transfer

USAGE:
    chunkstore put <path> [name]
    chunkstore get <file_id> <out>
    chunkstore info <file_id>
    chunkstore rm <file_id>
    chunkstore help

COMMANDS:
    put     Upload an already-encrypted chunk stream, prints the new file ID
    get     Download a file into <out>
    info    Show length, chunk count and remote ID of a file
    rm      Delete a file (storage errors are logged, metadata is always cleared)
    help    Show this help message

ENVIRONMENT:
    CHUNKSTORE_STORAGE               local, b2 or s3 (default: local)
    CHUNKSTORE_LOCAL_STORAGE_PATH    Local backend root (default: uploads)
    CHUNKSTORE_LOCAL_STORAGE_LIMIT   Local backend size cap, e.g. 50G
    CHUNKSTORE_B2_BUCKET_ID          B2 bucket ID
    CHUNKSTORE_B2_BUCKET_KEY_ID      B2 application key ID
    CHUNKSTORE_B2_BUCKET_KEY         B2 application key
    CHUNKSTORE_S3_ENDPOINT           S3 endpoint
    CHUNKSTORE_S3_ACCESS_KEY_ID      S3 access key ID
    CHUNKSTORE_S3_SECRET_KEY         S3 secret key
    CHUNKSTORE_S3_BUCKET_NAME        S3 bucket
    CHUNKSTORE_S3_REGION_NAME        S3 region (default: auto)
    CHUNKSTORE_CACHE_DIR             Disk cache directory
    CHUNKSTORE_CACHE_MAX_SIZE        Total cache size, e.g. 25G
    CHUNKSTORE_CACHE_MAX_FILE_SIZE   Largest cacheable file, e.g. 5G
    CHUNKSTORE_METADATA_DIR          Metadata directory
    CHUNKSTORE_REAUTH_INTERVAL_SECS  Seconds between reauthorizations
    RUST_LOG                         Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "put" => {
            if args.len() < 3 {
                return Err(anyhow!("Usage: chunkstore put <path> [name]"));
            }
            let path = PathBuf::from(&args[2]);
            let name = match args.get(3) {
                Some(name) => name.clone(),
                None => path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow!("Cannot derive a name from {}", path.display()))?,
            };
            Ok(Command::Put { path, name })
        }
        "get" => {
            if args.len() < 4 {
                return Err(anyhow!("Usage: chunkstore get <file_id> <out>"));
            }
            Ok(Command::Get {
                file_id: args[2].clone(),
                out: PathBuf::from(&args[3]),
            })
        }
        "info" => match args.get(2) {
            Some(id) => Ok(Command::Info { file_id: id.clone() }),
            None => Err(anyhow!("Usage: chunkstore info <file_id>")),
        },
        "rm" => match args.get(2) {
            Some(id) => Ok(Command::Rm { file_id: id.clone() }),
            None => Err(anyhow!("Usage: chunkstore rm <file_id>")),
        },
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = Config::from_env().context("Invalid configuration")?;
    let backend = storage::connect(&config)
        .await
        .context("Unable to connect to storage")?;
    let metadata = Arc::new(
        JsonMetadataStore::open(&config.metadata_dir).context("Unable to open metadata store")?,
    );
    let cache = DiskCache::new(config.cache.clone()).unwrap_or_else(|e| {
        warn!(error = %e, "Disk cache unavailable, continuing without it");
        DiskCache::disabled()
    });
    let service = Arc::new(TransferService::new(backend, metadata, cache));

    let reauth = {
        let service = Arc::clone(&service);
        let period = config.reauth_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.reauthorize().await;
            }
        })
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling transfer...");
                cancel.cancel();
            }
        });
    }

    let result = run(command, &service, &cancel).await;
    reauth.abort();
    result
}

async fn run(command: Command, service: &Arc<TransferService>, cancel: &CancellationToken) -> Result<()> {
    match command {
        Command::Put { path, name } => {
            let file_id = upload_stream(service, &path, &name, cancel)
                .await
                .with_context(|| format!("Upload of {} failed", path.display()))?;
            println!("{}", file_id);
        }
        Command::Get { file_id, out } => {
            let length = download_to(service, &file_id, &out, cancel)
                .await
                .with_context(|| format!("Download of {} failed", file_id))?;
            println!("{} bytes written to {}", length, out.display());
        }
        Command::Info { file_id } => {
            let file = service.file_info(&file_id).await?;
            println!("id:        {}", file.id);
            println!("name:      {}", file.name);
            println!("length:    {}", file.length);
            println!("chunks:    {}", file.chunks);
            println!("remote_id: {}", file.remote_id);
        }
        Command::Rm { file_id } => {
            service.delete_file(&file_id).await?;
            println!("Deleted {}", file_id);
        }
        Command::Help => print_help(),
    }
    Ok(())
}
