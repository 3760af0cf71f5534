use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use circus_rs::transfer::{ChannelConfig, DuplexChannel, TcpConnector};
use circus_rs::volume::StaticMetadata;
use circus_rs::{
    CIRCUS_VERSION, LoaderConfig, PartialVolumeDescriptor, TransferRegistry, VolumeLoader,
    VolumeMetadata, VolumeSpecifier,
};

const USAGE: &str = "\
Usage: circus-fetch <addr> <series_uid> --meta <file> [options]

Arguments:
  <addr>                 Volume server address, host:port
  <series_uid>           Series to fetch

Options:
  --meta <file>          Volume metadata as JSON
  --partial <s:e:d>      Fetch only slices start..=end every delta
  --priority <i,j,...>   Image indices to request first
  --out <file>           Write the raw volume here
  --version              Print version";

struct Args {
    addr: String,
    series_uid: String,
    meta: PathBuf,
    partial: Option<PartialVolumeDescriptor>,
    priority: Vec<u32>,
    out: Option<PathBuf>,
}

/// Tracing goes to stderr. `RUST_LOG` wins; otherwise `CIRCUS_LOG` sets the
/// crate level. `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CIRCUS_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("circus_rs={level},circus_fetch={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_partial(value: &str) -> Result<PartialVolumeDescriptor, String> {
    let parts: Vec<&str> = value.split(':').collect();
    let [start, end, delta] = parts.as_slice() else {
        return Err(format!("--partial expects start:end:delta, got '{value}'"));
    };
    let number = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| format!("invalid number '{s}' in --partial"))
    };
    PartialVolumeDescriptor::new(number(*start)?, number(*end)?, number(*delta)?)
        .map_err(|e| e.to_string())
}

fn parse_priority(value: &str) -> Result<Vec<u32>, String> {
    value
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid image index '{s}' in --priority"))
        })
        .collect()
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut positional = Vec::new();
    let mut meta = None;
    let mut partial = None;
    let mut priority = Vec::new();
    let mut out = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--meta" => {
                i += 1;
                meta = Some(PathBuf::from(args.get(i).ok_or("--meta requires a value")?));
            }
            "--partial" => {
                i += 1;
                partial = Some(parse_partial(
                    args.get(i).ok_or("--partial requires a value")?,
                )?);
            }
            "--priority" => {
                i += 1;
                priority = parse_priority(args.get(i).ok_or("--priority requires a value")?)?;
            }
            "--out" => {
                i += 1;
                out = Some(PathBuf::from(args.get(i).ok_or("--out requires a value")?));
            }
            "--version" | "-V" => {
                println!("circus-fetch {CIRCUS_VERSION}");
                process::exit(0);
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let addr = positional.next().ok_or("missing required argument: <addr>")?;
    let series_uid = positional
        .next()
        .ok_or("missing required argument: <series_uid>")?;
    if let Some(extra) = positional.next() {
        return Err(format!("unexpected argument: {extra}"));
    }
    let meta = meta.ok_or("missing required option: --meta")?;

    Ok(Args {
        addr,
        series_uid,
        meta,
        partial,
        priority,
        out,
    })
}

async fn run(args: Args) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&args.meta)
        .with_context(|| format!("failed to read {}", args.meta.display()))?;
    let metadata: VolumeMetadata = serde_json::from_str(&raw)
        .with_context(|| format!("invalid metadata in {}", args.meta.display()))?;

    let mut volume = VolumeSpecifier::new(args.series_uid);
    if let Some(pvd) = args.partial {
        volume = volume.with_partial(pvd);
    }

    let connector = Arc::new(TcpConnector::new(args.addr));
    tracing::info!(addr = connector.addr(), volume = %volume, "Fetching volume");
    let channel = Arc::new(DuplexChannel::with_config(
        connector,
        ChannelConfig::default(),
    ));
    let registry = TransferRegistry::new(Arc::clone(&channel));
    let loader = VolumeLoader::with_config(
        volume.clone(),
        Arc::new(StaticMetadata(metadata)),
        registry,
        LoaderConfig::default(),
    )?;

    if !args.priority.is_empty() {
        loader.set_priority(args.priority, 1).await?;
    }

    let mut progress = loader.subscribe_progress();
    let reporter = tokio::spawn(async move {
        let mut last_percent = 0;
        while let Ok(p) = progress.recv().await {
            let percent = if p.total == 0 { 100 } else { p.finished * 100 / p.total };
            if percent / 10 > last_percent / 10 || p.finished == p.total {
                tracing::info!(finished = p.finished, total = p.total, "Progress {percent}%");
                last_percent = percent;
            }
        }
    });

    let buffer = loader.load_volume().await?;
    reporter.abort();
    channel.close();

    match args.out {
        Some(path) => {
            std::fs::write(&path, buffer.to_bytes())
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), bytes = buffer.byte_len(), "Volume written");
        }
        None => println!(
            "{}: {} slices, {} bytes",
            volume,
            buffer.total_slices(),
            buffer.byte_len()
        ),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}
