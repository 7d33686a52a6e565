use addon_installer::*;
use clap::{Parser, Subcommand};
use log::*;
use simplelog::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::macros::format_description;

#[derive(Parser)]
#[command(author, version, about = "Install addon packages", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    install_root: Option<PathBuf>,
    #[arg(long)]
    platform_version: Option<String>,
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install from an http(s) URL or a local archive
    Install {
        source: String,
        #[arg(long)]
        job_id: Option<String>,
        /// expected digest, `sha256:<hex>`; URL sources only
        #[arg(long)]
        checksum: Option<String>,
    },
    /// List installed addons
    List,
}

fn init_log_config(log_file: Option<&Path>) {
    let mut builder = ConfigBuilder::new();
    builder
        .set_location_level(LevelFilter::Debug)
        .set_time_format_custom(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        ));
    let _ = builder.set_time_offset_to_local();
    let config = builder.build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        LevelFilter::Info,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        match std::fs::File::create(path) {
            Ok(file) => loggers.push(WriteLogger::new(LevelFilter::Debug, config, file)),
            Err(err) => eprintln!("create log file {} failed: {}", path.display(), err),
        }
    }
    let _ = CombinedLogger::init(loggers);
}

fn load_config(cli: &Cli) -> AddonResult<InstallerConfig> {
    let mut config = match &cli.config {
        Some(path) => InstallerConfig::from_file(path)?,
        None => InstallerConfig::default(),
    };
    if let Some(root) = &cli.install_root {
        config.install_root = root.clone();
    }
    if let Some(version) = &cli.platform_version {
        config.platform_version = version.clone();
    }
    config.platform_version()?;
    Ok(config)
}

fn parse_source(source: &str) -> ArchiveSource {
    if source.starts_with("http://") || source.starts_with("https://") {
        ArchiveSource::Url(source.to_string())
    } else {
        ArchiveSource::LocalArchive(PathBuf::from(source))
    }
}

async fn run(cli: Cli) -> AddonResult<bool> {
    let config = load_config(&cli)?;
    match cli.command {
        Commands::Install {
            source,
            job_id,
            checksum,
        } => {
            let job_id = job_id
                .unwrap_or_else(|| format!("install-{}", chrono::Utc::now().timestamp_millis()));
            let sink = Arc::new(MemoryProgressSink::new());
            let sinks: Vec<Arc<dyn ProgressSink>> = vec![Arc::new(LogProgressSink), sink.clone()];
            let installer = AddonInstaller::new(config, Arc::new(FanoutProgressSink::new(sinks)))?;
            info!(
                "job {}: install {} for platform {}",
                job_id,
                source,
                installer.platform_version()
            );

            match parse_source(&source) {
                ArchiveSource::Url(url) => {
                    installer
                        .install_from_url_with_checksum(&job_id, &url, checksum.as_deref())
                        .await
                }
                ArchiveSource::LocalArchive(path) => {
                    if checksum.is_some() {
                        warn!("--checksum is ignored for local archives");
                    }
                    installer.install_from_local_archive(&job_id, &path).await
                }
            }

            let record = sink.get(&job_id).ok_or_else(|| {
                AddonError::JobStateError(format!("job {} left no record", job_id))
            })?;
            let ok = record.status == Some(JobStatus::Finished);
            if ok {
                println!("{}", record.description);
                if let Some(summary) = &record.summary {
                    println!("{}", serde_json::to_string_pretty(summary).unwrap_or_default());
                }
            } else {
                eprintln!("{}", record.description);
            }
            Ok(ok)
        }
        Commands::List => {
            let registry = AddonRegistry::load(&config.install_root)?;
            println!("# {}", registry.root().display());
            for addon in registry.list() {
                println!("{}\t{}\t{}", addon.name, addon.version, addon.path.display());
            }
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_log_config(cli.log_file.as_deref());

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            error!("{}", err);
            eprintln!("Error: {}", err);
            std::process::exit(2);
        }
    }
}
