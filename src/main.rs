use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hotrod_client::config::Config;
use hotrod_client::utils::format_duration;
use hotrod_client::HotRodClient;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hotrod")]
#[command(about = "Command line client for Hot Rod cache servers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "hotrod-client team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping every initial server
    Ping {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/client.toml")]
        config: PathBuf,
    },
    /// Read a key
    Get {
        #[arg(short, long, default_value = "config/client.toml")]
        config: PathBuf,
        /// Cache name, the server's default cache when omitted
        #[arg(long, default_value = "")]
        cache: String,
        key: String,
    },
    /// Write a key
    Put {
        #[arg(short, long, default_value = "config/client.toml")]
        config: PathBuf,
        #[arg(long, default_value = "")]
        cache: String,
        key: String,
        value: String,
        /// Lifespan in seconds
        #[arg(long)]
        lifespan: Option<u64>,
    },
    /// Remove a key
    Remove {
        #[arg(short, long, default_value = "config/client.toml")]
        config: PathBuf,
        #[arg(long, default_value = "")]
        cache: String,
        key: String,
    },
    /// Generate example configuration files
    Config {
        /// Configuration mode (single or xsite)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ping { config } => ping(config).await?,
        Commands::Get { config, cache, key } => {
            let client = connect(&config).await?;
            match client.cache(&cache).get(key.clone()).await? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => bail!("Key not found: {}", key),
            }
        }
        Commands::Put { config, cache, key, value, lifespan } => {
            let client = connect(&config).await?;
            let cache = client.cache(&cache);
            match lifespan {
                Some(secs) => {
                    cache
                        .put_with_expiration(key, value, Some(std::time::Duration::from_secs(secs)), None)
                        .await?
                }
                None => {
                    cache.put(key, value, false).await?;
                }
            }
            println!("OK");
        }
        Commands::Remove { config, cache, key } => {
            let client = connect(&config).await?;
            let outcome = client.cache(&cache).remove(key.clone()).await?;
            if outcome.executed {
                println!("Removed {}", key);
            } else {
                println!("Key not found: {}", key);
            }
        }
        Commands::Config { mode, output } => generate_config(mode, output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn connect(config_path: &PathBuf) -> Result<HotRodClient> {
    let config = Config::load_from_file(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(&config)?;

    info!("Configuration loaded from: {:?}", config_path);
    HotRodClient::connect(&config)
        .await
        .context("Failed to start client")
}

async fn ping(config_path: PathBuf) -> Result<()> {
    let client = connect(&config_path).await?;
    let started = Instant::now();
    let response = client.default_cache().ping().await.context("Ping failed")?;

    println!("✓ Ping succeeded in {}", format_duration(started.elapsed()));
    if response.server_version != 0 {
        println!("  Server protocol version: {}.{}", response.server_version / 10, response.server_version % 10);
    }
    println!("  Cluster: {}", client.dispatcher().current_cluster_name());
    for server in client.dispatcher().servers() {
        println!("    {}", server);
    }
    Ok(())
}

fn generate_config(mode: String, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, &mode).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  hotrod ping --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Protocol version: {}", config.client.protocol_version);
            println!("  Intelligence: {:?}", config.client.intelligence);
            println!("  Max retries: {}", config.client.max_retries);
            println!("  Initial servers: {} instances", config.client.servers.len());
            for (i, server) in config.client.servers.iter().enumerate() {
                println!("    {}: {}", i + 1, server);
            }
            for cluster in &config.clusters {
                println!("  Cluster {}: {} instances", cluster.name, cluster.servers.len());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            eprintln!("  {}", e);
            Err(e.into())
        }
    }
}

fn show_version() {
    println!("hotrod v{}", env!("CARGO_PKG_VERSION"));
    println!("Command line client for Hot Rod cache servers");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Hot Rod protocol 2.8, 3.0 and 3.1");
    println!("  • Topology and segment aware routing");
    println!("  • Cross-site cluster failover");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);

    let result = match config.logging.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
