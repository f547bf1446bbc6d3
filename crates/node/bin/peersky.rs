use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use peersky_node::config::Config;
use peersky_node::logging::init_logging;
use peersky_node::logging::LogLevel;
use peersky_node::prelude::Installer;

#[derive(Parser, Debug)]
#[command(about, version, author)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value_t = LogLevel::Info, value_enum, env)]
    log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Command {
    #[command(about = "Initializes the gateway with a default configuration.")]
    Init(InitCommand),
    #[command(about = "Starts a long-running gateway over a local HTTP bridge.")]
    Run(RunCommand),
    #[command(about = "Installs an extension package from an archive or directory.")]
    ExtInstall(ExtInstallCommand),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[arg(
        long,
        short = 'c',
        env,
        default_value = "~/.peersky/config.yaml",
        help = "Config file location"
    )]
    pub config: String,
}

#[derive(Args, Debug)]
struct InitCommand {
    #[arg(
        long,
        default_value = "~/.peersky/config.yaml",
        help = "The location of config file"
    )]
    pub location: String,
}

#[derive(Args, Debug)]
struct RunCommand {
    #[arg(
        long,
        short = 'b',
        help = "Bridge listen address. If not provided, use 127.0.0.1:9080",
        env
    )]
    pub http_addr: Option<String>,

    #[arg(
        long,
        help = "Ethereum JSON-RPC endpoint. If not provided, use eth_rpc_url in config file",
        env
    )]
    pub eth_rpc_url: Option<String>,

    #[command(flatten)]
    config_args: ConfigArgs,
}

#[derive(Args, Debug)]
struct ExtInstallCommand {
    #[arg(help = "A .zip or .crx archive, or an unpacked extension directory")]
    pub path: PathBuf,

    #[arg(long, help = "Locale used to resolve display strings", default_value = "en-US")]
    pub locale: String,

    #[command(flatten)]
    config_args: ConfigArgs,
}

#[cfg(feature = "dummy")]
async fn daemon_run(args: RunCommand) -> anyhow::Result<()> {
    use std::sync::Arc;

    use peersky_node::consts::ENS_CACHE_FILE;
    use peersky_node::consts::HYPER_CACHE_FILE;
    use peersky_node::consts::ROOM_PORTS_FILE;
    use peersky_node::prelude::ChatService;
    use peersky_node::prelude::Dispatcher;
    use peersky_node::prelude::EnsCache;
    use peersky_node::prelude::EnsResolver;
    use peersky_node::prelude::HyperCache;
    use peersky_node::prelude::HyperResolver;
    use peersky_node::prelude::IpfsResolver;
    use peersky_node::prelude::RoomPortTable;
    use peersky_node::prelude::RoomService;
    use peersky_node::prelude::SwarmKeypair;
    use peersky_transport::connections::memory::MemoryFetcher;
    use peersky_transport::connections::memory::MemoryNetwork;
    use peersky_transport::connections::memory::MemoryTunnel;

    let c = Config::read_fs(args.config_args.config.as_str())?;
    let data_dir = c.user_data_dir()?;
    std::fs::create_dir_all(&data_dir)?;

    let network = Arc::new(MemoryNetwork::new());
    let tunnel = Arc::new(MemoryTunnel::new());
    let fetcher = Arc::new(MemoryFetcher::new());

    let identity =
        SwarmKeypair::load_or_create(&data_dir.join(peersky_node::consts::SWARM_KEYPAIR_FILE), tunnel.as_ref())?;
    println!("Swarm identity: {}", identity.public_key);

    let ens_cache = Arc::new(EnsCache::load(data_dir.join(ENS_CACHE_FILE)));
    let hyper_cache = Arc::new(HyperCache::load(data_dir.join(HYPER_CACHE_FILE)));
    let ports = Arc::new(RoomPortTable::load(data_dir.join(ROOM_PORTS_FILE)));

    let eth_rpc_url = args.eth_rpc_url.unwrap_or_else(|| c.eth_rpc_url.clone());
    let rooms = Arc::new(RoomService::new(tunnel.clone(), ports));
    let chat = Arc::new(ChatService::new(tunnel));

    let dispatcher = Arc::new(
        Dispatcher::new(
            IpfsResolver::new(network),
            EnsResolver::new(eth_rpc_url, ens_cache),
            HyperResolver::new(fetcher, hyper_cache),
            rooms.clone(),
            chat.clone(),
        )
        .with_assets_dir(c.assets_dir()?)
        .with_extensions_dir(c.extensions_dir()?),
    );

    let bind_addr = args
        .http_addr
        .unwrap_or_else(|| "127.0.0.1:9080".to_string());
    println!("Bridge listening on http://{bind_addr}/");

    let app = axum::Router::new()
        .fallback(bridge)
        .with_state(dispatcher);
    axum::Server::bind(&bind_addr.parse()?)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    rooms.close_all().await;
    chat.close_all().await;
    Ok(())
}

#[cfg(not(feature = "dummy"))]
async fn daemon_run(_args: RunCommand) -> anyhow::Result<()> {
    anyhow::bail!(
        "this build carries no transport stack; rebuild with --features dummy \
         or embed the gateway in a shell"
    )
}

/// Map `GET /<target-url>` on the bridge to one dispatcher request.
#[cfg(feature = "dummy")]
async fn bridge(
    axum::extract::State(dispatcher): axum::extract::State<
        std::sync::Arc<peersky_node::prelude::Dispatcher>,
    >,
    request: axum::http::Request<axum::body::Body>,
) -> axum::response::Response {
    use axum::body::StreamBody;
    use axum::response::IntoResponse;
    use peersky_node::prelude::Request;
    use peersky_node::prelude::UploadSource;

    let (parts, body) = request.into_parts();
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = percent_encoding::percent_decode_str(target.trim_start_matches('/'))
        .decode_utf8_lossy()
        .to_string();

    let bytes = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                axum::http::StatusCode::BAD_REQUEST,
                format!("unreadable request body: {e}"),
            )
                .into_response();
        }
    };

    let mut gateway_request = Request::get(target);
    gateway_request.method = parts.method.as_str().to_string();
    gateway_request.headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();
    if !bytes.is_empty() {
        gateway_request.upload = Some(UploadSource::Bytes(bytes));
    }

    let response = dispatcher.handle(gateway_request).await;
    let mut builder = axum::http::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(axum::body::boxed(StreamBody::new(response.body)))
        .unwrap_or_else(|e| {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("response assembly failed: {e}"),
            )
                .into_response()
        })
}

async fn ext_install(args: ExtInstallCommand) -> anyhow::Result<()> {
    let c = Config::read_fs(args.config_args.config.as_str())?;
    let installer = Installer::new(c.extensions_dir()?, args.locale);

    let installed = if args.path.is_dir() {
        installer.install_from_directory(&args.path).await
    } else {
        installer.install_from_archive(&args.path).await
    };

    match installed {
        Ok(package) => {
            println!("{}", serde_json::to_string_pretty(&package)?);
            for warning in &package.warnings {
                eprintln!("warning: {warning}");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("install failed: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.log_level);

    match cli.command {
        Command::Init(args) => {
            let written = Config::default().write_fs(args.location.as_str())?;
            println!("Your config file: {written}");
            Ok(())
        }
        Command::Run(args) => daemon_run(args).await,
        Command::ExtInstall(args) => ext_install(args).await,
    }
}
