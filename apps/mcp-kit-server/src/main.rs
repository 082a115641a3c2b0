use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use mcp_kit_coord::{
    Coordinator, InstanceManager, RoleOutcome, run_stdio_bridge, run_stdio_server, shutdown_signal,
};
use mcp_kit_proto::{McpHandler, McpServerConfig};

mod handler;
mod server;

use handler::DemoToolHandler;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "mcp-kit-server",
    version,
    about = "MCP server with local multi-instance coordination on a shared port"
)]
struct Args {
    /// Well-known port shared by every instance of this server.
    #[arg(short, long, env = "MCP_KIT_PORT", default_value_t = 8989)]
    port: u16,

    /// Serve MCP over stdin/stdout.
    #[arg(long, conflicts_with = "http")]
    stdio: bool,

    /// Serve MCP over streamable HTTP (the default). `--sse` is accepted as
    /// a legacy alias.
    #[arg(long, alias = "sse")]
    http: bool,

    /// Coordinate with other local instances: elect a primary over the lock
    /// file and expose the control endpoints.
    #[arg(long)]
    local: bool,

    /// Never terminate processes found holding the shared port.
    #[arg(long)]
    no_kill: bool,

    /// Lock file path override. Default: <tmpdir>/mcp-kit-<port>.lock.
    #[arg(long, env = "MCP_KIT_LOCK_FILE")]
    lock_file: Option<PathBuf>,
}

/// `STDIO_MODE=1` forces stdio regardless of flags.
fn stdio_forced() -> bool {
    std::env::var("STDIO_MODE").is_ok_and(|v| v.trim() == "1")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout belongs to MCP framing in stdio mode; all diagnostics go to
    // stderr in every mode.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn,reqwest=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let version = env!("CARGO_PKG_VERSION");
    let stdio_mode = args.stdio || stdio_forced();

    let cfg = McpServerConfig::for_binary("mcp-kit-server", version);
    let handler: Arc<dyn McpHandler> = Arc::new(DemoToolHandler::new(version));

    if !args.local {
        return if stdio_mode {
            run_stdio_server(cfg, handler).await
        } else {
            server::serve_plain(args.port, cfg, handler).await
        };
    }

    let mut mgr = InstanceManager::new(args.port, version, args.lock_file.clone())?;
    let outcome = Coordinator::default().run(&mut mgr).await?;

    match outcome {
        RoleOutcome::Primary {
            reason,
            previous_version,
        } => {
            info!(
                ?reason,
                previous_version = previous_version.as_deref().unwrap_or("-"),
                "instance elected primary"
            );
            mgr.ensure_target_port(!args.no_kill).await?;
            server::run_primary(mgr, cfg, handler, stdio_mode).await
        }
        RoleOutcome::Secondary { main_version } => {
            if stdio_mode {
                info!(%main_version, "instance running as stdio bridge");
                run_stdio_bridge(args.port, cfg).await
            } else {
                let proxy_port = mgr.start_proxy(Some(&main_version)).await?;
                info!(%main_version, proxy_port, "instance running as reverse proxy");
                shutdown_signal().await;
                mgr.stop_proxy().await;
                Ok(())
            }
        }
    }
}
