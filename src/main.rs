use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, EnvFilter};

mod catalog;
mod prompt;
mod selection;
mod server;
mod session;
mod settings;
mod storage;
mod transport;

use settings::{resolve_effective_settings, SettingsLayer};

#[derive(Debug, Parser)]
#[command(name = "routine_advisor")]
#[command(about = "Product picker and beauty routine chat assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1:7272")]
        listen: String,
        /// Catalog JSON file or http(s) URL
        #[arg(long)]
        catalog: Option<String>,
        /// Chat worker endpoint
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        database_url: Option<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Expose Prometheus metrics on this address
        #[arg(long)]
        metrics_listen: Option<String>,
    },
    /// Print catalog products matching the filters as JSON
    Products {
        #[arg(long)]
        catalog: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        search: Option<String>,
    },
}

fn effective_settings(cli: &SettingsLayer) -> settings::AdvisorSettings {
    resolve_effective_settings(&SettingsLayer::defaults(), &SettingsLayer::from_env(), cli)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            listen,
            catalog,
            endpoint,
            database_url,
            timeout_secs,
            metrics_listen,
        } => {
            let addr: SocketAddr = listen.parse()?;
            if let Some(metrics_addr) = metrics_listen {
                let metrics_addr: SocketAddr = metrics_addr.parse()?;
                metrics_exporter_prometheus::PrometheusBuilder::new()
                    .with_http_listener(metrics_addr)
                    .install()?;
                tracing::info!(%metrics_addr, "metrics exporter listening");
            }
            let overrides = SettingsLayer {
                chat_endpoint: endpoint,
                catalog_source: catalog,
                database_url,
                request_timeout_secs: timeout_secs,
            };
            let settings = effective_settings(&overrides);
            let state = server::AppState::from_settings(&settings).await?;
            server::serve(addr, state).await?;
        }
        Commands::Products { catalog: source, category, search } => {
            let overrides = SettingsLayer { catalog_source: source, ..Default::default() };
            let settings = effective_settings(&overrides);
            let source = catalog::CatalogSource::parse(&settings.catalog_source);
            let store = catalog::CatalogStore::new(source);
            let products = store.filter(category.as_deref(), search.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&products)?);
        }
    }
    Ok(())
}
