use anyhow::{Context, Result};
use clap::Parser;
use kubert::ClientArgs;
use lbex_cli::status;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
/// Inspects the routes managed by the lbex load balancer controller.
struct Cli {
    #[command(flatten)]
    client: kubert::ClientArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone)]
enum OutputMode {
    Table,
    Json,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show the routes the controller configures for the cluster's services
    Status {
        /// Only show routes for the service with this name
        #[arg(long)]
        service: Option<String>,

        /// Only list services in this namespace
        #[arg(short, long)]
        namespace: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        output: OutputMode,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { client, command } = Cli::parse();

    match command {
        Commands::Status {
            service,
            namespace,
            output,
        } => {
            let client = try_client(client).await?;

            let resolved =
                status::status(client, namespace.as_deref(), service.as_deref()).await?;
            match output {
                OutputMode::Table => status::print_status(&resolved),
                OutputMode::Json => status::json_print_status(&resolved)?,
            }
        }
    };

    Ok(())
}

async fn try_client(client: ClientArgs) -> Result<kubert::client::Client> {
    client
        .try_client()
        .await
        .context("failed to load a Kubernetes client configuration")
}
