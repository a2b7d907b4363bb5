use crate::demo::{run_demo, DemoArgs};
use crate::server::{self, SweepArgs};
use clap::{Args, Parser, Subcommand};
use health_permit::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "Health Permit Review",
    about = "Run the health-card application review service and its maintenance tasks",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Archive expired pending-payment applications once and exit
    Sweep(SweepArgs),
    /// Walk one application through a rejection and resubmission cycle
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Sweep(args) => server::sweep_once(args),
        Command::Demo(args) => run_demo(args),
    }
}
