use crate::demo::{run_demo, run_export, DemoArgs, ExportArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use review_engine::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "Review Orchestrator",
    about = "Run and demonstrate the multi-stage application review service",
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
    /// Walk a seeded scholarship cycle from intake to analytics
    Demo(DemoArgs),
    /// Write the seeded workspace as CSV
    Export(ExportArgs),
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
        Command::Demo(args) => run_demo(args).await,
        Command::Export(args) => run_export(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn serve_is_the_default() {
        let cli = Cli::try_parse_from(["review-api"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn export_accepts_an_output_path() {
        let cli = Cli::try_parse_from(["review-api", "export", "--output", "out.csv"])
            .expect("parse");
        match cli.command {
            Some(Command::Export(args)) => {
                assert_eq!(args.output, Some(PathBuf::from("out.csv")))
            }
            other => panic!("expected export, got {other:?}"),
        }
    }

    #[test]
    fn serve_port_must_be_numeric() {
        assert!(Cli::try_parse_from(["review-api", "serve", "--port", "http"]).is_err());
    }
}
