use anyhow::Result;
use clap::{Parser, Subcommand};

use coderun::{cli, config, webapp};

#[derive(Parser)]
#[command(name = "coderun")]
#[command(about = "Sandboxed remote code execution service")]
#[command(long_about = "\
Sandboxed remote code execution service

coderun accepts source code in one of several languages, compiles it when
the language needs it, runs it against the given stdin inside a disposable
sandbox, and reports stdout, stderr, exit status, time and memory.

TYPICAL WORKFLOWS:

  Serve the HTTP API:
    coderun serve --port 3000
    curl -s localhost:3000/run -d '{\"language\":\"python3\",\"code\":\"print(1)\"}'

  Run a file locally through the same pipeline:
    coderun exec cpp main.cpp --stdin @input.txt

  Check which toolchains this host provides:
    coderun languages

For more details on each command, use: coderun <command> --help
")]
struct Cli {
    /// Global configuration arguments
    #[command(flatten)]
    config: config::ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP execution server
    ///
    /// Example:
    ///
    ///  $ coderun serve --port 3000 --ready-file ./ready
    ///
    Serve(webapp::ServeArgs),

    /// Execute one source file in a sandbox and print the result as JSON
    ///
    /// Example:
    ///
    ///  $ coderun exec python3 solution.py --stdin '5'
    ///
    ///  $ cat main.c | coderun exec c - --pretty
    ///
    Exec(cli::exec::ExecArgs),

    /// List registered languages and whether their toolchains are installed
    Languages(cli::languages::LanguagesArgs),

    /// Display version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let global_config = config::GlobalConfig::from_args(&cli.config)?;
    global_config.init_tracing();

    tracing::debug!("coderun starting");

    match cli.command {
        Commands::Serve(args) => webapp::run(args, &global_config).await?,
        Commands::Exec(args) => cli::exec::run(args, &global_config).await?,
        Commands::Languages(args) => cli::languages::run(args, &global_config).await?,
        Commands::Version => println!("{}", cli::version("coderun")),
    };

    tracing::debug!("coderun shutting down");

    Ok(())
}
