use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::process::exit;
use tokio::io::AsyncReadExt;

use crate::config::GlobalConfig;
use crate::exec::{ExecError, Executor, SubmissionRequest};

#[derive(Parser, Debug)]
pub struct ExecArgs {
    /// Language identifier or alias (python3, js, ts, java, cpp, c)
    language: String,

    /// Source file to run, `-` reads it from stdin
    file: String,

    /// Stdin input (supports @file syntax to read from a file)
    #[arg(short = 'i', long, visible_alias = "in")]
    stdin: Option<String>,

    /// Pretty-print the result record
    #[arg(long)]
    pretty: bool,
}

/// Read a value that is either literal text or `@path`
fn literal_or_file(value: &str) -> Result<String> {
    match value.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path)),
        None => Ok(value.to_string()),
    }
}

async fn read_source(file: &str) -> Result<String> {
    if file != "-" {
        return std::fs::read_to_string(file).with_context(|| format!("reading {}", file));
    }
    if std::io::stdin().is_terminal() {
        anyhow::bail!("refusing to read source from a terminal, pass a file or pipe it in");
    }
    let mut code = String::new();
    tokio::io::stdin().read_to_string(&mut code).await?;
    Ok(code)
}

/// Run one submission locally and print its result record as JSON
///
/// Exits with 0 when the submission succeeded, 1 when it failed at compile
/// or run time, and 2 when it was rejected.
pub async fn run(args: ExecArgs, config: &GlobalConfig) -> Result<()> {
    let code = read_source(&args.file).await?;
    let stdin = match &args.stdin {
        Some(value) => literal_or_file(value)?,
        None => String::new(),
    };

    // Private root so a server sharing scratch_root never purges this run
    let mut config = config.clone();
    config.scratch_root = config.scratch_root.join(format!("cli-{}", std::process::id()));
    config.max_concurrency = 1;
    let executor = Executor::from_config(&config)?;
    let request = SubmissionRequest { language: args.language, code, stdin };

    let outcome = executor.execute(request).await;
    if let Err(e) = std::fs::remove_dir(&config.scratch_root) {
        tracing::debug!(error = %e, root = %config.scratch_root.display(), "scratch root not removed");
    }

    match outcome {
        Ok(result) => {
            let json = if args.pretty {
                serde_json::to_string_pretty(&result)?
            } else {
                serde_json::to_string(&result)?
            };
            println!("{}", json);
            if !result.succeeded() {
                exit(1);
            }
            Ok(())
        }
        Err(ExecError::Validation(e)) => {
            eprintln!("{}", e);
            exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_literal_or_file() {
        assert_eq!(literal_or_file("5\n").unwrap(), "5\n");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"1 2 3\n").unwrap();
        let arg = format!("@{}", file.path().display());
        assert_eq!(literal_or_file(&arg).unwrap(), "1 2 3\n");

        assert!(literal_or_file("@/nonexistent/input.txt").is_err());
    }
}
