mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "relaymq", version, about = "Messaging over a multiplexed broker connection")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", env = "RELAYMQ_LOG_FORMAT", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", env = "RELAYMQ_LOG_LEVEL", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::Scenario;

    #[test]
    fn parses_demo_subcommand() {
        let cli = Cli::try_parse_from(["relaymq", "demo", "rpc-error", "--timeout", "500ms"])
            .expect("demo args should parse");

        match cli.command {
            Command::Demo(args) => {
                assert_eq!(args.scenario, Scenario::RpcError);
                assert_eq!(args.timeout, "500ms");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn demo_defaults_to_all_scenarios() {
        let cli = Cli::try_parse_from(["relaymq", "demo"]).expect("demo should parse");
        assert!(matches!(cli.command, Command::Demo(ref args) if args.scenario == Scenario::All));
    }

    #[test]
    fn parses_soak_with_global_flags() {
        let cli = Cli::try_parse_from([
            "relaymq",
            "soak",
            "--requests",
            "50",
            "--workers",
            "2",
            "--format",
            "json",
            "--log-level",
            "warn",
        ])
        .expect("soak args should parse");

        assert_eq!(cli.format, Some(OutputFormat::Json));
        assert_eq!(cli.log_level, LogLevel::Warn);
        match cli.command {
            Command::Soak(args) => {
                assert_eq!(args.requests, 50);
                assert_eq!(args.workers, 2);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_scenario() {
        let err = Cli::try_parse_from(["relaymq", "demo", "fanout"])
            .expect_err("unknown scenario should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }
}
