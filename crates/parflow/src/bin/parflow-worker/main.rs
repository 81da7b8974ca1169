mod exit;

use std::time::Duration;

use clap::Parser;
use parflow::logging::{init_logging, LogFormat, LogLevel};
use parflow::worker::{self, WorkerArgs};
use parflow::TaskRegistry;

#[derive(Parser, Debug)]
#[command(name = "parflow-worker", version, about = "parflow process pool worker")]
struct Cli {
    /// Host of the parent's remote object service.
    #[arg(long, env = "PARFLOW_WORKER_HOST")]
    host: String,

    /// Port of the parent's remote object service.
    #[arg(long, env = "PARFLOW_WORKER_PORT")]
    port: u16,

    /// Object id of the parent's work queue.
    #[arg(long, value_name = "ID")]
    queue_id: String,

    /// How long each request for work waits on the parent.
    #[arg(long, value_name = "MS", default_value_t = 500)]
    poll_ms: u64,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let mut args = WorkerArgs::new(cli.host, cli.port, cli.queue_id);
    args.poll_interval = Duration::from_millis(cli.poll_ms);

    match worker::run(&args, &TaskRegistry::with_builtins()) {
        Ok(()) => std::process::exit(exit::SUCCESS),
        Err(err) => {
            let err = exit::pool_error("worker", err);
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connection_arguments() {
        let cli = Cli::try_parse_from([
            "parflow-worker",
            "--host",
            "127.0.0.1",
            "--port",
            "4100",
            "--queue-id",
            "q-1",
            "--log-level",
            "debug",
        ])
        .expect("worker args should parse");

        assert_eq!(cli.port, 4100);
        assert_eq!(cli.queue_id, "q-1");
        assert_eq!(cli.poll_ms, 500);
        assert_eq!(cli.log_level, LogLevel::Debug);
    }

    #[test]
    fn queue_id_is_required() {
        let err = Cli::try_parse_from(["parflow-worker", "--host", "h", "--port", "1"])
            .expect_err("missing queue id should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
