mod runner;
mod telemetry;

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use skiff_core::protocol::{EXIT_CODE_UNAVAILABLE, TaskPayload};
use skiff_core::transport::webrtc::WebRtcConfig;

use runner::ClientConfig;

/// Demo task submitted when neither a file nor inline code is given.
const EXAMPLE_TASK: &str = r#"
def fib(n):
    if n <= 1:
        return n
    return fib(n-1) + fib(n-2)

result = fib(30)
print(f"Fibonacci(30) = {result}")
"#;

#[derive(Parser, Debug)]
#[command(name = "skiff", about = "Submit a sealed task to a compute node")]
struct Cli {
    /// Script file to execute remotely. Without a file or --code, a
    /// built-in example task is submitted.
    #[arg(value_name = "FILE", conflicts_with = "code")]
    file: Option<PathBuf>,

    /// Inline code to execute instead of a file.
    #[arg(short, long)]
    code: Option<String>,

    /// Task kind tag sent alongside the code.
    #[arg(long, default_value = "python_code")]
    task_type: String,

    /// Session id to announce to the relay; auto-generated if omitted.
    #[arg(long)]
    session_id: Option<String>,

    /// Rendezvous relay to negotiate through.
    #[arg(long, env = "SKIFF_RELAY_URL", default_value = "http://localhost:10000")]
    relay_url: String,

    /// How long to wait for the session to become ready, in seconds.
    #[arg(long, env = "SKIFF_READY_TIMEOUT_SECS", default_value_t = 30)]
    ready_timeout_secs: u64,

    /// How long to wait for the result after submitting, in seconds.
    #[arg(long, env = "SKIFF_RESULT_TIMEOUT_SECS", default_value_t = 60)]
    result_timeout_secs: u64,

    /// STUN servers for transport negotiation (repeatable).
    #[arg(long = "stun-server", env = "SKIFF_STUN_SERVERS", value_delimiter = ',')]
    stun_servers: Vec<String>,
}

/// Inline code wins over a file; with neither, fall back to the
/// built-in example.
fn task_code(file: Option<&std::path::Path>, code: Option<String>) -> anyhow::Result<String> {
    match (file, code) {
        (_, Some(code)) => Ok(code),
        (Some(path), None) => std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display())),
        (None, None) => {
            tracing::info!(target = "client", "no task given, submitting the built-in example");
            Ok(EXAMPLE_TASK.to_string())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init()?;
    let cli = Cli::parse();

    let code = task_code(cli.file.as_deref(), cli.code)?;

    let mut webrtc = WebRtcConfig::default();
    if !cli.stun_servers.is_empty() {
        webrtc.stun_servers = cli.stun_servers;
    }

    let result = runner::submit(
        ClientConfig {
            relay_url: cli.relay_url,
            webrtc,
            ready_timeout: Duration::from_secs(cli.ready_timeout_secs),
            result_timeout: Duration::from_secs(cli.result_timeout_secs),
            session_id: cli.session_id,
        },
        TaskPayload {
            code,
            kind: cli.task_type,
        },
    )
    .await?;

    // The remote task's streams become ours; its exit code becomes
    // ours too.
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    std::io::stdout().flush().ok();
    std::io::stderr().flush().ok();
    tracing::info!(
        target = "client",
        exit_code = result.exit_code,
        execution_time = result.execution_time,
        "task finished"
    );

    let status = if result.exit_code == EXIT_CODE_UNAVAILABLE {
        1
    } else {
        result.exit_code.clamp(0, 255)
    };
    std::process::exit(status);
}
