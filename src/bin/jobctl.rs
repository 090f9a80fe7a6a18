use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tonic::transport::Endpoint;

use jobworker::config::{TlsConfig, WorkerConfig};
use jobworker::proto::worker_client::WorkerClient;
use jobworker::proto::{JobOpts, OutputRequest, StartRequest, StatusRequest, StopRequest};
use jobworker::tls::TlsIdentity;

#[derive(Parser, Debug)]
#[command(name = "jobctl")]
#[command(about = "Client for the jobworker service")]
struct Cli {
    /// Server host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(long, default_value_t = 50051)]
    port: u16,

    /// CA certificate used to verify the server
    #[arg(long, default_value = "certs/root.pem")]
    ca_cert: PathBuf,

    /// Client certificate; its Common Name is the owner identity
    #[arg(long, default_value = "certs/client.pem")]
    cert: PathBuf,

    /// Client private key
    #[arg(long, default_value = "certs/client-key.pem")]
    key: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a job: jobctl start -- bash -c "echo hello"
    Start {
        /// cgroup v2 `cpu.weight`
        #[arg(long, default_value_t = 100)]
        cpu: i32,

        /// cgroup v2 `io.weight`
        #[arg(long, default_value_t = 100)]
        io: i32,

        /// cgroup v2 `memory.high`, e.g. 512, 100M, 2G
        #[arg(long, default_value = "100M")]
        mem: String,

        /// Command and arguments to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        argv: Vec<String>,
    },
    /// Stop a job and release its resources
    Stop { id: String },
    /// Show a job's status
    Status { id: String },
    /// Stream a job's combined stdout/stderr
    Logs {
        id: String,

        /// Keep the stream open and follow new output
        #[arg(short, long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = WorkerConfig::from_env();

    let tls = TlsIdentity::load(&TlsConfig::new(&cli.ca_cert, &cli.cert, &cli.key)).await?;

    // Unary calls get the short timeout; a followed log stream may stay
    // open for minutes.
    let timeout = if matches!(cli.command, Command::Logs { .. }) {
        config.stream_timeout
    } else {
        config.unary_timeout
    };
    let channel = Endpoint::from_shared(format!("https://{}:{}", cli.host, cli.port))?
        .tls_config(tls.client_tls_config())?
        .timeout(timeout)
        .connect()
        .await?;
    let mut client = WorkerClient::new(channel);

    match cli.command {
        Command::Start {
            cpu,
            io,
            mem,
            argv,
        } => {
            let (command, args) = argv.split_first().expect("clap requires at least one arg");
            let resp = client
                .start(StartRequest {
                    command: command.clone(),
                    args: args.to_vec(),
                    opts: Some(JobOpts {
                        cpu_weight: cpu,
                        io_weight: io,
                        mem_limit: mem,
                    }),
                })
                .await?
                .into_inner();
            println!("Started job {}", resp.id);
            println!("  logs:   jobctl logs {}", resp.id);
            println!("  status: jobctl status {}", resp.id);
            println!("  stop:   jobctl stop {}", resp.id);
        }
        Command::Stop { id } => {
            client.stop(StopRequest { id: id.clone() }).await?;
            println!("Stopped job {id}");
        }
        Command::Status { id } => {
            let resp = client.status(StatusRequest { id }).await?.into_inner();
            let status = resp
                .job_status
                .ok_or("server returned an empty status response")?;
            println!("Job Status");
            println!("  ID: {}", status.id);
            println!("  PID: {}", status.pid);
            println!("  Running: {}", status.running);
            println!("  Exit Code: {}", status.exit_code);
        }
        Command::Logs { id, follow } => {
            let mut stream = client
                .output(OutputRequest { id, follow })
                .await?
                .into_inner();
            while let Some(frame) = stream.message().await? {
                println!("{}", String::from_utf8_lossy(&frame.bytes));
            }
        }
    }

    Ok(())
}
