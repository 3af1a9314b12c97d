//! muxprobe: open one HTTP/2 connection, fan out requests, report responses.
//!
//! # Usage
//!
//! ```bash
//! muxprobe --port 9590 --token abc --count 4
//! muxprobe --tls --ca-file ca.pem --server-name gateway.local --method post --data 'test data!'
//! ```
//!
//! Exit status: 0 when every stream got a response, 1 on a fatal error, 2 when
//! the response deadline passed, 3 when streams failed or the peer violated
//! the protocol.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, ValueEnum};
use muxprobe::{CompletionReport, HarnessConfig, HarnessError, RequestKind, TrustPolicy};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "muxprobe")]
#[command(about = "Issue concurrent requests over a single HTTP/2 connection and correlate the responses")]
struct Args {
    #[arg(long, env = "MUXPROBE_HOST", default_value = muxprobe::DEFAULT_HOST)]
    host: String,

    #[arg(long, env = "MUXPROBE_PORT", default_value_t = muxprobe::DEFAULT_PORT)]
    port: u16,

    /// Negotiate h2 over TLS instead of cleartext prior knowledge
    #[arg(long, env = "MUXPROBE_TLS")]
    tls: bool,

    /// PEM bundle of trust anchors (default: web PKI roots)
    #[arg(long, env = "MUXPROBE_CA_FILE", conflicts_with = "insecure")]
    ca_file: Option<PathBuf>,

    /// Accept any server certificate. Test servers only.
    #[arg(long, env = "MUXPROBE_INSECURE")]
    insecure: bool,

    /// Name to verify the certificate against, if not the host
    #[arg(long, env = "MUXPROBE_SERVER_NAME")]
    server_name: Option<String>,

    /// Sent as `authorization: Bearer <token>`
    #[arg(long, env = "MUXPROBE_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "MUXPROBE_PATH", default_value = muxprobe::DEFAULT_PATH)]
    path: String,

    #[arg(long, value_enum, env = "MUXPROBE_METHOD", default_value_t = MethodArg::Get)]
    method: MethodArg,

    /// Request body for POST
    #[arg(long, env = "MUXPROBE_DATA", default_value = "test data!")]
    data: String,

    /// Streams to open in the batch
    #[arg(long, env = "MUXPROBE_COUNT", default_value_t = 1)]
    count: usize,

    #[arg(
        long = "accept-encoding",
        env = "MUXPROBE_ACCEPT_ENCODING",
        value_delimiter = ',',
        default_value = "gzip,deflate"
    )]
    accept_encodings: Vec<String>,

    #[arg(long, env = "MUXPROBE_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    connect_timeout_ms: u64,

    #[arg(long, env = "MUXPROBE_HANDSHAKE_TIMEOUT_MS", default_value_t = 5000)]
    handshake_timeout_ms: u64,

    #[arg(long, env = "MUXPROBE_RESPONSE_TIMEOUT_MS", default_value_t = 5000)]
    response_timeout_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum MethodArg {
    Get,
    Head,
    Options,
    Post,
}

impl Args {
    fn into_config(self) -> HarnessConfig {
        let request = match self.method {
            MethodArg::Get => RequestKind::Get,
            MethodArg::Head => RequestKind::Head,
            MethodArg::Options => RequestKind::Options,
            MethodArg::Post => RequestKind::Post {
                body: Bytes::from(self.data),
            },
        };

        let mut config = HarnessConfig::new(self.host, self.port)
            .with_path(self.path)
            .with_request(request)
            .with_count(self.count)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_handshake_timeout(Duration::from_millis(self.handshake_timeout_ms))
            .with_response_timeout(Duration::from_millis(self.response_timeout_ms));
        config.accept_encodings = self.accept_encodings;

        if self.tls {
            let trust = match (self.insecure, self.ca_file) {
                (true, _) => TrustPolicy::AcceptAny,
                (false, Some(path)) => TrustPolicy::PemFile(path),
                (false, None) => TrustPolicy::WebPkiRoots,
            };
            config = config.with_tls(trust);
        }
        if let Some(name) = self.server_name {
            config = config.with_server_name(name);
        }
        if let Some(token) = self.token {
            config = config.with_token(token);
        }
        config
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.into_config();
    match muxprobe::run(&config) {
        Ok(report) => {
            print_report(&report);
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(3)
            }
        }
        Err(e) => {
            eprintln!("muxprobe: {e}");
            if let Some(report) = e.report() {
                print_report(report);
            }
            match e {
                HarnessError::ResponseTimeout { .. } => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn print_report(report: &CompletionReport) {
    for (id, response) in &report.responses {
        println!("stream {id}: {} ({} bytes)", response.status, response.body.len());
    }
    for (id, failure) in &report.failures {
        println!("stream {id}: failed: {failure}");
    }
    for id in &report.unresolved {
        println!("stream {id}: no response");
    }
    for violation in &report.violations {
        println!("{violation}");
    }
}
