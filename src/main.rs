//! Termlab - disposable web-terminal lab sessions on Docker.
//!
//! Usage:
//!   termlab serve [--port 8080] [--host-ip 1.2.3.4] [--capacity 5]

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use bollard::Docker;
use clap::{Parser, Subcommand};

mod bans;
mod http_server;
mod lifecycle;
mod notify;
mod runtime;
mod state;
#[cfg(test)]
mod testing;
mod watchdog;

use bans::BanList;
use notify::{AuditEvent, AuditSink, LogSink, Severity, WebhookSink};
use runtime::DockerRuntime;
use state::{AppState, LabConfig};

#[derive(Parser, Debug)]
#[command(name = "termlab")]
#[command(about = "Disposable terminal lab sessions on Docker")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the lab server
    Serve {
        /// Port the control API listens on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Public address users connect to
        #[arg(long, default_value = "127.0.0.1")]
        host_ip: String,

        /// Docker image for lab containers
        #[arg(long, default_value = "lab-image")]
        image: String,

        /// First host port for labs
        #[arg(long, default_value = "9500")]
        base_port: u16,

        /// Maximum simultaneous labs
        #[arg(long, default_value = "5")]
        capacity: usize,

        /// Lab lifetime in seconds
        #[arg(long, default_value = "3600")]
        session_secs: u64,

        /// Slack added before the expiry timer fires
        #[arg(long, default_value = "60")]
        grace_secs: u64,

        /// Watchdog sweep interval in seconds
        #[arg(long, default_value = "60")]
        watchdog_secs: u64,

        /// JSON file holding the ban table
        #[arg(long, default_value = "banned_users.json")]
        ban_file: PathBuf,

        /// Bearer token for admin routes (unset disables them)
        #[arg(long, env = "TERMLAB_ADMIN_TOKEN")]
        admin_token: Option<String>,

        /// Operator webhook for audit events (unset logs them instead)
        #[arg(long, env = "TERMLAB_WEBHOOK_URL")]
        webhook_url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            port,
            host_ip,
            image,
            base_port,
            capacity,
            session_secs,
            grace_secs,
            watchdog_secs,
            ban_file,
            admin_token,
            webhook_url,
        } => {
            let docker = match Docker::connect_with_socket_defaults() {
                Ok(docker) => docker,
                Err(e) => {
                    eprintln!("Error: cannot reach the Docker daemon: {}", e);
                    exit(1);
                }
            };

            let config = LabConfig {
                host_ip,
                image,
                base_port,
                capacity,
                session_secs,
                grace_secs,
                watchdog_secs,
                admin_token,
            };

            let runtime = Arc::new(DockerRuntime::new(docker));
            let bans = BanList::load(&ban_file);
            let audit: Arc<dyn AuditSink> = match webhook_url {
                Some(url) => Arc::new(WebhookSink::new(url)),
                None => Arc::new(LogSink),
            };

            let state = AppState::new(config, runtime, bans, audit);

            state
                .audit
                .send(AuditEvent::new(
                    "System online",
                    "the lab service is up".to_string(),
                    Severity::Info,
                ))
                .await;

            watchdog::spawn_watchdog(state.clone());
            http_server::run_server(port, state).await;
        }
    }
}
