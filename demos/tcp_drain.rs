//! A drain-aware TCP line server.
//!
//! ```sh
//! cargo run --example tcp_drain --features tcp
//! ```
//!
//! Talk to it with netcat:
//!
//! ```sh
//! nc 127.0.0.1 62810
//! hello        # echoed back
//! sub          # upgrade to streaming: ticks get pushed until the drain
//! ```
//!
//! Press CTRL+C once: the listener keeps accepting for a short grace, live
//! responses finish, idle connections close, and streaming connections are
//! shed in batches over ten seconds. If the 30s task limit runs out the
//! remaining connections are destroyed outright.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use weir::error::BoxError;
use weir::graceful::Shutdown;
use weir::policy::DrainPolicy;
use weir::rt::Executor;
use weir::tcp::{TcpConn, TcpListener};
use weir::{DrainController, Service};

const ADDRESS: &str = "127.0.0.1:62810";

struct LineServer;

impl Service<TcpConn> for LineServer {
    type Output = ();
    type Error = BoxError;

    async fn serve(&self, conn: TcpConn) -> Result<(), BoxError> {
        let handle = conn.handle();
        info!(key = %handle.key(), "connection accepted");

        let (reader, mut writer) = tokio::io::split(conn);
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            if line == "sub" {
                if handle.upgrade().is_refused() {
                    info!(key = %handle.key(), "upgrade refused; draining");
                    return Ok(());
                }
                info!(key = %handle.key(), "connection upgraded to streaming");
                let mut seq = 0u64;
                loop {
                    tokio::select! {
                        _ = handle.destroyed() => {
                            info!(key = %handle.key(), "stream shed");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {
                            seq += 1;
                            writer.write_all(format!("tick {seq}\n").as_bytes()).await?;
                        }
                    }
                }
            }

            handle.begin_request();
            writer.write_all(format!("echo: {line}\n").as_bytes()).await?;
            handle.end_request();

            if handle.marked_last() {
                info!(key = %handle.key(), "final response served; closing");
                writer.shutdown().await?;
                break;
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::DEBUG.into())
                .from_env_lossy(),
        )
        .init();

    let controller = DrainController::builder()
        .with_policy(DrainPolicy::Graceful)
        .with_accept_grace(Duration::from_secs(2))
        .with_close_idle_after(Duration::from_secs(5))
        .with_shed_window(Duration::from_secs(10))
        .build();

    let shutdown = Shutdown::default();

    let listener = TcpListener::build(controller.clone())
        .with_executor(Executor::graceful(shutdown.guard()))
        .bind(ADDRESS)
        .await?;
    info!("listening on {}", listener.local_addr()?);

    shutdown.spawn_task(listener.serve(LineServer));

    shutdown.spawn_task_fn({
        let controller = controller.clone();
        move |guard| async move {
            guard.cancelled().await;
            let report = controller.suspend();
            info!(
                destroyed = report.destroyed,
                marked_last = report.marked_last,
                left_open = report.left_open,
                shed_scheduled = report.shed_scheduled,
                "suspending on shutdown signal"
            );
        }
    });

    match shutdown.shutdown_with_limit(Duration::from_secs(30)).await {
        Ok(elapsed) => {
            info!(?elapsed, "drained and shut down cleanly");
        }
        Err(err) => {
            let report = controller.destroy();
            warn!(
                error = ?err,
                destroyed = report.destroyed,
                "shutdown limit hit; destroyed what was left"
            );
        }
    }

    Ok(())
}
