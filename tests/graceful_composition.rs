//! Connection draining and task-level graceful shutdown working together:
//! the controller empties the connections, `tokio-graceful` waits for the
//! tasks, and the two meet in the middle.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use weir::DrainController;
use weir::error::BoxError;
use weir::graceful::Shutdown;
use weir::rt::Executor;
use weir_tcp::{TcpConn, TcpListener};

struct Echo;

impl weir::Service<TcpConn> for Echo {
    type Output = ();
    type Error = BoxError;

    async fn serve(&self, conn: TcpConn) -> Result<(), BoxError> {
        let handle = conn.handle();
        let (reader, mut writer) = tokio::io::split(conn);
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            handle.begin_request();
            writer.write_all(format!("echo: {line}\n").as_bytes()).await?;
            handle.end_request();
            if handle.marked_last() {
                writer.shutdown().await?;
                break;
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn drained_connections_then_finished_tasks() {
    let (trigger, signal) = tokio::sync::oneshot::channel::<()>();
    let shutdown = Shutdown::new(async { drop(signal.await) });

    let controller = DrainController::new();
    let listener = TcpListener::build(controller.clone())
        .with_executor(Executor::graceful(shutdown.guard()))
        .bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("listener local addr");
    shutdown.spawn_task(listener.serve(Echo));

    let stream = TcpStream::connect(addr).await.expect("connect");
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"hello\n").await.expect("send line");
    assert_eq!(
        Some("echo: hello".to_owned()),
        timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("timely echo")
            .expect("read echo")
    );

    // drain the connections, then let the task shutdown run its course
    let report = controller.suspend();
    assert_eq!(1, report.destroyed, "the idle echo connection");

    trigger.send(()).expect("deliver shutdown signal");
    timeout(
        Duration::from_secs(5),
        shutdown.shutdown_with_limit(Duration::from_secs(5)),
    )
    .await
    .expect("timely shutdown")
    .expect("all tasks stop once the connections are gone");

    assert_eq!(0, controller.tracked_connections());
}
