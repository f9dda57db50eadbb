//! Control channel: a Unix socket per running task.
//!
//! One command per connection, answered with a single reply starting with
//! `OK` or `ERR`. Commands only read the [`StateStore`] or flip its durable
//! flags; the scheduler picks the flags up on its next poll.
//!
//! ```text
//! pause | pause-workflow        resume | resume-workflow      cancel
//! pause <block>                 resume <block>                cancel <block>
//! status                        log <block>                   list
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ReinError;
use crate::models::BlockStatus;
use crate::store::StateStore;
use crate::task_dir::RunLog;

const LOG_LINES: usize = 20;

/// `<socket_dir>/rein-<task_id>.sock`
pub fn socket_path(socket_dir: &Path, task_id: &str) -> PathBuf {
    socket_dir.join(format!("rein-{}.sock", task_id))
}

/// Execute one control command against the store and return the reply.
pub async fn handle_command(store: &StateStore, task_id: &str, log: &RunLog, line: &str) -> String {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or("").to_lowercase();
    let arg = parts.next();

    let reply = match execute(store, task_id, log, &verb, arg).await {
        Ok(reply) => reply,
        Err(e) => format!("ERR {}", e),
    };
    let outcome = if reply.starts_with("OK") { "OK" } else { "ERR" };
    log.write(format!("COMMAND | {} | {}", line.trim(), outcome));
    reply
}

async fn execute(
    store: &StateStore,
    task_id: &str,
    log: &RunLog,
    verb: &str,
    arg: Option<&str>,
) -> Result<String, ReinError> {
    match (verb, arg) {
        ("pause" | "pause-workflow", None) => Ok(if store.request_pause(task_id).await? {
            "OK workflow paused".to_string()
        } else {
            "OK workflow already paused".to_string()
        }),
        ("resume" | "resume-workflow", None) => Ok(if store.request_resume(task_id).await? {
            "OK workflow resumed".to_string()
        } else {
            "OK workflow not paused".to_string()
        }),
        ("cancel", None) => {
            store.request_cancel(task_id).await?;
            Ok("OK cancelling".to_string())
        }
        ("pause", Some(block)) => block_request(store.hold_block(task_id, block).await?, "held", block),
        ("resume", Some(block)) => {
            block_request(store.release_block(task_id, block).await?, "released", block)
        }
        ("cancel", Some(block)) => {
            block_request(store.cancel_block(task_id, block).await?, "cancelling", block)
        }
        ("status", None) => status_line(store, task_id).await,
        ("list", None) => {
            let task = store.get(task_id).await?;
            let mut lines = vec![format!("OK {} blocks", task.blocks.len())];
            for b in &task.blocks {
                lines.push(format!(
                    "{} {} run={}/{} phase={}{}",
                    b.name,
                    b.status,
                    b.run_count,
                    b.max_runs,
                    b.phase,
                    if b.held { " held" } else { "" }
                ));
            }
            Ok(lines.join("\n"))
        }
        ("log", Some(block)) => {
            let task = store.get(task_id).await?;
            if task.block(block).is_none() {
                return Ok(format!("ERR unknown block '{}'", block));
            }
            let prefix = format!("{} ", block);
            let matching: Vec<String> = log
                .tail(usize::MAX)
                .into_iter()
                .filter(|l| {
                    l.split(" | ")
                        .skip(1)
                        .any(|field| field == block || field.starts_with(&prefix))
                })
                .collect();
            let start = matching.len().saturating_sub(LOG_LINES);
            let mut lines = vec![format!("OK {} lines", matching.len() - start)];
            lines.extend_from_slice(&matching[start..]);
            Ok(lines.join("\n"))
        }
        ("", _) => Ok("ERR empty command".to_string()),
        (other, _) => Ok(format!("ERR unknown command '{}'", other)),
    }
}

fn block_request(found: bool, action: &str, block: &str) -> Result<String, ReinError> {
    Ok(if found {
        format!("OK {} {}", action, block)
    } else {
        format!("ERR unknown block '{}'", block)
    })
}

/// `running=… ready=… pending=… done=… failed=… skipped=… waiting=…
/// workflow_paused=yes|no task=<status>`
pub async fn status_line(store: &StateStore, task_id: &str) -> Result<String, ReinError> {
    let task = store.get(task_id).await?;
    Ok(format!(
        "OK running={} ready={} pending={} done={} failed={} skipped={} waiting={} workflow_paused={} task={}",
        task.count(BlockStatus::Running),
        task.count(BlockStatus::Ready),
        task.count(BlockStatus::Pending),
        task.count(BlockStatus::Done),
        task.count(BlockStatus::Failed),
        task.count(BlockStatus::Skipped),
        task.count(BlockStatus::Waiting),
        if task.paused { "yes" } else { "no" },
        task.status
    ))
}

#[cfg(unix)]
pub use unix::{send_command, ControlServer};

#[cfg(not(unix))]
pub use fallback::ControlServer;

#[cfg(not(unix))]
mod fallback {
    use super::*;

    /// Unix sockets are unavailable; the task runs without a control channel.
    pub struct ControlServer;

    impl ControlServer {
        pub async fn start(
            path: PathBuf,
            _store: StateStore,
            _task_id: String,
            log: Arc<RunLog>,
        ) -> Result<Self, ReinError> {
            log.write(format!("CONTROL | unavailable on this platform: {}", path.display()));
            tracing::warn!("[Control] Control sockets need a Unix platform");
            Ok(Self)
        }

        pub async fn shutdown(self) {}
    }
}

#[cfg(unix)]
mod unix {
    use super::*;

    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    /// Socket listener for one task. Dropping it without `shutdown` leaves
    /// the socket file behind.
    pub struct ControlServer {
        path: PathBuf,
        stop: Option<oneshot::Sender<()>>,
        handle: JoinHandle<()>,
    }

    impl ControlServer {
        pub async fn start(
            path: PathBuf,
            store: StateStore,
            task_id: String,
            log: Arc<RunLog>,
        ) -> Result<Self, ReinError> {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let listener = UnixListener::bind(&path).map_err(|e| {
                ReinError::Control(format!("bind {}: {}", path.display(), e))
            })?;
            log.write(format!("CONTROL | listening on {}", path.display()));
            tracing::info!("[Control] Listening on {}", path.display());

            let (stop, mut stopped) = oneshot::channel::<()>();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = &mut stopped => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => {
                                let store = store.clone();
                                let task_id = task_id.clone();
                                let log = log.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = serve(stream, &store, &task_id, &log).await {
                                        tracing::warn!("[Control] Connection error: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::warn!("[Control] Accept failed: {}", e);
                            }
                        }
                    }
                }
            });

            Ok(Self {
                path,
                stop: Some(stop),
                handle,
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Stop accepting and remove the socket file.
        pub async fn shutdown(mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            let _ = (&mut self.handle).await;
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!("[Control] Socket already gone: {}", e);
            }
        }
    }

    async fn serve(
        stream: UnixStream,
        store: &StateStore,
        task_id: &str,
        log: &RunLog,
    ) -> std::io::Result<()> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut line = String::new();
        match tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                write.write_all(b"ERR timeout\n").await?;
                return Ok(());
            }
        }
        let reply = handle_command(store, task_id, log, line.trim()).await;
        write.write_all(reply.as_bytes()).await?;
        write.write_all(b"\n").await?;
        write.shutdown().await
    }

    /// Send one command and return the trimmed reply.
    pub async fn send_command(socket_path: &Path, command: &str) -> Result<String, ReinError> {
        let mut stream = UnixStream::connect(socket_path).await.map_err(|e| {
            ReinError::Control(format!("connect {}: {}", socket_path.display(), e))
        })?;
        stream
            .write_all(format!("{}\n", command.trim()).as_bytes())
            .await
            .map_err(|e| ReinError::Control(format!("send: {}", e)))?;
        let mut reply = String::new();
        stream
            .read_to_string(&mut reply)
            .await
            .map_err(|e| ReinError::Control(format!("receive: {}", e)))?;
        Ok(reply.trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{BlockRunState, TaskState};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, StateStore, RunLog) {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(Database::open_in_memory().unwrap());
        let mut task = TaskState::new("task-1".to_string(), "demo".to_string(), serde_json::json!({}));
        let mut draft = BlockRunState::new("draft", 1, 1, 0);
        draft.status = BlockStatus::Done;
        task.blocks = vec![draft, BlockRunState::new("review", 1, 2, 1)];
        store.create(&task).await.unwrap();
        let log = RunLog::new(tmp.path().join("rein.log"));
        (tmp, store, log)
    }

    #[tokio::test]
    async fn test_status_reply() {
        let (_tmp, store, log) = setup().await;
        let reply = handle_command(&store, "task-1", &log, "status").await;
        assert_eq!(
            reply,
            "OK running=0 ready=0 pending=1 done=1 failed=0 skipped=0 waiting=0 workflow_paused=no task=pending"
        );
    }

    #[tokio::test]
    async fn test_pause_flips_durable_flag_and_logs() {
        let (_tmp, store, log) = setup().await;
        assert_eq!(handle_command(&store, "task-1", &log, "PAUSE").await, "OK workflow paused");
        assert!(store.flags("task-1").await.unwrap().paused);
        assert!(handle_command(&store, "task-1", &log, "status")
            .await
            .contains("workflow_paused=yes"));
        assert_eq!(
            handle_command(&store, "task-1", &log, "resume-workflow").await,
            "OK workflow resumed"
        );
        assert!(log.tail(10)[0].ends_with("COMMAND | PAUSE | OK"));
    }

    #[tokio::test]
    async fn test_block_commands() {
        let (_tmp, store, log) = setup().await;
        assert_eq!(handle_command(&store, "task-1", &log, "pause review").await, "OK held review");
        assert!(store.blocks.get("task-1", "review").await.unwrap().unwrap().held);
        assert_eq!(
            handle_command(&store, "task-1", &log, "cancel nope").await,
            "ERR unknown block 'nope'"
        );
        assert_eq!(
            handle_command(&store, "task-1", &log, "cancel review").await,
            "OK cancelling review"
        );
        assert!(
            store
                .blocks
                .get("task-1", "review")
                .await
                .unwrap()
                .unwrap()
                .cancel_requested
        );
    }

    #[tokio::test]
    async fn test_list_log_and_unknown() {
        let (_tmp, store, log) = setup().await;
        log.write("BLOCK STARTED | draft | phase=1 | run=1/1");
        log.write("BLOCK STARTED | review | phase=2 | run=1/1");
        log.write("BLOCK DONE | draft | run=1");

        let list = handle_command(&store, "task-1", &log, "list").await;
        assert!(list.starts_with("OK 2 blocks"));
        assert!(list.contains("draft done run=0/1 phase=1"));

        let lines = handle_command(&store, "task-1", &log, "log draft").await;
        assert!(lines.starts_with("OK 2 lines"));
        assert!(!lines.contains("review"));

        assert!(handle_command(&store, "task-1", &log, "explode")
            .await
            .starts_with("ERR unknown command"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_socket_round_trip() {
        let (tmp, store, _log) = setup().await;
        let log = Arc::new(RunLog::new(tmp.path().join("socket.log")));
        let path = socket_path(tmp.path(), "task-1");
        let server = ControlServer::start(path.clone(), store.clone(), "task-1".to_string(), log)
            .await
            .unwrap();

        let reply = send_command(&path, "pause").await.unwrap();
        assert_eq!(reply, "OK workflow paused");
        assert!(store.flags("task-1").await.unwrap().paused);

        server.shutdown().await;
        assert!(!path.exists());
        assert!(send_command(&path, "status").await.is_err());
    }
}
