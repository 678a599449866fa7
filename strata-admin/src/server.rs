use crate::handlers::AdminState;
use crate::rpc::RpcDispatcher;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, error, info};

/// Serve line-delimited JSON-RPC 2.0 over a local unix socket. One line in,
/// at most one line out (notifications are silent).
pub async fn serve(
    socket_path: &Path,
    dispatcher: Arc<RpcDispatcher>,
    state: Arc<AdminState>,
) -> anyhow::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "Admin interface listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let dispatcher = Arc::clone(&dispatcher);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        debug!(len = line.len(), "Admin request");
                        if let Some(reply) = dispatcher.handle_call(&line).await {
                            let mut out = reply.into_bytes();
                            out.push(b'\n');
                            if write_half.write_all(&out).await.is_err() {
                                break;
                            }
                        }
                        if state.shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "Admin connection error");
                        break;
                    }
                }
            }
        });
    }
}

/// Run the admin plane on its own thread with a current-thread tokio
/// runtime, keeping it fully isolated from the monoio data plane.
pub fn spawn_admin_thread(
    state: Arc<AdminState>,
    dispatcher: RpcDispatcher,
    socket_path: std::path::PathBuf,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("strata-admin".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Failed to build tokio runtime for admin");
            rt.block_on(async {
                if let Err(e) = serve(&socket_path, Arc::new(dispatcher), state).await {
                    error!(error = %e, "Admin interface failed");
                }
            });
        })
        .expect("Failed to spawn admin thread")
}
