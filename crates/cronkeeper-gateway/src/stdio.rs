//! Newline-delimited JSON over stdin/stdout.
//!
//! Each input line is one request frame; each output line is one response
//! frame. Requests run concurrently, so responses may come back out of order
//! and callers correlate them by `id`. Logs never go to stdout.

use std::sync::Arc;

use cronkeeper_protocol::frames::{parse_request, ResFrame};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::rpc;

/// Serve the process's stdin/stdout until EOF or shutdown.
pub async fn serve(app: Arc<AppState>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    serve_io(app, tokio::io::stdin(), tokio::io::stdout(), shutdown).await
}

/// Serve frames read from `reader`, writing responses to `writer`.
pub async fn serve_io<R, W>(
    app: Arc<AppState>,
    reader: R,
    mut writer: W,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<ResFrame>(64);
    let write_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let mut line = match serde_json::to_string(&frame) {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "could not encode response frame");
                    continue;
                }
            };
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    info!("stdio transport ready");
    let mut lines = BufReader::new(reader).lines();
    let mut inflight = JoinSet::new();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let tx = out_tx.clone();
                match parse_request(&line) {
                    Ok(req) => {
                        let app = app.clone();
                        inflight.spawn(async move {
                            let res = rpc::route(&req, &app).await;
                            let _ = tx.send(res).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "rejected stdio frame");
                        let _ = tx.send(e.to_response()).await;
                    }
                }
            }
            Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    while inflight.join_next().await.is_some() {}
    drop(out_tx);
    write_task.await??;
    info!("stdio transport closed");
    Ok(())
}
