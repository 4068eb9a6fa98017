//! Log streaming from a container's pod to a caller-supplied sink.
//!
//! The stream always targets the fixed `main` container of the first
//! matching pod. Bytes are read in fixed-size chunks and forwarded verbatim
//! through the stdout framing layer. In follow mode the caller's stop
//! signal cancels an in-flight blocking read, bounding cancellation latency
//! to a single chunk.

use kube::api::LogParams;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::debug;

use super::deploy::MAIN_CONTAINER;
use super::ioproxy::{FrameWriter, StreamType};
use super::{Backend, BackendResult};
use crate::container::Container;

/// Chunk size for log reads.
const LOG_CHUNK: usize = 255;

impl Backend {
    /// Stream the container's logs to `sink`.
    ///
    /// Requests the last `tail_lines` lines and, with `follow`, keeps
    /// delivering new output until the stream ends or `stop` fires. Stream
    /// end and a failing sink both terminate quietly with success: a caller
    /// cannot distinguish delivered-everything from sink-gave-up, which the
    /// wire layer accepts because the client connection is gone in the
    /// failing case anyway.
    pub async fn logs<W>(
        &self,
        tainr: &Container,
        follow: bool,
        tail_lines: i64,
        stop: watch::Receiver<bool>,
        sink: W,
    ) -> BackendResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let pod_name = self.first_pod_name(tainr).await?;
        let params = LogParams {
            container: Some(MAIN_CONTAINER.to_string()),
            follow,
            tail_lines: Some(tail_lines),
            ..LogParams::default()
        };
        let stream = self.pods().log_stream(&pod_name, &params).await?;
        debug!(
            "Streaming logs of pod {} for container {} (follow: {})",
            pod_name,
            tainr.short_id(),
            follow
        );
        pump(Box::pin(stream.compat()), sink, follow, stop).await
    }
}

/// Copy log bytes from the cluster stream to the sink, framed as stdout.
///
/// Termination rules:
/// - end of stream: success, in both modes (while the server merely pauses,
///   the read stays pending rather than returning zero, so waiting happens
///   inside the read itself)
/// - sink write failure or zero bytes accepted: success, quietly
/// - stop signal while following: success; the in-flight read is dropped,
///   so cancellation takes at most one chunk's latency
async fn pump<R, W>(
    mut stream: R,
    sink: W,
    follow: bool,
    mut stop: watch::Receiver<bool>,
) -> BackendResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut out = FrameWriter::new(sink, StreamType::Stdout);
    let mut buf = [0u8; LOG_CHUNK];
    loop {
        let n = if follow {
            tokio::select! {
                read = stream.read(&mut buf) => read?,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
        } else {
            stream.read(&mut buf).await?
        };

        if n == 0 {
            break;
        }

        match out.write_frame(&buf[..n]).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    let _ = out.flush().await;
    Ok(())
}
