//! TCP line transport.
//!
//! Agents keep a connection open and write one JSON event per line. Every
//! connection gets its own read task; a bad line or a broken peer never
//! affects other connections.

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use loadpub_common::protocol::{DecodeError, decode_line};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::queue::InboundQueue;

/// Running listener. Dropping it has the same effect as [`Listener::stop`]
/// without waiting for the connections to close.
pub struct Listener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Bind `addr` and start accepting connections.
    pub async fn start(
        addr: impl ToSocketAddrs,
        queue: InboundQueue,
        max_line_bytes: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(listener, queue, max_line_bytes, shutdown_rx));
        info!(addr = %local_addr, "Listening for agents");

        Ok(Self {
            local_addr,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and end every open connection. Lines already read are
    /// in the queue when this returns. Calling it again is a no-op.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }
            info!(addr = %self.local_addr, "Listener stopped");
        }
    }
}

/// Pause before accepting again after `consecutive_errors` failures in a row.
/// Errors such as descriptor exhaustion persist until connections close.
fn accept_backoff(consecutive_errors: u32) -> Duration {
    const STEP: Duration = Duration::from_millis(50);
    const MAX: Duration = Duration::from_secs(1);
    STEP.saturating_mul(consecutive_errors).min(MAX)
}

async fn accept_loop(
    listener: TcpListener,
    queue: InboundQueue,
    max_line_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    let connection_shutdown = shutdown.clone();
    let mut accept_errors: u32 = 0;

    loop {
        if accept_errors > 0 {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = tokio::time::sleep(accept_backoff(accept_errors)) => {}
            }
        }

        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    accept_errors = 0;
                    let connection = Connection {
                        id: Uuid::new_v4(),
                        peer,
                        queue: queue.clone(),
                        max_line_bytes,
                    };
                    connections.spawn(connection.run(stream, connection_shutdown.clone()));
                }
                Err(e) => {
                    accept_errors = accept_errors.saturating_add(1);
                    warn!(error = %e, consecutive = accept_errors, "Accept error");
                }
            },
            // Reap finished connections so the set does not grow unbounded.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

struct Connection {
    id: Uuid,
    peer: SocketAddr,
    queue: InboundQueue,
    max_line_bytes: usize,
}

impl Connection {
    async fn run(self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        debug!(connection_id = %self.id, peer = %self.peer, "Agent connected");
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        let mut received: u64 = 0;

        loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                read = read_line_bounded(&mut reader, &mut line, self.max_line_bytes) => read,
            };
            match read {
                Ok(LineRead::Line) => {
                    if self.accept(&line) {
                        received += 1;
                    }
                }
                Ok(LineRead::Overlong(len)) => {
                    warn!(
                        connection_id = %self.id,
                        peer = %self.peer,
                        len,
                        max = self.max_line_bytes,
                        "Line exceeds maximum length, discarded"
                    );
                }
                Ok(LineRead::Eof) => break,
                Err(e) => {
                    debug!(connection_id = %self.id, peer = %self.peer, error = %e, "Read error");
                    break;
                }
            }
        }

        debug!(connection_id = %self.id, peer = %self.peer, received, "Agent disconnected");
    }

    fn accept(&self, line: &[u8]) -> bool {
        let text = String::from_utf8_lossy(line);
        match decode_line(&text) {
            Ok(event) => {
                trace!(connection_id = %self.id, kind = event.type_name(), "Event received");
                self.queue.enqueue(event);
                true
            }
            Err(DecodeError::Empty) => false,
            Err(e) => {
                warn!(connection_id = %self.id, peer = %self.peer, error = %e, "Undecodable line discarded");
                false
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    /// `buf` holds the line without its terminator.
    Line,
    /// The line was longer than allowed; `buf` is empty.
    Overlong(usize),
    Eof,
}

/// Read up to the next `\n`, keeping at most `max` bytes. A final line without
/// terminator counts as a line.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut total = 0usize;
    let mut overlong = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (total, overlong) {
                (0, _) => LineRead::Eof,
                (len, true) => LineRead::Overlong(len),
                _ => LineRead::Line,
            });
        }

        let (chunk, consumed, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (&available[..i], i + 1, true),
            None => (available, available.len(), false),
        };
        total += chunk.len();
        if !overlong {
            if buf.len() + chunk.len() > max {
                overlong = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        reader.consume(consumed);

        if done {
            return Ok(if overlong {
                LineRead::Overlong(total)
            } else {
                LineRead::Line
            });
        }
    }
}
