use crate::error::{Result, SensemeError};
use crate::protocol::Command;
use std::future::Future;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Capacity of the inbound chunk queue per connection
const RECEIVE_QUEUE_SIZE: usize = 64;

const READ_BUFFER_SIZE: usize = 4096;

/// One raw read from the socket, or the error that ended reading
pub(crate) type Inbound = std::io::Result<Vec<u8>>;

/// Task handle that aborts the task when dropped
#[derive(Debug)]
pub(crate) struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Write half of a connection, shared with the refresh task and setters
#[derive(Debug, Clone)]
pub(crate) struct CommandSender {
    tx: mpsc::UnboundedSender<String>,
}

impl CommandSender {
    /// Queue a command; does not wait for it to reach the device
    pub(crate) fn send(&self, command: &Command) -> Result<()> {
        let encoded = command.encode();
        tracing::debug!("Sending: {}", encoded);
        self.tx
            .send(encoded)
            .map_err(|_| SensemeError::ConnectionClosed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Persistent TCP connection to a device
///
/// A reader task pushes raw chunks onto a bounded queue and a writer task
/// drains outgoing commands. Both tasks end when the connection is dropped.
pub(crate) struct Connection {
    inbound: mpsc::Receiver<Inbound>,
    sender: CommandSender,
    _reader: TaskGuard,
    _writer: TaskGuard,
}

impl Connection {
    pub(crate) async fn connect(name: &str, addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut read, mut write) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::channel::<Inbound>(RECEIVE_QUEUE_SIZE);

        let writer_name = name.to_string();
        let writer = TaskGuard::spawn(async move {
            while let Some(command) = out_rx.recv().await {
                if let Err(e) = write.write_all(command.as_bytes()).await {
                    tracing::error!("{}: Failed to send command: {}", writer_name, e);
                    break;
                }
            }
            let _ = write.shutdown().await;
        });

        let reader_name = name.to_string();
        let reader = TaskGuard::spawn(async move {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match read.read(&mut buffer).await {
                    Ok(0) => {
                        tracing::debug!("{}: Connection closed by device", reader_name);
                        break;
                    }
                    Ok(n) => match in_tx.try_send(Ok(buffer[..n].to_vec())) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::error!("{}: Receive queue full", reader_name);
                        }
                        Err(TrySendError::Closed(_)) => break,
                    },
                    Err(e) => {
                        let _ = in_tx.try_send(Err(e));
                        break;
                    }
                }
            }
        });

        Ok(Self {
            inbound: in_rx,
            sender: CommandSender { tx: out_tx },
            _reader: reader,
            _writer: writer,
        })
    }

    /// Next chunk from the device; `None` once the device closed the socket
    pub(crate) async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    pub(crate) fn sender(&self) -> CommandSender {
        self.sender.clone()
    }
}
