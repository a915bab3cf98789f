use crate::device::SecondaryInfo;
use crate::error::{Result, SensemeError};
use crate::protocol::{Command, DiscoveryReply, FrameDecoder, Message};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Short-lived request/response connection
///
/// Used to classify a device or fill in its secondary info without starting
/// a session. The socket is closed when the client is dropped.
pub(crate) struct QueryClient {
    stream: TcpStream,
    decoder: FrameDecoder,
    frames: VecDeque<String>,
    buffer: Vec<u8>,
}

impl QueryClient {
    pub(crate) async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            frames: VecDeque::new(),
            buffer: vec![0u8; 1024],
        })
    }

    async fn next_frame(&mut self) -> Result<String> {
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(frame);
            }
            let n = self.stream.read(&mut self.buffer).await?;
            if n == 0 {
                return Err(SensemeError::ConnectionClosed);
            }
            let frames = self.decoder.decode(&self.buffer[..n]);
            self.frames.extend(frames);
        }
    }

    async fn send(&mut self, command: &Command) -> Result<()> {
        let encoded = command.encode();
        tracing::debug!("Query: {}", encoded);
        self.stream.write_all(encoded.as_bytes()).await?;
        Ok(())
    }

    /// Ask `target` for `path` and wait for the matching reply value
    ///
    /// Unrelated pushed records are skipped.
    pub(crate) async fn query(&mut self, target: &str, path: &str) -> Result<String> {
        let command = Command::get(target, path);
        self.send(&command).await?;
        loop {
            let frame = self.next_frame().await?;
            match Message::parse(&frame) {
                Ok(Message::Error(detail)) => {
                    tracing::error!("{}: Sent bad command {}: {}", target, command, detail);
                    return Err(SensemeError::DeviceError(detail));
                }
                Ok(Message::Param { value, .. }) if frame.contains(path) => return Ok(value),
                Ok(_) => {}
                Err(e) => tracing::debug!("{}: Ignoring reply: {}", target, e),
            }
        }
    }

    /// Ask whoever is listening for its identity
    pub(crate) async fn identity(&mut self) -> Result<DiscoveryReply> {
        let command = Command::discovery();
        self.send(&command).await?;
        loop {
            let frame = self.next_frame().await?;
            if !frame.contains(command.path()) {
                continue;
            }
            match DiscoveryReply::parse(&frame) {
                Ok(reply) => return Ok(reply),
                Err(e) => tracing::debug!("Ignoring identity reply: {}", e),
            }
        }
    }
}

/// Query firmware, light presence and room of the device at `addr`
pub(crate) async fn fetch_secondary_info(
    target: &str,
    addr: SocketAddr,
    limit: Duration,
) -> Result<SecondaryInfo> {
    let exchange = async {
        let mut client = QueryClient::connect(addr).await?;
        let mut info = SecondaryInfo::default();

        let fw_name = client.query(target, "FW;NAME").await?;
        let fw_version = client.query(target, &format!("FW;{fw_name}")).await?;
        let light = client.query(target, "DEVICE;LIGHT").await?;
        let room_name = client.query(target, "GROUP;LIST").await?;
        let room_type = client.query(target, "GROUP;ROOM;TYPE").await?;

        info.fw_name = Some(fw_name);
        info.fw_version = Some(fw_version);
        info.has_light = Some(SecondaryInfo::light_present(&light));
        info.room_name = Some(room_name);
        info.room_type = Some(room_type);
        Ok::<_, SensemeError>(info)
    };

    timeout(limit, exchange)
        .await
        .map_err(|_| SensemeError::Timeout)?
}

/// Ask the device at `addr` for its name, hardware id and model
pub(crate) async fn fetch_identity(addr: SocketAddr, limit: Duration) -> Result<DiscoveryReply> {
    let exchange = async {
        let mut client = QueryClient::connect(addr).await?;
        client.identity().await
    };

    timeout(limit, exchange)
        .await
        .map_err(|_| SensemeError::Timeout)?
}
