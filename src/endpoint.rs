use crate::config::DiscoveryConfig;
use crate::connection::TaskGuard;
use crate::error::{Result, SensemeError};
use crate::protocol::{Command, DiscoveryReply};
use crate::types::{self, DeviceType};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Capacity of the reply queue shared by all endpoints
const REPLY_QUEUE_SIZE: usize = 64;

const RECEIVE_BUFFER_SIZE: usize = 1024;

/// A classified discovery answer and the address it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FoundDevice {
    pub(crate) reply: DiscoveryReply,
    pub(crate) address: IpAddr,
    pub(crate) device_type: DeviceType,
}

/// Non-loopback IPv4 addresses of this host
pub(crate) fn local_interfaces() -> Vec<Ipv4Addr> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::debug!("Failed to list network interfaces: {}", e);
            return Vec::new();
        }
    };

    interfaces
        .into_iter()
        .filter_map(|(_, ip)| match ip {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() => Some(ipv4),
            _ => None,
        })
        .collect()
}

/// Parse and classify one datagram; `None` for junk and ignored models
pub(crate) fn classify(datagram: &[u8], address: IpAddr) -> Option<FoundDevice> {
    let raw = String::from_utf8_lossy(datagram);
    let reply = match DiscoveryReply::parse(&raw) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::debug!("Ignoring discovery datagram from {}: {}", address, e);
            return None;
        }
    };
    if types::is_ignored_model(&reply.model) {
        tracing::debug!("Ignoring {} model {} at {}", reply.name, reply.model, address);
        return None;
    }
    let device_type = DeviceType::from_model(&reply.model);
    Some(FoundDevice {
        reply,
        address,
        device_type,
    })
}

/// One broadcast-capable UDP socket per local interface
///
/// Replies from every socket land on one queue. Dropping the set closes the
/// sockets and stops their receive tasks.
pub(crate) struct EndpointSet {
    sockets: Vec<Arc<UdpSocket>>,
    replies: mpsc::Receiver<FoundDevice>,
    target: SocketAddr,
    _receivers: Vec<TaskGuard>,
}

impl EndpointSet {
    /// Bind every eligible interface; fails only if none could be bound
    pub(crate) async fn open(config: &DiscoveryConfig) -> Result<Self> {
        let interfaces = match &config.interfaces {
            Some(interfaces) => interfaces.clone(),
            None => local_interfaces(),
        };

        let (tx, replies) = mpsc::channel(REPLY_QUEUE_SIZE);
        let mut sockets = Vec::new();
        let mut receivers = Vec::new();

        for ip in interfaces {
            let socket = match bind(ip, config.local_port).await {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    match e.kind() {
                        io::ErrorKind::AddrInUse
                        | io::ErrorKind::AddrNotAvailable
                        | io::ErrorKind::InvalidInput => {
                            tracing::debug!("Unable to listen on {}: {}", ip, e);
                        }
                        _ => tracing::error!("Unable to listen on {}: {}", ip, e),
                    }
                    continue;
                }
            };
            tracing::debug!("Listening for devices on {}", ip);
            receivers.push(TaskGuard::spawn(receive(socket.clone(), tx.clone())));
            sockets.push(socket);
        }

        if sockets.is_empty() {
            return Err(SensemeError::NoInterfaces);
        }

        Ok(Self {
            sockets,
            replies,
            target: SocketAddr::new(IpAddr::V4(config.broadcast_addr), config.port),
            _receivers: receivers,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.sockets.len()
    }

    /// Send the discovery request from every endpoint
    pub(crate) async fn broadcast(&self) {
        let request = Command::discovery().encode();
        for socket in &self.sockets {
            if let Err(e) = socket.send_to(request.as_bytes(), self.target).await {
                tracing::debug!("Discovery broadcast to {} failed: {}", self.target, e);
            }
        }
        tracing::debug!("Sent discovery request on {} endpoint(s)", self.sockets.len());
    }

    /// Next classified reply from any endpoint
    pub(crate) async fn recv(&mut self) -> Option<FoundDevice> {
        self.replies.recv().await
    }
}

async fn bind(ip: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(ip), port)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

async fn receive(socket: Arc<UdpSocket>, tx: mpsc::Sender<FoundDevice>) {
    let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];
    loop {
        let (n, from) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                tracing::debug!("Discovery endpoint closed: {}", e);
                break;
            }
        };
        let Some(found) = classify(&buffer[..n], from.ip()) else {
            continue;
        };
        match tx.try_send(found) {
            Ok(()) => {}
            Err(TrySendError::Full(found)) => {
                tracing::error!("Discovery queue full, dropping reply from {}", found.address);
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}
