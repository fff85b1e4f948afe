use std::{io, net::SocketAddr};

use chatrelay_core::{ChatRecord, CoreError, encode_record};
use thiserror::Error;
use tokio::net::{ToSocketAddrs, UdpSocket, lookup_host};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("could not resolve {0}")]
    Unresolved(String),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("encode failed: {0}")]
    Encode(#[from] CoreError),
    #[error("datagram truncated: sent {sent} of {len} bytes")]
    Truncated { sent: usize, len: usize },
}

/// Sends chat records to one relay, one datagram per record.
#[derive(Debug)]
pub struct ChatSender {
    socket: UdpSocket,
    server: SocketAddr,
}

impl ChatSender {
    pub async fn connect(server: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self, SendError> {
        let label = format!("{server:?}");
        let server = lookup_host(server)
            .await?
            .next()
            .ok_or(SendError::Unresolved(label))?;
        let local: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self { socket, server })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub async fn send(&self, record: &ChatRecord) -> Result<usize, SendError> {
        let payload = encode_record(record)?;
        let sent = self.socket.send_to(&payload, self.server).await?;
        if sent != payload.len() {
            return Err(SendError::Truncated {
                sent,
                len: payload.len(),
            });
        }
        Ok(sent)
    }
}
