use std::io;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{lookup_host, UdpSocket};
use url::Url;

use super::Sender;
use crate::error::{ForwardError, SendError};

/// Sends each batch as a single datagram over a connected UDP socket.
///
/// The `udp` scheme accepts whichever address family resolution produces;
/// `udp4` and `udp6` restrict it.
#[derive(Debug)]
pub(crate) struct UdpSender {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl UdpSender {
    pub async fn connect(url: &Url) -> Result<Self, ForwardError> {
        let port = url.port().ok_or_else(|| ForwardError::UnusableUrl {
            reason: "udp destination needs a port".to_string(),
        })?;

        let candidates: Vec<std::net::SocketAddr> = match url.host() {
            Some(url::Host::Ipv4(ip)) => vec![(ip, port).into()],
            Some(url::Host::Ipv6(ip)) => vec![(ip, port).into()],
            Some(url::Host::Domain(domain)) => lookup_host((domain, port))
                .await
                .map_err(|e| ForwardError::Transport { source: Box::new(e) })?
                .collect(),
            None => {
                return Err(ForwardError::UnusableUrl {
                    reason: "udp destination needs a host".to_string(),
                })
            }
        };

        let addr = candidates
            .into_iter()
            .find(|addr| match url.scheme() {
                "udp4" => addr.is_ipv4(),
                "udp6" => addr.is_ipv6(),
                _ => true,
            })
            .ok_or_else(|| ForwardError::UnusableUrl {
                reason: format!("no {} address for the destination host", url.scheme()),
            })?;

        let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ForwardError::Transport { source: Box::new(e) })?;
        socket
            .connect(addr)
            .await
            .map_err(|e| ForwardError::Transport { source: Box::new(e) })?;

        Ok(Self {
            socket,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Sender for UdpSender {
    async fn send(&self, payload: Bytes) -> Result<(), SendError> {
        if self.closed.load(SeqCst) {
            return Err(SendError::terminal(ForwardError::Closed));
        }

        match self.socket.send(&payload).await {
            Ok(sent) if sent == payload.len() => Ok(()),
            Ok(_) => Err(SendError::terminal(ForwardError::Transport {
                source: Box::new(io::Error::new(io::ErrorKind::WriteZero, "short datagram write")),
            })),
            Err(e) => {
                // Nothing left the socket, so a retry is safe for errors
                // that tend to clear up on their own.
                let retryable = matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                );
                let err = ForwardError::Transport { source: Box::new(e) };
                Err(if retryable {
                    SendError::retryable(err)
                } else {
                    SendError::terminal(err)
                })
            }
        }
    }

    async fn close(&self) -> Result<(), ForwardError> {
        self.closed.store(true, SeqCst);
        Ok(())
    }
}
