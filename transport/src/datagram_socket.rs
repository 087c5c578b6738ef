use std::net::SocketAddr;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, trace};
use crate::core_location::CoreLocation;

/// This is an abstraction for exchanging datagrams with a single monitor core, introduced to
///  facilitate replacing the I/O part for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send(&self, datagram: &[u8]) -> std::io::Result<()>;

    /// Waits for the next datagram. Timeouts are the caller's business.
    async fn recv(&self) -> std::io::Result<Bytes>;
}

/// Opens the socket a session uses to talk to the monitor responsible for a given core. Every
///  session owns its socket.
#[async_trait]
pub trait DatagramConnector: Send + Sync + 'static {
    async fn connect(&self, core: CoreLocation) -> anyhow::Result<Box<dyn DatagramSocket>>;
}

/// The largest datagram we are prepared to receive
const RECV_BUF_LEN: usize = 1500;

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send(&self, datagram: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), self.peer_addr());
        UdpSocket::send(self, datagram).await?;
        Ok(())
    }

    async fn recv(&self) -> std::io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(RECV_BUF_LEN);
        let len = UdpSocket::recv(self, &mut buf).await?;
        buf.truncate(len);
        Ok(buf.freeze())
    }
}

/// Connects to monitors through a board's UDP endpoint. The board forwards the datagrams to the
///  monitor of the target chip based on tags that are set up outside this crate.
pub struct UdpConnector {
    board_address: SocketAddr,
}

impl UdpConnector {
    pub fn new(board_address: SocketAddr) -> UdpConnector {
        UdpConnector { board_address }
    }
}

#[async_trait]
impl DatagramConnector for UdpConnector {
    async fn connect(&self, core: CoreLocation) -> anyhow::Result<Box<dyn DatagramSocket>> {
        let bind_addr: SocketAddr = if self.board_address.is_ipv4() {
            "0.0.0.0:0".parse()?
        }
        else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.board_address).await?;
        debug!("opened socket {:?} to {:?} for core {}", socket.local_addr()?, self.board_address, core);
        Ok(Box::new(socket))
    }
}
