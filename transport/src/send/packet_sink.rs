use std::io;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use socket2::{SockAddr, SockRef};
use spead_protocol::packet_generator::Packet;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for putting a packet on the wire, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    async fn send_packet(&self, packet: &Packet) -> io::Result<()>;
}

/// Sends packets as UDP datagrams to a fixed destination, gathering header and payload
///  slices without copying them
pub struct UdpSink {
    socket: UdpSocket,
    destination: SockAddr,
}

impl UdpSink {
    pub fn new(socket: UdpSocket, destination: SocketAddr) -> UdpSink {
        UdpSink {
            socket,
            destination: destination.into(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl PacketSink for UdpSink {
    async fn send_packet(&self, packet: &Packet) -> io::Result<()> {
        trace!("UDP socket: sending {:?} to {:?}", packet, self.destination.as_socket());

        let slices = packet.buffers().iter()
            .map(|b| IoSlice::new(b))
            .collect::<Vec<_>>();

        let sent = self.socket.async_io(Interest::WRITABLE, || {
            SockRef::from(&self.socket).send_to_vectored(&slices, &self.destination)
        }).await?;

        if sent != packet.len() {
            return Err(io::Error::other(format!("datagram truncated: sent {} of {} bytes", sent, packet.len())));
        }
        Ok(())
    }
}

/// Collects all packets in one contiguous buffer, e.g. for writing heaps to a file or for
///  feeding them to a memory reader
#[derive(Default)]
pub struct MemorySink {
    buf: Mutex<BytesMut>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    /// everything sent so far
    pub fn getvalue(&self) -> Bytes {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        Bytes::copy_from_slice(&buf)
    }
}

#[async_trait]
impl PacketSink for MemorySink {
    async fn send_packet(&self, packet: &Packet) -> io::Result<()> {
        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        for part in packet.buffers() {
            buf.put_slice(part);
        }
        Ok(())
    }
}
