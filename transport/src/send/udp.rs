use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use anyhow::anyhow;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use spead_protocol::heap::Heap;
use tokio::net::{lookup_host, UdpSocket};
use tokio::runtime::Handle;
use tracing::{info, warn};
use crate::config::{SendStreamConfig, UdpSendConfig};
use crate::send::packet_sink::UdpSink;
use crate::send::send_stream::SendStream;
use crate::send::{CompletionCallback, HeapSender};

/// A send stream to a UDP destination given by host name and port
pub struct UdpSendStream {
    inner: SendStream,
    destination: SocketAddr,
    local_addr: SocketAddr,
}

impl UdpSendStream {
    /// Resolves `host` and creates a socket for sending to the first address it resolves to
    pub async fn connect(runtime: Handle, host: &str, port: u16, config: SendStreamConfig, udp_config: UdpSendConfig) -> anyhow::Result<UdpSendStream> {
        let destination = lookup_host((host, port)).await?
            .next()
            .ok_or_else(|| anyhow!("{} does not resolve to an address", host))?;
        Self::with_destination(runtime, destination, config, udp_config)
    }

    pub fn with_destination(runtime: Handle, destination: SocketAddr, config: SendStreamConfig, udp_config: UdpSendConfig) -> anyhow::Result<UdpSendStream> {
        config.validate()?;

        let socket = Socket::new(Domain::for_address(destination), Type::DGRAM, Some(Protocol::UDP))?;
        if udp_config.buffer_size > 0 {
            if let Err(e) = socket.set_send_buffer_size(udp_config.buffer_size) {
                warn!("could not set UDP send buffer size to {}: {}", udp_config.buffer_size, e);
            }
        }
        let bind_addr: SocketAddr = match destination {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        socket.bind(&bind_addr.into())?;
        socket.set_nonblocking(true)?;

        let socket = {
            let _guard = runtime.enter();
            UdpSocket::from_std(socket.into())?
        };
        let local_addr = socket.local_addr()?;
        info!("sending heaps from {:?} to {:?}", local_addr, destination);

        let inner = SendStream::new(runtime, config, Arc::new(UdpSink::new(socket, destination)))?;
        Ok(UdpSendStream { inner, destination, local_addr })
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl HeapSender for UdpSendStream {
    async fn async_send_heap(&self, heap: Arc<Heap>, on_complete: CompletionCallback) -> bool {
        self.inner.async_send_heap(heap, on_complete).await
    }

    async fn flush(&self) {
        self.inner.flush().await;
    }

    fn runtime(&self) -> &Handle {
        self.inner.runtime()
    }
}
