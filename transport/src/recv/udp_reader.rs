use std::net::{Ipv4Addr, SocketAddr};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use crate::config::UdpReaderConfig;
use crate::recv::stream::{ReaderControl, Stream, StreamRef};

struct UdpReader {
    task: JoinHandle<()>,
}

impl ReaderControl for UdpReader {
    fn stop(&mut self) {
        self.task.abort();
    }
}

/// Binds a socket for receiving on `endpoint`. For a multicast address, the socket is bound
///  to the group and joins it.
fn bind_socket(endpoint: SocketAddr, config: &UdpReaderConfig) -> anyhow::Result<Socket> {
    let socket = Socket::new(Domain::for_address(endpoint), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if config.buffer_size > 0 {
        if let Err(e) = socket.set_recv_buffer_size(config.buffer_size) {
            warn!("could not set UDP receive buffer size to {}: {}", config.buffer_size, e);
        }
    }

    socket.bind(&endpoint.into())?;
    match endpoint {
        SocketAddr::V4(addr) if addr.ip().is_multicast() => {
            let interface = config.interface_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
            debug!("joining multicast group {} on interface {}", addr.ip(), interface);
            socket.join_multicast_v4(addr.ip(), &interface)?;
        }
        SocketAddr::V6(addr) if addr.ip().is_multicast() => {
            debug!("joining multicast group {} on interface #{}", addr.ip(), config.interface_index);
            socket.join_multicast_v6(addr.ip(), config.interface_index)?;
        }
        _ => {}
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}

async fn recv_loop(socket: UdpSocket, stream_ref: StreamRef, max_size: usize) {
    // one extra byte to detect datagrams that were too big
    let mut buf = vec![0u8; max_size + 1];
    loop {
        let num_read = match socket.recv(&mut buf).await {
            Ok(num_read) => num_read,
            Err(e) => {
                error!("socket error: {}", e);
                continue;
            }
        };
        trace!("received {} byte datagram", num_read);

        let processed = if num_read > max_size {
            debug!("datagram exceeds maximum packet size {} - dropping", max_size);
            stream_ref.process(|inner| inner.stats_mut().oversized_packets += 1)
        }
        else {
            stream_ref.process(|inner| {
                inner.add_packet(&buf[..num_read]);
            })
        };
        if processed.is_none() {
            break;
        }
    }
    debug!("UDP receive loop finished");
}

impl Stream {
    /// Receives packets on a UDP endpoint, which may be a multicast group. Returns the address
    ///  the socket is bound to.
    pub fn add_udp_reader(&self, endpoint: SocketAddr, config: UdpReaderConfig) -> anyhow::Result<SocketAddr> {
        config.validate()?;

        let socket = {
            let _guard = self.runtime().enter();
            UdpSocket::from_std(bind_socket(endpoint, &config)?.into())?
        };
        let local_addr = socket.local_addr()?;
        info!("receiving heaps on {:?}", local_addr);

        let runtime = self.runtime().clone();
        self.attach_reader(move |stream_ref| {
            let task = runtime.spawn(recv_loop(socket, stream_ref, config.max_size));
            Ok(Box::new(UdpReader { task }))
        })?;
        Ok(local_addr)
    }
}
