use std::net::{Ipv4Addr, SocketAddrV4};
use std::ptr::NonNull;
use std::sync::Arc;
use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use spead_protocol::safe_converter::SafeCast;
use tracing::{debug, info, trace};
use crate::config::IbvReaderConfig;
use crate::recv::ibv::verbs::{RawHandle, Verbs};

macro_rules! verbs_resource {
    ($name:ident, $destroy:ident) => {
        pub(crate) struct $name {
            verbs: Arc<dyn Verbs>,
            handle: RawHandle,
        }

        impl $name {
            pub(crate) fn handle(&self) -> RawHandle {
                self.handle
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                trace!("{} {:?}", stringify!($destroy), self.handle);
                self.verbs.$destroy(self.handle);
            }
        }
    };
}

verbs_resource!(EventChannel, destroy_event_channel);
verbs_resource!(CmId, destroy_id);
verbs_resource!(ProtectionDomain, dealloc_pd);
verbs_resource!(CompChannel, destroy_comp_channel);
verbs_resource!(CompletionQueue, destroy_cq);
verbs_resource!(QueuePair, destroy_qp);
verbs_resource!(MemoryRegion, dereg_mr);
verbs_resource!(Flow, destroy_flow);

/// The memory frames are received into, split into slots of `max_size` bytes
pub(crate) struct RecvBuffer {
    ptr: NonNull<[u8]>,
}

// SAFETY: the buffer is uniquely owned; the device writes only to slots that are posted, and
//  reading a slot is unsafe
unsafe impl Send for RecvBuffer {}
unsafe impl Sync for RecvBuffer {}

impl RecvBuffer {
    fn new(len: usize) -> RecvBuffer {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
        // SAFETY: Box::into_raw never returns null
        RecvBuffer { ptr: unsafe { NonNull::new_unchecked(raw) } }
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    pub(crate) fn len(&self) -> usize {
        self.ptr.len()
    }

    /// # Safety
    /// The slot must not be posted for receiving while the returned slice lives.
    pub(crate) unsafe fn slot(&self, offset: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.as_mut_ptr().add(offset), len)
    }
}

impl Drop for RecvBuffer {
    fn drop(&mut self) {
        // SAFETY: the pointer came from Box::into_raw, and the memory region that refers to it
        //  was deregistered before
        unsafe { drop(Box::from_raw(self.ptr.as_ptr())) };
    }
}

/// Everything a verbs reader needs, in the order it is torn down
pub(crate) struct IbvResources {
    _flow: Flow,
    pub(crate) mr: MemoryRegion,
    pub(crate) qp: QueuePair,
    pub(crate) recv_cq: CompletionQueue,
    _send_cq: CompletionQueue,
    /// `None` when busy polling
    pub(crate) comp_channel: Option<CompChannel>,
    _pd: ProtectionDomain,
    _cm_id: CmId,
    _event_channel: EventChannel,
    pub(crate) buffer: RecvBuffer,
    /// kernel socket subscribed to the multicast group, so that switches forward it to us
    _join_socket: Option<Socket>,

    pub(crate) verbs: Arc<dyn Verbs>,
    pub(crate) max_size: usize,
    pub(crate) n_slots: usize,
}

fn join_multicast(endpoint: SocketAddrV4, interface_address: Ipv4Addr) -> anyhow::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.join_multicast_v4(endpoint.ip(), &interface_address)
        .with_context(|| format!("joining multicast group {} on {}", endpoint.ip(), interface_address))?;
    Ok(socket)
}

impl IbvResources {
    /// Acquires all resources in order. If a step fails, everything acquired before is released
    ///  in reverse order.
    pub(crate) fn new(verbs: Arc<dyn Verbs>, endpoint: SocketAddrV4, interface_address: Ipv4Addr, config: &IbvReaderConfig) -> anyhow::Result<IbvResources> {
        let max_size = config.max_size;
        let n_slots = config.n_slots();
        debug!("setting up verbs reader for {:?} on {}: {} slots of {} bytes", endpoint, interface_address, n_slots, max_size);

        let join_socket = if endpoint.ip().is_multicast() {
            Some(join_multicast(endpoint, interface_address)?)
        }
        else {
            None
        };
        let buffer = RecvBuffer::new(n_slots * max_size);

        let event_channel = EventChannel {
            handle: verbs.create_event_channel().context("creating RDMA event channel")?,
            verbs: verbs.clone(),
        };
        let cm_id = CmId {
            handle: verbs.create_id(event_channel.handle()).context("creating RDMA connection id")?,
            verbs: verbs.clone(),
        };
        verbs.bind_addr(cm_id.handle(), interface_address)
            .with_context(|| format!("binding to interface {}", interface_address))?;
        let port_num = verbs.port_num(cm_id.handle());

        let pd = ProtectionDomain {
            handle: verbs.alloc_pd(cm_id.handle()).context("allocating protection domain")?,
            verbs: verbs.clone(),
        };

        let comp_vector = if config.comp_vector >= 0 {
            let num_vectors = verbs.num_comp_vectors(cm_id.handle()).max(1);
            Some(config.comp_vector % num_vectors)
        }
        else {
            None
        };
        let comp_channel = match comp_vector {
            Some(_) => Some(CompChannel {
                handle: verbs.create_comp_channel(cm_id.handle()).context("creating completion channel")?,
                verbs: verbs.clone(),
            }),
            None => None,
        };

        let send_cq = CompletionQueue {
            handle: verbs.create_cq(cm_id.handle(), 1, None, 0).context("creating send completion queue")?,
            verbs: verbs.clone(),
        };
        let recv_cq = CompletionQueue {
            handle: verbs.create_cq(cm_id.handle(), n_slots, comp_channel.as_ref().map(|c| c.handle()), comp_vector.unwrap_or(0))
                .context("creating receive completion queue")?,
            verbs: verbs.clone(),
        };

        let qp = QueuePair {
            handle: verbs.create_qp(pd.handle(), send_cq.handle(), recv_cq.handle(), n_slots).context("creating queue pair")?,
            verbs: verbs.clone(),
        };
        verbs.modify_qp_to_init(qp.handle(), port_num).context("initializing queue pair")?;

        // SAFETY: the buffer is declared after the region in IbvResources, so it is freed after
        //  the region is deregistered
        let mr = MemoryRegion {
            handle: unsafe { verbs.reg_mr(pd.handle(), buffer.as_mut_ptr(), buffer.len()) }.context("registering receive buffer")?,
            verbs: verbs.clone(),
        };

        let flow = Flow {
            handle: verbs.create_flow(qp.handle(), endpoint, port_num).context("creating flow steering rule")?,
            verbs: verbs.clone(),
        };

        info!("verbs reader set up for {:?} (comp vector {:?})", endpoint, comp_vector);
        Ok(IbvResources {
            _flow: flow,
            mr,
            qp,
            recv_cq,
            _send_cq: send_cq,
            comp_channel,
            _pd: pd,
            _cm_id: cm_id,
            _event_channel: event_channel,
            buffer,
            _join_socket: join_socket,
            verbs,
            max_size,
            n_slots,
        })
    }

    pub(crate) fn post_slot(&self, index: usize) -> std::io::Result<()> {
        self.verbs.post_recv(self.qp.handle(), self.mr.handle(), index.safe_cast(), index * self.max_size, self.max_size)
    }

    /// Posts all slots and starts receiving
    pub(crate) fn start(&self) -> anyhow::Result<()> {
        for index in 0..self.n_slots {
            self.post_slot(index).context("posting receive buffer")?;
        }
        self.verbs.modify_qp_to_rtr(self.qp.handle()).context("moving queue pair to ready-to-receive")?;
        Ok(())
    }

    pub(crate) fn is_busy_polling(&self) -> bool {
        self.comp_channel.is_none()
    }
}
