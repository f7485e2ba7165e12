use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;

/// Opaque reference to an object a [Verbs] implementation created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub byte_len: usize,
    pub success: bool,
}

/// The subset of the RDMA connection manager and verbs API that the verbs reader uses.
///
/// Implementations wrap a device library (e.g. `librdmacm` / `libibverbs`). Each `create_*`
///  or `alloc_*` call hands out a handle that the reader passes to the matching `destroy_*`
///  call exactly once, in reverse order of creation.
pub trait Verbs: Send + Sync + 'static {
    fn create_event_channel(&self) -> io::Result<RawHandle>;
    fn destroy_event_channel(&self, event_channel: RawHandle);

    fn create_id(&self, event_channel: RawHandle) -> io::Result<RawHandle>;
    fn destroy_id(&self, cm_id: RawHandle);

    /// Binds the connection id to the device that owns `interface_address`
    fn bind_addr(&self, cm_id: RawHandle, interface_address: Ipv4Addr) -> io::Result<()>;
    fn port_num(&self, cm_id: RawHandle) -> u8;
    fn num_comp_vectors(&self, cm_id: RawHandle) -> i32;

    fn alloc_pd(&self, cm_id: RawHandle) -> io::Result<RawHandle>;
    fn dealloc_pd(&self, pd: RawHandle);

    fn create_comp_channel(&self, cm_id: RawHandle) -> io::Result<RawHandle>;
    fn destroy_comp_channel(&self, comp_channel: RawHandle);
    /// non-blocking file descriptor that becomes readable when a completion event is pending
    fn comp_channel_fd(&self, comp_channel: RawHandle) -> RawFd;

    fn create_cq(&self, cm_id: RawHandle, cqe: usize, comp_channel: Option<RawHandle>, comp_vector: i32) -> io::Result<RawHandle>;
    fn destroy_cq(&self, cq: RawHandle);

    /// Creates a raw packet queue pair
    fn create_qp(&self, pd: RawHandle, send_cq: RawHandle, recv_cq: RawHandle, max_recv_wr: usize) -> io::Result<RawHandle>;
    fn destroy_qp(&self, qp: RawHandle);
    fn modify_qp_to_init(&self, qp: RawHandle, port_num: u8) -> io::Result<()>;
    fn modify_qp_to_rtr(&self, qp: RawHandle) -> io::Result<()>;

    /// Registers memory for receiving into.
    ///
    /// # Safety
    /// `addr..addr+len` must stay valid until the region is deregistered.
    unsafe fn reg_mr(&self, pd: RawHandle, addr: *mut u8, len: usize) -> io::Result<RawHandle>;
    fn dereg_mr(&self, mr: RawHandle);

    /// Steers frames addressed to `endpoint` to the queue pair
    fn create_flow(&self, qp: RawHandle, endpoint: SocketAddrV4, port_num: u8) -> io::Result<RawHandle>;
    fn destroy_flow(&self, flow: RawHandle);

    /// Posts a receive of up to `len` bytes into the region at `offset`
    fn post_recv(&self, qp: RawHandle, mr: RawHandle, wr_id: u64, offset: usize, len: usize) -> io::Result<()>;

    fn req_notify_cq(&self, cq: RawHandle) -> io::Result<()>;
    /// Takes a pending completion event without blocking, returning the CQ it is for
    fn get_cq_event(&self, comp_channel: RawHandle) -> io::Result<Option<RawHandle>>;
    fn ack_cq_events(&self, cq: RawHandle, num_events: u32);

    /// Appends up to `max` completions to `completions`, returning how many there were
    fn poll_cq(&self, cq: RawHandle, max: usize, completions: &mut Vec<WorkCompletion>) -> io::Result<usize>;
}
