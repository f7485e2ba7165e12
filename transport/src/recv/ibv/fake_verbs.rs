//! An in-process stand-in for an RDMA device, for testing the verbs reader without hardware

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use crate::recv::ibv::verbs::{RawHandle, Verbs, WorkCompletion};
use crate::signal_queue::Semaphore;

#[derive(Default)]
struct FakeState {
    calls: Vec<&'static str>,
    fail_on: Option<&'static str>,

    next_handle: usize,
    created: Vec<usize>,
    destroyed: Vec<usize>,

    cq_vectors: Vec<(bool, i32)>,
    /// base address and length of each registered region
    regions: FxHashMap<usize, (usize, usize)>,
    posted: VecDeque<(RawHandle, u64, usize, usize)>,
    pending_frames: VecDeque<Vec<u8>>,
    completions: VecDeque<WorkCompletion>,
    recv_cq: Option<RawHandle>,
    notify_armed: bool,
}

pub(crate) struct FakeVerbs {
    state: Mutex<FakeState>,
    /// stands in for the completion channel's file descriptor
    events: Semaphore,
}

impl FakeVerbs {
    pub(crate) fn new() -> FakeVerbs {
        FakeVerbs {
            state: Mutex::new(FakeState::default()),
            events: Semaphore::new().unwrap(),
        }
    }

    pub(crate) fn failing_on(step: &'static str) -> FakeVerbs {
        let result = FakeVerbs::new();
        result.state().fail_on = Some(step);
        result
    }

    fn state(&self) -> MutexGuard<FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub(crate) fn cq_vectors(&self) -> Vec<(bool, i32)> {
        self.state().cq_vectors.clone()
    }

    pub(crate) fn num_posted(&self) -> usize {
        self.state().posted.len()
    }

    pub(crate) fn live_handles(&self) -> Vec<usize> {
        let state = self.state();
        state.created.iter()
            .filter(|h| !state.destroyed.contains(h))
            .copied()
            .collect()
    }

    pub(crate) fn is_torn_down_in_reverse(&self) -> bool {
        let state = self.state();
        let mut expected = state.created.clone();
        expected.reverse();
        state.destroyed == expected
    }

    /// Receives a frame into the next posted slot, or as soon as a slot is posted
    pub(crate) fn deliver(&self, frame: Vec<u8>) {
        let mut state = self.state();
        state.pending_frames.push_back(frame);
        self.deliver_pending(&mut state);
    }

    fn deliver_pending(&self, state: &mut FakeState) {
        while !state.pending_frames.is_empty() && !state.posted.is_empty() {
            let (Some(frame), Some((mr, wr_id, offset, len))) = (state.pending_frames.pop_front(), state.posted.pop_front()) else {
                return;
            };
            let (base, region_len) = state.regions[&mr.0];
            let byte_len = frame.len().min(len);
            assert!(offset + byte_len <= region_len);
            // SAFETY: the reader registered this memory and posted the slot for receiving
            unsafe {
                std::ptr::copy_nonoverlapping(frame.as_ptr(), (base + offset) as *mut u8, byte_len);
            }
            state.completions.push_back(WorkCompletion { wr_id, byte_len, success: true });

            if state.notify_armed {
                state.notify_armed = false;
                self.events.put().unwrap();
            }
        }
    }

    fn call(&self, step: &'static str) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(step);
        if state.fail_on == Some(step) {
            return Err(io::Error::new(io::ErrorKind::Other, format!("{} failed", step)));
        }
        Ok(())
    }

    fn create(&self, step: &'static str) -> io::Result<RawHandle> {
        self.call(step)?;
        let mut state = self.state();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.created.push(handle);
        Ok(RawHandle(handle))
    }

    fn destroy(&self, step: &'static str, handle: RawHandle) {
        let mut state = self.state();
        state.calls.push(step);
        assert!(state.created.contains(&handle.0), "{} of unknown handle", step);
        assert!(!state.destroyed.contains(&handle.0), "{} of destroyed handle", step);
        state.destroyed.push(handle.0);
    }
}

impl Verbs for FakeVerbs {
    fn create_event_channel(&self) -> io::Result<RawHandle> {
        self.create("create_event_channel")
    }

    fn destroy_event_channel(&self, event_channel: RawHandle) {
        self.destroy("destroy_event_channel", event_channel)
    }

    fn create_id(&self, _event_channel: RawHandle) -> io::Result<RawHandle> {
        self.create("create_id")
    }

    fn destroy_id(&self, cm_id: RawHandle) {
        self.destroy("destroy_id", cm_id)
    }

    fn bind_addr(&self, _cm_id: RawHandle, _interface_address: Ipv4Addr) -> io::Result<()> {
        self.call("bind_addr")
    }

    fn port_num(&self, _cm_id: RawHandle) -> u8 {
        1
    }

    fn num_comp_vectors(&self, _cm_id: RawHandle) -> i32 {
        4
    }

    fn alloc_pd(&self, _cm_id: RawHandle) -> io::Result<RawHandle> {
        self.create("alloc_pd")
    }

    fn dealloc_pd(&self, pd: RawHandle) {
        self.destroy("dealloc_pd", pd)
    }

    fn create_comp_channel(&self, _cm_id: RawHandle) -> io::Result<RawHandle> {
        self.create("create_comp_channel")
    }

    fn destroy_comp_channel(&self, comp_channel: RawHandle) {
        self.destroy("destroy_comp_channel", comp_channel)
    }

    fn comp_channel_fd(&self, _comp_channel: RawHandle) -> RawFd {
        self.events.as_raw_fd()
    }

    fn create_cq(&self, _cm_id: RawHandle, _cqe: usize, comp_channel: Option<RawHandle>, comp_vector: i32) -> io::Result<RawHandle> {
        let cq = self.create("create_cq")?;
        let mut state = self.state();
        state.cq_vectors.push((comp_channel.is_some(), comp_vector));
        state.recv_cq = Some(cq);
        Ok(cq)
    }

    fn destroy_cq(&self, cq: RawHandle) {
        self.destroy("destroy_cq", cq)
    }

    fn create_qp(&self, _pd: RawHandle, _send_cq: RawHandle, _recv_cq: RawHandle, _max_recv_wr: usize) -> io::Result<RawHandle> {
        self.create("create_qp")
    }

    fn destroy_qp(&self, qp: RawHandle) {
        self.destroy("destroy_qp", qp)
    }

    fn modify_qp_to_init(&self, _qp: RawHandle, _port_num: u8) -> io::Result<()> {
        self.call("modify_qp_to_init")
    }

    fn modify_qp_to_rtr(&self, _qp: RawHandle) -> io::Result<()> {
        self.call("modify_qp_to_rtr")
    }

    unsafe fn reg_mr(&self, _pd: RawHandle, addr: *mut u8, len: usize) -> io::Result<RawHandle> {
        let mr = self.create("reg_mr")?;
        self.state().regions.insert(mr.0, (addr as usize, len));
        Ok(mr)
    }

    fn dereg_mr(&self, mr: RawHandle) {
        self.destroy("dereg_mr", mr);
        let mut state = self.state();
        state.regions.remove(&mr.0);
        state.posted.clear();
    }

    fn create_flow(&self, _qp: RawHandle, _endpoint: SocketAddrV4, _port_num: u8) -> io::Result<RawHandle> {
        self.create("create_flow")
    }

    fn destroy_flow(&self, flow: RawHandle) {
        self.destroy("destroy_flow", flow)
    }

    fn post_recv(&self, _qp: RawHandle, mr: RawHandle, wr_id: u64, offset: usize, len: usize) -> io::Result<()> {
        self.call("post_recv")?;
        let mut state = self.state();
        state.posted.push_back((mr, wr_id, offset, len));
        self.deliver_pending(&mut state);
        Ok(())
    }

    fn req_notify_cq(&self, _cq: RawHandle) -> io::Result<()> {
        let mut state = self.state();
        if state.completions.is_empty() {
            state.notify_armed = true;
        }
        else {
            // the event fires right away if completions are queued already
            self.events.put()?;
        }
        Ok(())
    }

    fn get_cq_event(&self, _comp_channel: RawHandle) -> io::Result<Option<RawHandle>> {
        if self.events.try_get()? {
            return Ok(self.state().recv_cq);
        }
        Ok(None)
    }

    fn ack_cq_events(&self, _cq: RawHandle, _num_events: u32) {}

    fn poll_cq(&self, _cq: RawHandle, max: usize, completions: &mut Vec<WorkCompletion>) -> io::Result<usize> {
        let mut state = self.state();
        let n = max.min(state.completions.len());
        completions.extend(state.completions.drain(..n));
        Ok(n)
    }
}
