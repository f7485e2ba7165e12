use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::bail;
use spead_protocol::safe_converter::PrecheckedCast;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use crate::config::IbvReaderConfig;
use crate::recv::frame::parse_udp_frame;
use crate::recv::ibv::resources::IbvResources;
use crate::recv::ibv::verbs::{Verbs, WorkCompletion};
use crate::recv::stream::{ReaderControl, Stream, StreamInner, StreamRef};

struct IbvReader {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ReaderControl for IbvReader {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.task.abort();
    }
}

fn process_frames(inner: &mut StreamInner, resources: &IbvResources, completions: &[WorkCompletion]) -> bool {
    for wc in completions {
        if !wc.success {
            warn!("receive into slot {} failed", wc.wr_id);
            continue;
        }

        let slot: usize = wc.wr_id.prechecked_cast();
        // SAFETY: the slot completed and is not reposted before the frames are processed
        let frame = unsafe { resources.buffer.slot(slot * resources.max_size, wc.byte_len.min(resources.max_size)) };
        match parse_udp_frame(frame) {
            Ok(udp) => {
                inner.add_packet(udp.payload);
            }
            Err(e) => {
                debug!("discarding frame: {}", e);
                let stats = inner.stats_mut();
                stats.packets += 1;
                stats.malformed_packets += 1;
            }
        }

        if inner.is_stopped() {
            return false;
        }
    }
    true
}

/// Hands all available completions to the stream and reposts their slots. Returns `false`
///  once the stream does not take packets any more.
fn process_completions(resources: &IbvResources, stream_ref: &StreamRef, completions: &mut Vec<WorkCompletion>) -> anyhow::Result<bool> {
    completions.clear();
    resources.verbs.poll_cq(resources.recv_cq.handle(), resources.n_slots, completions)?;
    if completions.is_empty() {
        return Ok(true);
    }

    let keep_going = stream_ref.process(|inner| process_frames(inner, resources, completions));
    if keep_going != Some(true) {
        return Ok(false);
    }

    for wc in completions.iter() {
        resources.post_slot(wc.wr_id.prechecked_cast())?;
    }
    Ok(true)
}

async fn run_event_loop(resources: &IbvResources, stream_ref: &StreamRef) -> anyhow::Result<()> {
    let Some(comp_channel) = &resources.comp_channel else {
        bail!("no completion channel");
    };
    let verbs = &resources.verbs;
    // SAFETY: the descriptor belongs to the completion channel, which outlives this loop
    let channel_fd = unsafe { BorrowedFd::borrow_raw(verbs.comp_channel_fd(comp_channel.handle())) };
    let fd = AsyncFd::with_interest(channel_fd, Interest::READABLE)?;
    let mut completions = Vec::with_capacity(resources.n_slots);

    verbs.req_notify_cq(resources.recv_cq.handle())?;
    // completions that arrived before notification was requested
    if !process_completions(resources, stream_ref, &mut completions)? {
        return Ok(());
    }

    loop {
        let mut guard = fd.readable().await?;
        match verbs.get_cq_event(comp_channel.handle())? {
            Some(cq) => {
                verbs.ack_cq_events(cq, 1);
                verbs.req_notify_cq(resources.recv_cq.handle())?;
            }
            None => {
                guard.clear_ready();
                continue;
            }
        }

        if !process_completions(resources, stream_ref, &mut completions)? {
            return Ok(());
        }
    }
}

async fn event_loop(resources: IbvResources, stream_ref: StreamRef) {
    if let Err(e) = run_event_loop(&resources, &stream_ref).await {
        error!("verbs reader failed: {:#}", e);
        stream_ref.reader_finished();
    }
    debug!("verbs reader finished");
}

fn poll_loop(resources: IbvResources, stream_ref: StreamRef, stop: Arc<AtomicBool>) {
    let mut completions = Vec::with_capacity(resources.n_slots);
    while !stop.load(Ordering::Acquire) {
        match process_completions(&resources, &stream_ref, &mut completions) {
            Ok(true) => std::hint::spin_loop(),
            Ok(false) => break,
            Err(e) => {
                error!("verbs reader failed: {:#}", e);
                stream_ref.reader_finished();
                break;
            }
        }
    }
    debug!("verbs poll loop finished");
}

impl Stream {
    /// Receives UDP packets for `endpoint` directly from an RDMA-capable NIC, bypassing the
    ///  kernel. `interface_address` selects the device.
    ///
    /// With a negative completion vector in `config`, a blocking thread busy-polls for
    ///  completions; otherwise the reader waits for completion events on the runtime.
    pub fn add_ibv_reader(&self, verbs: Arc<dyn Verbs>, endpoint: SocketAddrV4, interface_address: Ipv4Addr, config: IbvReaderConfig) -> anyhow::Result<()> {
        config.validate()?;
        let resources = IbvResources::new(verbs, endpoint, interface_address, &config)?;
        resources.start()?;

        let runtime = self.runtime().clone();
        self.attach_reader(move |stream_ref| {
            let stop = Arc::new(AtomicBool::new(false));
            let task = if resources.is_busy_polling() {
                let stop = stop.clone();
                runtime.spawn_blocking(move || poll_loop(resources, stream_ref, stop))
            }
            else {
                runtime.spawn(event_loop(resources, stream_ref))
            };
            Ok(Box::new(IbvReader { stop, task }))
        })
    }
}
