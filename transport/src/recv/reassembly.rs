use std::collections::VecDeque;
use rustc_hash::FxHashMap;
use spead_protocol::constants::BugCompat;
use spead_protocol::packet_header::PacketHeader;
use tracing::{debug, trace, warn};
use crate::config::ReceiveStreamConfig;
use crate::recv::completed_heap::CompletedHeap;
use crate::recv::live_heap::{LiveHeap, PacketDisposition};

/// Counters of a receive stream. All of them only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// packets handed to the stream by its readers, including malformed ones
    pub packets: u64,
    pub malformed_packets: u64,
    /// packets that carried nothing that was not received before
    pub duplicate_packets: u64,
    pub heaps_completed: u64,
    /// partial heaps discarded to make room for a new heap
    pub heaps_evicted: u64,
    /// partial heaps discarded when the stream stopped
    pub heaps_incomplete_at_stop: u64,
    /// completed heaps the consumer had no room for
    pub heaps_dropped_ring_full: u64,
    /// datagrams longer than the reader's maximum packet size
    pub oversized_packets: u64,
}

/// Turns packets into completed heaps. This is plain single-threaded state; the stream
///  serializes access to it.
pub(crate) struct Reassembler {
    max_heaps: usize,
    max_heap_size: usize,
    bug_compat: BugCompat,

    live_heaps: FxHashMap<u64, LiveHeap>,
    /// counters of the most recently completed heaps, so that late duplicates of their packets
    ///  do not start a new heap
    recently_completed: VecDeque<u64>,
    tick: u64,

    stats: StreamStats,
}

impl Reassembler {
    pub(crate) fn new(config: &ReceiveStreamConfig) -> Reassembler {
        Reassembler {
            max_heaps: config.max_heaps,
            max_heap_size: config.max_heap_size,
            bug_compat: config.bug_compat,
            live_heaps: FxHashMap::default(),
            recently_completed: VecDeque::with_capacity(config.max_heaps),
            tick: 0,
            stats: StreamStats::default(),
        }
    }

    pub(crate) fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut StreamStats {
        &mut self.stats
    }

    pub(crate) fn num_live_heaps(&self) -> usize {
        self.live_heaps.len()
    }

    /// Decodes a single packet at the start of `buf` and adds it. Returns the number of bytes
    ///  the packet occupied (`None` if it could not be decoded), and the heap it completed.
    pub(crate) fn add_raw_packet(&mut self, buf: &[u8]) -> (Option<usize>, Option<CompletedHeap>) {
        self.stats.packets += 1;
        match PacketHeader::decode(buf) {
            Ok((packet, consumed)) => (Some(consumed), self.add_packet(&packet)),
            Err(e) => {
                debug!("discarding malformed packet: {}", e);
                self.stats.malformed_packets += 1;
                (None, None)
            }
        }
    }

    fn add_packet(&mut self, packet: &PacketHeader) -> Option<CompletedHeap> {
        trace!("packet {:?}", packet);
        self.tick += 1;
        let cnt = packet.heap_cnt;

        let disposition = match self.live_heaps.get_mut(&cnt) {
            Some(live_heap) => live_heap.add_packet(packet, self.max_heap_size, self.tick),
            None => {
                if self.recently_completed.contains(&cnt) {
                    trace!("packet for heap {} that was completed already", cnt);
                    self.stats.duplicate_packets += 1;
                    return None;
                }
                // a new heap only takes a slot once its first packet was accepted
                let mut live_heap = LiveHeap::new(packet);
                let disposition = live_heap.add_packet(packet, self.max_heap_size, self.tick);
                if disposition == PacketDisposition::Accepted {
                    if live_heap.is_complete() {
                        return Some(self.complete(live_heap));
                    }
                    if self.live_heaps.len() >= self.max_heaps {
                        self.evict_oldest();
                    }
                    self.live_heaps.insert(cnt, live_heap);
                }
                disposition
            }
        };

        match disposition {
            PacketDisposition::Accepted => {}
            PacketDisposition::Duplicate => {
                trace!("duplicate packet for heap {}", cnt);
                self.stats.duplicate_packets += 1;
                return None;
            }
            PacketDisposition::Inconsistent(reason) => {
                warn!("discarding packet for heap {}: {}", cnt, reason);
                self.stats.malformed_packets += 1;
                return None;
            }
        }

        if !self.live_heaps.get(&cnt)?.is_complete() {
            return None;
        }
        let live_heap = self.live_heaps.remove(&cnt)?;
        Some(self.complete(live_heap))
    }

    fn complete(&mut self, live_heap: LiveHeap) -> CompletedHeap {
        let cnt = live_heap.cnt();
        if self.recently_completed.len() >= self.max_heaps {
            self.recently_completed.pop_front();
        }
        self.recently_completed.push_back(cnt);
        self.stats.heaps_completed += 1;
        debug!("heap {} complete", cnt);
        live_heap.into_completed(self.bug_compat)
    }

    fn evict_oldest(&mut self) {
        let oldest = self.live_heaps.values()
            .min_by_key(|h| h.last_touched)
            .map(|h| h.cnt());
        if let Some(cnt) = oldest {
            debug!("evicting incomplete heap {}", cnt);
            self.live_heaps.remove(&cnt);
            self.stats.heaps_evicted += 1;
        }
    }

    /// Discards all partial heaps, returning how many there were
    pub(crate) fn discard_incomplete(&mut self) -> usize {
        let num_incomplete = self.live_heaps.len();
        if num_incomplete > 0 {
            debug!("discarding {} incomplete heaps", num_incomplete);
        }
        self.live_heaps.clear();
        self.stats.heaps_incomplete_at_stop += num_incomplete as u64;
        num_incomplete
    }
}
