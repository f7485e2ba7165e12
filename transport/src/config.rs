use std::net::Ipv4Addr;
use anyhow::bail;
use spead_protocol::constants::{BugCompat, ITEM_POINTER_SIZE, MIN_PACKET_SIZE};

/// What happens when a heap is submitted while `max_heaps` heaps are already in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueFullPolicy {
    /// The heap is not sent, and its completion callback receives
    ///  [crate::send::SendError::QueueFull]
    #[default]
    Reject,
    /// Submission waits until a heap in flight completes
    Block,
}

#[derive(Debug, Clone)]
pub struct SendStreamConfig {
    /// Upper bound for the size of a packet, including the SPEAD header but excluding UDP / IP
    ///  headers. It is rounded down to a multiple of 8.
    ///
    /// With full Ethernet frames and no optional IP headers, the UDP payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4. With Jumbo frames, this can be significantly bigger.
    pub max_packet_size: usize,

    /// Transmission rate in bytes per second, 0 for no rate limit
    pub rate: f64,

    /// Number of bytes that may be sent in a burst before the rate limit kicks in
    pub burst_size: usize,

    /// Maximum number of heaps that may be in flight (submitted but not completed) at any time
    pub max_heaps: usize,

    pub queue_full_policy: QueueFullPolicy,
}

impl Default for SendStreamConfig {
    fn default() -> Self {
        SendStreamConfig {
            max_packet_size: 1472,
            rate: 0.0,
            burst_size: 65536,
            max_heaps: 4,
            queue_full_policy: QueueFullPolicy::Reject,
        }
    }
}

impl SendStreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size - self.max_packet_size % ITEM_POINTER_SIZE < MIN_PACKET_SIZE {
            bail!("packet size must be at least {} bytes", MIN_PACKET_SIZE);
        }
        if !self.rate.is_finite() || self.rate < 0.0 {
            bail!("rate must be a non-negative number, was {}", self.rate);
        }
        if self.max_heaps == 0 {
            bail!("at least one heap must be allowed in flight");
        }
        if self.max_heaps > tokio::sync::Semaphore::MAX_PERMITS {
            bail!("max_heaps is too big");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UdpSendConfig {
    /// socket send buffer size, 0 for the OS default
    pub buffer_size: usize,
}

impl Default for UdpSendConfig {
    fn default() -> Self {
        UdpSendConfig {
            buffer_size: 512 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiveStreamConfig {
    /// Maximum number of partially received heaps that are tracked. When a packet for a new heap
    ///  arrives while this many heaps are incomplete, the least recently touched one is dropped.
    pub max_heaps: usize,

    /// Heaps declaring a bigger payload are rejected
    pub max_heap_size: usize,

    /// capacity of the completed-heap queue of a ring stream
    pub ring_heaps: usize,

    pub bug_compat: BugCompat,
}

impl Default for ReceiveStreamConfig {
    fn default() -> Self {
        ReceiveStreamConfig {
            max_heaps: 4,
            max_heap_size: 256 * 1024 * 1024,
            ring_heaps: 4,
            bug_compat: BugCompat::empty(),
        }
    }
}

impl ReceiveStreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_heaps == 0 {
            bail!("max_heaps must be at least 1");
        }
        if self.ring_heaps == 0 {
            bail!("ring_heaps must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UdpReaderConfig {
    /// Largest packet that is accepted, bigger ones are dropped
    pub max_size: usize,
    /// socket receive buffer size, 0 for the OS default
    pub buffer_size: usize,
    /// interface for joining an IPv4 multicast group, `None` to let the OS pick one
    pub interface_address: Option<Ipv4Addr>,
    /// interface for joining an IPv6 multicast group, 0 to let the OS pick one
    pub interface_index: u32,
}

impl Default for UdpReaderConfig {
    fn default() -> Self {
        UdpReaderConfig {
            max_size: 9200,
            buffer_size: 8 * 1024 * 1024,
            interface_address: None,
            interface_index: 0,
        }
    }
}

impl UdpReaderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_size < MIN_PACKET_SIZE {
            bail!("max_size must be at least {} bytes", MIN_PACKET_SIZE);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IbvReaderConfig {
    /// Largest frame that is accepted, including Ethernet, IP and UDP headers
    pub max_size: usize,
    /// Total size of the registered receive buffer. It is split into `max_size` slots.
    pub buffer_size: usize,
    /// Completion vector for interrupt-driven operation. It is taken modulo the number of
    ///  vectors the device has. A negative value selects busy polling.
    pub comp_vector: i32,
}

impl Default for IbvReaderConfig {
    fn default() -> Self {
        IbvReaderConfig {
            max_size: 9200,
            buffer_size: 8 * 1024 * 1024,
            comp_vector: 0,
        }
    }
}

impl IbvReaderConfig {
    pub fn n_slots(&self) -> usize {
        (self.buffer_size / self.max_size.max(1)).max(1)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_size < MIN_PACKET_SIZE {
            bail!("max_size must be at least {} bytes", MIN_PACKET_SIZE);
        }
        Ok(())
    }
}
