//! Estimates the sustainable heap bandwidth between two machines.
//!
//! UDP is lossy, so the sustainable rate is found by binary search: each candidate rate is
//!  tried several times, and it counts as sustainable if most tries lose at most the end
//!  marker. A TCP connection synchronizes the two ends; all configuration happens on the
//!  master.
//!
//! ```text
//! receiver$ spead_bench slave 7148
//! sender$   spead_bench master receiver.example.com 7148
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use bytes::Bytes;
use clap::Parser;
use clap_derive::{Args, Parser, Subcommand};
use spead_protocol::heap::Heap;
use spead_transport::config::{QueueFullPolicy, ReceiveStreamConfig, SendStreamConfig, UdpReaderConfig, UdpSendConfig};
use spead_transport::recv::ring_stream::RingStream;
use spead_transport::send::udp::UdpSendStream;
use spead_transport::send::HeapSender;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio::{select, spawn};
use tracing::{debug, error, info, warn, Level};

#[derive(Parser)]
struct CliArgs {
    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Sends heaps and searches for the highest rate the slave keeps up with
    Master(MasterArgs),
    /// Receives heaps on request of a master
    Slave {
        port: u16,
    },
}

#[derive(Args, Clone)]
struct MasterArgs {
    /// print only the final result
    #[clap(long, default_value_t = false)]
    quiet: bool,
    /// maximum packet size
    #[clap(long, default_value_t = 9172)]
    packet: usize,
    /// payload bytes per heap
    #[clap(long, default_value_t = 4 * 1024 * 1024)]
    heap_size: usize,
    #[clap(long, default_value_t = 512 * 1024)]
    send_buffer: usize,
    #[clap(long, default_value_t = 8 * 1024 * 1024)]
    recv_buffer: usize,
    #[clap(long, default_value_t = 65536)]
    burst: usize,
    /// maximum number of heaps in flight on either end
    #[clap(long, default_value_t = 4)]
    heaps: usize,

    host: String,
    port: u16,
}

const TRIES_PER_RATE: usize = 5;
const GOOD_TRIES_REQUIRED: usize = 3;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    match args.mode {
        Mode::Master(master_args) => run_master(master_args).await,
        Mode::Slave { port } => run_slave(port).await,
    }
}

async fn next_line(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> anyhow::Result<String> {
    lines.next_line().await?
        .ok_or_else(|| anyhow!("control connection closed"))
}

async fn send_heaps(args: &MasterArgs, rate: f64, num_heaps: usize) -> anyhow::Result<()> {
    let config = SendStreamConfig {
        max_packet_size: args.packet,
        rate,
        burst_size: args.burst,
        max_heaps: 2,
        queue_full_policy: QueueFullPolicy::Block,
    };
    let udp_config = UdpSendConfig { buffer_size: args.send_buffer };
    let stream = UdpSendStream::connect(Handle::current(), &args.host, args.port, config, udp_config).await?;

    let payload = Bytes::from(vec![0u8; args.heap_size]);
    let failures = Arc::new(AtomicUsize::new(0));
    for cnt in 1..=num_heaps {
        let mut heap = Heap::new(cnt as u64);
        if cnt == num_heaps {
            heap.add_end()?;
        }
        else {
            heap.add_item(0x1000, payload.clone(), false)?;
        }

        let failures = failures.clone();
        stream.async_send_heap(Arc::new(heap), Box::new(move |result| {
            if let Err(e) = result {
                debug!("heap {} not sent: {}", cnt, e);
                failures.fetch_add(1, Ordering::Relaxed);
            }
        })).await;
    }
    stream.flush().await;

    let failures = failures.load(Ordering::Relaxed);
    if failures > 0 {
        warn!("{} heaps failed to send", failures);
    }
    Ok(())
}

async fn measure_once(args: &MasterArgs, rate: f64, num_heaps: usize) -> anyhow::Result<bool> {
    let control = TcpStream::connect((args.host.as_str(), args.port)).await?;
    let (read, mut write) = control.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(format!("start {} {} {}\n", args.heaps, args.packet, args.recv_buffer).as_bytes()).await?;
    let response = next_line(&mut lines).await?;
    if response != "ready" {
        bail!("unexpected response to start: {}", response);
    }

    send_heaps(args, rate, num_heaps).await?;

    // give the receiver time to drain its queues
    sleep(Duration::from_millis(100)).await;
    write.write_all(b"stop\n").await?;
    let response = next_line(&mut lines).await?;
    let received_heaps: usize = response.strip_prefix("received ")
        .ok_or_else(|| anyhow!("unexpected response to stop: {}", response))?
        .parse()?;
    write.write_all(b"exit\n").await?;

    debug!("received {} of {} heaps", received_heaps, num_heaps);
    // the end marker carries no items and is not counted
    Ok(received_heaps + 1 >= num_heaps)
}

async fn measure(args: &MasterArgs, rate: f64, num_heaps: usize) -> anyhow::Result<bool> {
    let mut good = 0;
    for _ in 0..TRIES_PER_RATE {
        if measure_once(args, rate, num_heaps).await? {
            good += 1;
        }
        sleep(Duration::from_millis(500)).await;
    }
    Ok(good >= GOOD_TRIES_REQUIRED)
}

async fn run_master(args: MasterArgs) -> anyhow::Result<()> {
    // bytes per second
    let mut low = 0.5e9;
    let mut high = 5e9;
    while high - low > 1e8 / 8.0 {
        let rate = (low + high) * 0.5;
        // at least 1 GiB and one second of data, to get past cache and warmup effects
        let num_heaps = (f64::max(1024.0 * 1024.0 * 1024.0, rate) / args.heap_size as f64) as usize + 2;

        let good = measure(&args, rate, num_heaps).await?;
        if !args.quiet {
            println!("Rate: {:.3} Gbps: {}", rate * 8.0 / 1e9, if good { "GOOD" } else { "BAD" });
        }
        if good {
            low = rate;
        }
        else {
            high = rate;
        }
    }

    let rate_gbps = (low + high) * 0.5 * 8.0 / 1e9;
    if args.quiet {
        println!("{}", rate_gbps);
    }
    else {
        println!("Sustainable rate: {:.3} Gbps", rate_gbps);
    }
    Ok(())
}

struct Receiver {
    stop: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<usize>,
}

fn start_receiver(port: u16, max_heaps: usize, max_size: usize, buffer_size: usize) -> anyhow::Result<Receiver> {
    let config = ReceiveStreamConfig { max_heaps, ..Default::default() };
    let mut ring = RingStream::new(Handle::current(), config)?;
    let reader_config = UdpReaderConfig { max_size, buffer_size, ..Default::default() };
    ring.stream().add_udp_reader(([0, 0, 0, 0], port).into(), reader_config)?;

    let (stop, mut stop_requested) = oneshot::channel();
    let task = spawn(async move {
        let mut num_heaps = 0;
        loop {
            select! {
                heap = ring.pop() => match heap {
                    Ok(_) => num_heaps += 1,
                    Err(_) => break,
                },
                _ = &mut stop_requested => {
                    ring.stop();
                    while let Ok(Some(_)) = ring.try_pop() {
                        num_heaps += 1;
                    }
                    break;
                }
            }
        }
        info!("receiver finished: {:?}", ring.stats());
        num_heaps
    });
    Ok(Receiver { stop, task })
}

async fn handle_connection(control: TcpStream, port: u16) -> anyhow::Result<()> {
    let (read, mut write) = control.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut receiver: Option<Receiver> = None;

    while let Some(command) = lines.next_line().await? {
        debug!("command: {}", command);
        let mut words = command.split_whitespace();
        match words.next() {
            Some("start") => {
                if receiver.is_some() {
                    warn!("start received while already running");
                    continue;
                }
                let params = words.map(str::parse).collect::<Result<Vec<usize>, _>>()?;
                let &[max_heaps, max_size, buffer_size] = params.as_slice() else {
                    bail!("malformed start command: {}", command);
                };
                receiver = Some(start_receiver(port, max_heaps, max_size, buffer_size)?);
                write.write_all(b"ready\n").await?;
            }
            Some("stop") => {
                let Some(Receiver { stop, task }) = receiver.take() else {
                    warn!("stop received while not running");
                    continue;
                };
                let _ = stop.send(());
                let num_heaps = task.await?;
                write.write_all(format!("received {}\n", num_heaps).as_bytes()).await?;
            }
            Some("exit") => break,
            _ => warn!("bad command: {}", command),
        }
    }

    debug!("control connection closed");
    if let Some(Receiver { stop, task }) = receiver {
        let _ = stop.send(());
        task.await?;
    }
    Ok(())
}

async fn run_slave(port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("waiting for master on port {}", port);
    loop {
        let (control, peer) = listener.accept().await?;
        info!("master connected from {:?}", peer);
        spawn(async move {
            if let Err(e) = handle_connection(control, port).await {
                error!("control connection failed: {:#}", e);
            }
        });
    }
}
