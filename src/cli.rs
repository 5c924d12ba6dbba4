use clap::Parser;
use std::path::PathBuf;

/// RoCEv2 UDP capture engine: ingests a flow-steered stream of fixed-size
/// datagrams into a shared-memory producer/consumer ring.
#[derive(Debug, Parser)]
#[command(name = "rocedada", version, about)]
pub struct RawArgs {
    /// NIC device index
    #[arg(short = 'd', long, default_value_t = 0)]
    pub device: u32,

    /// Source MAC of the flow-steering match tuple
    #[arg(long)]
    pub smac: String,

    /// Destination MAC of the flow-steering match tuple
    #[arg(long)]
    pub dmac: String,

    /// Source IPv4 of the flow-steering match tuple
    #[arg(long)]
    pub sip: String,

    /// Destination IPv4 of the flow-steering match tuple
    #[arg(long)]
    pub dip: String,

    /// Source UDP port of the flow-steering match tuple
    #[arg(long)]
    pub sport: u16,

    /// Destination UDP port of the flow-steering match tuple
    #[arg(long)]
    pub dport: u16,

    /// Bytes per packet, including the 64-byte L2/L3/L4 header budget
    #[arg(long = "pkt_size")]
    pub pkt_size: usize,

    /// Batch size: work requests completed per publication event
    #[arg(long = "send_n")]
    pub send_n: usize,

    /// SGEs per work request (0 is rewritten to 4)
    #[arg(long, default_value_t = 4)]
    pub nsge: u32,

    /// Ring attachment key, as 32-bit hex (with or without a 0x prefix)
    #[arg(long)]
    pub key: String,

    /// GPU device index for staging-buffer placement (unset = host memory)
    #[arg(long)]
    pub gpu: Option<u32>,

    /// CPU core to pin the capture worker to (unset = unpinned)
    #[arg(long)]
    pub cpu: Option<u32>,

    /// Number of ring blocks, passed through to the header record
    #[arg(long, default_value_t = 8)]
    pub nbufs: u32,

    /// Total expected file size in bytes, copied into the header's FILE_SIZE
    #[arg(long = "file-bytes", default_value_t = 0)]
    pub file_bytes: u64,

    /// Reader-side dump output directory (reader mode only)
    #[arg(long = "dump-dir")]
    pub dump_dir: Option<PathBuf>,

    /// Reader-side header template path (reader mode only)
    #[arg(long = "dump-header")]
    pub dump_header: Option<PathBuf>,

    /// Verbose tracing
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Receive directly into ring blocks (zero-copy); default is staged-copy
    #[arg(long, default_value_t = false)]
    pub direct_to_ring: bool,

    /// Run as a sender instead of a receiver
    #[arg(long, default_value_t = false)]
    pub send: bool,
}
