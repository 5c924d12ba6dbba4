use crate::cli::RawArgs;
use crate::error::CaptureError;

/// Fixed L2/L3/L4 header budget counted against every packet's `pkt_size`.
pub const L2L3L4_HEADER_BYTES: usize = 64;

/// Default SGEs per work request, also the fallback when `--nsge 0` is given.
pub const DEFAULT_NSGE: u32 = 4;

/// Whether the engine is capturing (receiver) or generating traffic (sender).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Receive,
    Send,
}

/// Frozen, validated configuration for one capture session. Built once from
/// `RawArgs` via `TryFrom` and never mutated afterwards; the engine, ring
/// attachment and verbs layer all borrow from it rather than own a copy of
/// the raw CLI input.
#[derive(Debug, Clone)]
pub struct ReceiveParams {
    pub mode: Mode,
    pub device_index: u32,
    pub smac: [u8; 6],
    pub dmac: [u8; 6],
    pub sip: std::net::Ipv4Addr,
    pub dip: std::net::Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    /// Bytes per packet, including `L2L3L4_HEADER_BYTES`.
    pub pkt_size: usize,
    /// Batch size `B`: work requests completed per publication event.
    pub send_n: usize,
    /// SGEs per work request `S`.
    pub nsge: u32,
    pub ring_key: u32,
    pub gpu_id: Option<u32>,
    pub cpu_id: Option<u32>,
    pub nbufs: u32,
    pub file_bytes: u64,
    pub dump_dir: Option<std::path::PathBuf>,
    pub dump_header: Option<std::path::PathBuf>,
    pub debug: bool,
    pub direct_to_ring: bool,
}

impl ReceiveParams {
    /// `W`: the size of the posted-receive-descriptor pool.
    pub fn work_request_count(&self) -> usize {
        if self.direct_to_ring {
            self.send_n
        } else {
            (4 * self.send_n).min(8192)
        }
    }
}

impl TryFrom<RawArgs> for ReceiveParams {
    type Error = CaptureError;

    fn try_from(args: RawArgs) -> Result<Self, Self::Error> {
        if args.pkt_size <= L2L3L4_HEADER_BYTES {
            return Err(CaptureError::Validation(format!(
                "pkt_size {} must be greater than the {}-byte header budget",
                args.pkt_size, L2L3L4_HEADER_BYTES
            )));
        }
        if args.send_n < 8 {
            return Err(CaptureError::Validation(format!(
                "send_n < 8 (got {})",
                args.send_n
            )));
        }
        if let Some(gpu) = args.gpu
            && gpu >= 6
        {
            return Err(CaptureError::Validation(format!(
                "gpu {gpu} out of range (>= 6)"
            )));
        }
        if args.device >= 4 {
            return Err(CaptureError::Validation(format!(
                "device {} out of range (>= 4)",
                args.device
            )));
        }
        if let Some(cpu) = args.cpu
            && cpu >= 384
        {
            return Err(CaptureError::Validation(format!(
                "cpu {cpu} out of range (>= 384)"
            )));
        }

        let nsge = if args.nsge == 0 {
            DEFAULT_NSGE
        } else {
            args.nsge
        };

        let smac = parse_mac(&args.smac)
            .ok_or_else(|| CaptureError::Validation(format!("invalid smac {}", args.smac)))?;
        let dmac = parse_mac(&args.dmac)
            .ok_or_else(|| CaptureError::Validation(format!("invalid dmac {}", args.dmac)))?;
        let sip = args
            .sip
            .parse()
            .map_err(|_| CaptureError::Validation(format!("invalid sip {}", args.sip)))?;
        let dip = args
            .dip
            .parse()
            .map_err(|_| CaptureError::Validation(format!("invalid dip {}", args.dip)))?;
        let ring_key = u32::from_str_radix(args.key.trim_start_matches("0x"), 16)
            .map_err(|_| CaptureError::Validation(format!("invalid ring key {}", args.key)))?;

        Ok(ReceiveParams {
            mode: if args.send { Mode::Send } else { Mode::Receive },
            device_index: args.device,
            smac,
            dmac,
            sip,
            dip,
            sport: args.sport,
            dport: args.dport,
            pkt_size: args.pkt_size,
            send_n: args.send_n,
            nsge,
            ring_key,
            gpu_id: args.gpu,
            cpu_id: args.cpu,
            nbufs: args.nbufs,
            file_bytes: args.file_bytes,
            dump_dir: args.dump_dir,
            dump_header: args.dump_header,
            debug: args.debug,
            direct_to_ring: args.direct_to_ring,
        })
    }
}

pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }

    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> RawArgs {
        RawArgs {
            device: 0,
            smac: "52:54:00:12:34:56".into(),
            dmac: "52:54:00:12:34:57".into(),
            sip: "10.0.0.1".into(),
            dip: "10.0.0.2".into(),
            sport: 4791,
            dport: 4791,
            pkt_size: 8192,
            send_n: 2048,
            nsge: 4,
            key: "1234abcd".into(),
            gpu: None,
            cpu: None,
            nbufs: 8,
            file_bytes: 0,
            dump_dir: None,
            dump_header: None,
            debug: false,
            direct_to_ring: true,
            send: false,
        }
    }

    #[test]
    fn test_parse_mac_roundtrip() {
        let mac = parse_mac("52:54:00:12:34:56").unwrap();
        assert_eq!(mac, [0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
    }

    #[test]
    fn test_parse_mac_invalid() {
        assert!(parse_mac("not-a-mac").is_none());
    }

    #[test]
    fn test_nsge_zero_rewritten_to_default() {
        let mut args = base_args();
        args.nsge = 0;
        let params = ReceiveParams::try_from(args).unwrap();
        assert_eq!(params.nsge, DEFAULT_NSGE);
    }

    #[test]
    fn test_send_n_below_eight_is_fatal() {
        let mut args = base_args();
        args.send_n = 4;
        let err = ReceiveParams::try_from(args).unwrap_err();
        assert!(matches!(err, CaptureError::Validation(msg) if msg.contains("send_n < 8")));
    }

    #[test]
    fn test_pkt_size_at_or_below_header_budget_is_fatal() {
        let mut args = base_args();
        args.pkt_size = 64;
        assert!(ReceiveParams::try_from(args).is_err());
    }

    #[test]
    fn test_gpu_out_of_range_is_fatal() {
        let mut args = base_args();
        args.gpu = Some(6);
        assert!(ReceiveParams::try_from(args).is_err());
    }

    #[test]
    fn test_device_out_of_range_is_fatal() {
        let mut args = base_args();
        args.device = 4;
        assert!(ReceiveParams::try_from(args).is_err());
    }

    #[test]
    fn test_cpu_out_of_range_is_fatal() {
        let mut args = base_args();
        args.cpu = Some(384);
        assert!(ReceiveParams::try_from(args).is_err());
    }

    #[test]
    fn test_work_request_count_direct_to_ring_is_send_n() {
        let args = base_args();
        let params = ReceiveParams::try_from(args).unwrap();
        assert_eq!(params.work_request_count(), 2048);
    }

    #[test]
    fn test_work_request_count_staged_caps_at_8192() {
        let mut args = base_args();
        args.direct_to_ring = false;
        args.send_n = 4096;
        let params = ReceiveParams::try_from(args).unwrap();
        assert_eq!(params.work_request_count(), 8192);
    }
}
