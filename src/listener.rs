//! Passive packet capture.
//!
//! The daemon never binds the advertised UDP port. Scanners get the
//! kernel's closed-port answer while a pcap handle observes the traffic
//! out-of-band through a BPF filter. Frame decoding is a pure function of
//! the captured bytes so it can be exercised exhaustively in tests.

use std::net::IpAddr;
use std::thread;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest UDP payload a knock may occupy. Anything bigger is dropped
/// before it reaches the pipeline.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Capture snapshot length: a full Ethernet frame.
pub const SNAPLEN: i32 = 1518;

/// Poll granularity of the capture loop; bounds shutdown latency.
const READ_TIMEOUT_MS: i32 = 400;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IP_PROTO_UDP: u8 = 17;

/// One captured knock: the UDP body and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    pub payload: Vec<u8>,
    pub source_ip: IpAddr,
}

#[derive(thiserror::Error, Debug)]
pub enum ListenerError {
    #[error("failed to open capture on '{iface}': {source}")]
    Open {
        iface: String,
        #[source]
        source: pcap::Error,
    },
    #[error("kernel rejected BPF filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: pcap::Error,
    },
}

/// Decode an Ethernet frame down to the UDP body and source address.
///
/// Returns `None` on anything that is not a well-formed UDP-over-IP frame
/// (missing or truncated layers) and on payloads over [`MAX_PAYLOAD_SIZE`].
/// Total over arbitrary input; must never panic.
pub fn extract_packet_info(frame: &[u8]) -> Option<PacketInfo> {
    if frame.len() < 14 {
        return None;
    }
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut offset = 14;

    // One 802.1Q tag is enough for the deployments we care about.
    if ethertype == ETHERTYPE_VLAN {
        if frame.len() < 18 {
            return None;
        }
        ethertype = u16::from_be_bytes([frame[16], frame[17]]);
        offset = 18;
    }

    let (source_ip, transport) = match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(&frame[offset..])?,
        ETHERTYPE_IPV6 => parse_ipv6(&frame[offset..])?,
        _ => return None,
    };

    let payload = parse_udp(transport)?;
    if payload.is_empty() || payload.len() > MAX_PAYLOAD_SIZE {
        return None;
    }

    Some(PacketInfo { payload: payload.to_vec(), source_ip })
}

fn parse_ipv4(packet: &[u8]) -> Option<(IpAddr, &[u8])> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    let header_len = usize::from(packet[0] & 0x0f) * 4;
    if header_len < 20 || packet.len() < header_len {
        return None;
    }
    if packet[9] != IP_PROTO_UDP {
        return None;
    }
    let source: [u8; 4] = packet[12..16].try_into().ok()?;
    Some((IpAddr::from(source), &packet[header_len..]))
}

fn parse_ipv6(packet: &[u8]) -> Option<(IpAddr, &[u8])> {
    if packet.len() < 40 || packet[0] >> 4 != 6 {
        return None;
    }
    // Extension headers are not walked: the BPF filter only passes plain
    // UDP datagrams, so anything else is noise.
    if packet[6] != IP_PROTO_UDP {
        return None;
    }
    let source: [u8; 16] = packet[8..24].try_into().ok()?;
    Some((IpAddr::from(source), &packet[40..]))
}

fn parse_udp(segment: &[u8]) -> Option<&[u8]> {
    if segment.len() < 8 {
        return None;
    }
    // The UDP length field wins over the slice length: captured frames may
    // carry link-layer padding past the datagram.
    let total = usize::from(u16::from_be_bytes([segment[4], segment[5]]));
    if total < 8 || total > segment.len() {
        return None;
    }
    Some(&segment[8..total])
}

/// Build the capture filter for the configured port and optional bind IP.
pub fn bpf_filter(port: u16, listen_ip: Option<IpAddr>) -> String {
    match listen_ip {
        Some(ip) => format!("dst host {ip} and udp and port {port}"),
        None => format!("udp and port {port}"),
    }
}

/// Open the capture handle and start the blocking capture thread.
///
/// Captured knocks are emitted on the returned channel. The channel is
/// deliberately capacity-1: a slow pipeline blocks the sender and lets the
/// kernel shed excess packets at the capture layer instead of buffering
/// attacker traffic in memory. When `cancel` fires the thread drops the
/// handle and the sender, closing the channel.
pub fn spawn(
    iface: &str,
    port: u16,
    listen_ip: Option<IpAddr>,
    cancel: CancellationToken,
) -> Result<(mpsc::Receiver<PacketInfo>, thread::JoinHandle<()>), ListenerError> {
    let capture = pcap::Capture::from_device(iface)
        .and_then(|cap| {
            cap.snaplen(SNAPLEN)
                .promisc(true)
                .timeout(READ_TIMEOUT_MS)
                .immediate_mode(true)
                .open()
        })
        .map_err(|source| ListenerError::Open { iface: iface.to_string(), source })?;

    let filter = bpf_filter(port, listen_ip);
    let mut capture = capture;
    capture
        .filter(&filter, true)
        .map_err(|source| ListenerError::Filter { filter: filter.clone(), source })?;

    info!(iface, port, %filter, "passive capture started");

    let (tx, rx) = mpsc::channel(1);
    let iface_name = iface.to_string();
    let handle = thread::spawn(move || {
        capture_loop(capture, tx, cancel);
        info!(iface = %iface_name, "capture stopped");
    });

    Ok((rx, handle))
}

fn capture_loop(
    mut capture: pcap::Capture<pcap::Active>,
    tx: mpsc::Sender<PacketInfo>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match capture.next_packet() {
            Ok(packet) => {
                let Some(info) = extract_packet_info(packet.data) else {
                    debug!("captured frame without a usable UDP body");
                    continue;
                };
                // blocking_send is the backpressure point: the kernel drops
                // packets while the pipeline is busy.
                if tx.blocking_send(info).is_err() {
                    return;
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(err) => {
                warn!(error = %err, "capture read failed, stopping listener");
                return;
            }
        }
    }
}
