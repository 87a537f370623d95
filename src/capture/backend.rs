//! Capture backends
//!
//! Three acquisition modes are attempted in order, moving to the next only
//! on a setup or permission failure:
//!   1. pcap at layer 2 with the BPF `"ip"` filter
//!   2. pcap at layer 2 without a filter
//!   3. cooked AF_PACKET socket at layer 3
//!
//! Every backend yields the same normalised [`PacketRecord`]; non-IP frames
//! are dropped silently.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{IpProtocol, PacketRecord, TcpFlags};

/// BPF filter applied in the preferred mode
pub const BPF_FILTER: &str = "ip";

const SNAPLEN: i32 = 65535;
const READ_TIMEOUT_MS: i32 = 100;

/// Which acquisition mode the sniffer ended up with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Layer 2 capture with BPF filter
    L2Filtered,
    /// Layer 2 capture, filtering done in userspace
    L2Unfiltered,
    /// Layer 3 raw socket
    L3Socket,
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureMode::L2Filtered => write!(f, "l2_filtered"),
            CaptureMode::L2Unfiltered => write!(f, "l2_unfiltered"),
            CaptureMode::L3Socket => write!(f, "l3_socket"),
        }
    }
}

/// A packet source the capture thread can poll
///
/// `next_record` returns `Ok(None)` on read timeout or for frames that do
/// not project to an IP packet record.
pub trait CaptureBackend: Send {
    fn next_record(&mut self) -> Result<Option<PacketRecord>>;
    fn mode(&self) -> CaptureMode;
}

/// Resolve an interface name, honouring `"auto"`
pub fn resolve_device(interface: &str) -> Result<pcap::Device> {
    if interface == "auto" {
        return pcap::Device::lookup()
            .context("interface lookup failed")?
            .ok_or_else(|| anyhow!("no default capture interface found"));
    }
    pcap::Device::list()
        .context("interface enumeration failed")?
        .into_iter()
        .find(|d| d.name == interface)
        .ok_or_else(|| anyhow!("interface not found: {}", interface))
}

/// Names of all capture-capable interfaces
pub fn list_interfaces() -> Result<Vec<String>> {
    let devices = pcap::Device::list().context("interface enumeration failed")?;
    Ok(devices.into_iter().map(|d| d.name).collect())
}

/// Open the best available backend for an interface
///
/// Walks the fallback chain; only when every mode fails to set up does the
/// error surface to the caller of `start()`.
pub fn open_backend(interface: &str) -> Result<Box<dyn CaptureBackend>> {
    let mut last_err = None;

    match PcapCapture::open(interface, true) {
        Ok(backend) => return Ok(Box::new(backend)),
        Err(e) => {
            warn!("L2 filtered capture unavailable: {:#}", e);
            last_err = Some(e);
        }
    }

    match PcapCapture::open(interface, false) {
        Ok(backend) => return Ok(Box::new(backend)),
        Err(e) => {
            warn!("L2 unfiltered capture unavailable: {:#}", e);
            last_err = Some(e);
        }
    }

    #[cfg(target_os = "linux")]
    match RawSocketCapture::open(interface) {
        Ok(backend) => return Ok(Box::new(backend)),
        Err(e) => {
            warn!("L3 raw socket capture unavailable: {:#}", e);
            last_err = Some(e);
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no capture backend available")))
}

/// pcap-based layer 2 capture
pub struct PcapCapture {
    cap: pcap::Capture<pcap::Active>,
    mode: CaptureMode,
}

impl PcapCapture {
    pub fn open(interface: &str, with_filter: bool) -> Result<Self> {
        let device = resolve_device(interface)?;
        let name = device.name.clone();
        let mut cap = pcap::Capture::from_device(device)
            .with_context(|| format!("failed to open device {}", name))?
            .promisc(true)
            .snaplen(SNAPLEN)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .with_context(|| format!("failed to activate capture on {}", name))?;

        let mode = if with_filter {
            cap.filter(BPF_FILTER, true)
                .with_context(|| format!("failed to apply BPF filter on {}", name))?;
            CaptureMode::L2Filtered
        } else {
            CaptureMode::L2Unfiltered
        };

        Ok(Self { cap, mode })
    }
}

impl CaptureBackend for PcapCapture {
    fn next_record(&mut self) -> Result<Option<PacketRecord>> {
        match self.cap.next_packet() {
            Ok(pkt) => {
                let ts = pkt.header.ts.tv_sec as f64 + pkt.header.ts.tv_usec as f64 * 1e-6;
                Ok(record_from_ethernet(pkt.data, ts))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(anyhow!("pcap read error: {}", e)),
        }
    }

    fn mode(&self) -> CaptureMode {
        self.mode
    }
}

/// Cooked AF_PACKET socket; frames arrive without a link-layer header
#[cfg(target_os = "linux")]
pub struct RawSocketCapture {
    fd: libc::c_int,
    buf: Vec<u8>,
}

#[cfg(target_os = "linux")]
impl RawSocketCapture {
    pub fn open(interface: &str) -> Result<Self> {
        let protocol = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_DGRAM, protocol) };
        if fd < 0 {
            return Err(anyhow!(
                "raw socket creation failed: {}",
                std::io::Error::last_os_error()
            ));
        }

        let sock = Self {
            fd,
            buf: vec![0u8; SNAPLEN as usize],
        };

        // Read timeout so the capture loop can observe the stop flag
        let timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: (READ_TIMEOUT_MS * 1000) as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::setsockopt(
                sock.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(anyhow!(
                "raw socket timeout setup failed: {}",
                std::io::Error::last_os_error()
            ));
        }

        if interface != "auto" {
            sock.bind_interface(interface)?;
        }

        Ok(sock)
    }

    fn bind_interface(&self, interface: &str) -> Result<()> {
        let name = std::ffi::CString::new(interface)
            .map_err(|_| anyhow!("invalid interface name: {}", interface))?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(anyhow!("interface not found: {}", interface));
        }

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = ifindex as libc::c_int;

        let rc = unsafe {
            libc::bind(
                self.fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(anyhow!(
                "failed to bind raw socket to {}: {}",
                interface,
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl CaptureBackend for RawSocketCapture {
    fn next_record(&mut self) -> Result<Option<PacketRecord>> {
        let n = unsafe {
            libc::recv(
                self.fd,
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
                0,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return match err.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Ok(None),
                std::io::ErrorKind::Interrupted => Ok(None),
                _ => Err(anyhow!("raw socket read error: {}", err)),
            };
        }

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Ok(record_from_ip(&self.buf[..n as usize], ts))
    }

    fn mode(&self) -> CaptureMode {
        CaptureMode::L3Socket
    }
}

#[cfg(target_os = "linux")]
impl Drop for RawSocketCapture {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Project an ethernet frame onto a packet record
pub fn record_from_ethernet(data: &[u8], timestamp: f64) -> Option<PacketRecord> {
    let sliced = SlicedPacket::from_ethernet(data).ok()?;
    record_from_sliced(&sliced, timestamp)
}

/// Project a bare IP packet onto a packet record
pub fn record_from_ip(data: &[u8], timestamp: f64) -> Option<PacketRecord> {
    let sliced = SlicedPacket::from_ip(data).ok()?;
    record_from_sliced(&sliced, timestamp)
}

fn record_from_sliced(sliced: &SlicedPacket<'_>, timestamp: f64) -> Option<PacketRecord> {
    let (src_ip, dst_ip, protocol, size) = match &sliced.net {
        Some(NetSlice::Ipv4(v4)) => {
            let header = v4.header();
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                IpProtocol::from(header.protocol().0),
                header.total_len() as u32,
            )
        }
        Some(NetSlice::Ipv6(v6)) => {
            let header = v6.header();
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                IpProtocol::from(header.next_header().0),
                40 + header.payload_length() as u32,
            )
        }
        _ => return None, // ARP and friends
    };

    let mut rec = PacketRecord {
        timestamp,
        src_ip,
        dst_ip,
        src_port: 0,
        dst_port: 0,
        protocol,
        size,
        tcp_flags: 0,
        tcp_window: 0,
        payload_size: 0,
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            rec.src_port = tcp.source_port();
            rec.dst_port = tcp.destination_port();
            rec.tcp_flags = TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                ack: tcp.ack(),
                urg: tcp.urg(),
                ece: tcp.ece(),
                cwr: tcp.cwr(),
            }
            .to_u8();
            rec.tcp_window = tcp.window_size();
            rec.payload_size = tcp.payload().len() as u32;
        }
        Some(TransportSlice::Udp(udp)) => {
            rec.src_port = udp.source_port();
            rec.dst_port = udp.destination_port();
            rec.payload_size = udp.payload().len() as u32;
        }
        _ => {} // ICMP keeps ports at 0
    }

    Some(rec)
}
