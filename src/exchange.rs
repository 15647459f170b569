//! Synchronized send/receive exchange on a raw AF_PACKET socket.
//!
//! One exchange instance is shared by a sender and a receiver thread. The
//! sender broadcasts a fixed 29-byte EtherCAT probe frame; the receiver
//! pulls it back off the wire together with the kernel's hardware and
//! software receive timestamps and feeds the inter-arrival deltas into the
//! per-clock-domain recorders.

use std::io::IoSliceMut;
use std::mem;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use nix::net::if_::if_nametoindex;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, TimestampingFlag, Timestamps,
};
use nix::sys::time::TimeSpec;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::TestParameters;
use crate::delta::{timespec_to_nanos, DeltaTracker};
use crate::rendezvous::IterationGate;
use crate::report::LatencyRecorder;
use crate::traits::NicTest;

pub const ETHERCAT_ETHERTYPE: u16 = 0x88A4;
pub const FRAME_SIZE: usize = 29;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_TIMEOUT_MS: u16 = 1_000;
const RECEIVE_BUFFER_SIZE: usize = 2048;

// linux/net_tstamp.h; the ioctl and config layout are stable ABI but not
// wrapped by libc.
const SIOCSHWTSTAMP: libc::c_ulong = 0x89b0;
const HWTSTAMP_TX_ON: libc::c_int = 1;
const HWTSTAMP_FILTER_ALL: libc::c_int = 1;
const HWTSTAMP_FILTER_PTP_V2_EVENT: libc::c_int = 12;

#[repr(C)]
struct HwtstampConfig {
    flags: libc::c_int,
    tx_type: libc::c_int,
    rx_filter: libc::c_int,
}

pub struct FrameExchange {
    socket: Socket,
    gate: IterationGate,
    receive_state: Mutex<ReceiveState>,
}

// Written only by the receiver role; the mutex is uncontended and exists to
// let `receive` take `&self` on the shared exchange.
struct ReceiveState {
    hardware_tracker: DeltaTracker,
    software_tracker: DeltaTracker,
    hardware_report: LatencyRecorder,
    software_report: LatencyRecorder,
}

/// The fixed EtherCAT BRD probe frame: broadcast destination, zero source,
/// one broadcast-read sub-command addressed at offset 0x0500.
pub fn build_probe_frame() -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    // Destination: broadcast. Source stays all-zero.
    frame[0..6].fill(0xff);
    BigEndian::write_u16(&mut frame[12..14], ETHERCAT_ETHERTYPE);
    // EtherCAT frame length
    frame[14] = 0x0d;
    // Frame type selector
    frame[15] = 0x10;
    // Command
    frame[16] = 0x08;
    // Index
    frame[17] = 0xff;
    // Subordinate address stays zero (bytes 18-19); offset address:
    frame[20] = 0x00;
    frame[21] = 0x05;
    // No roundtrip / last sub-command, length
    frame[22] = 0x01;
    frame
}

impl FrameExchange {
    /// Create, configure and bind the raw socket. Any configuration failure
    /// is fatal and carries the underlying OS error; a usable exchange is
    /// fully bound with timestamping enabled.
    pub fn new(
        params: &TestParameters,
        hardware_report: LatencyRecorder,
        software_report: LatencyRecorder,
    ) -> Result<Self> {
        let nic_name = params
            .nic_name
            .as_deref()
            .context("no interface configured for the frame exchange")?;

        let protocol = Protocol::from(i32::from(ETHERCAT_ETHERTYPE.to_be()));
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol))
            .context("failed to create raw socket")?;

        socket
            .set_read_timeout(Some(SOCKET_TIMEOUT))
            .context("failed to set socket receive timeout")?;
        socket
            .set_write_timeout(Some(SOCKET_TIMEOUT))
            .context("failed to set socket send timeout")?;

        // Link-local delivery only, never via a gateway.
        set_socket_option(&socket, libc::SOL_SOCKET, libc::SO_DONTROUTE, 1)
            .context("failed to set socket routing to 'dont route'")?;

        enable_interface_timestamping(&socket, nic_name);

        let flags = TimestampingFlag::SOF_TIMESTAMPING_TX_HARDWARE
            | TimestampingFlag::SOF_TIMESTAMPING_RX_HARDWARE
            | TimestampingFlag::SOF_TIMESTAMPING_RAW_HARDWARE
            | TimestampingFlag::SOF_TIMESTAMPING_SOFTWARE;
        setsockopt(&socket, sockopt::Timestamping, &flags)
            .context("failed to enable timestamp reporting on socket")?;

        let interface_index = if_nametoindex(nic_name)
            .with_context(|| format!("failed to get interface index for NIC: {nic_name}"))?;

        set_promiscuous_broadcast(&socket, nic_name)
            .with_context(|| format!("failed to set promiscuous and broadcast flags on {nic_name}"))?;

        bind_to_interface(&socket, interface_index as libc::c_int)
            .with_context(|| format!("failed to bind socket on interface {nic_name}"))?;

        debug!("frame exchange bound to {nic_name} (index {interface_index})");

        Ok(FrameExchange {
            socket,
            gate: IterationGate::new(),
            receive_state: Mutex::new(ReceiveState {
                hardware_tracker: DeltaTracker::new(),
                software_tracker: DeltaTracker::new(),
                hardware_report,
                software_report,
            }),
        })
    }

    /// Anomaly counts per clock domain (hardware, software).
    pub fn clock_anomalies(&self) -> (u64, u64) {
        let state = self.receive_state.lock().unwrap();
        (
            state.hardware_tracker.anomalies(),
            state.software_tracker.anomalies(),
        )
    }
}

impl NicTest for FrameExchange {
    fn send(&self) -> Result<()> {
        let frame = build_probe_frame();

        // Lock-step with the receiver: iteration n+1 is not transmitted
        // until the receiver has booked iteration n.
        self.gate.wait_for_receiver(SOCKET_TIMEOUT)?;

        self.socket
            .send(&frame)
            .context("failed to send data on socket")?;

        self.gate.advance_sender();
        Ok(())
    }

    fn receive(&self) -> Result<bool> {
        // Advance and signal before blocking so the sender's transmit and
        // our receive proceed concurrently.
        let iteration = self.gate.advance_receiver();

        let mut poll_fds = [PollFd::new(self.socket.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut poll_fds, POLL_TIMEOUT_MS)
            .context("error during frame polling on socket")?;
        if ready == 0 {
            debug!("no frame within poll timeout at iteration {iteration}");
            return Ok(false);
        }

        let mut data = [0u8; RECEIVE_BUFFER_SIZE];
        let mut iov = [IoSliceMut::new(&mut data)];
        let mut cmsg_buffer = nix::cmsg_space!(Timestamps);
        let message = match recvmsg::<()>(
            self.socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        ) {
            Ok(message) => message,
            Err(errno) => {
                // Kept non-fatal so a long run survives transient hiccups.
                warn!("recvmsg failed at iteration {iteration}: {errno}");
                return Ok(false);
            }
        };

        let mut software_ns = None;
        let mut hardware_ns = None;
        for cmsg in message.cmsgs() {
            if let ControlMessageOwned::ScmTimestampsns(timestamps) = cmsg {
                // timespec[3]: [0] software, [1] legacy (ignored), [2] raw
                // hardware.
                software_ns = nonzero_nanos(&timestamps.system);
                hardware_ns = nonzero_nanos(&timestamps.hw_raw);
            }
        }

        let mut state = self.receive_state.lock().unwrap();
        let state = &mut *state;
        if let Some(nanos) = hardware_ns {
            if let Some(delta) = state.hardware_tracker.update(nanos) {
                state.hardware_report.add_observation(delta, iteration);
            }
        }
        if let Some(nanos) = software_ns {
            if let Some(delta) = state.software_tracker.update(nanos) {
                state.software_report.add_observation(delta, iteration);
            }
        }

        Ok(true)
    }
}

/// The kernel reports a missing timestamp as an all-zero timespec.
fn nonzero_nanos(time: &TimeSpec) -> Option<i64> {
    if time.tv_sec() == 0 && time.tv_nsec() == 0 {
        return None;
    }
    Some(timespec_to_nanos(time))
}

fn set_socket_option(
    socket: &Socket,
    level: libc::c_int,
    option: libc::c_int,
    value: libc::c_int,
) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn ifreq_for(name: &str) -> Result<libc::ifreq> {
    if name.len() >= libc::IFNAMSIZ {
        bail!("interface name too long: {name}");
    }
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

/// Ask the driver to timestamp all packets in hardware; NICs that reject the
/// catch-all filter get the narrower PTP event filter. Neither being
/// accepted is not fatal: software timestamps still flow.
fn enable_interface_timestamping(socket: &Socket, nic_name: &str) {
    for rx_filter in [HWTSTAMP_FILTER_ALL, HWTSTAMP_FILTER_PTP_V2_EVENT] {
        let mut config = HwtstampConfig {
            flags: 0,
            tx_type: HWTSTAMP_TX_ON,
            rx_filter,
        };
        let Ok(mut ifr) = ifreq_for(nic_name) else {
            return;
        };
        ifr.ifr_ifru.ifru_data = &mut config as *mut HwtstampConfig as *mut libc::c_char;
        let rc = unsafe { libc::ioctl(socket.as_raw_fd(), SIOCSHWTSTAMP, &mut ifr) };
        if rc == 0 {
            return;
        }
    }
    warn!(
        "hardware timestamping unavailable on {nic_name}: {}",
        std::io::Error::last_os_error()
    );
}

fn set_promiscuous_broadcast(socket: &Socket, nic_name: &str) -> Result<()> {
    let mut ifr = ifreq_for(nic_name)?;
    let rc = unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCGIFFLAGS, &mut ifr) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error()).context("failed to read interface flags");
    }

    let flags = unsafe { ifr.ifr_ifru.ifru_flags };
    ifr.ifr_ifru.ifru_flags = flags | (libc::IFF_PROMISC | libc::IFF_BROADCAST) as libc::c_short;
    let rc = unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCSIFFLAGS, &mut ifr) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error()).context("failed to write interface flags");
    }
    Ok(())
}

fn bind_to_interface(socket: &Socket, interface_index: libc::c_int) -> Result<()> {
    let mut address: libc::sockaddr_ll = unsafe { mem::zeroed() };
    address.sll_family = libc::AF_PACKET as libc::sa_family_t;
    address.sll_protocol = ETHERCAT_ETHERTYPE.to_be();
    address.sll_ifindex = interface_index;

    let rc = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &address as *const libc::sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_frame_is_bit_exact() {
        let frame = build_probe_frame();
        let expected: [u8; FRAME_SIZE] = [
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // destination: broadcast
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // source: zero
            0x88, 0xa4, // ethertype
            0x0d, // frame length
            0x10, // frame type
            0x08, // command
            0xff, // index
            0x00, 0x00, // subordinate address
            0x00, 0x05, // offset address
            0x01, // last sub-command / length
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // zero padding
        ];
        assert_eq!(frame, expected);
    }

    #[test]
    fn missing_timestamps_are_all_zero_timespecs() {
        assert_eq!(nonzero_nanos(&TimeSpec::new(0, 0)), None);
        assert_eq!(nonzero_nanos(&TimeSpec::new(0, 1)), Some(1));
        assert_eq!(
            nonzero_nanos(&TimeSpec::new(3, 500)),
            Some(3_000_000_500)
        );
    }

    #[test]
    fn interface_names_must_fit_ifreq() {
        assert!(ifreq_for("eth0").is_ok());
        assert!(ifreq_for("a-name-well-beyond-ifnamsiz").is_err());
    }
}
