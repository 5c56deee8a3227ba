//! AF_PACKET capture backend: a `TPACKET_V2` RX ring shared with the kernel
//! and a `PACKET_FANOUT_HASH` group spreading flows across sockets.

mod ring;

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use libc::{c_int, c_void, socklen_t};
use tracing::{debug, trace, warn};

use crate::api::{self, Capture, FanoutGroupId, PacketView, Wake};
use crate::errors::CaptureError;
use ring::{
    PACKET_FANOUT, PACKET_FANOUT_FLAG_DEFRAG, PACKET_FANOUT_HASH, PACKET_RX_RING, PACKET_VERSION,
    RxRing, TPACKET_V2,
};

pub use ring::RingLayout;

/// -------- Flags ------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct AfPacketFlags {
    pub ring: RingLayout,
    /// Put the interface in promiscuous mode for the lifetime of the socket.
    pub promiscuous: bool,
}

impl Default for AfPacketFlags {
    fn default() -> Self {
        Self {
            ring: RingLayout::default(),
            promiscuous: true,
        }
    }
}

impl api::Flags for AfPacketFlags {}

/// -------- Waker ------------------------------------------------------------------

struct WakeFd {
    fd: OwnedFd,
    woken: AtomicBool,
}

/// Wakes a socket blocked in `poll(2)` through an eventfd.
#[derive(Clone)]
pub struct Waker {
    inner: Arc<WakeFd>,
}

impl Waker {
    fn new() -> io::Result<Self> {
        // SAFETY: eventfd has no memory-safety preconditions; the result is checked.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            inner: Arc::new(WakeFd {
                // SAFETY: fd was just created and is owned by nobody else.
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
                woken: AtomicBool::new(false),
            }),
        })
    }

    fn as_raw_fd(&self) -> RawFd {
        self.inner.fd.as_raw_fd()
    }
}

impl Wake for Waker {
    fn wake(&self) {
        self.inner.woken.store(true, Ordering::Release);
        let val: u64 = 1;
        // SAFETY: the eventfd is valid for as long as `inner` lives; val is
        // a properly initialized u64.
        let ret = unsafe {
            libc::write(
                self.as_raw_fd(),
                &val as *const u64 as *const c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            // EAGAIN means the counter is already non-zero: the poller is awake anyway.
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!(error = %err, "failed to signal capture eventfd");
            }
        }
    }

    fn is_woken(&self) -> bool {
        self.inner.woken.load(Ordering::Acquire)
    }
}

/// -------- Socket -----------------------------------------------------------------

pub struct Sock {
    // Field order matters: the ring is unmapped before the socket is closed.
    ring: RxRing,
    fd: OwnedFd,
    waker: Waker,
    device: String,
    group: FanoutGroupId,
}

fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, val: &T) -> io::Result<()> {
    // SAFETY: val points to a live T and we pass its exact size.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            val as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pause after a recoverable socket error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_millis(1);

/// Errors the kernel latches on a packet socket while its interface is down
/// or being reconfigured. The socket keeps working once the link returns.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENETDOWN | libc::ENETRESET | libc::ENXIO | libc::ENODEV | libc::ENOBUFS | libc::ENOMEM)
    )
}

fn open_error(device: &str, err: io::Error) -> CaptureError {
    match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => CaptureError::PermissionDenied(device.to_string()),
        Some(libc::ENODEV) | Some(libc::ENXIO) => CaptureError::NoSuchDevice(device.to_string()),
        _ => CaptureError::Io(err),
    }
}

impl Sock {
    /// Waits until the socket or the waker becomes readable. A transient
    /// socket error is logged and swallowed.
    fn wait(&self) -> api::Result<()> {
        let mut fds = [
            libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.waker.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        // SAFETY: fds is a valid array of initialized pollfd structs.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }
        if fds[0].revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF).into());
        }
        if fds[0].revents & libc::POLLERR != 0 {
            match self.take_socket_error()? {
                Some(err) if !is_transient(&err) => return Err(CaptureError::Io(err)),
                Some(err) => warn!(device = %self.device, error = %err, "capture socket error, still polling"),
                None => trace!(device = %self.device, "POLLERR with no pending socket error"),
            }
            thread::sleep(ERROR_BACKOFF);
        }
        Ok(())
    }

    /// Reads and clears the pending `SO_ERROR`, if any.
    fn take_socket_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: c_int = 0;
        let mut len = mem::size_of::<c_int>() as socklen_t;
        // SAFETY: err/len are valid out-parameters of the right size.
        let ret = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut c_int as *mut c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((err != 0).then(|| io::Error::from_raw_os_error(err)))
    }
}

impl Capture for Sock {
    type Flags = AfPacketFlags;
    type Waker = Waker;

    fn open(device: &str, group: FanoutGroupId, flags: &Self::Flags) -> api::Result<Self> {
        flags.ring.validate().map_err(CaptureError::InvalidRing)?;

        let name = CString::new(device).map_err(|_| CaptureError::NoSuchDevice(device.to_string()))?;
        // SAFETY: name is a valid NUL-terminated string.
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(CaptureError::NoSuchDevice(device.to_string()));
        }

        let proto = (libc::ETH_P_ALL as u16).to_be();
        // SAFETY: plain socket(2) call; the result is checked.
        let raw = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, proto as c_int) };
        if raw < 0 {
            return Err(open_error(device, io::Error::last_os_error()));
        }
        // SAFETY: raw is a freshly created descriptor we exclusively own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let rawfd = fd.as_raw_fd();

        setsockopt(rawfd, libc::SOL_PACKET, PACKET_VERSION, &TPACKET_V2)
            .map_err(|e| open_error(device, e))?;
        let req = flags.ring.as_req();
        setsockopt(rawfd, libc::SOL_PACKET, PACKET_RX_RING, &req)
            .map_err(|e| open_error(device, e))?;
        let ring = RxRing::map(fd.as_fd(), flags.ring).map_err(|e| open_error(device, e))?;

        // SAFETY: sockaddr_ll is a C struct for which all-zero is valid.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = proto;
        addr.sll_ifindex = ifindex as c_int;
        // SAFETY: addr is initialized and we pass its exact size.
        let ret = unsafe {
            libc::bind(
                rawfd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(open_error(device, io::Error::last_os_error()));
        }

        if flags.promiscuous {
            // SAFETY: packet_mreq is a C struct for which all-zero is valid.
            let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
            mreq.mr_ifindex = ifindex as c_int;
            mreq.mr_type = libc::PACKET_MR_PROMISC as u16;
            setsockopt(rawfd, libc::SOL_PACKET, libc::PACKET_ADD_MEMBERSHIP, &mreq)
                .map_err(|e| open_error(device, e))?;
        }

        let fanout: u32 =
            u16::from(group) as u32 | ((PACKET_FANOUT_HASH | PACKET_FANOUT_FLAG_DEFRAG) << 16);
        setsockopt(rawfd, libc::SOL_PACKET, PACKET_FANOUT, &fanout).map_err(|source| {
            CaptureError::FanoutJoinFailed {
                group: group.into(),
                source,
            }
        })?;

        let waker = Waker::new()?;
        debug!(
            device,
            %group,
            frames = flags.ring.frame_count(),
            "capture socket open"
        );
        Ok(Self {
            ring,
            fd,
            waker,
            device: device.to_string(),
            group,
        })
    }

    fn run<F>(&mut self, mut on_packet: F) -> api::Result<()>
    where
        F: FnMut(&PacketView<'_>),
    {
        loop {
            if self.waker.is_woken() {
                trace!(device = %self.device, "capture loop woken");
                return Ok(());
            }
            if !self.ring.ready() {
                self.wait()?;
                continue;
            }
            if let Some(frame) = self.ring.next() {
                match frame.data() {
                    Some(data) => {
                        let view = PacketView::new(frame.timestamp(), frame.wire_len(), data);
                        on_packet(&view);
                    }
                    None => trace!(device = %self.device, "dropping frame with bad bounds"),
                }
            }
        }
    }

    fn waker(&self) -> Self::Waker {
        self.waker.clone()
    }

    fn close(self) {
        debug!(device = %self.device, group = %self.group, "capture socket closed");
        drop(self)
    }
}

impl std::fmt::Debug for Sock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sock")
            .field("device", &self.device)
            .field("group", &self.group)
            .finish()
    }
}
