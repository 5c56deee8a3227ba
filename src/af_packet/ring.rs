use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use libc::{c_int, c_void};

// Kernel ABI from <linux/if_packet.h>. Spelled out here so the layout does
// not depend on which of them a given libc release exports.
pub(super) const PACKET_RX_RING: c_int = 5;
pub(super) const PACKET_VERSION: c_int = 10;
pub(super) const PACKET_FANOUT: c_int = 18;
pub(super) const PACKET_FANOUT_HASH: u32 = 0;
pub(super) const PACKET_FANOUT_FLAG_DEFRAG: u32 = 0x8000;
pub(super) const TPACKET_V2: c_int = 1;

const TP_STATUS_KERNEL: u32 = 0;
const TP_STATUS_USER: u32 = 1 << 0;
const TPACKET_ALIGNMENT: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(super) struct TpacketReq {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
}

#[repr(C)]
struct Tpacket2Hdr {
    tp_status: u32,
    tp_len: u32,
    tp_snaplen: u32,
    tp_mac: u16,
    tp_net: u16,
    tp_sec: u32,
    tp_nsec: u32,
    tp_vlan_tci: u16,
    tp_vlan_tpid: u16,
    tp_padding: [u8; 4],
}

const fn tpacket_align(x: usize) -> usize {
    (x + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}

/// Smallest frame that can hold the v2 header plus a minimal Ethernet frame.
pub(super) const TPACKET2_HDRLEN: usize =
    tpacket_align(std::mem::size_of::<Tpacket2Hdr>()) + std::mem::size_of::<libc::sockaddr_ll>();

/// Ring geometry requested from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub block_size: u32,
    pub block_count: u32,
    pub frame_size: u32,
}

impl Default for RingLayout {
    /// 4 MiB blocks, 64 of them, 2 KiB frames.
    fn default() -> Self {
        Self {
            block_size: 1 << 22,
            block_count: 64,
            frame_size: 2048,
        }
    }
}

impl RingLayout {
    pub fn frames_per_block(&self) -> u32 {
        self.block_size / self.frame_size
    }

    pub fn frame_count(&self) -> u32 {
        self.frames_per_block() * self.block_count
    }

    pub fn len(&self) -> usize {
        self.block_size as usize * self.block_count as usize
    }

    /// Checks the constraints `PACKET_RX_RING` enforces, so misconfiguration
    /// is reported before any syscall.
    pub fn validate(&self) -> Result<(), String> {
        let page = page_size();
        if self.block_size == 0 || self.block_count == 0 || self.frame_size == 0 {
            return Err("ring sizes must be non-zero".to_string());
        }
        if self.block_size as usize % page != 0 {
            return Err(format!(
                "block size {} is not a multiple of the page size {page}",
                self.block_size
            ));
        }
        if self.frame_size as usize % TPACKET_ALIGNMENT != 0 {
            return Err(format!(
                "frame size {} is not {TPACKET_ALIGNMENT}-byte aligned",
                self.frame_size
            ));
        }
        if (self.frame_size as usize) < TPACKET2_HDRLEN {
            return Err(format!(
                "frame size {} is smaller than the frame header ({TPACKET2_HDRLEN})",
                self.frame_size
            ));
        }
        if self.block_size % self.frame_size != 0 {
            return Err(format!(
                "block size {} is not a multiple of frame size {}",
                self.block_size, self.frame_size
            ));
        }
        Ok(())
    }

    pub(super) fn as_req(&self) -> TpacketReq {
        TpacketReq {
            tp_block_size: self.block_size,
            tp_block_nr: self.block_count,
            tp_frame_size: self.frame_size,
            tp_frame_nr: self.frame_count(),
        }
    }
}

pub(super) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as usize }
}

/// The RX ring mapped into our address space. Unmapped on drop.
pub(super) struct RxRing {
    base: NonNull<u8>,
    layout: RingLayout,
    cursor: u32,
}

// The mapping is only touched by the thread that owns the socket.
unsafe impl Send for RxRing {}

impl RxRing {
    /// Maps the ring previously configured with `PACKET_RX_RING` on `fd`.
    pub(super) fn map(fd: BorrowedFd<'_>, layout: RingLayout) -> io::Result<Self> {
        // SAFETY: we request a fresh shared mapping of the socket's ring; the
        // kernel validates the length against the configured ring.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                layout.len(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(Self {
            base,
            layout,
            cursor: 0,
        })
    }

    fn frame_ptr(&self, idx: u32) -> *mut u8 {
        let fpb = self.layout.frames_per_block();
        let offset = (idx / fpb) as usize * self.layout.block_size as usize
            + (idx % fpb) as usize * self.layout.frame_size as usize;
        // SAFETY: idx < frame_count, so offset stays inside the mapping.
        unsafe { self.base.as_ptr().add(offset) }
    }

    fn status(&self, idx: u32) -> &AtomicU32 {
        // SAFETY: tp_status is the first field of an aligned tpacket2_hdr
        // living in the shared mapping for as long as `self`.
        unsafe { AtomicU32::from_ptr(self.frame_ptr(idx) as *mut u32) }
    }

    /// True when the frame under the cursor belongs to user space.
    pub(super) fn ready(&self) -> bool {
        self.status(self.cursor).load(Ordering::Acquire) & TP_STATUS_USER != 0
    }

    /// Returns the next frame handed to user space, if any.
    pub(super) fn next(&mut self) -> Option<Frame<'_>> {
        if !self.ready() {
            return None;
        }
        let idx = self.cursor;
        Some(Frame { ring: self, idx })
    }
}

impl Drop for RxRing {
    fn drop(&mut self) {
        // SAFETY: base/len describe exactly the mapping created in `map`.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut c_void, self.layout.len());
        }
    }
}

/// A frame owned by user space. Returned to the kernel on drop.
pub(super) struct Frame<'ring> {
    ring: &'ring mut RxRing,
    idx: u32,
}

impl Frame<'_> {
    fn header(&self) -> &Tpacket2Hdr {
        // SAFETY: the kernel wrote a complete header before setting
        // TP_STATUS_USER, which we observed with Acquire ordering.
        unsafe { &*(self.ring.frame_ptr(self.idx) as *const Tpacket2Hdr) }
    }

    pub(super) fn timestamp(&self) -> Duration {
        let hdr = self.header();
        Duration::new(hdr.tp_sec as u64, hdr.tp_nsec)
    }

    pub(super) fn wire_len(&self) -> u32 {
        self.header().tp_len
    }

    /// Captured bytes, or `None` when the header points outside the frame.
    pub(super) fn data(&self) -> Option<&[u8]> {
        let hdr = self.header();
        let start = hdr.tp_mac as usize;
        let end = start.checked_add(hdr.tp_snaplen as usize)?;
        if start < std::mem::size_of::<Tpacket2Hdr>() || end > self.ring.layout.frame_size as usize {
            return None;
        }
        // SAFETY: [start, end) was bounds-checked against the frame size.
        Some(unsafe {
            std::slice::from_raw_parts(self.ring.frame_ptr(self.idx).add(start), end - start)
        })
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        self.ring
            .status(self.idx)
            .store(TP_STATUS_KERNEL, Ordering::Release);
        self.ring.cursor = (self.idx + 1) % self.ring.layout.frame_count();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(block_size: u32, block_count: u32, frame_size: u32) -> RingLayout {
        RingLayout {
            block_size,
            block_count,
            frame_size,
        }
    }

    #[test]
    fn header_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<Tpacket2Hdr>(), 32);
        assert_eq!(TPACKET2_HDRLEN, 52);
    }

    #[test]
    fn frame_count_follows_geometry() {
        let l = layout(1 << 22, 64, 2048);
        assert_eq!(l.frames_per_block(), 2048);
        assert_eq!(l.frame_count(), 2048 * 64);
        assert_eq!(l.len(), (1 << 22) * 64);
        assert!(l.validate().is_ok());
    }

    #[test]
    fn rejects_bad_geometry() {
        let page = page_size() as u32;
        assert!(layout(page + 1, 4, 2048).validate().is_err());
        assert!(layout(page * 4, 4, 2047).validate().is_err());
        assert!(layout(page * 4, 4, 32).validate().is_err());
        assert!(layout(page * 4, 0, 2048).validate().is_err());
        assert!(layout(page, 4, page * 2).validate().is_err());
    }
}
