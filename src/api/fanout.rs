use std::fmt;

/// Identifier of a kernel fanout group.
///
/// Every capture channel opened with the same id on the same device is a
/// member of one load-balancing group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FanoutGroupId(u16);

impl FanoutGroupId {
    /// Derives the group id from the current process id, so concurrent
    /// probes on one host do not share a group.
    pub fn from_process() -> Self {
        let pid = nix::unistd::getpid().as_raw();
        Self((pid & 0xffff) as u16)
    }
}

impl From<u16> for FanoutGroupId {
    fn from(val: u16) -> Self {
        Self(val)
    }
}

impl From<FanoutGroupId> for u16 {
    fn from(val: FanoutGroupId) -> u16 {
        val.0
    }
}

impl fmt::Display for FanoutGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
