//! select() over poll()
//!
//! `select` translates its descriptor sets into one poll entry per
//! descriptor, waits through the [`Poll`] primitive, and writes readiness
//! back into the sets.
//!
//! # Semantics
//! - Read readiness is `IN` or `HUP`, write is `OUT`, exceptional is `ERR`
//! - Every set passed in is cleared once polling returns, even on error
//! - The result counts set memberships, so one descriptor ready for both
//!   reading and writing counts twice

use core::time::Duration;

use bitflags::bitflags;

use super::SyscallError;

/// Descriptors a set can hold.
pub const FD_SETSIZE: usize = 64;

bitflags! {
    /// Poll event bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u16 {
        /// Data may be read without blocking.
        const IN = 0x01;
        /// Data may be written without blocking.
        const OUT = 0x04;
        /// Error condition.
        const ERR = 0x08;
        /// Peer hung up.
        const HUP = 0x10;
        /// Descriptor is not open.
        const NVAL = 0x20;
    }
}

impl Default for PollEvents {
    fn default() -> Self {
        Self::empty()
    }
}

/// One poll request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollFd {
    pub fd: usize,
    /// Events of interest.
    pub events: PollEvents,
    /// Events that occurred, filled in by the poller.
    pub revents: PollEvents,
}

/// The readiness primitive `select` is built on.
pub trait Poll {
    /// Wait until at least one entry is ready or `timeout_ms` elapses
    /// (negative means forever). Returns the number of ready entries.
    fn poll(&mut self, fds: &mut [PollFd], timeout_ms: i32) -> Result<usize, SyscallError>;
}

/// Fixed-size descriptor bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdSet {
    bits: u64,
}

impl FdSet {
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    /// Add `fd`; descriptors past `FD_SETSIZE` are ignored.
    pub fn insert(&mut self, fd: usize) {
        if fd < FD_SETSIZE {
            self.bits |= 1u64 << fd;
        }
    }

    pub fn remove(&mut self, fd: usize) {
        if fd < FD_SETSIZE {
            self.bits &= !(1u64 << fd);
        }
    }

    pub fn contains(&self, fd: usize) -> bool {
        fd < FD_SETSIZE && self.bits & (1u64 << fd) != 0
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of descriptors in the set.
    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }
}

/// Poll timeout for a select timeout.
pub fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => {
            let ms = t
                .as_secs()
                .saturating_mul(1000)
                .saturating_add(u64::from(t.subsec_micros() / 1000));
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    }
}

fn member(set: &Option<&mut FdSet>, fd: usize) -> bool {
    set.as_ref().is_some_and(|set| set.contains(fd))
}

/// Wait for any descriptor below `nfds` in the given sets to become ready.
///
/// On return each set holds only its ready descriptors. Returns the total
/// number of set memberships, zero on timeout.
pub fn select<P: Poll + ?Sized>(
    poller: &mut P,
    nfds: usize,
    mut read: Option<&mut FdSet>,
    mut write: Option<&mut FdSet>,
    mut except: Option<&mut FdSet>,
    timeout: Option<Duration>,
) -> Result<usize, SyscallError> {
    if nfds > FD_SETSIZE {
        log::warn!("select: nfds {} exceeds {}", nfds, FD_SETSIZE);
        return Err(SyscallError::Einval);
    }

    let mut pollset = [PollFd::default(); FD_SETSIZE];
    let mut npfds = 0;
    for fd in 0..nfds {
        let mut events = PollEvents::empty();
        if member(&read, fd) {
            events |= PollEvents::IN;
        }
        if member(&write, fd) {
            events |= PollEvents::OUT;
        }
        if member(&except, fd) {
            events |= PollEvents::ERR;
        }
        if !events.is_empty() {
            pollset[npfds] = PollFd {
                fd,
                events,
                revents: PollEvents::empty(),
            };
            npfds += 1;
        }
    }

    let result = poller.poll(&mut pollset[..npfds], timeout_ms(timeout));

    for set in [read.as_deref_mut(), write.as_deref_mut(), except.as_deref_mut()]
        .into_iter()
        .flatten()
    {
        set.clear();
    }

    let ready = result?;
    if ready == 0 {
        return Ok(0);
    }
    if let Some(bad) = pollset[..npfds]
        .iter()
        .find(|entry| entry.revents.contains(PollEvents::NVAL))
    {
        log::debug!("select: descriptor {} is not open", bad.fd);
        return Err(SyscallError::Ebadf);
    }

    let mut count = 0;
    for entry in &pollset[..npfds] {
        count += mark(read.as_deref_mut(), entry, PollEvents::IN | PollEvents::HUP);
        count += mark(write.as_deref_mut(), entry, PollEvents::OUT);
        count += mark(except.as_deref_mut(), entry, PollEvents::ERR);
    }
    Ok(count)
}

/// Add `entry.fd` to `set` if any of `bits` occurred; returns the number
/// of memberships added.
fn mark(set: Option<&mut FdSet>, entry: &PollFd, bits: PollEvents) -> usize {
    match set {
        Some(set) if entry.revents.intersects(bits) => {
            set.insert(entry.fd);
            1
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    /// Reports fixed readiness and remembers what it was asked.
    struct Scripted {
        ready: Vec<(usize, PollEvents)>,
        seen: Vec<PollFd>,
        timeout: Option<i32>,
        fail: Option<SyscallError>,
    }

    impl Scripted {
        fn new(ready: &[(usize, PollEvents)]) -> Self {
            Self {
                ready: ready.to_vec(),
                seen: Vec::new(),
                timeout: None,
                fail: None,
            }
        }
    }

    impl Poll for Scripted {
        fn poll(&mut self, fds: &mut [PollFd], timeout_ms: i32) -> Result<usize, SyscallError> {
            self.seen = fds.to_vec();
            self.timeout = Some(timeout_ms);
            if let Some(err) = self.fail {
                return Err(err);
            }
            let mut n = 0;
            for fd in fds.iter_mut() {
                if let Some((_, ev)) = self.ready.iter().find(|(f, _)| *f == fd.fd) {
                    fd.revents = *ev;
                    n += 1;
                }
            }
            Ok(n)
        }
    }

    #[test]
    fn timeout_conversion() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::from_micros(2_500_999))), 2500);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX / 4))), i32::MAX);
    }

    #[test]
    fn one_entry_per_descriptor() {
        let mut poller = Scripted::new(&[]);
        let mut read = FdSet::new();
        let mut write = FdSet::new();
        read.insert(3);
        write.insert(3);
        write.insert(5);
        let n = select(&mut poller, 8, Some(&mut read), Some(&mut write), None, None).unwrap();
        assert_eq!(n, 0);
        assert_eq!(poller.seen.len(), 2);
        assert_eq!(poller.seen[0].fd, 3);
        assert_eq!(poller.seen[0].events, PollEvents::IN | PollEvents::OUT);
        assert_eq!(poller.seen[1].events, PollEvents::OUT);
        assert_eq!(poller.timeout, Some(-1));
        assert!(read.is_empty() && write.is_empty());
    }

    #[test]
    fn readiness_is_written_back() {
        let mut poller = Scripted::new(&[
            (1, PollEvents::HUP),
            (2, PollEvents::IN | PollEvents::OUT),
            (4, PollEvents::ERR),
        ]);
        let mut read = FdSet::new();
        let mut write = FdSet::new();
        let mut except = FdSet::new();
        for fd in [1, 2, 4] {
            read.insert(fd);
            except.insert(fd);
        }
        write.insert(2);
        let n = select(
            &mut poller,
            5,
            Some(&mut read),
            Some(&mut write),
            Some(&mut except),
            Some(Duration::from_millis(10)),
        )
        .unwrap();
        assert_eq!(n, 4);
        assert!(read.contains(1) && read.contains(2) && !read.contains(4));
        assert!(write.contains(2));
        assert!(except.contains(4) && except.len() == 1);
        assert_eq!(poller.timeout, Some(10));
    }

    #[test]
    fn descriptors_at_or_above_nfds_are_ignored() {
        let mut poller = Scripted::new(&[(6, PollEvents::IN)]);
        let mut read = FdSet::new();
        read.insert(6);
        let n = select(&mut poller, 6, Some(&mut read), None, None, None).unwrap();
        assert_eq!(n, 0);
        assert!(poller.seen.is_empty());
    }

    #[test]
    fn failure_still_clears_sets() {
        let mut poller = Scripted::new(&[]);
        poller.fail = Some(SyscallError::Eintr);
        let mut read = FdSet::new();
        read.insert(0);
        assert_eq!(
            select(&mut poller, 1, Some(&mut read), None, None, None),
            Err(SyscallError::Eintr)
        );
        assert!(read.is_empty());
    }

    #[test]
    fn closed_descriptor_is_ebadf() {
        let mut poller = Scripted::new(&[(1, PollEvents::IN), (3, PollEvents::NVAL)]);
        let mut read = FdSet::new();
        read.insert(1);
        read.insert(3);
        assert_eq!(
            select(&mut poller, 4, Some(&mut read), None, None, None),
            Err(SyscallError::Ebadf)
        );
        assert!(read.is_empty());
    }

    #[test]
    fn too_many_descriptors() {
        let mut poller = Scripted::new(&[]);
        assert_eq!(
            select(&mut poller, FD_SETSIZE + 1, None, None, None, None),
            Err(SyscallError::Einval)
        );
    }
}
