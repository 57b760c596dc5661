//! Level-triggered readiness checks over `poll(2)`
//!
//! The control loop calls into the transports once per tick, so every
//! socket wait goes through here with an explicit upper bound. Level
//! triggering matters: a peer that stays writable must be reported on every
//! tick, not only on the first edge.

use crate::error::Result;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::BorrowedFd;
use std::time::Duration;

/// What the kernel reported for one descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data (or end-of-stream, or a pending connection) can be read
    pub readable: bool,
    /// A write would not block
    pub writable: bool,
    /// Error, hang-up or invalid descriptor
    pub error: bool,
}

impl Readiness {
    fn from_flags(flags: PollFlags) -> Self {
        Self {
            readable: flags.contains(PollFlags::POLLIN),
            writable: flags.contains(PollFlags::POLLOUT),
            error: flags.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL),
        }
    }
}

/// Interest for one descriptor
#[derive(Debug, Clone, Copy)]
pub struct Interest {
    /// Watch for readability
    pub read: bool,
    /// Watch for writability
    pub write: bool,
}

impl Interest {
    /// Readable only
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    /// Readable and writable
    pub const READ_WRITE: Interest = Interest {
        read: true,
        write: true,
    };

    fn flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.read {
            flags |= PollFlags::POLLIN;
        }
        if self.write {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

/// `poll` timeouts are whole milliseconds capped at `u16::MAX` here; ticks
/// never wait anywhere near that long.
fn to_poll_timeout(timeout: Duration) -> PollTimeout {
    let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
    PollTimeout::from(ms)
}

/// Wait up to `timeout` for any of `fds` to become ready
///
/// Returns one [`Readiness`] per descriptor, in order. A signal interrupting
/// the wait is reported as "nothing ready".
pub fn wait_many(fds: &[(BorrowedFd<'_>, Interest)], timeout: Duration) -> Result<Vec<Readiness>> {
    let mut poll_fds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|(fd, interest)| PollFd::new(*fd, interest.flags()))
        .collect();

    match poll(&mut poll_fds, to_poll_timeout(timeout)) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(vec![Readiness::default(); fds.len()]),
        Err(e) => return Err(std::io::Error::from(e).into()),
    }

    Ok(poll_fds
        .iter()
        .map(|p| p.revents().map(Readiness::from_flags).unwrap_or_default())
        .collect())
}

/// Wait up to `timeout` for a single descriptor
pub fn wait_one(fd: BorrowedFd<'_>, interest: Interest, timeout: Duration) -> Result<Readiness> {
    let ready = wait_many(&[(fd, interest)], timeout)?;
    Ok(ready.into_iter().next().unwrap_or_default())
}
