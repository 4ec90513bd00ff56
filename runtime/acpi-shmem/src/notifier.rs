//! Event Notifier - eventfd-style counter shared with the helper

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};

/// Owned counter descriptor. Writers add to the counter, readers drain it.
#[derive(Debug)]
pub struct EventNotifier {
    file: File,
}

impl EventNotifier {
    /// Take ownership of `fd` and switch it to non-blocking mode.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let raw = fd.as_raw_fd();
        let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
        fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        Ok(Self { file: File::from(fd) })
    }

    /// Drain the counter. Returns whether it was non-zero.
    pub fn test_and_clear(&self) -> bool {
        let mut buf = [0u8; 8];
        loop {
            match (&self.file).read(&mut buf) {
                Ok(n) => return n == buf.len() && u64::from_ne_bytes(buf) != 0,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    log::warn!("event notifier read failed: {}", e);
                    return false;
                }
            }
        }
    }

    /// Add one to the counter, waking whoever waits on the other side.
    pub fn set(&self) -> io::Result<()> {
        let value = 1u64.to_ne_bytes();
        loop {
            match (&self.file).write(&value) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsFd for EventNotifier {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}
