use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error};

/// A counting semaphore backed by an eventfd, so that waiting for it can be integrated with
///  `poll`/`epoll` based event loops.
pub struct Semaphore {
    fd: OwnedFd,
}

impl Semaphore {
    pub fn new() -> io::Result<Semaphore> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_SEMAPHORE | libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: eventfd returned a fresh descriptor that nothing else owns
        Ok(Semaphore { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    pub fn put(&self) -> io::Result<()> {
        let one: u64 = 1;
        let written = unsafe {
            libc::write(self.fd.as_raw_fd(), &one as *const u64 as *const libc::c_void, size_of::<u64>())
        };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Decrements the semaphore if it is non-zero, returning whether it did
    pub fn try_get(&self) -> io::Result<bool> {
        let mut value: u64 = 0;
        let read = unsafe {
            libc::read(self.fd.as_raw_fd(), &mut value as *mut u64 as *mut libc::c_void, size_of::<u64>())
        };
        if read < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(true)
    }

    /// Blocks until the semaphore can be decremented.
    ///
    /// If a signal interrupts the wait, this returns an error of kind
    ///  [io::ErrorKind::Interrupted] without having decremented the semaphore. The caller decides
    ///  whether to retry.
    pub fn get(&self) -> io::Result<()> {
        loop {
            if self.try_get()? {
                return Ok(());
            }

            let mut pollfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            if unsafe { libc::poll(&mut pollfd, 1, -1) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
}

impl AsRawFd for Semaphore {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for Semaphore {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}


/// Hands items from one thread to another. Every pushed item raises a semaphore, so the
///  consumer can block on it, or register [SignalQueue::as_raw_fd] with an event loop and call
///  [SignalQueue::try_pop] when it becomes readable.
pub struct SignalQueue<T> {
    items: Mutex<VecDeque<T>>,
    semaphore: Semaphore,
}

impl<T> SignalQueue<T> {
    pub fn new() -> io::Result<SignalQueue<T>> {
        Ok(SignalQueue {
            items: Mutex::new(VecDeque::new()),
            semaphore: Semaphore::new()?,
        })
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
        if let Err(e) = self.semaphore.put() {
            error!("error signalling queued item: {}", e);
        }
    }

    /// Blocks until an item is available. Waits that are interrupted by a signal are resumed.
    pub fn pop(&self) -> io::Result<T> {
        loop {
            match self.semaphore.get() {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!("wait for queued item was interrupted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        self.take_signalled()
    }

    pub fn try_pop(&self) -> io::Result<Option<T>> {
        if !self.semaphore.try_get()? {
            return Ok(None);
        }
        self.take_signalled().map(Some)
    }

    /// Removes all items that are currently available without blocking
    pub fn drain(&self) -> io::Result<Vec<T>> {
        let mut result = Vec::new();
        while let Some(item) = self.try_pop()? {
            result.push(item);
        }
        Ok(result)
    }

    fn take_signalled(&self) -> io::Result<T> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| io::Error::other("queue was signalled but is empty"))
    }
}

impl<T> AsRawFd for SignalQueue<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.semaphore.as_raw_fd()
    }
}

impl<T> AsFd for SignalQueue<T> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.semaphore.as_fd()
    }
}
