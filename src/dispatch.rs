//! The thread reading compositor events for a live connection.

use crate::{
    error::Result,
    handler::{self, Shared, StateCell},
    transport::Connection,
};
use log::{debug, error, warn};
use parking_lot::ReentrantMutexGuard;
use rustix::{
    event::{PollFd, PollFlags},
    fd::OwnedFd,
    io::Errno,
    pipe::PipeFlags,
};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

/// How long the thread waits for the lock before checking for cancellation again.
const LOCK_SLICE: Duration = Duration::from_millis(10);

pub(crate) struct DispatchThread {
    cancel: OwnedFd,
    thread: JoinHandle<()>,
}

impl DispatchThread {
    /// Starts dispatching events for the connection polled through `connection_fd`.
    ///
    /// `generation` identifies the connection; the thread never touches a newer one.
    pub(crate) fn spawn<C: Connection>(
        shared: Arc<Shared<C>>,
        generation: u64,
        connection_fd: OwnedFd,
    ) -> Result<DispatchThread> {
        let (reader, writer) = rustix::pipe::pipe_with(PipeFlags::CLOEXEC)?;
        let thread = thread::Builder::new()
            .name("waykeys-dispatch".to_owned())
            .spawn(move || run(&shared, generation, &reader, &connection_fd))?;
        Ok(DispatchThread {
            cancel: writer,
            thread,
        })
    }

    /// Tells the thread to exit and waits for it, unless called from the thread itself.
    pub(crate) fn stop(self) {
        if let Err(err) = rustix::io::write(&self.cancel, b"q") {
            warn!("cannot signal the dispatch thread: {err}");
        }
        drop(self.cancel);
        if self.thread.thread().id() == thread::current().id() {
            debug!("dispatch thread stopping itself");
            return;
        }
        if self.thread.join().is_err() {
            error!("dispatch thread panicked");
        }
    }
}

fn is_ready(fd: &OwnedFd) -> bool {
    let mut fds = [PollFd::new(fd, PollFlags::IN)];
    matches!(rustix::event::poll(&mut fds, 0), Ok(n) if n > 0)
}

fn lock<'a, C: Connection>(
    shared: &'a Shared<C>,
    cancel: &OwnedFd,
) -> Option<ReentrantMutexGuard<'a, StateCell<C>>> {
    loop {
        if let Some(guard) = shared.state.try_lock_for(LOCK_SLICE) {
            // The connection may have been torn down while waiting.
            return (!is_ready(cancel)).then_some(guard);
        }
        if is_ready(cancel) {
            return None;
        }
    }
}

fn run<C: Connection>(shared: &Shared<C>, generation: u64, cancel: &OwnedFd, connection: &OwnedFd) {
    debug!("dispatch thread started");
    loop {
        let mut fds = [
            PollFd::new(cancel, PollFlags::IN),
            PollFd::new(connection, PollFlags::IN),
        ];
        match rustix::event::poll(&mut fds, -1) {
            Ok(_) => {}
            Err(Errno::INTR) => continue,
            Err(err) => {
                error!("cannot wait for compositor events: {err}");
                if let Some(guard) = lock(shared, cancel) {
                    handler::mark_dead(&guard, generation);
                }
                break;
            }
        }
        if !fds[0].revents().is_empty() {
            break;
        }
        let Some(guard) = lock(shared, cancel) else {
            break;
        };
        if !handler::process_events(&guard, generation) {
            break;
        }
    }
    debug!("dispatch thread stopped");
}
