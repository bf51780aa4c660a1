//! Starting the injected code on a remote thread, and checking how it exited.

use std::time::Duration;

use crate::platform::{RawThread, TargetProcess, WaitStatus};
use crate::thunk::RemoteExitCode;
use crate::Error;

quick_error! {
    /// Ways a handshake with injected code can fail.
    #[derive(Debug)]
    pub enum HandshakeError {
        /// The thread exited with something other than the sentinel.
        Mismatch(expected: u32, actual: u32) {
            display("Expected exit code {:#x}, thread exited with {:#x}", expected, actual)
        }
        /// The thread exited with a bootstrap error or an exception status.
        Remote(code: RemoteExitCode) {
            display("Remote thread failed: {}", code)
        }
        /// The thread did not exit in time.
        TimedOut {
            display("Timed out waiting for the remote thread")
        }
        Other(err: Error) {
            display("{}", err)
            source(err)
            from()
        }
    }
}

/// Compares a thread exit code against the expected sentinel.
pub fn check_exit_code(expected: u32, actual: u32) -> Result<(), HandshakeError> {
    if actual == expected {
        return Ok(());
    }
    match RemoteExitCode::from_code(actual) {
        Some(code) => Err(HandshakeError::Remote(code)),
        None => Err(HandshakeError::Mismatch(expected, actual)),
    }
}

/// State of a started thread. Before `Handoff::start` there is no thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Thread has been created; nobody has waited on it yet.
    Created,
    /// A wait timed out, so the thread was still running.
    Running,
    Terminated(u32),
}

/// A thread that is about to be created.
pub struct Handoff<'p> {
    process: &'p dyn TargetProcess,
    entry: u64,
    argument: u64,
}

impl<'p> Handoff<'p> {
    /// `entry` is the relocated code, `argument` the relocated thunk context.
    pub fn new(process: &'p dyn TargetProcess, entry: u64, argument: u64) -> Handoff<'p> {
        Handoff {
            process,
            entry,
            argument,
        }
    }

    pub fn start(self) -> Result<RemoteThread<'p>, Error> {
        let raw = self.process.create_remote_thread(self.entry, self.argument)?;
        debug!("Created thread {} at {:#x} ({:#x})", raw.id, self.entry, self.argument);
        Ok(RemoteThread {
            process: self.process,
            raw,
            state: ThreadState::Created,
        })
    }
}

/// A thread running injected code. Dropping this closes the handle, the thread
/// keeps running.
pub struct RemoteThread<'p> {
    process: &'p dyn TargetProcess,
    raw: RawThread,
    state: ThreadState,
}

impl<'p> RemoteThread<'p> {
    pub fn id(&self) -> u32 {
        self.raw.id
    }

    pub fn raw(&self) -> RawThread {
        self.raw
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Waits for the thread to exit, returning its exit code, or `None` if
    /// `timeout` passed first.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<u32>, Error> {
        if let ThreadState::Terminated(code) = self.state {
            return Ok(Some(code));
        }
        match self.process.wait_thread(self.raw, timeout)? {
            WaitStatus::Signaled => {
                let code = self.process.thread_exit_code(self.raw)?;
                debug!("Thread {} exited with {:#x}", self.raw.id, code);
                self.state = ThreadState::Terminated(code);
                Ok(Some(code))
            }
            WaitStatus::TimedOut => {
                self.state = ThreadState::Running;
                Ok(None)
            }
        }
    }

    /// Waits for the thread and checks that it exited with `sentinel`.
    pub fn verify_handshake(
        &mut self,
        sentinel: u32,
        timeout: Option<Duration>,
    ) -> Result<(), HandshakeError> {
        match self.wait(timeout)? {
            Some(code) => check_exit_code(sentinel, code),
            None => Err(HandshakeError::TimedOut),
        }
    }

    /// Forcibly ends the thread.
    pub fn terminate(&mut self, exit_code: u32) -> Result<(), Error> {
        self.process.terminate_thread(self.raw, exit_code)?;
        info!("Terminated thread {}", self.raw.id);
        match self.process.wait_thread(self.raw, None)? {
            WaitStatus::Signaled => self.state = ThreadState::Terminated(exit_code),
            WaitStatus::TimedOut => self.state = ThreadState::Running,
        }
        Ok(())
    }
}

impl<'p> Drop for RemoteThread<'p> {
    fn drop(&mut self) {
        if let Err(e) = self.process.close_thread(self.raw) {
            warn!("Could not close handle of thread {}: {}", self.raw.id, e);
        }
    }
}
