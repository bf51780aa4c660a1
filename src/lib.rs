//! Tracer-inject, a relocating code injection engine for x64 Windows.
//!
//! Tracer-inject takes a function that exists in the current process, copies its
//! machine code together with its unwind metadata into another, already running
//! process, fixes up every pointer the copy relies on, and starts a remote thread
//! whose first action is to run that code. No loader cooperation is needed from
//! the target; the copied code bootstraps itself through function pointers stored
//! in a thunk context that is copied next to it.
//!
//! The work is split into five steps, each in its own module:
//!
//! - [`extract`] finds the function's code and unwind descriptor (and those of
//!   its exception handler, if it has one).
//! - [`staging`] lays out a local mirror of the remote pages.
//! - [`relocate`] rewrites pointers in the mirror to remote addresses.
//! - [`remote`] allocates the remote pages, transfers the mirror and narrows
//!   page protections.
//! - [`handoff`] creates the remote thread and verifies the handshake.
//!
//! [`Injector`] runs all of them in order, rolling back the remote allocation if
//! any step after it fails.
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(all(windows, target_arch = "x86_64"))]
//! # fn main() -> Result<(), tracer_inject::Error> {
//! use tracer_inject::{Injector, InjectionRequest};
//! use tracer_inject::thunk::{injection_thunk, ThunkTemplate};
//! use tracer_inject::win::{LocalCode, WinProcess};
//!
//! let process = WinProcess::open(1234)?;
//! let code = LocalCode::new()?;
//! let primitives = process.bootstrap_primitives()?;
//! let template = ThunkTemplate::bootstrap("C:\\Tracer\\TracerCore.dll", "InitializeTracer", primitives)?;
//! let injector = Injector::new(&code, &process);
//! let mut injection = injector.inject(injection_thunk as usize as u64, InjectionRequest::new(&template))?;
//! injection.thread.wait(None)?;
//! # Ok(())
//! # }
//! # #[cfg(not(all(windows, target_arch = "x86_64")))]
//! # fn main() {}
//! ```

#[macro_use] extern crate log;
#[macro_use] extern crate quick_error;

pub mod extract;
pub mod handoff;
pub mod pe;
pub mod platform;
pub mod relocate;
pub mod remote;
pub mod staging;
pub mod thunk;
pub mod unwind;

#[cfg(all(windows, target_arch = "x86_64"))]
mod nt_api;
#[cfg(all(windows, target_arch = "x86_64"))]
pub mod win;

use std::io;
use std::time::Duration;

use scopeguard::{guard, ScopeGuard};

pub use crate::extract::{ExtractedFunction, FunctionImage};
pub use crate::handoff::{HandshakeError, RemoteThread, ThreadState};
pub use crate::platform::{CodeSource, ProcessMemory, RemoteThreads, TargetProcess};
pub use crate::relocate::{DefaultRelocator, PayloadRelocator, ThunkRelocator};
pub use crate::remote::RemoteAllocation;
pub use crate::staging::{StagingBuffer, StagingOptions};
pub use crate::thunk::{ProtocolMarker, RemoteExitCode, ThunkTemplate};

/// Os error, along with a description of what was being done.
#[derive(Debug)]
pub struct WinErr {
    pub err: io::Error,
    pub desc: String,
}

impl WinErr {
    pub fn desc(&self) -> String {
        format!("{}: {}", self.desc, self.err)
    }
}

quick_error! {
    /// Errors returned by the injection engine.
    #[derive(Debug)]
    pub enum Error {
        /// A platform call failed.
        Win(err: WinErr) {
            display("{}", err.desc())
        }
        /// A required input was missing or malformed.
        InvalidParameter(what: &'static str) {
            display("Invalid parameter: {}", what)
        }
        /// The platform has no function table entry for the address.
        NoFunctionEntry(address: u64) {
            display("No function table entry covers {:#x}", address)
        }
        /// The function's unwind metadata has a shape that is not supported,
        /// such as chained unwind info.
        UnsupportedShape(desc: String) {
            display("Unsupported function shape: {}", desc)
        }
        /// The local staging buffer could not be allocated.
        LocalAllocation(size: usize) {
            display("Could not allocate {} bytes for the staging buffer", size)
        }
        /// The code (and its handler) do not fit in the code page.
        CodeTooLarge(size: usize, available: usize) {
            display("Code needs {} bytes but the code page has {}", size, available)
        }
        /// Function tables, unwind descriptors and the thunk context do not fit
        /// in the data page.
        DataPageOverflow(size: usize, available: usize) {
            display("Data region needs {} bytes but the data page has {}", size, available)
        }
        /// The caller payload does not fit in what is left of the data page.
        PayloadTooLarge(size: usize, available: usize) {
            display("Payload of {} bytes exceeds the {} bytes left in the data page", size, available)
        }
        /// A region lies outside the staging buffer.
        OutOfBounds(offset: usize, len: usize) {
            display("Region {:#x}+{:#x} is outside the staging buffer", offset, len)
        }
        /// A structural self-check failed; this is a bug in the engine or in a
        /// relocator callback.
        InternalInvariant(desc: String) {
            display("Internal invariant violated: {}", desc)
        }
        /// Something else went wrong.
        Other(desc: String) {
            display("{}", desc)
        }
    }
}

fn invariant<T, S: Into<String>>(desc: S) -> Result<T, Error> {
    let desc = desc.into();
    error!("Internal invariant violated: {}", desc);
    Err(Error::InternalInvariant(desc))
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Everything needed to inject one function, apart from the function itself.
pub struct InjectionRequest<'r> {
    pub thunk: &'r ThunkTemplate,
    pub payload: &'r [u8],
    pub relocator: &'r dyn ThunkRelocator,
    pub payload_relocator: Option<&'r dyn PayloadRelocator>,
    pub options: StagingOptions,
}

impl<'r> InjectionRequest<'r> {
    /// A request with no payload, using `DefaultRelocator` and two pages.
    pub fn new(thunk: &'r ThunkTemplate) -> InjectionRequest<'r> {
        InjectionRequest {
            thunk,
            payload: &[],
            relocator: &DefaultRelocator,
            payload_relocator: None,
            options: StagingOptions::default(),
        }
    }

    pub fn payload(mut self, payload: &'r [u8]) -> InjectionRequest<'r> {
        self.payload = payload;
        self
    }

    pub fn relocator(mut self, relocator: &'r dyn ThunkRelocator) -> InjectionRequest<'r> {
        self.relocator = relocator;
        self
    }

    /// Sets the callback which fixes up pointers inside the payload once its
    /// remote address is known.
    pub fn payload_relocator(
        mut self,
        relocator: &'r dyn PayloadRelocator,
    ) -> InjectionRequest<'r> {
        self.payload_relocator = Some(relocator);
        self
    }

    pub fn options(mut self, options: StagingOptions) -> InjectionRequest<'r> {
        self.options = options;
        self
    }
}

/// A successful injection.
///
/// Neither the allocation nor the thread are cleaned up automatically (dropping
/// `thread` only closes its handle). Once the thread has exited, the allocation
/// can be released with `RemoteAllocation::free`; otherwise it lives until the
/// target exits.
pub struct Injection<'p> {
    pub thread: RemoteThread<'p>,
    pub allocation: RemoteAllocation,
    /// Remote address the thread started at.
    pub entry_address: u64,
    /// Remote address of the thunk context, the thread's argument.
    pub thunk_address: u64,
    /// Remote address of the caller payload.
    pub payload_address: u64,
    /// Remote address of the extra read/write pages, `None` without them.
    pub writable_address: Option<u64>,
    pub writable_pages: usize,
}

/// Runs extraction, staging, relocation, materialization and handoff against
/// one target process.
pub struct Injector<'p> {
    code: &'p dyn CodeSource,
    process: &'p dyn TargetProcess,
}

impl<'p> Injector<'p> {
    /// `code` provides the functions being copied, `process` is the target.
    pub fn new(code: &'p dyn CodeSource, process: &'p dyn TargetProcess) -> Injector<'p> {
        Injector {
            code,
            process,
        }
    }

    /// Resolves `function` (following jump stubs) to its code and unwind data.
    pub fn extract(&self, function: u64) -> Result<ExtractedFunction, Error> {
        extract::extract_function(self.code, function)
    }

    /// Injects the function at `function` and starts a thread running it.
    pub fn inject(
        &self,
        function: u64,
        request: InjectionRequest<'_>,
    ) -> Result<Injection<'p>, Error> {
        if function == 0 {
            return Err(Error::InvalidParameter("function address is null"));
        }
        let image = self.extract(function)?;
        self.inject_image(&image, request)
    }

    /// Injects an already extracted function.
    pub fn inject_image(
        &self,
        image: &ExtractedFunction,
        request: InjectionRequest<'_>,
    ) -> Result<Injection<'p>, Error> {
        let process = self.process;
        request.thunk.validate()?;
        let mut staging =
            StagingBuffer::build(image, request.thunk, request.payload, request.options)?;

        let allocation = remote::reserve(process, staging.layout().page_count)?;
        let allocation = guard(allocation, |a| a.release(process));
        let placement = staging.relocate(
            request.thunk,
            request.relocator,
            request.payload_relocator,
            allocation.targets(),
        )?;
        let allocation = ScopeGuard::into_inner(allocation);

        let allocation = remote::materialize(process, allocation, &staging)?;
        let allocation = guard(allocation, |a| a.release(process));
        let thread = handoff::Handoff::new(process, placement.entry, placement.thunk).start()?;
        let allocation = ScopeGuard::into_inner(allocation);

        info!(
            "Injected {:#x} bytes at {:#x}, thread {} entering at {:#x}",
            staging.len(), allocation.code_base(), thread.id(), placement.entry,
        );
        Ok(Injection {
            thread,
            allocation,
            entry_address: placement.entry,
            thunk_address: placement.thunk,
            payload_address: placement.payload,
            writable_address: placement.writable,
            writable_pages: request.options.writable_pages,
        })
    }

    /// Injects `function` with a probing protocol marker and checks that the
    /// remote thread exits with `sentinel`.
    ///
    /// This verifies that the copied code and its relocations work in the target
    /// without having it load or run anything else. The remote pages are freed
    /// once the thread has exited; if the wait times out they are left behind,
    /// since the thread may still be executing them.
    pub fn probe(
        &self,
        function: u64,
        sentinel: u32,
        timeout: Option<Duration>,
        options: StagingOptions,
    ) -> Result<(), HandshakeError> {
        let template = ThunkTemplate::probe(sentinel)?;
        let request = InjectionRequest::new(&template).options(options);
        let Injection {
            mut thread,
            allocation,
            ..
        } = self.inject(function, request)?;
        let result = thread.verify_handshake(sentinel, timeout);
        match thread.state() {
            ThreadState::Terminated(_) => {
                drop(thread);
                if let Err(e) = allocation.free(self.process) {
                    match result {
                        Ok(()) => return Err(e.into()),
                        Err(_) => error!("Could not free probe pages: {}", e),
                    }
                }
            }
            ThreadState::Running => {
                warn!("Probe thread {} still running, leaking its pages", thread.id());
            }
            ThreadState::Created => {
                warn!("Could not wait for probe thread {}, leaking its pages", thread.id());
            }
        }
        if result.is_ok() {
            info!("Probe handshake succeeded with sentinel {:#x}", sentinel);
        }
        result
    }
}
