//! A diagnostic memory-operation tracer.  `mem_trace` wraps a raw allocator and logs every
//! allocation, reallocation and deallocation, annotated with the call-site (file and line)
//! and the logical call stack of named function frames at the moment of the call.
//!
//! The call stack is not the machine stack: instrumented code maintains it by hand, pushing
//! a frame identifier on function entry and popping it on exit.  While a frame is active,
//! every traced allocation reports the full active chain, innermost frame first:
//!
//! ```text
//! File src/main.rs, line 62, function=add_column:make_extend_array:main reallocated the memory segment at address 0x55a3f8a012d0 to a new size 16
//! ```
//!
//! The tracer is strictly observational.  It never adjusts sizes or addresses, and it never
//! replaces the underlying allocator's failure semantics: a null result is logged and handed
//! back to the caller unchanged.
//!
//! ## Tracing allocations in a program
//!
//! ```
//! use mem_trace::{LibcAllocator, TraceContext, TracedAllocator};
//!
//! let mut ctx = TraceContext::new();
//! let mut alloc = TracedAllocator::new(LibcAllocator, std::io::stdout());
//!
//! ctx.push("load_table");
//! let p = alloc.trace_allocate(&mut ctx, 64);
//! let p = unsafe { alloc.trace_reallocate(&mut ctx, p, 128) };
//! unsafe { alloc.trace_free(&mut ctx, p) };
//! ctx.pop();
//! ```
//!
//! Callers must balance every `push` with exactly one `pop`; the tracer has no way to detect
//! a frame that was entered but never left.

use std::{
    fmt,
    fmt::{Display, Formatter},
    io::Write,
    panic::Location,
    process,
};

use libc::c_void;

/// Identifier reported for the implicit root frame, active before anything is pushed.
pub const GLOBAL_FRAME: &str = "global";

// A rendered trace summarizes at most 50 frames and never grows past 99 bytes.
const MAX_TRACE_DEPTH: usize = 50;
const MAX_TRACE_BYTES: usize = 99;

/// Logical call stack of active function frames.
///
/// The stack stores borrowed identifiers: the caller owns each string and must keep it alive
/// for as long as the frame stays pushed, which the `'id` lifetime enforces.  Frames exist
/// purely for diagnostic rendering; no control transfer happens here.
#[derive(Debug, Default)]
pub struct TraceContext<'id> {
    frames: Vec<&'id str>,
    // Reused across `render` calls; the returned slice is only valid until the next call.
    render_buf: String,
}

impl<'id> TraceContext<'id> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` as the innermost active frame.
    ///
    /// Growing the stack's own storage is the one allocation this crate performs for
    /// itself.  If that fails the process terminates with a short diagnostic: a tracer that
    /// can no longer track itself would only produce corrupted traces.
    pub fn push(&mut self, id: &'id str) {
        if self.frames.try_reserve(1).is_err() {
            eprintln!("mem_trace: failed to grow the trace stack");
            process::exit(1);
        }
        self.frames.push(id);
    }

    /// Removes the innermost active frame.
    ///
    /// Popping with nothing pushed is a caller bug and panics; the implicit root frame is
    /// not poppable.
    pub fn pop(&mut self) {
        assert!(
            self.frames.pop().is_some(),
            "TraceContext::pop called with no pushed frame"
        );
    }

    /// Number of explicitly pushed frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Renders the active frames, innermost first, colon-separated (`"funcC:funcB:funcA"`).
    ///
    /// With nothing pushed the result is exactly `"global"`.  The summary is deliberately
    /// lossy: rendering stops after 50 frames, or once appending the next identifier would
    /// push the line past 99 bytes, with no truncation marker.  The returned slice borrows
    /// an internal buffer and is invalidated by the next `render`, `push` or `pop`.
    pub fn render(&mut self) -> &str {
        self.render_buf.clear();
        match self.frames.last() {
            None => self.render_buf.push_str(GLOBAL_FRAME),
            Some(top) => {
                // The innermost identifier is always reported, clipped if it alone
                // overshoots the line budget.
                self.render_buf.push_str(clip(top, MAX_TRACE_BYTES));
                for id in self.frames.iter().rev().skip(1).take(MAX_TRACE_DEPTH - 1) {
                    if self.render_buf.len() + id.len() + 1 > MAX_TRACE_BYTES {
                        break;
                    }
                    self.render_buf.push(':');
                    self.render_buf.push_str(id);
                }
            }
        }
        &self.render_buf
    }
}

// Clip `s` to at most `max` bytes without splitting a character.
fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Raw allocation primitives the tracer delegates to.
pub trait RawAllocator {
    /// Allocates `size` bytes, returning null on failure.
    fn allocate(&self, size: usize) -> *mut c_void;

    /// Resizes the allocation at `ptr` to `new_size` bytes, returning the new address.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation previously returned by this allocator.
    unsafe fn reallocate(&self, ptr: *mut c_void, new_size: usize) -> *mut c_void;

    /// Releases the allocation at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation previously returned by this allocator.
    unsafe fn deallocate(&self, ptr: *mut c_void);
}

/// The C heap, reached through [`libc::malloc`], [`libc::realloc`] and [`libc::free`].
pub struct LibcAllocator;

impl RawAllocator for LibcAllocator {
    fn allocate(&self, size: usize) -> *mut c_void {
        unsafe { libc::malloc(size) }
    }

    unsafe fn reallocate(&self, ptr: *mut c_void, new_size: usize) -> *mut c_void {
        libc::realloc(ptr, new_size)
    }

    unsafe fn deallocate(&self, ptr: *mut c_void) {
        libc::free(ptr)
    }
}

/// The allocation operation behind one trace line.
#[derive(Clone, Copy, Debug)]
pub enum TraceEvent {
    Allocated { addr: *mut c_void, size: usize },
    Reallocated { addr: *mut c_void, size: usize },
    Freed { addr: *mut c_void },
}

/// One allocation event together with its call-site and rendered stack.
///
/// `Display` produces the log line.  Records are written to the sink immediately and never
/// retained.
#[derive(Debug)]
pub struct TraceRecord<'a> {
    pub file: &'a str,
    pub line: u32,
    pub trace: &'a str,
    pub event: TraceEvent,
}

impl Display for TraceRecord<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "File {}, line {}, function={} ",
            self.file, self.line, self.trace
        )?;
        match self.event {
            TraceEvent::Allocated { addr, size } => write!(
                f,
                "allocated new memory segment at address {:p} to size {}",
                addr, size
            ),
            TraceEvent::Reallocated { addr, size } => write!(
                f,
                "reallocated the memory segment at address {:p} to a new size {}",
                addr, size
            ),
            TraceEvent::Freed { addr } => {
                write!(f, "deallocated the memory segment at address {:p}", addr)
            }
        }
    }
}

/// Pass-through decorator that adds trace logging to a [`RawAllocator`].
///
/// Every operation captures its call-site via `#[track_caller]`, resolves "who is calling"
/// from the supplied [`TraceContext`] and writes one line to the sink.  Allocation and
/// reallocation log *after* delegating, so the line carries the address the caller actually
/// received; deallocation logs *before* delegating, so the line always describes memory
/// that is still valid at the moment of logging.
pub struct TracedAllocator<A, W> {
    raw: A,
    sink: W,
}

impl<A: RawAllocator, W: Write> TracedAllocator<A, W> {
    pub fn new(raw: A, sink: W) -> Self {
        Self { raw, sink }
    }

    /// Allocates `size` bytes and logs the result.  Null results pass through unchanged.
    #[track_caller]
    pub fn trace_allocate(&mut self, ctx: &mut TraceContext<'_>, size: usize) -> *mut c_void {
        let site = Location::caller();
        let addr = self.raw.allocate(size);
        self.emit(site, ctx, TraceEvent::Allocated { addr, size });
        addr
    }

    /// Resizes the allocation at `ptr` and logs the *new* address.  The old address is not
    /// recorded; callers wanting to correlate the two must track it themselves.
    ///
    /// # Safety
    ///
    /// Same contract as [`RawAllocator::reallocate`].
    #[track_caller]
    pub unsafe fn trace_reallocate(
        &mut self,
        ctx: &mut TraceContext<'_>,
        ptr: *mut c_void,
        new_size: usize,
    ) -> *mut c_void {
        let site = Location::caller();
        let addr = self.raw.reallocate(ptr, new_size);
        self.emit(
            site,
            ctx,
            TraceEvent::Reallocated {
                addr,
                size: new_size,
            },
        );
        addr
    }

    /// Logs the release of `ptr`, then releases it.
    ///
    /// # Safety
    ///
    /// Same contract as [`RawAllocator::deallocate`].
    #[track_caller]
    pub unsafe fn trace_free(&mut self, ctx: &mut TraceContext<'_>, ptr: *mut c_void) {
        let site = Location::caller();
        self.emit(site, ctx, TraceEvent::Freed { addr: ptr });
        self.raw.deallocate(ptr);
    }

    // Tracing is best effort: a sink write error must never change allocation results.
    fn emit(&mut self, site: &Location<'_>, ctx: &mut TraceContext<'_>, event: TraceEvent) {
        let record = TraceRecord {
            file: site.file(),
            line: site.line(),
            trace: ctx.render(),
            event,
        };
        let _ = writeln!(self.sink, "{}", record);
    }
}
