use std::fmt;
use std::iter;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use super::{FrameSink, StackWalker};
use crate::error::WalkError;
use crate::stack::Frame;

/// The number of frames recorded per thread. Deeper frames are counted but not recorded.
pub const MAX_DEPTH: usize = 128;

/// Stands in for the frames nested deeper than [`MAX_DEPTH`]. It is reported as the innermost
/// frame of a truncated chain, so the outermost recorded frame is never mistaken for the leaf.
pub static TRUNCATED: FrameInfo = FrameInfo::new("[truncated]", "<plop>", 0);

/// Static metadata describing one frame in a [`FrameRegistry`].
///
/// Usually created by the [`scope!`](crate::scope) macro as a `static`.
#[derive(Debug)]
pub struct FrameInfo {
    name: &'static str,
    source: &'static str,
    line: u32,
}

impl FrameInfo {
    /// Describes a frame named `name`, entered at `source:line`.
    pub const fn new(name: &'static str, source: &'static str, line: u32) -> Self {
        FrameInfo { name, source, line }
    }

    /// The symbolic name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The source location.
    pub fn source(&self) -> &'static str {
        self.source
    }

    /// The line within the source.
    pub fn line(&self) -> u32 {
        self.line
    }

    fn to_frame(&self) -> Frame {
        Frame::new(self.source, self.line, self.name)
    }
}

// One thread's frame chain. Slots are leaked on creation and recycled when their thread goes
// away, so a `&'static Slot` stays valid even while the interrupt handler reads a slot whose
// owner is exiting.
//
// Only the owning thread writes `frames` and `depth`. Frames are published before the depth
// that covers them (release), so a reader that loads `depth` (acquire) sees every frame below
// it. Frame pointers are never cleared, which makes a stale read harmless.
struct Slot {
    in_use: AtomicBool,
    owner: AtomicUsize,
    depth: AtomicUsize,
    frames: [AtomicPtr<FrameInfo>; MAX_DEPTH],
    next: AtomicPtr<Slot>,
}

impl Slot {
    fn claimed(owner: usize) -> Self {
        Slot {
            in_use: AtomicBool::new(true),
            owner: AtomicUsize::new(owner),
            depth: AtomicUsize::new(0),
            frames: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

fn current_owner() -> usize {
    // SAFETY: pthread_self has no preconditions and is safe to call from a signal handler.
    unsafe { libc::pthread_self() as usize }
}

/// A process-wide table of per-thread frame chains.
///
/// Runtimes that keep their own call stacks (interpreters, schedulers, or Rust code annotated
/// with [`scope!`](crate::scope)) publish frames here, and the sampler reads them from the
/// interrupt handler. All operations are lock-free: pushing and popping a frame are two atomic
/// stores, and reading a chain only loads atomics.
///
/// Registries must live for `'static`; most programs only ever use [`FrameRegistry::global`].
pub struct FrameRegistry {
    head: AtomicPtr<Slot>,
}

impl FrameRegistry {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        FrameRegistry {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The registry used by [`scope!`](crate::scope) and [`enter`].
    pub fn global() -> &'static FrameRegistry {
        static GLOBAL: FrameRegistry = FrameRegistry::new();
        &GLOBAL
    }

    /// Registers the calling thread, returning the handle it uses to publish frames.
    ///
    /// The thread stays registered until the handle is dropped.
    pub fn register(&'static self) -> ThreadFrames {
        let owner = current_owner();
        for slot in self.slots() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.depth.store(0, Ordering::Release);
                slot.owner.store(owner, Ordering::Release);
                return ThreadFrames::new(slot);
            }
        }

        let slot: &'static Slot = Box::leak(Box::new(Slot::claimed(owner)));
        let raw = slot as *const Slot as *mut Slot;
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            slot.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        ThreadFrames::new(slot)
    }

    /// The number of threads currently registered.
    pub fn threads(&self) -> usize {
        self.slots()
            .filter(|slot| slot.in_use.load(Ordering::Acquire))
            .count()
    }

    fn slots(&self) -> impl Iterator<Item = &'static Slot> {
        let mut next = self.head.load(Ordering::Acquire);
        iter::from_fn(move || {
            // SAFETY: slots are leaked when created and never freed.
            let slot: &'static Slot = unsafe { next.as_ref()? };
            next = slot.next.load(Ordering::Acquire);
            Some(slot)
        })
    }
}

impl Default for FrameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FrameRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRegistry")
            .field("threads", &self.threads())
            .finish()
    }
}

/// A thread registered with a [`FrameRegistry`].
#[derive(Clone, Copy)]
pub struct RegisteredThread(&'static Slot);

impl PartialEq for RegisteredThread {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}

impl Eq for RegisteredThread {}

impl fmt::Debug for RegisteredThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RegisteredThread")
            .field(&(self.0 as *const Slot))
            .finish()
    }
}

impl StackWalker for FrameRegistry {
    type Thread = RegisteredThread;

    fn for_each_thread(&self, f: &mut dyn FnMut(Self::Thread)) {
        for slot in self.slots() {
            if slot.in_use.load(Ordering::Acquire) {
                f(RegisteredThread(slot));
            }
        }
    }

    fn current_thread(&self) -> Option<Self::Thread> {
        let owner = current_owner();
        self.slots()
            .find(|slot| {
                slot.in_use.load(Ordering::Acquire) && slot.owner.load(Ordering::Acquire) == owner
            })
            .map(RegisteredThread)
    }

    fn walk(
        &self,
        thread: Self::Thread,
        _interrupted: bool,
        frames: &mut FrameSink<'_>,
    ) -> Result<(), WalkError> {
        let slot = thread.0;
        let depth = slot.depth.load(Ordering::Acquire);
        if depth > MAX_DEPTH && !frames.push(TRUNCATED.to_frame()) {
            return Ok(());
        }
        for i in (0..depth.min(MAX_DEPTH)).rev() {
            let info = slot.frames[i].load(Ordering::Acquire);
            // SAFETY: published pointers come from `&'static FrameInfo`.
            let frame = match unsafe { info.as_ref() } {
                Some(info) => info.to_frame(),
                None => return Err(WalkError::new("frame was never published", i)),
            };
            if !frames.push(frame) {
                break;
            }
        }
        Ok(())
    }
}

/// The calling thread's handle on a [`FrameRegistry`].
///
/// Dropping it unregisters the thread and frees its slot for reuse.
pub struct ThreadFrames {
    slot: &'static Slot,
    _not_send: PhantomData<*const ()>,
}

impl ThreadFrames {
    fn new(slot: &'static Slot) -> Self {
        ThreadFrames {
            slot,
            _not_send: PhantomData,
        }
    }

    /// Publishes `frame` as the new innermost frame.
    pub fn push(&self, frame: &'static FrameInfo) {
        let depth = self.slot.depth.load(Ordering::Relaxed);
        if depth < MAX_DEPTH {
            let frame = frame as *const FrameInfo as *mut FrameInfo;
            self.slot.frames[depth].store(frame, Ordering::Relaxed);
        }
        self.slot.depth.store(depth + 1, Ordering::Release);
    }

    /// Removes the innermost frame.
    pub fn pop(&self) {
        let depth = self.slot.depth.load(Ordering::Relaxed);
        if depth > 0 {
            self.slot.depth.store(depth - 1, Ordering::Release);
        }
    }

    /// Pushes `frame` and pops it again when the returned guard is dropped.
    pub fn enter(&self, frame: &'static FrameInfo) -> Entered<'_> {
        self.push(frame);
        Entered { frames: self }
    }

    /// The number of frames currently on this thread's chain.
    pub fn depth(&self) -> usize {
        self.slot.depth.load(Ordering::Relaxed)
    }

    /// This thread, as seen by the registry's [`StackWalker`] implementation.
    pub fn thread(&self) -> RegisteredThread {
        RegisteredThread(self.slot)
    }
}

impl Drop for ThreadFrames {
    fn drop(&mut self) {
        self.slot.depth.store(0, Ordering::Release);
        self.slot.owner.store(0, Ordering::Release);
        self.slot.in_use.store(false, Ordering::Release);
    }
}

impl fmt::Debug for ThreadFrames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadFrames")
            .field("depth", &self.depth())
            .finish()
    }
}

/// Guard returned by [`ThreadFrames::enter`].
#[derive(Debug)]
pub struct Entered<'a> {
    frames: &'a ThreadFrames,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        self.frames.pop();
    }
}

thread_local! {
    static LOCAL: ThreadFrames = FrameRegistry::global().register();
}

/// Publishes `frame` on the calling thread's chain in the [global](FrameRegistry::global)
/// registry until the returned guard is dropped.
///
/// The thread is registered on first use and unregistered when it exits.
pub fn enter(frame: &'static FrameInfo) -> Scope {
    LOCAL.with(|frames| frames.push(frame));
    Scope {
        _not_send: PhantomData,
    }
}

/// Guard returned by [`enter`].
#[derive(Debug)]
pub struct Scope {
    _not_send: PhantomData<*const ()>,
}

impl Drop for Scope {
    fn drop(&mut self) {
        let _ = LOCAL.try_with(|frames| frames.pop());
    }
}
