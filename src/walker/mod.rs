mod registry;

pub use registry::{
    enter, Entered, FrameInfo, FrameRegistry, RegisteredThread, Scope, ThreadFrames, MAX_DEPTH,
    TRUNCATED,
};

use crate::error::WalkError;
use crate::stack::Frame;

/// Where a [`StackWalker`] writes a frame chain.
///
/// The sink never grows its vector: the sampler reserves the space before the timer is armed,
/// and pushes beyond the reserved capacity are refused. Frames pushed from an interrupt handler
/// should borrow `'static` metadata, since building an owned string allocates.
#[derive(Debug)]
pub struct FrameSink<'a> {
    frames: &'a mut Vec<Frame>,
    overflowed: bool,
}

impl<'a> FrameSink<'a> {
    /// A sink appending to `frames` until its current capacity is reached.
    pub fn new(frames: &'a mut Vec<Frame>) -> Self {
        FrameSink {
            frames,
            overflowed: false,
        }
    }

    /// Appends `frame`, or returns `false` if there is no room left for it.
    ///
    /// A walker should stop walking once a push fails; the sampler drops the whole tick.
    pub fn push(&mut self, frame: Frame) -> bool {
        if self.frames.len() == self.frames.capacity() {
            self.overflowed = true;
            return false;
        }
        self.frames.push(frame);
        true
    }

    /// Whether a push was refused.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }
}

/// The capability the sampler uses to read call stacks.
///
/// A walker knows which threads are alive and how to read each one's current frame chain. The
/// sampler calls it synchronously from inside the timer's interrupt handler, so implementations
/// must not block, must not take locks the interrupted thread might hold, and should only read
/// frame metadata that is already available. They must not allocate either: the interrupted
/// thread may be inside the allocator. Reading another thread's frames while it keeps
/// running is inherently racy; a slightly stale chain is an acceptable answer.
///
/// The crate ships [`FrameRegistry`], a lock-free registry that runtimes (or annotated code, see
/// [`scope!`](crate::scope)) keep up to date.
pub trait StackWalker: Send + Sync {
    /// Identifies one live thread.
    type Thread: Copy + Eq;

    /// Calls `f` once for every thread currently alive, in no particular order.
    fn for_each_thread(&self, f: &mut dyn FnMut(Self::Thread));

    /// The thread the interrupt was delivered to, if this walker knows about it.
    fn current_thread(&self) -> Option<Self::Thread>;

    /// Pushes the frame chain of `thread` into `frames`, innermost frame first.
    ///
    /// `interrupted` is true for the thread that took the interrupt; walkers that can read the
    /// interrupted context directly should prefer it for that thread.
    fn walk(
        &self,
        thread: Self::Thread,
        interrupted: bool,
        frames: &mut FrameSink<'_>,
    ) -> Result<(), WalkError>;
}

impl<W> StackWalker for &W
where
    W: StackWalker + ?Sized,
{
    type Thread = W::Thread;

    fn for_each_thread(&self, f: &mut dyn FnMut(Self::Thread)) {
        (**self).for_each_thread(f)
    }

    fn current_thread(&self) -> Option<Self::Thread> {
        (**self).current_thread()
    }

    fn walk(
        &self,
        thread: Self::Thread,
        interrupted: bool,
        frames: &mut FrameSink<'_>,
    ) -> Result<(), WalkError> {
        (**self).walk(thread, interrupted, frames)
    }
}
