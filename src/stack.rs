use std::borrow::Cow;
use std::fmt;
use std::ops::Deref;

use serde::{Serialize, Serializer};

/// One entry in a captured call stack.
///
/// A frame is the triple of the source location it was entered from, the line within that
/// source, and the symbolic name of the function (or scope) it represents. Frames produced by
/// the built-in [`FrameRegistry`](crate::walker::FrameRegistry) borrow `'static` metadata and
/// are cheap to clone; walkers for dynamic runtimes can hand out owned strings instead.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Frame {
    /// Source location identifier, usually a file path.
    pub source: Cow<'static, str>,
    /// Line number within `source`.
    pub line: u32,
    /// Symbolic name.
    pub name: Cow<'static, str>,
}

impl Frame {
    /// Creates a new frame.
    pub fn new<S, N>(source: S, line: u32, name: N) -> Self
    where
        S: Into<Cow<'static, str>>,
        N: Into<Cow<'static, str>>,
    {
        Frame {
            source: source.into(),
            line,
            name: name.into(),
        }
    }
}

// Rendered as it appears in folded stack lines: `name (source:line)`.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.source, self.line)
    }
}

// Frames serialize as `[source, line, name]` triples.
impl Serialize for Frame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (&*self.source, self.line, &*self.name).serialize(serializer)
    }
}

/// An immutable call stack, innermost frame first.
///
/// The last frame is the outermost one (the thread's entry point as far as the walker can
/// tell). Two stacks are the same stack exactly when their frames are equal element-wise.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Stack {
    frames: Box<[Frame]>,
}

impl Stack {
    /// The frames of this stack, innermost first.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The innermost frame, if any.
    pub fn leaf(&self) -> Option<&Frame> {
        self.frames.first()
    }

    /// Iterates over the frames outermost first, the order folded stack lines use.
    pub fn outermost_first(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().rev()
    }

    /// Writes the frames outermost first, separated by `;`.
    pub fn write_folded<W>(&self, mut writer: W) -> std::io::Result<()>
    where
        W: std::io::Write,
    {
        for (i, frame) in self.outermost_first().enumerate() {
            if i != 0 {
                writer.write_all(b";")?;
            }
            write!(writer, "{}", frame)?;
        }
        Ok(())
    }
}

impl Deref for Stack {
    type Target = [Frame];

    fn deref(&self) -> &Self::Target {
        &self.frames
    }
}

impl From<Vec<Frame>> for Stack {
    fn from(frames: Vec<Frame>) -> Self {
        Stack {
            frames: frames.into_boxed_slice(),
        }
    }
}

impl FromIterator<Frame> for Stack {
    fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
        iter.into_iter().collect::<Vec<_>>().into()
    }
}
