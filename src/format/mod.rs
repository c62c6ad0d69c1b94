/// Folded stack output, one line per run of consecutive identical stacks.
pub mod folded;

/// Top-K table output.
pub mod table;

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use crate::error::Error;
use crate::stack::Stack;

/// The number of stacks the table format keeps by default.
pub const DEFAULT_MAX_STACKS: usize = 50;

/// The output encodings a profile can be saved in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// The `max_stacks` most frequent stacks with their counts, as JSON.
    Table {
        /// How many stacks to keep.
        max_stacks: usize,
    },
    /// Folded stack lines for flame graph tools.
    Folded,
}

impl Default for Format {
    fn default() -> Self {
        Format::Table {
            max_stacks: DEFAULT_MAX_STACKS,
        }
    }
}

impl Format {
    /// The file extension profiles in this format are saved with.
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Table { .. } => "plop",
            Format::Folded => "flame",
        }
    }

    /// Renders `stacks` (in capture order) to `writer`.
    pub fn render<'a, I, W>(&self, stacks: I, writer: W) -> io::Result<()>
    where
        I: IntoIterator<Item = &'a Stack>,
        W: Write,
    {
        match *self {
            Format::Table { max_stacks } => table::write(stacks, max_stacks, writer),
            Format::Folded => folded::write(stacks, writer),
        }
    }

    /// Renders `stacks` into the file at `path`, replacing it if it exists.
    pub fn save<'a, I, P>(&self, stacks: I, path: P) -> Result<(), Error>
    where
        I: IntoIterator<Item = &'a Stack>,
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let write = || -> io::Result<()> {
            let mut writer = BufWriter::new(File::create(path)?);
            self.render(stacks, &mut writer)?;
            writer.flush()
        };
        write().map_err(|source| Error::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Sets the table size. Has no effect on the folded format.
    pub fn with_max_stacks(self, max_stacks: usize) -> Self {
        match self {
            Format::Table { .. } => Format::Table { max_stacks },
            Format::Folded => Format::Folded,
        }
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plop" | "table" => Ok(Format::default()),
            "flamegraph" | "folded" => Ok(Format::Folded),
            unknown => Err(Error::Config(format!("unknown output format: {}", unknown))),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Table { .. } => f.write_str("plop"),
            Format::Folded => f.write_str("flamegraph"),
        }
    }
}
