use std::io::{self, Write};

use crate::stack::Stack;

/// Writes `stacks` as folded stack lines.
///
/// Each line is a stack, outermost frame first, frames rendered as `name (source:line)` and
/// joined with `;`, followed by a space and a sample count. Only *consecutive* identical stacks
/// are merged into one line: a stack that reappears after a different one starts a new line.
/// Flame graph consumers of this output rely on that encoding, so it is not globally
/// aggregated.
pub fn write<'a, I, W>(stacks: I, mut writer: W) -> io::Result<()>
where
    I: IntoIterator<Item = &'a Stack>,
    W: Write,
{
    let mut stacks = stacks.into_iter();
    let Some(mut current) = stacks.next() else {
        return Ok(());
    };
    let mut count = 1;
    for stack in stacks {
        if stack == current {
            count += 1;
            continue;
        }
        write_line(&mut writer, current, count)?;
        current = stack;
        count = 1;
    }
    write_line(&mut writer, current, count)
}

fn write_line<W>(writer: &mut W, stack: &Stack, count: usize) -> io::Result<()>
where
    W: Write,
{
    stack.write_folded(&mut *writer)?;
    let mut buffer = itoa::Buffer::new();
    writer.write_all(b" ")?;
    writer.write_all(buffer.format(count).as_bytes())?;
    writer.write_all(b"\n")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::stack::Frame;

    fn a() -> Stack {
        vec![
            Frame::new("work.rs", 5, "crunch"),
            Frame::new("main.rs", 1, "main"),
        ]
        .into()
    }

    fn b() -> Stack {
        vec![
            Frame::new("io.rs", 9, "read"),
            Frame::new("main.rs", 1, "main"),
        ]
        .into()
    }

    fn folded(stacks: &[Stack]) -> String {
        let mut out = Vec::new();
        write(stacks, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn merges_only_consecutive_runs() {
        let store = vec![a(), a(), a(), b(), a()];
        assert_eq!(
            folded(&store),
            "main (main.rs:1);crunch (work.rs:5) 3\n\
             main (main.rs:1);read (io.rs:9) 1\n\
             main (main.rs:1);crunch (work.rs:5) 1\n"
        );
    }

    #[test]
    fn counts_sum_to_the_number_of_stacks() {
        let store = vec![b(), a(), a(), b(), b(), a(), b()];
        let out = folded(&store);
        let total: usize = out
            .lines()
            .map(|line| line.rsplit(' ').next().unwrap().parse::<usize>().unwrap())
            .sum();
        assert_eq!(total, store.len());
        assert_eq!(out.lines().count(), 5);
    }

    #[test]
    fn single_stack() {
        assert_eq!(folded(&[b()]), "main (main.rs:1);read (io.rs:9) 1\n");
    }

    #[test]
    fn empty_store_writes_nothing() {
        assert_eq!(folded(&[]), "");
    }
}
