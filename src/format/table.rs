use std::io::{self, Write};

use serde::Serialize;

use crate::aggregate::{aggregate, top_k};
use crate::stack::Stack;

#[derive(Serialize)]
struct Entry<'a> {
    count: usize,
    stack: &'a Stack,
}

/// Writes the `max_stacks` most frequent of `stacks` as a JSON list.
///
/// Every entry is an object `{"count": n, "stack": [[source, line, name], ...]}` with frames
/// innermost first. Entries are ordered by descending count; equal counts keep first-capture
/// order.
pub fn write<'a, I, W>(stacks: I, max_stacks: usize, mut writer: W) -> io::Result<()>
where
    I: IntoIterator<Item = &'a Stack>,
    W: Write,
{
    let entries: Vec<_> = top_k(aggregate(stacks), max_stacks)
        .into_iter()
        .map(|(stack, count)| Entry { count, stack })
        .collect();
    serde_json::to_writer(&mut writer, &entries)?;
    writer.write_all(b"\n")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    use super::*;
    use crate::stack::Frame;

    fn stack(name: &'static str) -> Stack {
        vec![Frame::new("lib.rs", 3, name)].into()
    }

    fn table(stacks: &[Stack], max_stacks: usize) -> Value {
        let mut out = Vec::new();
        write(stacks, max_stacks, &mut out).unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    #[test]
    fn serializes_counts_and_frames() {
        let store = vec![stack("a"), stack("b"), stack("a")];
        assert_eq!(
            table(&store, 50),
            serde_json::json!([
                { "count": 2, "stack": [["lib.rs", 3, "a"]] },
                { "count": 1, "stack": [["lib.rs", 3, "b"]] },
            ])
        );
    }

    #[test]
    fn keeps_at_most_max_stacks_in_descending_order() {
        let names = ["a", "b", "b", "c", "c", "c", "d", "d", "d", "d"];
        let store: Vec<_> = names.iter().map(|&n| stack(n)).collect();
        let value = table(&store, 3);
        let entries = value.as_array().unwrap();
        assert_eq!(entries.len(), 3);

        let counts: Vec<_> = entries
            .iter()
            .map(|e| e["count"].as_u64().unwrap())
            .collect();
        assert_eq!(counts, vec![4, 3, 2]);
    }

    #[test]
    fn empty_store_is_an_empty_list() {
        assert_eq!(table(&[], 50), serde_json::json!([]));
    }
}
