//! Human readable call tree rendering
//!
//! Produces a table with self time, total time, percentage bars and an
//! indented tree of signatures:
//!
//! ```text
//! ----------------------------------------------------------------------
//! Selftime (ms)              Total (ms)                 Method signature
//! ----------------------------------------------------------------------
//! 000250.00  025% ||:        001000.00  100% |||||||||| GET /orders
//! 000250.00  025% ||:        000500.00  050% |||||      |-- loadOrders
//! 000250.00  025% ||:        000250.00  025% ||:        |   `-- SELECT * FROM orders
//! 000250.00  025% ||:        000250.00  025% ||:        `-- renderView
//! ```

use std::fmt::{self, Write};

use crate::node::NodeRef;
use crate::tree::CallTree;

const BAR_WIDTH: usize = 10;
const COLUMN_WIDTH: usize = 27;
const SEPARATOR: &str = "----------------------------------------------------------------------";

/// Renders finished call trees for logs and diagnostics
#[derive(Debug, Clone, Copy)]
pub struct TreeRenderer {
    ascii: bool,
}

impl TreeRenderer {
    /// Create a renderer
    ///
    /// # Arguments
    ///
    /// * `ascii` - draw bars with `|` and `:` instead of block characters
    pub fn new(ascii: bool) -> Self {
        Self { ascii }
    }

    /// Render the whole tree
    pub fn render(&self, tree: &CallTree) -> String {
        self.render_subtree(tree, tree.root())
    }

    /// Render the subtree below `from`; percentages are relative to it
    pub fn render_subtree(&self, tree: &CallTree, from: NodeRef) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail
        let _ = self.write_subtree(&mut out, tree, from);
        out
    }

    /// Render the subtree below `from` into any writer
    pub fn write_subtree<W: Write>(&self, out: &mut W, tree: &CallTree, from: NodeRef) -> fmt::Result {
        let total = tree.get(from).map_or(0, |n| n.execution_time_nanos());

        writeln!(out, "{}", SEPARATOR)?;
        writeln!(
            out,
            "{:<width$}{:<width$}Method signature",
            "Selftime (ms)",
            "Total (ms)",
            width = COLUMN_WIDTH
        )?;
        writeln!(out, "{}", SEPARATOR)?;

        for node in tree.preorder(from) {
            let Some(n) = tree.get(node) else {
                continue;
            };
            self.write_time(out, n.net_execution_time_nanos(), total)?;
            self.write_time(out, n.execution_time_nanos(), total)?;
            write_prefix(out, tree, from, node)?;
            writeln!(out, "{}", n.signature())?;
        }
        Ok(())
    }

    fn write_time<W: Write>(&self, out: &mut W, time: u64, total: u64) -> fmt::Result {
        let fraction = if total == 0 {
            0.0
        } else {
            time as f64 / total as f64
        };
        write!(
            out,
            "{:09.2}  {:03.0}% {} ",
            time as f64 / 1_000_000.0,
            fraction * 100.0,
            self.bar(fraction)
        )
    }

    fn bar(&self, fraction: f64) -> String {
        let (full, half, blank) = if self.ascii {
            ('|', ':', ' ')
        } else {
            ('\u{2588}', '\u{258C}', '\u{2007}')
        };
        let full_bars = (fraction * BAR_WIDTH as f64) as usize;
        let with_half = full_bars * 2 != (fraction * BAR_WIDTH as f64 * 2.0) as usize;

        (0..BAR_WIDTH)
            .map(|i| {
                if i < full_bars {
                    full
                } else if i == full_bars && with_half {
                    half
                } else {
                    blank
                }
            })
            .collect()
    }
}

impl Default for TreeRenderer {
    fn default() -> Self {
        Self::new(true)
    }
}

fn write_prefix<W: Write>(out: &mut W, tree: &CallTree, from: NodeRef, node: NodeRef) -> fmt::Result {
    if node == from {
        return Ok(());
    }

    let mut ancestors = Vec::new();
    let mut current = tree.get(node).and_then(|n| n.parent());
    while let Some(ancestor) = current {
        if ancestor == from {
            break;
        }
        ancestors.push(ancestor);
        current = tree.get(ancestor).and_then(|n| n.parent());
    }

    for ancestor in ancestors.iter().rev() {
        out.write_str(if tree.is_last_child(*ancestor) { "    " } else { "|   " })?;
    }
    out.write_str(if tree.is_last_child(node) { "`-- " } else { "|-- " })
}

impl fmt::Display for CallTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        TreeRenderer::default().write_subtree(f, self, self.root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_bar() {
        let renderer = TreeRenderer::new(true);
        assert_eq!(renderer.bar(0.0), "          ");
        assert_eq!(renderer.bar(0.25), "||:       ");
        assert_eq!(renderer.bar(0.5), "|||||     ");
        assert_eq!(renderer.bar(1.0), "||||||||||");
    }

    #[test]
    fn test_unicode_bar() {
        let renderer = TreeRenderer::new(false);
        assert_eq!(
            renderer.bar(0.25),
            "\u{2588}\u{2588}\u{258C}\u{2007}\u{2007}\u{2007}\u{2007}\u{2007}\u{2007}\u{2007}"
        );
    }

    #[test]
    fn test_write_time_guards_zero_total() {
        let renderer = TreeRenderer::new(true);
        let mut out = String::new();
        renderer.write_time(&mut out, 0, 0).unwrap();
        assert_eq!(out, "000000.00  000%            ");
    }
}
