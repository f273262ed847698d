//! Debug dumps of the expanded node graph.

use std::io::{self, Write};

use crate::graph::Graph;

/// Writes the node DAG in graphviz dot format: one box per kernel with its
/// dispatch extent, one edge per link labelled with the pixel layout.
pub fn dump_nodes_dot(graph: &Graph, w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "digraph nodes {{")?;
    writeln!(w, "  rankdir = BT;")?;
    for (ni, node) in graph.nodes.iter().enumerate() {
        writeln!(
            w,
            "  n{} [shape=box, label=\"{}_{}\\n{}x{}x{}\"];",
            ni, node.name, node.kernel, node.wd, node.ht, node.dp
        )?;
    }
    for (ni, node) in graph.nodes.iter().enumerate() {
        for c in node.connectors.iter() {
            if c.is_input() && c.connected_mi >= 0 {
                writeln!(
                    w,
                    "  n{} -> n{} [label=\"{} {} {}x{}\"];",
                    c.connected_mi, ni, c.chan, c.format, c.roi.wd, c.roi.ht
                )?;
            }
        }
    }
    writeln!(w, "}}")
}

/// Same for the coarse module graph, before expansion.
pub fn dump_modules_dot(graph: &Graph, w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "digraph modules {{")?;
    writeln!(w, "  rankdir = BT;")?;
    for (mi, module) in graph.modules.iter().enumerate() {
        writeln!(w, "  m{} [shape=box, label=\"{}_{}\"];", mi, module.name, module.inst)?;
    }
    for (mi, module) in graph.modules.iter().enumerate() {
        for c in module.connectors.iter() {
            if c.is_input() && c.connected_mi >= 0 {
                writeln!(
                    w,
                    "  m{} -> m{} [label=\"{} {}\"];",
                    c.connected_mi, mi, c.chan, c.format
                )?;
            }
        }
    }
    writeln!(w, "}}")
}
