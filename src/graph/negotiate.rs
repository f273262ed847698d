//! ROI negotiation, node expansion and reference counting.
//!
//! Two walks over the module graph settle buffer geometry: a post-order
//! forward pass pushes full dimensions from sources towards the sinks, a
//! pre-order reverse pass propagates the actually requested windows back
//! up. Afterwards every module expands into nodes, and a final pre-order
//! walk over the node graph counts live readers per output so the arena
//! knows when images become reclaimable.

use log::{error, info};
use smallvec::SmallVec;

use crate::connector::{Connector, ROLE_SINK, ROLE_WRITE};
use crate::error::Result;
use crate::graph::Graph;
use crate::node::Node;
use crate::token::Token;

const INPUT: Token = Token::new("input");
const OUTPUT: Token = Token::new("output");
const MAIN: Token = Token::new("main");

/// Forward pass body, run in post-order: by the time a module is visited
/// all its upstreams have settled their output ROIs.
pub(crate) fn modify_roi_out(g: &mut Graph, mi: usize) {
    let input = g.modules[mi].connector_index(INPUT);

    // image metadata follows the pixels through the distinguished input
    if let Some(ic) = input {
        let up = g.modules[mi].connectors[ic].connected_mi;
        if up >= 0 {
            g.modules[mi].img_param = g.modules[up as usize].img_param;
        }
    }

    if let Some(f) = g.ops(mi).modify_roi_out {
        sync_input_rois(g, mi);
        return f(g, mi);
    }

    // default: push the full extent of "input" through to every write
    let Some(ic) = input else { return };
    let (up, uc) = {
        let c = &g.modules[mi].connectors[ic];
        (c.connected_mi, c.connected_mc)
    };
    if up < 0 || uc < 0 {
        return;
    }
    let roi = g.modules[up as usize].connectors[uc as usize].roi;
    g.modules[mi].connectors[ic].roi = roi;
    for c in g.modules[mi].connectors.iter_mut() {
        if c.role == ROLE_WRITE {
            c.roi.full_wd = roi.full_wd;
            c.roi.full_ht = roi.full_ht;
        }
    }
}

/// Keeps every linked read connector's ROI in sync with its upstream
/// write connector before a custom hook runs.
fn sync_input_rois(g: &mut Graph, mi: usize) {
    for ci in 0..g.modules[mi].connectors.len() {
        let c = &g.modules[mi].connectors[ci];
        if !c.is_input() || c.connected_mi < 0 || c.connected_mc < 0 {
            continue;
        }
        let roi = g.modules[c.connected_mi as usize].connectors[c.connected_mc as usize].roi;
        g.modules[mi].connectors[ci].roi = roi;
    }
}

/// Reverse pass body, run in pre-order: downstream demand is known before
/// the predecessors are visited.
pub(crate) fn modify_roi_in(g: &mut Graph, mi: usize) {
    if let Some(f) = g.ops(mi).modify_roi_in {
        f(g, mi);
    } else {
        let mut output = g.modules[mi].connector_index(OUTPUT);
        if output.is_none() && g.modules[mi].connectors.first().map_or(false, |c| c.role == ROLE_SINK)
        {
            // sinks ask for everything by default
            let r = &mut g.modules[mi].connectors[0].roi;
            r.wd = r.full_wd;
            r.ht = r.full_ht;
            r.scale = 1.0;
            output = Some(0);
        }
        let Some(oc) = output else { return };
        let roi = g.modules[mi].connectors[oc].roi;
        for c in g.modules[mi].connectors.iter_mut() {
            if c.is_input() {
                c.roi = roi;
            }
        }
    }

    // make the request visible on the upstream write connectors
    for ci in 0..g.modules[mi].connectors.len() {
        let c = &g.modules[mi].connectors[ci];
        if !c.is_input() || c.connected_mi < 0 || c.connected_mc < 0 {
            continue;
        }
        let (up, uc, roi) = (c.connected_mi as usize, c.connected_mc as usize, c.roi);
        g.modules[up].connectors[uc].roi = roi;
    }
}

/// Expansion, run in post-order so upstream modules already know their
/// node indices when links are translated.
pub(crate) fn create_nodes(g: &mut Graph, mi: usize) -> Result<()> {
    if let Some(f) = g.ops(mi).create_nodes {
        return f(g, mi);
    }

    let module = &g.modules[mi];
    let mut node = Node::new(module.name, MAIN, mi);
    if let Some(oc) = module.connector_index(OUTPUT) {
        let roi = &module.connectors[oc].roi;
        node.wd = roi.wd;
        node.ht = roi.ht;
        node.dp = 1;
    }
    node.connectors
        .resize(module.connectors.len(), Connector::default());
    let nid = g.add_node(node)?;
    for ci in 0..g.modules[mi].connectors.len() {
        g.connector_copy(mi, ci, nid, ci);
    }
    Ok(())
}

/// Pre-order over the node graph. Outputs cannot enumerate their readers,
/// so the link field doubles as the reader count: each linked input bumps
/// its upstream output, and every output takes one count for its own
/// balancing free in the allocation walk.
pub(crate) fn count_references(g: &mut Graph, ni: usize) {
    let mut ups: SmallVec<[(usize, usize); 8]> = SmallVec::new();
    for c in g.nodes[ni].connectors.iter_mut() {
        if c.is_input() {
            if c.connected_mi >= 0 {
                ups.push((c.connected_mi as usize, c.connected_mc as usize));
            }
        } else {
            c.connected_mi += 1;
        }
    }
    for (up, uc) in ups {
        g.nodes[up].connectors[uc].connected_mi += 1;
    }
}

/// Per-run parameter flattening, invoked once per module before recording.
pub(crate) fn commit_params(g: &mut Graph, mi: usize) {
    if let Some(f) = g.ops(mi).commit_params {
        f(g, mi);
    }
}

/// Everything below the budget runs in one piece; above it, sub-ROI
/// iteration would kick in.
/// TODO: cut the sink request into tiles and loop the allocation walk
pub(crate) fn tile_check(g: &Graph) -> bool {
    let need = g.heap.vmsize();
    if need > g.heap_budget() {
        error!(
            target: "pipe",
            "image heap needs {:.1} MB but budget is {:.1} MB; tiling is not implemented",
            need as f64 / (1024.0 * 1024.0),
            g.heap_budget() as f64 / (1024.0 * 1024.0)
        );
        return true;
    }
    info!(
        target: "pipe",
        "images : peak rss {:.1} MB vmsize {:.1} MB",
        g.heap.peak_rss() as f64 / (1024.0 * 1024.0),
        g.heap.vmsize() as f64 / (1024.0 * 1024.0)
    );
    info!(
        target: "pipe",
        "staging: peak rss {:.1} MB vmsize {:.1} MB",
        g.heap_staging.peak_rss() as f64 / (1024.0 * 1024.0),
        g.heap_staging.vmsize() as f64 / (1024.0 * 1024.0)
    );
    false
}
