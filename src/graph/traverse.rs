//! Marked depth-first walks over the module and node DAGs.
//!
//! Both graphs hang off the same connector model, so one walker serves
//! them: starting from a sink it follows every linked input connector
//! upstream, fires `pre` when an item is first opened and `post` once all
//! its inputs are done, and reports back-edges (an input pointing at an
//! item still open on the stack) through `cycle` so the caller can sever
//! the link and carry on. Items are visited at most once; diamonds are
//! fine.

use crate::connector::Connector;
use crate::error::Result;
use crate::graph::Graph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Realm {
    Modules,
    Nodes,
}

fn connectors(g: &Graph, realm: Realm, idx: usize) -> &[Connector] {
    match realm {
        Realm::Modules => &g.modules[idx].connectors,
        Realm::Nodes => &g.nodes[idx].connectors,
    }
}

fn item_count(g: &Graph, realm: Realm) -> usize {
    match realm {
        Realm::Modules => g.modules.len(),
        Realm::Nodes => g.nodes.len(),
    }
}

#[derive(Clone, Copy)]
struct Frame {
    idx: usize,
    /// Next connector to look at.
    ci: usize,
    pre_done: bool,
}

const MARK_OPEN: u8 = 1;
const MARK_DONE: u8 = 2;

pub(crate) fn traverse<Pre, Post, Cycle>(
    g: &mut Graph,
    realm: Realm,
    start: usize,
    mut pre: Pre,
    mut post: Post,
    mut cycle: Cycle,
) -> Result<()>
where
    Pre: FnMut(&mut Graph, usize) -> Result<()>,
    Post: FnMut(&mut Graph, usize) -> Result<()>,
    Cycle: FnMut(&mut Graph, usize, usize),
{
    let count = item_count(g, realm);
    if start >= count {
        return Ok(());
    }
    let mut mark = vec![0u8; count];
    let mut stack = Vec::with_capacity(count);
    stack.push(Frame { idx: start, ci: 0, pre_done: false });
    mark[start] = MARK_OPEN;

    while let Some(&top) = stack.last() {
        if !top.pre_done {
            stack.last_mut().unwrap().pre_done = true;
            pre(g, top.idx)?;
            continue; // hooks may rewire; rescan from the frame state
        }

        // advance to the next unvisited upstream item
        let nc = connectors(g, realm, top.idx).len();
        let mut ci = top.ci;
        let mut descend = None;
        while ci < nc {
            let c = &connectors(g, realm, top.idx)[ci];
            if c.is_input() && c.connected_mi >= 0 {
                let up = c.connected_mi as usize;
                if up < count {
                    match mark[up] {
                        MARK_OPEN => cycle(g, top.idx, ci),
                        MARK_DONE => {}
                        _ => {
                            descend = Some(up);
                            ci += 1;
                            break;
                        }
                    }
                }
            }
            ci += 1;
        }
        stack.last_mut().unwrap().ci = ci;

        if let Some(up) = descend {
            mark[up] = MARK_OPEN;
            stack.push(Frame { idx: up, ci: 0, pre_done: false });
        } else {
            post(g, top.idx)?;
            mark[top.idx] = MARK_DONE;
            stack.pop();
        }
    }
    Ok(())
}
