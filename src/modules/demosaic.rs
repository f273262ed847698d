//! Half-size demosaic.
//!
//! Collapses each CFA block (2x2 Bayer, 3x3 X-Trans) into one output
//! pixel, so the output frame is the input divided by the block size.
//! A full-resolution reconstruction would expand into a down/gauss/splat
//! node chain instead; the half-size path is a single kernel.

use crate::connector::{Connector, ROLE_READ, ROLE_WRITE};
use crate::error::Result;
use crate::graph::Graph;
use crate::module::Module;
use crate::node::Node;
use crate::registry::{ModuleClass, ModuleOps};
use crate::token::Token;

const NAME: Token = Token::new("demosaic");
const HALFSIZE: Token = Token::new("halfsize");

fn block_size(filters: u32) -> u32 {
    if filters == 9 {
        3
    } else {
        2
    }
}

pub fn class() -> ModuleClass {
    ModuleClass::new(NAME)
        .connector(Connector::new(
            Token::new("input"),
            ROLE_READ,
            Token::new("rggb"),
            Token::new("ui16"),
        ))
        .connector(Connector::new(
            Token::new("output"),
            ROLE_WRITE,
            Token::new("rgb"),
            Token::new("f16"),
        ))
        .ops(ModuleOps {
            init: Some(init),
            modify_roi_out: Some(modify_roi_out),
            modify_roi_in: Some(modify_roi_in),
            create_nodes: Some(create_nodes),
            commit_params: Some(commit_params),
            ..Default::default()
        })
}

fn init(m: &mut Module) -> Result<()> {
    m.committed = vec![0u8; 4];
    Ok(())
}

fn modify_roi_out(g: &mut Graph, mi: usize) {
    let block = block_size(g.modules[mi].img_param.filters);
    let ri = g.modules[mi].connectors[0].roi;
    let ro = &mut g.modules[mi].connectors[1].roi;
    // rounding down to whole blocks is the right thing here
    ro.full_wd = ri.full_wd / block;
    ro.full_ht = ri.full_ht / block;
}

fn modify_roi_in(g: &mut Graph, mi: usize) {
    let block = block_size(g.modules[mi].img_param.filters);
    let ro = g.modules[mi].connectors[1].roi;
    let ri = &mut g.modules[mi].connectors[0].roi;
    ri.wd = block * ro.wd;
    ri.ht = block * ro.ht;
    ri.x = block * ro.x;
    ri.y = block * ro.y;
    ri.scale = 1.0;
}

fn create_nodes(g: &mut Graph, mi: usize) -> Result<()> {
    let (roi_in, roi_out) = {
        let m = &g.modules[mi];
        (m.connectors[0].roi, m.connectors[1].roi)
    };
    let mut node = Node::new(NAME, HALFSIZE, mi);
    node.wd = roi_out.wd;
    node.ht = roi_out.ht;
    node.dp = 1;
    let mut ci = Connector::new(
        Token::new("input"),
        ROLE_READ,
        Token::new("rggb"),
        Token::new("ui16"),
    );
    ci.roi = roi_in;
    let mut co = Connector::new(
        Token::new("output"),
        ROLE_WRITE,
        Token::new("rgb"),
        Token::new("f16"),
    );
    co.roi = roi_out;
    node.connectors.push(ci);
    node.connectors.push(co);
    let nid = g.add_node(node)?;
    g.connector_copy(mi, 0, nid, 0);
    g.connector_copy(mi, 1, nid, 1);
    Ok(())
}

/// The kernel needs the CFA pattern to know where the colours sit.
fn commit_params(g: &mut Graph, mi: usize) {
    let filters = g.modules[mi].img_param.filters;
    g.modules[mi].committed[0..4].copy_from_slice(&filters.to_ne_bytes());
}
