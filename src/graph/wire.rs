//! Connection protocol, shared by modules and nodes.
//!
//! `connect` links a write/source connector into a read/sink connector by
//! storing `(peer, peer connector)` on the destination. Reference counts
//! on the source side are not touched here; the counting pass owns them.
//! Passing negative source indices severs an existing link, which is how
//! cycle detection prunes back-edges.

use crate::connector::{Connector, ANY};
use crate::error::WireError;
use crate::module::Module;
use crate::node::Node;

pub(crate) trait Wired {
    fn connectors(&self) -> &[Connector];
    fn connectors_mut(&mut self) -> &mut [Connector];
}

impl Wired for Module {
    fn connectors(&self) -> &[Connector] {
        &self.connectors
    }
    fn connectors_mut(&mut self) -> &mut [Connector] {
        &mut self.connectors
    }
}

impl Wired for Node {
    fn connectors(&self) -> &[Connector] {
        &self.connectors
    }
    fn connectors_mut(&mut self) -> &mut [Connector] {
        &mut self.connectors
    }
}

pub(crate) fn connect<T: Wired>(
    items: &mut [T],
    m0: i32,
    c0: i32,
    m1: i32,
    c1: i32,
) -> Result<(), WireError> {
    // destination must exist and read, for linking and severing alike
    if m1 < 0 || m1 as usize >= items.len() {
        return Err(WireError::NoSuchDestNode);
    }
    let mi1 = m1 as usize;
    if c1 < 0 || c1 as usize >= items[mi1].connectors().len() {
        return Err(WireError::NoSuchDestConnector);
    }
    let ci1 = c1 as usize;
    if !items[mi1].connectors()[ci1].is_input() {
        return Err(WireError::DestDoesNotRead);
    }

    if m0 < 0 || c0 < 0 {
        // sever
        let dst = &mut items[mi1].connectors_mut()[ci1];
        dst.connected_mi = -1;
        dst.connected_mc = -1;
        return Ok(());
    }

    if m0 == m1 {
        return Err(WireError::DestInconsistent);
    }
    if m0 as usize >= items.len() {
        return Err(WireError::NoSuchSrcNode);
    }
    let mi0 = m0 as usize;
    if c0 as usize >= items[mi0].connectors().len() {
        return Err(WireError::NoSuchSrcConnector);
    }
    let ci0 = c0 as usize;

    let (src_role, src_chan, src_format) = {
        let src = &items[mi0].connectors()[ci0];
        (src.is_output(), src.chan, src.format)
    };
    if !src_role {
        return Err(WireError::SrcDoesNotWrite);
    }

    {
        let dst = &items[mi1].connectors()[ci1];
        if dst.chan != ANY && dst.chan != src_chan {
            return Err(WireError::ChannelsDoNotMatch);
        }
        if dst.format != ANY && dst.format != src_format {
            return Err(WireError::FormatDoesNotMatch);
        }
    }

    let dst = &mut items[mi1].connectors_mut()[ci1];
    // a wildcard input adopts whatever the upstream produces
    if dst.chan == ANY {
        dst.chan = src_chan;
    }
    if dst.format == ANY {
        dst.format = src_format;
    }
    dst.connected_mi = m0;
    dst.connected_mc = c0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ROLE_READ, ROLE_WRITE};
    use crate::node::Node;
    use crate::token::Token;

    fn node_with(conn: Connector) -> Node {
        let mut n = Node::new(Token::new("t"), Token::new("main"), 0);
        n.connectors.push(conn);
        n
    }

    fn rw_pair(chan0: &str, fmt0: &str, chan1: &str, fmt1: &str) -> Vec<Node> {
        vec![
            node_with(Connector::new(
                Token::new("output"),
                ROLE_WRITE,
                Token::new(chan0),
                Token::new(fmt0),
            )),
            node_with(Connector::new(
                Token::new("input"),
                ROLE_READ,
                Token::new(chan1),
                Token::new(fmt1),
            )),
        ]
    }

    #[test]
    fn link_and_sever() {
        let mut nodes = rw_pair("rgb", "f16", "rgb", "f16");
        connect(&mut nodes, 0, 0, 1, 0).unwrap();
        assert_eq!(nodes[1].connectors[0].connected_mi, 0);
        assert_eq!(nodes[1].connectors[0].connected_mc, 0);
        connect(&mut nodes, -1, -1, 1, 0).unwrap();
        assert_eq!(nodes[1].connectors[0].connected_mi, -1);
    }

    #[test]
    fn channel_mismatch_leaves_links_untouched() {
        let mut nodes = rw_pair("rgb", "f16", "y", "f16");
        let err = connect(&mut nodes, 0, 0, 1, 0).unwrap_err();
        assert_eq!(err, WireError::ChannelsDoNotMatch);
        assert_eq!(err.code(), 10);
        assert_eq!(nodes[1].connectors[0].connected_mi, -1);
        assert_eq!(nodes[0].connectors[0].connected_mi, -1);
    }

    #[test]
    fn format_mismatch() {
        let mut nodes = rw_pair("rgb", "f16", "rgb", "f32");
        assert_eq!(
            connect(&mut nodes, 0, 0, 1, 0).unwrap_err().code(),
            11
        );
    }

    #[test]
    fn role_checks() {
        let mut nodes = rw_pair("rgb", "f16", "rgb", "f16");
        // write side as destination
        assert_eq!(connect(&mut nodes, 1, 0, 0, 0).unwrap_err().code(), 3);
        // read side as source
        let mut three = rw_pair("rgb", "f16", "rgb", "f16");
        three.push(node_with(Connector::new(
            Token::new("input"),
            ROLE_READ,
            Token::new("rgb"),
            Token::new("f16"),
        )));
        assert_eq!(connect(&mut three, 1, 0, 2, 0).unwrap_err().code(), 9);
        // out of range
        assert_eq!(connect(&mut nodes, 0, 0, 7, 0).unwrap_err().code(), 1);
        assert_eq!(connect(&mut nodes, 0, 5, 1, 0).unwrap_err().code(), 8);
        assert_eq!(connect(&mut nodes, 0, 0, 1, 5).unwrap_err().code(), 2);
        // self link
        assert_eq!(connect(&mut nodes, 1, 0, 1, 0).unwrap_err().code(), 4);
    }

    #[test]
    fn wildcard_adopts_upstream_layout() {
        let mut nodes = rw_pair("rgb", "f16", "*", "*");
        connect(&mut nodes, 0, 0, 1, 0).unwrap();
        assert_eq!(nodes[1].connectors[0].chan, Token::new("rgb"));
        assert_eq!(nodes[1].connectors[0].format, Token::new("f16"));
    }
}
