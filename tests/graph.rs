//! Graph construction, ROI negotiation and expansion, exercised through
//! the public API. None of this touches a GPU: the device-dependent
//! phases are covered by running the CLI on real hardware.

use std::sync::Arc;

use rawpipe::connector::{Connector, ROLE_READ, ROLE_WRITE};
use rawpipe::graph::dump;
use rawpipe::registry::ModuleClass;
use rawpipe::{Error, Graph, Registry, Token};

fn tok(s: &str) -> Token {
    Token::new(s)
}

fn builtin_graph() -> Graph {
    Graph::new(Arc::new(Registry::with_builtins("modules")))
}

fn source_sink_graph(wd: f32, ht: f32) -> Graph {
    let mut g = builtin_graph();
    let src = g.add_module(tok("source"), tok("main")).unwrap();
    let snk = g.add_module(tok("sink"), tok("main")).unwrap();
    g.set_param_f32(src, tok("wd"), &[wd]).unwrap();
    g.set_param_f32(src, tok("ht"), &[ht]).unwrap();
    g.connect(src as i32, 0, snk as i32, 0).unwrap();
    g
}

#[test]
fn minimum_pipeline_expands_to_two_nodes() {
    let mut g = source_sink_graph(16.0, 16.0);
    g.negotiate_roi_out().unwrap();
    g.expand_nodes().unwrap();

    assert_eq!(g.nodes.len(), 2);
    let source = &g.nodes[0];
    let sink = &g.nodes[1];
    assert!(source.is_source());
    assert!(sink.is_sink());

    // the wildcard sink adopted the source's layout at connect time
    let sc = &sink.connectors[0];
    assert_eq!(sc.chan, tok("rggb"));
    assert_eq!(sc.format, tok("ui16"));
    assert_eq!(sc.roi.wd, 16);
    assert_eq!(sc.roi.ht, 16);
    // 16x16, one packed bayer channel, two bytes
    assert_eq!(sc.bufsize(), 16 * 16 * 2);

    // node-level wiring: sink reads the source node's output
    assert_eq!(sc.connected_mi, 0);
    assert_eq!(sc.connected_mc, 0);

    // one reader plus the owner's balancing release
    g.count_node_references();
    assert_eq!(g.nodes[0].connectors[0].connected_mi, 2);
}

#[test]
fn read_connectors_have_matching_upstreams() {
    let mut g = builtin_graph();
    let src = g.add_module(tok("source"), tok("main")).unwrap();
    let dem = g.add_module(tok("demosaic"), tok("main")).unwrap();
    let snk = g.add_module(tok("sink"), tok("main")).unwrap();
    g.set_param_f32(src, tok("wd"), &[100.0]).unwrap();
    g.set_param_f32(src, tok("ht"), &[100.0]).unwrap();
    g.connect(src as i32, 0, dem as i32, 0).unwrap();
    g.connect(dem as i32, 1, snk as i32, 0).unwrap();
    g.negotiate_roi_out().unwrap();
    g.expand_nodes().unwrap();

    for node in &g.nodes {
        for c in node.connectors.iter().filter(|c| c.is_input()) {
            assert!(c.connected_mi >= 0, "unconnected read on {}", node.name);
            let up = &g.nodes[c.connected_mi as usize].connectors[c.connected_mc as usize];
            assert!(up.is_output());
            assert_eq!(up.chan, c.chan);
            assert_eq!(up.format, c.format);
        }
    }
}

#[test]
fn halfsize_demosaic_expansion() {
    let mut g = builtin_graph();
    let src = g.add_module(tok("source"), tok("main")).unwrap();
    let dem = g.add_module(tok("demosaic"), tok("main")).unwrap();
    let snk = g.add_module(tok("sink"), tok("main")).unwrap();
    g.set_param_f32(src, tok("wd"), &[100.0]).unwrap();
    g.set_param_f32(src, tok("ht"), &[100.0]).unwrap();
    g.set_param_f32(src, tok("filters"), &[0.0]).unwrap(); // bayer
    g.connect(src as i32, 0, dem as i32, 0).unwrap();
    g.connect(dem as i32, 1, snk as i32, 0).unwrap();

    g.negotiate_roi_out().unwrap();
    g.expand_nodes().unwrap();

    assert_eq!(g.nodes.len(), 3);
    let half = g
        .nodes
        .iter()
        .find(|n| n.kernel == tok("halfsize"))
        .expect("demosaic expands to a halfsize node");
    assert_eq!(half.name, tok("demosaic"));
    assert_eq!((half.wd, half.ht, half.dp), (50, 50, 1));
    // work groups of 32x32
    assert_eq!(((half.wd + 31) / 32, (half.ht + 31) / 32), (2, 2));

    let out = &half.connectors[1];
    assert_eq!(out.chan, tok("rgb"));
    assert_eq!(out.format, tok("f16"));
    assert_eq!((out.roi.wd, out.roi.ht), (50, 50));
    // the bayer input still covers the full 100x100 frame
    let inp = &half.connectors[0];
    assert_eq!((inp.roi.wd, inp.roi.ht), (100, 100));
}

#[test]
fn roi_negotiation_is_idempotent() {
    let mut g = builtin_graph();
    let src = g.add_module(tok("source"), tok("main")).unwrap();
    let dem = g.add_module(tok("demosaic"), tok("main")).unwrap();
    let exp = g.add_module(tok("exposure"), tok("main")).unwrap();
    let snk = g.add_module(tok("sink"), tok("main")).unwrap();
    g.set_param_f32(src, tok("wd"), &[100.0]).unwrap();
    g.set_param_f32(src, tok("ht"), &[100.0]).unwrap();
    g.connect(src as i32, 0, dem as i32, 0).unwrap();
    g.connect(dem as i32, 1, exp as i32, 0).unwrap();
    g.connect(exp as i32, 1, snk as i32, 0).unwrap();

    let snapshot = |g: &Graph| -> Vec<_> {
        g.modules
            .iter()
            .flat_map(|m| m.connectors.iter().map(|c| c.roi))
            .collect()
    };

    g.negotiate_roi_out().unwrap();
    g.expand_nodes().unwrap();
    let first = snapshot(&g);
    g.negotiate_roi_out().unwrap();
    g.expand_nodes().unwrap();
    let second = snapshot(&g);
    assert_eq!(first, second);
    assert_eq!(g.nodes.len(), 4);
}

#[test]
fn channel_mismatch_is_error_10_and_leaves_links_alone() {
    let mut reg = Registry::with_builtins("modules");
    reg.add(
        ModuleClass::new(tok("gray"))
            .connector(Connector::new(tok("input"), ROLE_READ, tok("y"), tok("f16")))
            .connector(Connector::new(tok("output"), ROLE_WRITE, tok("y"), tok("f16"))),
    );
    let mut g = Graph::new(Arc::new(reg));
    let exp = g.add_module(tok("exposure"), tok("main")).unwrap();
    let gray = g.add_module(tok("gray"), tok("main")).unwrap();

    let err = g.connect(exp as i32, 1, gray as i32, 0).unwrap_err();
    match err {
        Error::Wire(w) => {
            assert_eq!(w.code(), 10);
            assert_eq!(w.to_string(), "channels do not match");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(g.modules[gray].connectors[0].connected_mi, -1);
    assert_eq!(g.modules[exp].connectors[1].connected_mi, -1);
}

#[test]
fn fan_out_reference_counts() {
    let mut reg = Registry::with_builtins("modules");
    reg.add(
        ModuleClass::new(tok("flat"))
            .connector(Connector::new(tok("output"), ROLE_WRITE, tok("rgb"), tok("f16"))),
    );
    reg.add(
        ModuleClass::new(tok("merge3"))
            .connector(Connector::new(tok("a"), ROLE_READ, tok("rgb"), tok("f16")))
            .connector(Connector::new(tok("b"), ROLE_READ, tok("rgb"), tok("f16")))
            .connector(Connector::new(tok("c"), ROLE_READ, tok("rgb"), tok("f16")))
            .connector(Connector::new(tok("output"), ROLE_WRITE, tok("rgb"), tok("f16"))),
    );
    let mut g = Graph::new(Arc::new(reg));
    let flat = g.add_module(tok("flat"), tok("main")).unwrap();
    let merge = g.add_module(tok("merge3"), tok("main")).unwrap();
    let snk = g.add_module(tok("sink"), tok("main")).unwrap();
    for ci in 0..3 {
        g.connect(flat as i32, 0, merge as i32, ci).unwrap();
    }
    g.connect(merge as i32, 3, snk as i32, 0).unwrap();

    g.negotiate_roi_out().unwrap();
    g.expand_nodes().unwrap();
    g.count_node_references();

    let flat_node = g
        .nodes
        .iter()
        .position(|n| n.name == tok("flat"))
        .unwrap();
    // three scheduled readers plus the producer's own balancing release
    assert_eq!(g.nodes[flat_node].connectors[0].connected_mi, 4);
    // merge's output feeds the sink only
    let merge_node = g
        .nodes
        .iter()
        .position(|n| n.name == tok("merge3"))
        .unwrap();
    assert_eq!(g.nodes[merge_node].connectors[3].connected_mi, 2);
}

#[test]
fn module_cycle_is_severed_once() {
    let mut g = builtin_graph();
    let a = g.add_module(tok("exposure"), tok("a")).unwrap();
    let b = g.add_module(tok("exposure"), tok("b")).unwrap();
    let snk = g.add_module(tok("sink"), tok("main")).unwrap();
    g.connect(b as i32, 1, a as i32, 0).unwrap(); // a reads b
    g.connect(a as i32, 1, b as i32, 0).unwrap(); // b reads a: cycle
    g.connect(b as i32, 1, snk as i32, 0).unwrap();

    g.negotiate_roi_out().unwrap();
    g.expand_nodes().unwrap();

    assert_eq!(g.cycles_severed(), 1);
    // both kernels still expanded exactly once
    assert_eq!(g.nodes.len(), 3);
    // the back edge is gone from the node DAG: one of the two exposure
    // nodes lost its upstream
    let dangling = g
        .nodes
        .iter()
        .filter(|n| n.name == tok("exposure"))
        .filter(|n| n.connectors[0].connected_mi < 0)
        .count();
    assert_eq!(dangling, 1);
}

#[test]
fn capacity_limits_are_enforced() {
    let mut g = builtin_graph();
    let mut last = Ok(0);
    for i in 0..200 {
        last = g.add_module(tok("exposure"), Token(i as u64 + 1));
        if last.is_err() {
            break;
        }
    }
    match last {
        Err(Error::Capacity(_)) => {}
        other => panic!("expected capacity error, got {other:?}"),
    }
}

#[test]
fn dot_dump_lists_nodes_and_edges() {
    let mut g = source_sink_graph(16.0, 16.0);
    g.negotiate_roi_out().unwrap();
    g.expand_nodes().unwrap();

    let mut out = Vec::new();
    dump::dump_nodes_dot(&g, &mut out).unwrap();
    let dot = String::from_utf8(out).unwrap();
    assert!(dot.starts_with("digraph nodes {"));
    assert!(dot.contains("source_main"));
    assert!(dot.contains("n0 -> n1"));

    let mut out = Vec::new();
    dump::dump_modules_dot(&g, &mut out).unwrap();
    let dot = String::from_utf8(out).unwrap();
    assert!(dot.contains("m0 -> m1"));
}
