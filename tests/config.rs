//! Config reader round trips.

use std::io::Write;
use std::sync::Arc;

use rawpipe::graph::config::read_config;
use rawpipe::{Error, Graph, Registry, Token};

fn tok(s: &str) -> Token {
    Token::new(s)
}

fn graph() -> Graph {
    Graph::new(Arc::new(Registry::with_builtins("modules")))
}

fn write_cfg(content: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(content.as_bytes()).unwrap();
    f.flush().unwrap();
    f
}

#[test]
fn minimum_pipeline_config() {
    let cfg = write_cfg(
        "module source main\n\
         module sink main\n\
         connect source main output sink main input\n\
         param source main wd 16\n\
         param source main ht 16\n\
         param sink main filename /tmp/rawpipe out.dat\n",
    );
    let mut g = graph();
    read_config(&mut g, cfg.path()).unwrap();

    let src = g.get_module(tok("source"), tok("main")).unwrap();
    let snk = g.get_module(tok("sink"), tok("main")).unwrap();
    assert_eq!(g.param_f32(src, tok("wd"), 0), Some(16.0));
    assert_eq!(g.param_f32(src, tok("ht"), 0), Some(16.0));
    // string params keep everything after the name, spaces included
    assert_eq!(g.param_str(snk, tok("filename")), Some("/tmp/rawpipe out.dat"));
    assert_eq!(g.modules[snk].connectors[0].connected_mi, src as i32);
}

#[test]
fn unknown_command_reports_line() {
    let cfg = write_cfg(
        "module source main\n\
         frobnicate a b\n",
    );
    let mut g = graph();
    match read_config(&mut g, cfg.path()) {
        Err(Error::Config { line, .. }) => assert_eq!(line, 2),
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn overlong_identifier_fails() {
    let cfg = write_cfg("module ninecharss main\n");
    let mut g = graph();
    assert!(matches!(
        read_config(&mut g, cfg.path()),
        Err(Error::Config { line: 1, .. })
    ));
}

#[test]
fn bad_float_value_fails() {
    let cfg = write_cfg(
        "module source main\n\
         param source main wd sixteen\n",
    );
    let mut g = graph();
    assert!(matches!(
        read_config(&mut g, cfg.path()),
        Err(Error::Config { line: 2, .. })
    ));
}

#[test]
fn connect_between_missing_modules_fails() {
    let cfg = write_cfg("connect source main output sink main input\n");
    let mut g = graph();
    assert!(matches!(
        read_config(&mut g, cfg.path()),
        Err(Error::Config { line: 1, .. })
    ));
}

#[test]
fn blank_lines_are_fine() {
    let cfg = write_cfg("\nmodule source main\n\n\nmodule sink main\n");
    let mut g = graph();
    read_config(&mut g, cfg.path()).unwrap();
    assert_eq!(g.modules.len(), 2);
}
