//! File sink.
//!
//! Accepts whatever layout its upstream produces (wildcard connector) and
//! dumps the downloaded staging bytes to a file. Without a filename the
//! pixels stay on the GPU, which is what a display path would want.

use std::fs;

use log::error;

use crate::connector::{Connector, ANY, ROLE_SINK};
use crate::module::Module;
use crate::params::{self, ParamDesc, PARAM_STRING};
use crate::registry::{ModuleClass, ModuleOps};
use crate::token::Token;

const NAME: Token = Token::new("sink");
const FILENAME: Token = Token::new("filename");

fn descs() -> [ParamDesc; 1] {
    let mut d = [ParamDesc { name: FILENAME, kind: PARAM_STRING, cnt: 256, offset: 0 }];
    params::layout(&mut d);
    d
}

pub fn class() -> ModuleClass {
    ModuleClass::new(NAME)
        .connector(Connector::new(Token::new("input"), ROLE_SINK, ANY, ANY))
        .params(descs().to_vec())
        .ops(ModuleOps {
            write_sink: Some(write_sink),
            ..Default::default()
        })
}

fn write_sink(m: &Module, params: &[u8], mapped: &[u8]) {
    let d = descs();
    let path = params::read_str(params, &d[0]);
    if path.is_empty() {
        return;
    }
    if let Err(e) = fs::write(path, mapped) {
        error!(
            target: "pipe",
            "sink {}_{}: failed to write '{}': {}",
            m.name, m.inst, path, e
        );
    }
}
