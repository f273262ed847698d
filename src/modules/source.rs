//! Raw frame source.
//!
//! Feeds a Bayer ui16 frame from a flat binary file into the graph. The
//! frame geometry and CFA pattern come from parameters; a real camera
//! loader would fill them from the raw metadata instead.

use std::fs;

use log::error;

use crate::connector::{Connector, ROLE_SOURCE};
use crate::graph::Graph;
use crate::module::{ImageParams, Module};
use crate::params::{self, ParamDesc, PARAM_FLOAT, PARAM_STRING};
use crate::registry::{ModuleClass, ModuleOps};
use crate::token::Token;

const NAME: Token = Token::new("source");
const FILENAME: Token = Token::new("filename");
const WD: Token = Token::new("wd");
const HT: Token = Token::new("ht");
const FILTERS: Token = Token::new("filters");

fn descs() -> [ParamDesc; 4] {
    let mut d = [
        ParamDesc { name: FILENAME, kind: PARAM_STRING, cnt: 256, offset: 0 },
        ParamDesc { name: WD, kind: PARAM_FLOAT, cnt: 1, offset: 0 },
        ParamDesc { name: HT, kind: PARAM_FLOAT, cnt: 1, offset: 0 },
        ParamDesc { name: FILTERS, kind: PARAM_FLOAT, cnt: 1, offset: 0 },
    ];
    params::layout(&mut d);
    d
}

pub fn class() -> ModuleClass {
    ModuleClass::new(NAME)
        .connector(Connector::new(
            Token::new("output"),
            ROLE_SOURCE,
            Token::new("rggb"),
            Token::new("ui16"),
        ))
        .params(descs().to_vec())
        .ops(ModuleOps {
            modify_roi_out: Some(modify_roi_out),
            read_source: Some(read_source),
            ..Default::default()
        })
}

/// The source decides the full frame; there is no input to inherit from.
fn modify_roi_out(g: &mut Graph, mi: usize) {
    let d = descs();
    let blob = g.module_params(mi);
    let wd = params::read_f32(blob, &d[1], 0) as u32;
    let ht = params::read_f32(blob, &d[2], 0) as u32;
    let filters = params::read_f32(blob, &d[3], 0) as u32;

    let m = &mut g.modules[mi];
    m.img_param = ImageParams { filters, ..Default::default() };
    let roi = &mut m.connectors[0].roi;
    roi.full_wd = wd;
    roi.full_ht = ht;
    roi.scale = 1.0;
}

fn read_source(m: &Module, params: &[u8], mapped: &mut [u8]) {
    let d = descs();
    let path = params::read_str(params, &d[0]);
    match fs::read(path) {
        Ok(bytes) => {
            let n = bytes.len().min(mapped.len());
            mapped[..n].copy_from_slice(&bytes[..n]);
            mapped[n..].fill(0);
        }
        Err(e) => {
            error!(
                target: "pipe",
                "source {}_{}: failed to read '{}': {}",
                m.name, m.inst, path, e
            );
            mapped.fill(0);
        }
    }
}
