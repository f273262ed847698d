//! Exposure correction.
//!
//! Commits per-channel black levels and gains; the gain folds the user
//! exposure (in stops) together with white balance and the sensor's
//! black/white range, so the kernel is a single fused multiply-add.

use crate::connector::{Connector, ROLE_READ, ROLE_WRITE};
use crate::error::Result;
use crate::graph::Graph;
use crate::module::Module;
use crate::params::{self, ParamDesc, PARAM_FLOAT};
use crate::registry::{ModuleClass, ModuleOps};
use crate::token::Token;

const NAME: Token = Token::new("exposure");
const EXPOSURE: Token = Token::new("exposure");

fn descs() -> [ParamDesc; 1] {
    let mut d = [ParamDesc { name: EXPOSURE, kind: PARAM_FLOAT, cnt: 1, offset: 0 }];
    params::layout(&mut d);
    d
}

pub fn class() -> ModuleClass {
    ModuleClass::new(NAME)
        .connector(Connector::new(
            Token::new("input"),
            ROLE_READ,
            Token::new("rgb"),
            Token::new("f16"),
        ))
        .connector(Connector::new(
            Token::new("output"),
            ROLE_WRITE,
            Token::new("rgb"),
            Token::new("f16"),
        ))
        .params(descs().to_vec())
        .ops(ModuleOps {
            init: Some(init),
            commit_params: Some(commit_params),
            ..Default::default()
        })
}

fn init(m: &mut Module) -> Result<()> {
    m.committed = vec![0u8; 8 * 4];
    Ok(())
}

fn commit_params(g: &mut Graph, mi: usize) {
    let d = descs();
    let ev = params::read_f32(g.module_params(mi), &d[0], 0);
    let ip = g.modules[mi].img_param;

    let mut f = [0f32; 8];
    for k in 0..4 {
        f[k] = ip.black[k];
        f[4 + k] = 2f32.powf(ev) * ip.whitebalance[k] / (ip.white[k] - ip.black[k]);
    }
    let committed = &mut g.modules[mi].committed;
    for (k, v) in f.iter().enumerate() {
        committed[4 * k..4 * k + 4].copy_from_slice(&v.to_ne_bytes());
    }
}
