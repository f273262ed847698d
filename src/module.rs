//! Module instances.

use smallvec::SmallVec;

use crate::connector::{Connector, MAX_MODULE_CONNECTORS};
use crate::token::Token;

/// Image-wide metadata travelling with the pixels: set by the source,
/// inherited downstream through each module's `input` connector during the
/// forward ROI pass, consumed by whoever commits it into uniforms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageParams {
    pub black: [f32; 4],
    pub white: [f32; 4],
    pub whitebalance: [f32; 4],
    /// CFA pattern code; 9 selects X-Trans, anything else Bayer.
    pub filters: u32,
}

impl Default for ImageParams {
    fn default() -> ImageParams {
        ImageParams {
            black: [0.0; 4],
            white: [65535.0; 4],
            whitebalance: [1.0; 4],
            filters: 0,
        }
    }
}

/// One instance of a module class in a graph.
pub struct Module {
    pub name: Token,
    pub inst: Token,
    /// Class index in the registry this graph was built against.
    pub class: usize,
    pub connectors: SmallVec<[Connector; MAX_MODULE_CONNECTORS]>,

    /// Byte range of this instance's parameter blob in the graph pool.
    pub param_offset: u32,
    pub param_size: u32,
    /// Flattened parameters as uploaded to the uniform buffer; sized by
    /// the class `init`, filled by `commit_params`.
    pub committed: Vec<u8>,
    /// fxhash of the parameter blob at the last recording; drives the
    /// dirty-prefix skip.
    pub last_param_hash: Option<u64>,

    pub img_param: ImageParams,
}

impl Module {
    /// First connector with the given name, the way lookups work for the
    /// distinguished `input`/`output` ports.
    pub fn connector_index(&self, name: Token) -> Option<usize> {
        self.connectors.iter().position(|c| c.name == name)
    }
}
