//! Module class catalog.
//!
//! A module class is everything about an operator that is not bound to an
//! instance: its connector templates, its parameter declarations and a
//! capability record of optional callbacks. Default behaviour for absent
//! callbacks lives in the graph passes, not here.
//!
//! The registry is an explicit handle rather than process-global state so
//! tests can hold several with different class sets; a graph keeps an
//! `Arc` to the one it was built against.

use std::path::{Path, PathBuf};

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::connector::{Connector, MAX_MODULE_CONNECTORS};
use crate::error::Result;
use crate::graph::Graph;
use crate::module::Module;
use crate::params::{self, ParamDesc};
use crate::token::Token;

pub type InitFn = fn(&mut Module) -> Result<()>;
pub type CleanupFn = fn(&mut Module);
/// ROI hooks get the graph plus the module's index; links are index-based,
/// so that is enough to reach peers.
pub type ModifyRoiFn = fn(&mut Graph, usize);
pub type CreateNodesFn = fn(&mut Graph, usize) -> Result<()>;
pub type CommitParamsFn = fn(&mut Graph, usize);
/// Source upload: module, its parameter blob, the mapped staging window.
pub type ReadSourceFn = fn(&Module, &[u8], &mut [u8]);
/// Sink download: module, its parameter blob, the mapped staging window.
pub type WriteSinkFn = fn(&Module, &[u8], &[u8]);

/// Capability record. Absent entries fall back to the defaults described
/// in the graph passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleOps {
    pub init: Option<InitFn>,
    pub cleanup: Option<CleanupFn>,
    pub modify_roi_out: Option<ModifyRoiFn>,
    pub modify_roi_in: Option<ModifyRoiFn>,
    pub create_nodes: Option<CreateNodesFn>,
    pub commit_params: Option<CommitParamsFn>,
    pub read_source: Option<ReadSourceFn>,
    pub write_sink: Option<WriteSinkFn>,
}

pub struct ModuleClass {
    pub name: Token,
    pub connectors: SmallVec<[Connector; MAX_MODULE_CONNECTORS]>,
    pub params: Vec<ParamDesc>,
    pub param_size: u32,
    pub ops: ModuleOps,
}

impl ModuleClass {
    pub fn new(name: Token) -> ModuleClass {
        ModuleClass {
            name,
            connectors: SmallVec::new(),
            params: Vec::new(),
            param_size: 0,
            ops: ModuleOps::default(),
        }
    }

    pub fn connector(mut self, c: Connector) -> Self {
        assert!(self.connectors.len() < MAX_MODULE_CONNECTORS);
        self.connectors.push(c);
        self
    }

    /// Declares parameters; offsets are laid out here.
    pub fn params(mut self, mut params: Vec<ParamDesc>) -> Self {
        self.param_size = params::layout(&mut params);
        self.params = params;
        self
    }

    pub fn ops(mut self, ops: ModuleOps) -> Self {
        self.ops = ops;
        self
    }

    pub fn param(&self, name: Token) -> Option<&ParamDesc> {
        self.params.iter().find(|p| p.name == name)
    }
}

pub struct Registry {
    classes: Vec<ModuleClass>,
    by_name: FxHashMap<Token, usize>,
    /// Root of the on-disk module tree: SPIR-V is loaded from
    /// `<module_dir>/<module>/<kernel>.spv`.
    module_dir: PathBuf,
}

impl Registry {
    pub fn new(module_dir: impl Into<PathBuf>) -> Registry {
        Registry {
            classes: Vec::new(),
            by_name: FxHashMap::default(),
            module_dir: module_dir.into(),
        }
    }

    /// Registry preloaded with the builtin operator classes.
    pub fn with_builtins(module_dir: impl Into<PathBuf>) -> Registry {
        let mut reg = Registry::new(module_dir);
        crate::modules::register_all(&mut reg);
        reg
    }

    pub fn add(&mut self, class: ModuleClass) -> usize {
        let idx = self.classes.len();
        self.by_name.insert(class.name, idx);
        self.classes.push(class);
        idx
    }

    pub fn get(&self, name: Token) -> Option<usize> {
        self.by_name.get(&name).copied()
    }

    pub fn class(&self, idx: usize) -> &ModuleClass {
        &self.classes[idx]
    }

    pub fn module_dir(&self) -> &Path {
        &self.module_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ROLE_READ, ROLE_WRITE};
    use crate::params::PARAM_FLOAT;

    #[test]
    fn lookup_by_token() {
        let mut reg = Registry::new("modules");
        let class = ModuleClass::new(Token::new("blur"))
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
            .params(vec![ParamDesc {
                name: Token::new("radius"),
                kind: PARAM_FLOAT,
                cnt: 1,
                offset: 0,
            }]);
        let idx = reg.add(class);
        assert_eq!(reg.get(Token::new("blur")), Some(idx));
        assert_eq!(reg.get(Token::new("sharpen")), None);
        assert_eq!(reg.class(idx).param_size, 4);
        assert!(reg.class(idx).param(Token::new("radius")).is_some());
    }
}
