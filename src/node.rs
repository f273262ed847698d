//! Node instances: one GPU compute kernel each.

use ash::vk;
use smallvec::SmallVec;

use crate::connector::{Connector, MAX_NODE_CONNECTORS};
use crate::token::Token;

/// A leaf kernel in the fine-grained DAG. `name` is the owning module's
/// name; together with `kernel` it locates the SPIR-V binary at
/// `<module_dir>/<name>/<kernel>.spv`.
pub struct Node {
    pub name: Token,
    pub kernel: Token,
    /// Owning module index.
    pub module: usize,
    pub connectors: SmallVec<[Connector; MAX_NODE_CONNECTORS]>,

    /// Dispatch extents; work group counts are `ceil(wd/32) x ceil(ht/32) x dp`.
    pub wd: u32,
    pub ht: u32,
    pub dp: u32,

    pub push_constant: Vec<u8>,

    // created by the allocation passes; sinks and sources never get a
    // pipeline, but they do get a descriptor set
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub dset: vk::DescriptorSet,
    pub dset_layout: vk::DescriptorSetLayout,
}

impl Node {
    pub fn new(name: Token, kernel: Token, module: usize) -> Node {
        Node {
            name,
            kernel,
            module,
            connectors: SmallVec::new(),
            wd: 0,
            ht: 0,
            dp: 1,
            push_constant: Vec::new(),
            pipeline: vk::Pipeline::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            dset: vk::DescriptorSet::null(),
            dset_layout: vk::DescriptorSetLayout::null(),
        }
    }

    /// Pure sinks and sources run no pipeline; connector 0 decides.
    pub fn is_sink(&self) -> bool {
        self.connectors.first().map_or(false, |c| c.is_sink())
    }

    pub fn is_source(&self) -> bool {
        self.connectors.first().map_or(false, |c| c.is_source())
    }

    pub fn connector_index(&self, name: Token) -> Option<usize> {
        self.connectors.iter().position(|c| c.name == name)
    }
}
