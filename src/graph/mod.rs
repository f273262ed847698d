//! The compute graph: module instances, their node expansion, GPU
//! resources and the run driver.
//!
//! A graph owns everything a single pipeline needs to execute: bounded
//! module and node storage, two memory arenas (device images and
//! host-visible staging), a parameter pool, and per-graph Vulkan objects
//! (command buffer, descriptor pool, uniform buffer, query pool). Two
//! graphs never share any of it; only the device handle is common.
//!
//! `run` executes the phases selected by a [`GraphRun`] mask, in fixed
//! order: ROI negotiation, node expansion, allocation, descriptor setup,
//! command recording, submission, and the staging transfers around it.

use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;
use log::{debug, error, info, warn};

use crate::alloc::Arena;
use crate::connector::ROLE_SINK;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::module::Module;
use crate::node::Node;
use crate::params;
use crate::registry::{ModuleOps, Registry};
use crate::token::Token;

mod allocate;
pub mod config;
pub mod dump;
mod negotiate;
mod record;
mod traverse;
mod wire;

use traverse::{traverse, Realm};

pub const MAX_MODULES: usize = 100;
pub const MAX_NODES: usize = 300;
const PARAMS_POOL_SIZE: usize = 4096;
pub(crate) const UNIFORM_SIZE: u64 = 4096;
/// One start/stop pair per node at full capacity.
pub(crate) const QUERY_MAX: u32 = 2 * MAX_NODES as u32;
/// Fence timeout for `wait_done`, about one second.
const FENCE_TIMEOUT_NS: u64 = 1 << 30;

bitflags! {
    /// Phase selection for [`Graph::run`]. Flags combine freely but the
    /// phase order is fixed; recording requires descriptors from this or
    /// an earlier run's `ALLOC_DSET`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GraphRun: u32 {
        const ROI_OUT        = 1 << 0;
        const CREATE_NODES   = 1 << 1;
        const ALLOC_FREE     = 1 << 2;
        const ALLOC_DSET     = 1 << 3;
        const RECORD_CMD_BUF = 1 << 4;
        const UPLOAD_SOURCE  = 1 << 5;
        const WAIT_DONE      = 1 << 6;
        const DOWNLOAD_SINK  = 1 << 7;
    }
}

pub struct Graph {
    registry: Arc<Registry>,

    pub modules: Vec<Module>,
    pub nodes: Vec<Node>,

    pub(crate) heap: Arena,
    pub(crate) heap_staging: Arena,
    heap_budget: u64,

    params_pool: Vec<u8>,
    params_end: usize,

    cycles_severed: u32,

    // descriptor pool sizing, accumulated during the allocation walk
    pub(crate) dset_cnt_image_read: u32,
    pub(crate) dset_cnt_image_write: u32,
    pub(crate) dset_cnt_uniform: u32,
    dset_pool_sets: u32,

    pub(crate) memory_type_bits: u32,
    pub(crate) memory_type_bits_staging: u32,

    // per-graph vulkan objects; null until first used, destroyed in cleanup()
    command_pool: vk::CommandPool,
    pub(crate) command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    pub(crate) query_pool: vk::QueryPool,
    pub(crate) query_cnt: u32,
    query_results: Vec<u64>,
    pub(crate) query_name: Vec<Token>,
    pub(crate) dset_pool: vk::DescriptorPool,
    pub(crate) uniform_dset_layout: vk::DescriptorSetLayout,
    pub(crate) uniform_dset: vk::DescriptorSet,
    pub(crate) uniform_buffer: vk::Buffer,
    pub(crate) vkmem: vk::DeviceMemory,
    vkmem_size: u64,
    pub(crate) vkmem_staging: vk::DeviceMemory,
    vkmem_staging_size: u64,
    vkmem_uniform: vk::DeviceMemory,
    dset_ready: bool,
}

impl Graph {
    pub fn new(registry: Arc<Registry>) -> Graph {
        Graph {
            registry,
            modules: Vec::new(),
            nodes: Vec::new(),
            heap: Arena::new(),
            heap_staging: Arena::new(),
            heap_budget: u64::MAX,
            params_pool: vec![0; PARAMS_POOL_SIZE],
            params_end: 0,
            cycles_severed: 0,
            dset_cnt_image_read: 0,
            dset_cnt_image_write: 0,
            dset_cnt_uniform: 0,
            dset_pool_sets: 0,
            memory_type_bits: !0,
            memory_type_bits_staging: !0,
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            query_pool: vk::QueryPool::null(),
            query_cnt: 0,
            query_results: Vec::new(),
            query_name: Vec::new(),
            dset_pool: vk::DescriptorPool::null(),
            uniform_dset_layout: vk::DescriptorSetLayout::null(),
            uniform_dset: vk::DescriptorSet::null(),
            uniform_buffer: vk::Buffer::null(),
            vkmem: vk::DeviceMemory::null(),
            vkmem_size: 0,
            vkmem_staging: vk::DeviceMemory::null(),
            vkmem_staging_size: 0,
            vkmem_uniform: vk::DeviceMemory::null(),
            dset_ready: false,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn ops(&self, mi: usize) -> ModuleOps {
        self.registry.class(self.modules[mi].class).ops
    }

    /// Cap on the device image heap; above it the tiling hook fires.
    pub fn set_heap_budget(&mut self, bytes: u64) {
        self.heap_budget = bytes;
    }

    pub(crate) fn heap_budget(&self) -> u64 {
        self.heap_budget
    }

    /// Back-edges severed by the last expansion or allocation pass.
    pub fn cycles_severed(&self) -> u32 {
        self.cycles_severed
    }

    // ------------------------------------------------------------------
    // construction
    // ------------------------------------------------------------------

    /// Instantiates a module class. Parameters start zeroed; `init` runs
    /// before the module is visible in the graph.
    pub fn add_module(&mut self, name: Token, inst: Token) -> Result<usize> {
        if self.modules.len() >= MAX_MODULES {
            return Err(Error::Capacity("modules"));
        }
        let reg = self.registry.clone();
        let class_idx = reg.get(name).ok_or(Error::NoSuchClass(name))?;
        let class = reg.class(class_idx);

        self.params_end = (self.params_end + 3) & !3;
        let param_offset = self.params_end;
        if param_offset + class.param_size as usize > self.params_pool.len() {
            return Err(Error::Capacity("parameter pool"));
        }
        self.params_end += class.param_size as usize;

        let mut module = Module {
            name,
            inst,
            class: class_idx,
            connectors: class.connectors.clone(),
            param_offset: param_offset as u32,
            param_size: class.param_size,
            committed: Vec::new(),
            last_param_hash: None,
            img_param: Default::default(),
        };
        if let Some(init) = class.ops.init {
            init(&mut module)?;
        }
        self.modules.push(module);
        Ok(self.modules.len() - 1)
    }

    pub fn get_module(&self, name: Token, inst: Token) -> Option<usize> {
        self.modules
            .iter()
            .position(|m| m.name == name && m.inst == inst)
    }

    /// Wires module `(m0, c0)` into `(m1, c1)`; negative source indices
    /// sever the destination's link.
    pub fn connect(&mut self, m0: i32, c0: i32, m1: i32, c1: i32) -> Result<()> {
        wire::connect(&mut self.modules, m0, c0, m1, c1).map_err(Error::Wire)
    }

    /// Node-level counterpart of [`Graph::connect`], used by `create_nodes`
    /// hooks and by cycle severing.
    pub fn node_connect(&mut self, n0: i32, c0: i32, n1: i32, c1: i32) -> Result<()> {
        wire::connect(&mut self.nodes, n0, c0, n1, c1).map_err(Error::Wire)
    }

    pub fn add_node(&mut self, node: Node) -> Result<usize> {
        if self.nodes.len() >= MAX_NODES {
            return Err(Error::Capacity("nodes"));
        }
        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }

    /// Copies module connector `mc` onto node `nid` slot `nc`, records the
    /// expansion target on the module, and translates the module-level
    /// link into node indices (valid because expansion runs post-order).
    pub fn connector_copy(&mut self, mi: usize, mc: usize, nid: usize, nc: usize) {
        let mut c = self.modules[mi].connectors[mc].clone();
        self.modules[mi].connectors[mc].connected_ni = nid as i32;
        self.modules[mi].connectors[mc].connected_nc = nc as i32;

        if c.is_input() && c.connected_mi >= 0 {
            let up = &self.modules[c.connected_mi as usize].connectors[c.connected_mc as usize];
            c.connected_mi = up.connected_ni;
            c.connected_mc = up.connected_nc;
        } else {
            c.connected_mi = -1;
            c.connected_mc = -1;
        }
        c.connected_ni = -1;
        c.connected_nc = -1;
        c.mem = None;
        c.mem_staging = None;
        c.image = vk::Image::null();
        c.image_view = vk::ImageView::null();
        c.staging = vk::Buffer::null();
        c.layout = vk::ImageLayout::UNDEFINED;
        self.nodes[nid].connectors[nc] = c;
    }

    // ------------------------------------------------------------------
    // parameters
    // ------------------------------------------------------------------

    pub(crate) fn module_params(&self, mi: usize) -> &[u8] {
        let m = &self.modules[mi];
        &self.params_pool[m.param_offset as usize..(m.param_offset + m.param_size) as usize]
    }

    fn module_params_mut(&mut self, mi: usize) -> &mut [u8] {
        let m = &self.modules[mi];
        let (o, s) = (m.param_offset as usize, m.param_size as usize);
        &mut self.params_pool[o..o + s]
    }

    fn param_desc(&self, mi: usize, name: Token) -> Result<params::ParamDesc> {
        self.registry
            .class(self.modules[mi].class)
            .param(name)
            .copied()
            .ok_or(Error::NoSuchParam(name))
    }

    pub fn set_param_f32(&mut self, mi: usize, name: Token, values: &[f32]) -> Result<()> {
        let desc = self.param_desc(mi, name)?;
        if desc.kind != params::PARAM_FLOAT {
            return Err(Error::UnknownParamType(desc.kind));
        }
        let blob = self.module_params_mut(mi);
        for (i, v) in values.iter().take(desc.cnt as usize).enumerate() {
            params::write_f32(blob, &desc, i, *v);
        }
        Ok(())
    }

    pub fn set_param_str(&mut self, mi: usize, name: Token, value: &str) -> Result<()> {
        let desc = self.param_desc(mi, name)?;
        if desc.kind != params::PARAM_STRING {
            return Err(Error::UnknownParamType(desc.kind));
        }
        params::write_str(self.module_params_mut(mi), &desc, value);
        Ok(())
    }

    pub fn param_f32(&self, mi: usize, name: Token, i: usize) -> Option<f32> {
        let desc = self.param_desc(mi, name).ok()?;
        Some(params::read_f32(self.module_params(mi), &desc, i))
    }

    pub fn param_str(&self, mi: usize, name: Token) -> Option<&str> {
        let desc = self.param_desc(mi, name).ok()?;
        Some(params::read_str(self.module_params(mi), &desc))
    }

    fn param_hash(&self, mi: usize) -> u64 {
        fxhash::hash64(&self.module_params(mi))
    }

    fn module_dirty(&self, mi: usize) -> bool {
        self.modules[mi].last_param_hash != Some(self.param_hash(mi))
    }

    /// True once recording reaches this node: everything from the first
    /// module with changed parameters onward is re-recorded, the prefix is
    /// served from cached images.
    pub(crate) fn node_live(&self, ni: usize, runflag: &mut bool) -> bool {
        if !*runflag && self.module_dirty(self.nodes[ni].module) {
            *runflag = true;
        }
        *runflag
    }

    // ------------------------------------------------------------------
    // phases
    // ------------------------------------------------------------------

    fn sink_module(&self) -> Option<usize> {
        self.modules
            .iter()
            .position(|m| m.connectors.first().map_or(false, |c| c.role == ROLE_SINK))
    }

    fn sink_node(&self) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.connectors.first().map_or(false, |c| c.role == ROLE_SINK))
    }

    /// Forward ROI pass: post-order `modify_roi_out` from the first sink.
    pub fn negotiate_roi_out(&mut self) -> Result<()> {
        let sink = self.sink_module().ok_or(Error::NoSink)?;
        traverse(
            self,
            Realm::Modules,
            sink,
            |_, _| Ok(()),
            |g, mi| {
                negotiate::modify_roi_out(g, mi);
                Ok(())
            },
            |_, _, _| {}, // cycles are handled (and severed) in the second pass
        )
    }

    /// Reverse ROI pass and node expansion in one traversal: pre-order
    /// `modify_roi_in`, post-order `create_nodes`. Back-edges found here
    /// are severed and counted.
    pub fn expand_nodes(&mut self) -> Result<()> {
        self.nodes.clear();
        self.cycles_severed = 0;
        let sink = self.sink_module().ok_or(Error::NoSink)?;
        traverse(
            self,
            Realm::Modules,
            sink,
            |g, mi| {
                negotiate::modify_roi_in(g, mi);
                Ok(())
            },
            negotiate::create_nodes,
            |g, mi, ci| {
                let peer = g.modules[mi].connectors[ci].connected_mi;
                warn!(
                    target: "pipe",
                    "module cycle {}_{} -> {}_{}!",
                    g.modules[mi].name,
                    g.modules[mi].inst,
                    g.modules[peer as usize].name,
                    g.modules[peer as usize].inst
                );
                let _ = g.connect(-1, -1, mi as i32, ci as i32);
                g.cycles_severed += 1;
            },
        )
    }

    /// Resets all output reader counts, then walks the node graph
    /// pre-order counting live readers per output connector.
    pub fn count_node_references(&mut self) {
        for n in self.nodes.iter_mut() {
            for c in n.connectors.iter_mut() {
                if c.is_output() {
                    c.connected_mi = 0;
                }
            }
        }
        let Some(sink) = self.sink_node() else { return };
        let _ = traverse(
            self,
            Realm::Nodes,
            sink,
            |g, ni| {
                negotiate::count_references(g, ni);
                Ok(())
            },
            |_, _| Ok(()),
            |_, _, _| {},
        );
    }

    // ------------------------------------------------------------------
    // run driver
    // ------------------------------------------------------------------

    /// Executes the selected phases and submits the command buffer once to
    /// the compute queue. The first failing Vulkan call aborts the
    /// remaining phases; already-created resources stay valid for
    /// teardown and a later retry.
    pub fn run(&mut self, device: &Device, run: GraphRun) -> Result<()> {
        self.ensure_device_objects(device)?;
        self.query_cnt = 0;

        if run.contains(GraphRun::ALLOC_DSET)
            && self.uniform_dset_layout == vk::DescriptorSetLayout::null()
        {
            self.create_uniform_dset_layout(device)?;
        }

        // ------- module passes -------
        if run.contains(GraphRun::ROI_OUT) {
            self.negotiate_roi_out()?;
        }
        if run.intersects(GraphRun::ROI_OUT | GraphRun::CREATE_NODES) {
            self.expand_nodes()?;
        }

        let sink_node = self.sink_node().ok_or(Error::NoSink)?;

        // ------- node passes -------
        if run.contains(GraphRun::ALLOC_FREE) {
            self.count_node_references();
            self.heap.nuke();
            self.heap_staging.nuke();
            self.dset_cnt_image_read = 0;
            self.dset_cnt_image_write = 0;
            self.dset_cnt_uniform = 1; // the shared roi+params uniform
            self.memory_type_bits = !0;
            self.memory_type_bits_staging = !0;
            traverse(
                self,
                Realm::Nodes,
                sink_node,
                |_, _| Ok(()),
                |g, ni| {
                    allocate::alloc_outputs(g, device, ni)?;
                    allocate::free_inputs(g, ni);
                    Ok(())
                },
                |g, ni, ci| {
                    let peer = g.nodes[ni].connectors[ci].connected_mi as usize;
                    warn!(
                        target: "pipe",
                        "cycle {}_{} -> {}_{}!",
                        g.nodes[ni].name, g.nodes[ni].kernel,
                        g.nodes[peer].name, g.nodes[peer].kernel
                    );
                    let _ = g.node_connect(-1, -1, ni as i32, ci as i32);
                    g.cycles_severed += 1;
                },
            )?;
            negotiate::tile_check(self);
        }

        self.ensure_backing_memory(device)?;

        if run.contains(GraphRun::ALLOC_DSET) {
            self.prepare_dset_pool(device)?;
            self.dset_ready = true;
        }
        if run.contains(GraphRun::RECORD_CMD_BUF) && !self.dset_ready {
            return Err(Error::PhaseOrder("record_cmd_buf requires alloc_dset first"));
        }

        let vkd = device.vk();
        unsafe {
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            vkd.begin_command_buffer(self.command_buffer, &begin)
                .map_err(Error::Vk)?;
            vkd.cmd_reset_query_pool(self.command_buffer, self.query_pool, 0, QUERY_MAX);
        }

        if run.contains(GraphRun::UPLOAD_SOURCE) {
            self.upload_sources(device)?;
        }

        if run.contains(GraphRun::RECORD_CMD_BUF) {
            for mi in 0..self.modules.len() {
                negotiate::commit_params(self, mi);
            }
        }

        if run.intersects(GraphRun::ALLOC_DSET | GraphRun::RECORD_CMD_BUF) {
            let mut runflag = run.contains(GraphRun::UPLOAD_SOURCE);
            traverse(
                self,
                Realm::Nodes,
                sink_node,
                |_, _| Ok(()),
                |g, ni| {
                    if run.contains(GraphRun::ALLOC_DSET) {
                        allocate::alloc_outputs2(g, device, ni)?;
                    }
                    if run.contains(GraphRun::RECORD_CMD_BUF) {
                        record::record_command_buffer(g, device, ni, &mut runflag)?;
                    }
                    Ok(())
                },
                |_, _, _| {},
            )?;
        }

        unsafe {
            vkd.end_command_buffer(self.command_buffer).map_err(Error::Vk)?;
            vkd.reset_fences(&[self.fence]).map_err(Error::Vk)?;
            let cbs = [self.command_buffer];
            let submit = vk::SubmitInfo::default().command_buffers(&cbs);
            vkd.queue_submit(device.queue(), &[submit], self.fence)
                .map_err(Error::Vk)?;
        }

        if run.contains(GraphRun::WAIT_DONE) {
            unsafe {
                vkd.wait_for_fences(&[self.fence], true, FENCE_TIMEOUT_NS)
                    .map_err(Error::Vk)?;
            }
        }

        if run.contains(GraphRun::DOWNLOAD_SINK) {
            self.download_sinks(device)?;
        }

        if run.contains(GraphRun::RECORD_CMD_BUF) {
            for mi in 0..self.modules.len() {
                let h = self.param_hash(mi);
                self.modules[mi].last_param_hash = Some(h);
            }
        }

        if run.contains(GraphRun::WAIT_DONE) {
            self.report_timings(device)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // vulkan plumbing
    // ------------------------------------------------------------------

    fn ensure_device_objects(&mut self, device: &Device) -> Result<()> {
        if self.command_pool != vk::CommandPool::null() {
            return Ok(());
        }
        let vkd = device.vk();
        unsafe {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(device.queue_family())
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            self.command_pool = vkd.create_command_pool(&pool_info, None).map_err(Error::Vk)?;

            let cb_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            self.command_buffer = vkd
                .allocate_command_buffers(&cb_info)
                .map_err(Error::Vk)?[0];

            self.fence = vkd
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(Error::Vk)?;

            let query_info = vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::TIMESTAMP)
                .query_count(QUERY_MAX);
            self.query_pool = vkd.create_query_pool(&query_info, None).map_err(Error::Vk)?;
        }
        self.query_results = vec![0; QUERY_MAX as usize];
        self.query_name = vec![Token::default(); QUERY_MAX as usize];
        Ok(())
    }

    fn create_uniform_dset_layout(&mut self, device: &Device) -> Result<()> {
        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE);
        let bindings = [binding];
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        self.uniform_dset_layout = unsafe {
            device
                .vk()
                .create_descriptor_set_layout(&info, None)
                .map_err(Error::Vk)?
        };
        Ok(())
    }

    /// Backing memory is allocated once, after the first accounting walk,
    /// at the arenas' high-water size. A later run that outgrows it frees
    /// and reallocates; the images were recreated by that same walk.
    fn ensure_backing_memory(&mut self, device: &Device) -> Result<()> {
        let vkd = device.vk();
        let need = self.heap.vmsize();
        let need_staging = self.heap_staging.vmsize();
        unsafe {
            if self.vkmem != vk::DeviceMemory::null() && self.vkmem_size < need {
                vkd.free_memory(self.vkmem, None);
                self.vkmem = vk::DeviceMemory::null();
            }
            if self.vkmem == vk::DeviceMemory::null() && need > 0 {
                let idx = device
                    .memory_type_index(self.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
                let info = vk::MemoryAllocateInfo::default()
                    .allocation_size(need)
                    .memory_type_index(idx);
                self.vkmem = vkd.allocate_memory(&info, None).map_err(Error::Vk)?;
                self.vkmem_size = need;
            }

            if self.vkmem_staging != vk::DeviceMemory::null()
                && self.vkmem_staging_size < need_staging
            {
                vkd.free_memory(self.vkmem_staging, None);
                self.vkmem_staging = vk::DeviceMemory::null();
            }
            if self.vkmem_staging == vk::DeviceMemory::null() && need_staging > 0 {
                let idx = device.memory_type_index(
                    self.memory_type_bits_staging,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )?;
                let info = vk::MemoryAllocateInfo::default()
                    .allocation_size(need_staging)
                    .memory_type_index(idx);
                self.vkmem_staging = vkd.allocate_memory(&info, None).map_err(Error::Vk)?;
                self.vkmem_staging_size = need_staging;
            }

            if self.uniform_buffer == vk::Buffer::null() {
                let info = vk::BufferCreateInfo::default()
                    .size(UNIFORM_SIZE)
                    .usage(
                        vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::UNIFORM_BUFFER,
                    )
                    .sharing_mode(vk::SharingMode::EXCLUSIVE);
                self.uniform_buffer = vkd.create_buffer(&info, None).map_err(Error::Vk)?;
                let req = vkd.get_buffer_memory_requirements(self.uniform_buffer);
                let idx = device.memory_type_index(
                    req.memory_type_bits,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )?;
                let info = vk::MemoryAllocateInfo::default()
                    .allocation_size(req.size)
                    .memory_type_index(idx);
                self.vkmem_uniform = vkd.allocate_memory(&info, None).map_err(Error::Vk)?;
                vkd.bind_buffer_memory(self.uniform_buffer, self.vkmem_uniform, 0)
                    .map_err(Error::Vk)?;
            }
        }
        Ok(())
    }

    fn prepare_dset_pool(&mut self, device: &Device) -> Result<()> {
        let vkd = device.vk();
        let sets = self.dset_cnt_image_read + self.dset_cnt_image_write + self.dset_cnt_uniform;
        unsafe {
            if self.dset_pool != vk::DescriptorPool::null() && sets <= self.dset_pool_sets {
                vkd.reset_descriptor_pool(self.dset_pool, vk::DescriptorPoolResetFlags::empty())
                    .map_err(Error::Vk)?;
            } else {
                if self.dset_pool != vk::DescriptorPool::null() {
                    vkd.destroy_descriptor_pool(self.dset_pool, None);
                }
                let pool_sizes = [
                    vk::DescriptorPoolSize {
                        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        descriptor_count: 1 + self.dset_cnt_image_read,
                    },
                    vk::DescriptorPoolSize {
                        ty: vk::DescriptorType::STORAGE_IMAGE,
                        descriptor_count: 1 + self.dset_cnt_image_write,
                    },
                    vk::DescriptorPoolSize {
                        ty: vk::DescriptorType::UNIFORM_BUFFER,
                        descriptor_count: 1 + self.dset_cnt_uniform,
                    },
                ];
                let info = vk::DescriptorPoolCreateInfo::default()
                    .pool_sizes(&pool_sizes)
                    .max_sets(sets);
                self.dset_pool = vkd.create_descriptor_pool(&info, None).map_err(Error::Vk)?;
                self.dset_pool_sets = sets;
            }

            // the shared uniform descriptor
            let layouts = [self.uniform_dset_layout];
            let info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(self.dset_pool)
                .set_layouts(&layouts);
            self.uniform_dset = vkd.allocate_descriptor_sets(&info).map_err(Error::Vk)?[0];

            let buf_info = [vk::DescriptorBufferInfo::default()
                .buffer(self.uniform_buffer)
                .offset(0)
                .range(vk::WHOLE_SIZE)];
            let write = vk::WriteDescriptorSet::default()
                .dst_set(self.uniform_dset)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buf_info);
            vkd.update_descriptor_sets(&[write], &[]);
        }
        Ok(())
    }

    fn upload_sources(&mut self, device: &Device) -> Result<()> {
        let vkd = device.vk();
        let size = self.vkmem_staging_size as usize;
        if size == 0 {
            return Ok(());
        }
        let mapped = unsafe {
            vkd.map_memory(
                self.vkmem_staging,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
            .map_err(Error::Vk)? as *mut u8
        };
        for ni in 0..self.nodes.len() {
            if !self.nodes[ni].is_source() {
                continue;
            }
            let mi = self.nodes[ni].module;
            match self.ops(mi).read_source {
                Some(f) => {
                    let offset = self.nodes[ni].connectors[0].offset_staging as usize;
                    let len = self.nodes[ni].connectors[0].bufsize() as usize;
                    let window =
                        unsafe { std::slice::from_raw_parts_mut(mapped.add(offset), len.min(size - offset)) };
                    f(&self.modules[mi], self.module_params(mi), window);
                }
                None => error!(
                    target: "pipe",
                    "source node '{}' has no read_source() callback!", self.nodes[ni].name
                ),
            }
        }
        unsafe { vkd.unmap_memory(self.vkmem_staging) };
        Ok(())
    }

    fn download_sinks(&mut self, device: &Device) -> Result<()> {
        let vkd = device.vk();
        let size = self.vkmem_staging_size as usize;
        if size == 0 {
            return Ok(());
        }
        let mapped = unsafe {
            vkd.map_memory(
                self.vkmem_staging,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
            .map_err(Error::Vk)? as *const u8
        };
        for ni in 0..self.nodes.len() {
            if !self.nodes[ni].is_sink() {
                continue;
            }
            let mi = self.nodes[ni].module;
            if let Some(f) = self.ops(mi).write_sink {
                let offset = self.nodes[ni].connectors[0].offset_staging as usize;
                let len = self.nodes[ni].connectors[0].bufsize() as usize;
                let window =
                    unsafe { std::slice::from_raw_parts(mapped.add(offset), len.min(size - offset)) };
                f(&self.modules[mi], self.module_params(mi), window);
            }
            // a sink without the callback is not an error; a display
            // would read the image directly
        }
        unsafe { vkd.unmap_memory(self.vkmem_staging) };
        Ok(())
    }

    fn report_timings(&mut self, device: &Device) -> Result<()> {
        let cnt = self.query_cnt as usize;
        if cnt == 0 {
            return Ok(());
        }
        unsafe {
            device
                .vk()
                .get_query_pool_results::<u64>(
                    self.query_pool,
                    0,
                    &mut self.query_results[..cnt],
                    vk::QueryResultFlags::TYPE_64,
                )
                .map_err(Error::Vk)?;
        }
        for i in (0..cnt).step_by(2) {
            let ticks = self.query_results[i + 1].saturating_sub(self.query_results[i]);
            let ms = ticks as f64 * device.timestamp_period() as f64 * 1e-6;
            info!(target: "perf", "query {}: {:8.2} ms", self.query_name[i], ms);
        }
        Ok(())
    }

    /// Destroys all GPU resources owned by this graph. Must run before the
    /// device goes away; safe to call more than once.
    pub fn cleanup(&mut self, device: &Device) {
        for mi in 0..self.modules.len() {
            if let Some(f) = self.ops(mi).cleanup {
                f(&mut self.modules[mi]);
            }
        }
        let vkd = device.vk();
        unsafe {
            // device may still be chewing on the last submission
            let _ = vkd.device_wait_idle();
            for node in self.nodes.iter_mut() {
                vkd.destroy_pipeline(node.pipeline, None);
                vkd.destroy_pipeline_layout(node.pipeline_layout, None);
                vkd.destroy_descriptor_set_layout(node.dset_layout, None);
                node.pipeline = vk::Pipeline::null();
                node.pipeline_layout = vk::PipelineLayout::null();
                node.dset_layout = vk::DescriptorSetLayout::null();
                for c in node.connectors.iter_mut() {
                    if c.is_output() {
                        vkd.destroy_image(c.image, None);
                        vkd.destroy_image_view(c.image_view, None);
                    }
                    vkd.destroy_buffer(c.staging, None);
                    c.image = vk::Image::null();
                    c.image_view = vk::ImageView::null();
                    c.staging = vk::Buffer::null();
                }
            }
            vkd.destroy_descriptor_pool(self.dset_pool, None);
            vkd.destroy_descriptor_set_layout(self.uniform_dset_layout, None);
            vkd.destroy_buffer(self.uniform_buffer, None);
            vkd.free_memory(self.vkmem, None);
            vkd.free_memory(self.vkmem_staging, None);
            vkd.free_memory(self.vkmem_uniform, None);
            vkd.destroy_fence(self.fence, None);
            vkd.destroy_query_pool(self.query_pool, None);
            vkd.destroy_command_pool(self.command_pool, None);
        }
        self.dset_pool = vk::DescriptorPool::null();
        self.uniform_dset_layout = vk::DescriptorSetLayout::null();
        self.uniform_buffer = vk::Buffer::null();
        self.vkmem = vk::DeviceMemory::null();
        self.vkmem_staging = vk::DeviceMemory::null();
        self.vkmem_uniform = vk::DeviceMemory::null();
        self.fence = vk::Fence::null();
        self.query_pool = vk::QueryPool::null();
        self.command_pool = vk::CommandPool::null();
        self.command_buffer = vk::CommandBuffer::null();
        self.vkmem_size = 0;
        self.vkmem_staging_size = 0;
        self.dset_ready = false;
        debug!(target: "pipe", "graph cleaned up");
    }
}
