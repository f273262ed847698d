//! Resource allocation for the node graph.
//!
//! Two post-order walks. The first creates per-node descriptor layouts and
//! pipelines, creates the output images and reserves their memory from the
//! arenas, then immediately releases the reservations it is done with
//! (`free_inputs`) so downstream nodes can alias the space; nothing is
//! bound yet because the backing memory object does not exist until the
//! arenas know their high-water size. The second walk binds memory,
//! creates views and writes the descriptor sets in one batch per node.

use std::fs;
use std::io::Cursor;

use ash::util::read_spv;
use ash::vk;
use log::{debug, error, info};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::graph::Graph;

/// Walk A body.
pub(crate) fn alloc_outputs(g: &mut Graph, device: &Device, ni: usize) -> Result<()> {
    let vkd = device.vk();

    // bindings mirror the connector list: reads sample, writes store
    let mut bindings = Vec::with_capacity(g.nodes[ni].connectors.len());
    for (i, c) in g.nodes[ni].connectors.iter().enumerate() {
        let ty = if c.is_input() {
            g.dset_cnt_image_read += 1;
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        } else {
            g.dset_cnt_image_write += 1;
            vk::DescriptorType::STORAGE_IMAGE
        };
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(i as u32)
                .descriptor_type(ty)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::ALL),
        );
    }
    unsafe {
        if g.nodes[ni].dset_layout != vk::DescriptorSetLayout::null() {
            vkd.destroy_descriptor_set_layout(g.nodes[ni].dset_layout, None);
        }
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        g.nodes[ni].dset_layout = vkd
            .create_descriptor_set_layout(&info, None)
            .map_err(Error::Vk)?;
    }

    // sinks and sources run no kernel; they still got the descriptor set
    // layout above so the image can be bound elsewhere (e.g. a display)
    if !(g.nodes[ni].is_sink() || g.nodes[ni].is_source()) {
        create_pipeline(g, device, ni)?;
    }

    for ci in 0..g.nodes[ni].connectors.len() {
        if g.nodes[ni].connectors[ci].is_output() {
            alloc_output_image(g, device, ni, ci)?;
        } else {
            alias_input(g, device, ni, ci)?;
        }
    }
    Ok(())
}

fn create_pipeline(g: &mut Graph, device: &Device, ni: usize) -> Result<()> {
    let vkd = device.vk();
    let node = &g.nodes[ni];

    let set_layouts = [g.uniform_dset_layout, node.dset_layout];
    let pc_size = node.push_constant.len() as u32;
    let pc_ranges = [vk::PushConstantRange::default()
        .stage_flags(vk::ShaderStageFlags::ALL)
        .offset(0)
        .size(pc_size)];
    let mut layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
    if pc_size > 0 {
        layout_info = layout_info.push_constant_ranges(&pc_ranges);
    }

    let path = g
        .registry()
        .module_dir()
        .join(node.name.to_string())
        .join(format!("{}.spv", node.kernel));
    let bytes = fs::read(&path).map_err(|e| {
        error!(target: "qvk", "failed to read shader '{}': {}", path.display(), e);
        Error::Io(e)
    })?;
    let words = read_spv(&mut Cursor::new(&bytes)).map_err(Error::Io)?;

    unsafe {
        if g.nodes[ni].pipeline_layout != vk::PipelineLayout::null() {
            vkd.destroy_pipeline_layout(g.nodes[ni].pipeline_layout, None);
        }
        let pipeline_layout = vkd
            .create_pipeline_layout(&layout_info, None)
            .map_err(Error::Vk)?;

        let sm_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let shader_module = vkd.create_shader_module(&sm_info, None).map_err(Error::Vk)?;

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(c"main");
        let pipe_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(pipeline_layout);
        let pipelines = vkd
            .create_compute_pipelines(vk::PipelineCache::null(), &[pipe_info], None)
            .map_err(|(_, e)| Error::Vk(e));
        // the module is baked into the pipeline either way
        vkd.destroy_shader_module(shader_module, None);
        let pipeline = pipelines?[0];

        if g.nodes[ni].pipeline != vk::Pipeline::null() {
            vkd.destroy_pipeline(g.nodes[ni].pipeline, None);
        }
        g.nodes[ni].pipeline = pipeline;
        g.nodes[ni].pipeline_layout = pipeline_layout;
    }
    Ok(())
}

fn alloc_output_image(g: &mut Graph, device: &Device, ni: usize, ci: usize) -> Result<()> {
    let vkd = device.vk();
    let (format, roi, name, chan, fmt_tok, is_source, readers) = {
        let node = &g.nodes[ni];
        let c = &node.connectors[ci];
        let format = c.vk_format().ok_or(Error::InvalidFormat(c.format))?;
        (
            format,
            c.roi,
            node.name,
            c.chan,
            c.format,
            c.is_source(),
            c.connected_mi,
        )
    };
    debug!(target: "pipe", "{} x {} {}", roi.wd, roi.ht, name);

    let info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D { width: roi.wd, height: roi.ht, depth: 1 })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(
            vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
        )
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let (image, req) = unsafe {
        if g.nodes[ni].connectors[ci].image != vk::Image::null() {
            vkd.destroy_image(g.nodes[ni].connectors[ci].image, None);
        }
        let image = vkd.create_image(&info, None).map_err(Error::Vk)?;
        (image, vkd.get_image_memory_requirements(image))
    };

    if g.memory_type_bits != !0 && req.memory_type_bits != g.memory_type_bits {
        error!(target: "qvk", "memory type bits don't match!");
    }
    g.memory_type_bits = req.memory_type_bits;

    let mem = g
        .heap
        .alloc(req.size, req.alignment)
        .ok_or(Error::OutOfMemory("image heap"))?;
    let size = {
        let c = &g.nodes[ni].connectors[ci];
        c.bufsize()
    };
    info!(
        target: "pipe",
        "allocating {:.1}/{:.1} MB for {} {} {} {}",
        req.size as f64 / (1024.0 * 1024.0),
        size as f64 / (1024.0 * 1024.0),
        name,
        g.nodes[ni].connectors[ci].name,
        chan,
        fmt_tok
    );

    // the counting pass left the number of scheduled readers (plus this
    // node's own balancing free) in the link field; seed the arena entry
    // with it, sources keep one extra so the image survives past upload
    let refs = readers.max(0) as u32 + if is_source { 1 } else { 0 };
    g.heap.set_ref(mem, refs);

    {
        let c = &mut g.nodes[ni].connectors[ci];
        c.image = image;
        c.layout = vk::ImageLayout::UNDEFINED;
        c.mem = Some(mem);
        c.offset = g.heap.offset(mem);
        c.size = size;
    }

    if is_source {
        create_staging(g, device, ni, ci)?;
    }
    Ok(())
}

fn alias_input(g: &mut Graph, device: &Device, ni: usize, ci: usize) -> Result<()> {
    let (mi, mc, is_sink) = {
        let c = &g.nodes[ni].connectors[ci];
        (c.connected_mi, c.connected_mc, c.is_sink())
    };
    if mi < 0 {
        // not connected; nothing will be bound
        return Ok(());
    }
    let (image, mem) = {
        let up = &g.nodes[mi as usize].connectors[mc as usize];
        (up.image, up.mem)
    };
    {
        let c = &mut g.nodes[ni].connectors[ci];
        c.image = image;
        c.mem = mem;
        // the image view follows in the second walk
    }
    if is_sink {
        create_staging(g, device, ni, ci)?;
    }
    Ok(())
}

/// Host-visible staging buffer for a source upload or sink download.
fn create_staging(g: &mut Graph, device: &Device, ni: usize, ci: usize) -> Result<()> {
    let vkd = device.vk();
    let size = g.nodes[ni].connectors[ci].bufsize();
    let info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let (staging, req) = unsafe {
        if g.nodes[ni].connectors[ci].staging != vk::Buffer::null() {
            vkd.destroy_buffer(g.nodes[ni].connectors[ci].staging, None);
        }
        let b = vkd.create_buffer(&info, None).map_err(Error::Vk)?;
        (b, vkd.get_buffer_memory_requirements(b))
    };

    if g.memory_type_bits_staging != !0 && req.memory_type_bits != g.memory_type_bits_staging {
        error!(target: "qvk", "staging memory type bits don't match!");
    }
    g.memory_type_bits_staging = req.memory_type_bits;

    let mem = g
        .heap_staging
        .alloc(req.size, req.alignment)
        .ok_or(Error::OutOfMemory("staging heap"))?;
    let c = &mut g.nodes[ni].connectors[ci];
    c.staging = staging;
    c.mem_staging = Some(mem);
    c.offset_staging = g.heap_staging.offset(mem);
    c.size_staging = g.heap_staging.size(mem);
    Ok(())
}

/// Releases everything this node is done with: its inputs (the upstream
/// entries it aliased) and its own outputs' balancing reference. Nothing
/// is freed for real while readers remain; offsets and images stay around
/// for consecutive runs either way.
pub(crate) fn free_inputs(g: &mut Graph, ni: usize) {
    for ci in 0..g.nodes[ni].connectors.len() {
        let (is_input, mi, mem, mem_staging, cname) = {
            let c = &g.nodes[ni].connectors[ci];
            (c.is_input(), c.connected_mi, c.mem, c.mem_staging, c.name)
        };
        if is_input && mi >= 0 {
            if let Some(mem) = mem {
                debug!(
                    target: "pipe",
                    "freeing input {}_{} {}",
                    g.nodes[ni].name, g.nodes[ni].kernel, cname
                );
                g.heap.free(mem);
            }
        } else if !is_input {
            if let Some(mem) = mem {
                debug!(
                    target: "pipe",
                    "freeing output ref count {}_{} {} {}",
                    g.nodes[ni].name, g.nodes[ni].kernel, cname,
                    g.heap.refcount(mem)
                );
                g.heap.free(mem);
            }
        }
        // staging windows are only needed while the copy runs
        if let Some(mem) = mem_staging {
            debug!(
                target: "pipe",
                "freeing staging {}_{} {}",
                g.nodes[ni].name, g.nodes[ni].kernel, cname
            );
            g.heap_staging.free(mem);
        }
    }
}

/// Walk B body: memory exists now, so bind it, create the views and write
/// the descriptors.
pub(crate) fn alloc_outputs2(g: &mut Graph, device: &Device, ni: usize) -> Result<()> {
    let vkd = device.vk();

    if g.nodes[ni].dset_layout != vk::DescriptorSetLayout::null() {
        let layouts = [g.nodes[ni].dset_layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(g.dset_pool)
            .set_layouts(&layouts);
        g.nodes[ni].dset = unsafe { vkd.allocate_descriptor_sets(&info).map_err(Error::Vk)?[0] };
    }

    let nc = g.nodes[ni].connectors.len();
    let mut img_info = vec![vk::DescriptorImageInfo::default(); nc];
    let mut bound = vec![false; nc];

    for ci in 0..nc {
        if g.nodes[ni].connectors[ci].is_output() {
            let (image, offset, format, is_source) = {
                let c = &g.nodes[ni].connectors[ci];
                (
                    c.image,
                    c.offset,
                    c.vk_format().ok_or(Error::InvalidFormat(c.format))?,
                    c.is_source(),
                )
            };
            unsafe {
                vkd.bind_image_memory(image, g.vkmem, offset).map_err(Error::Vk)?;
                if g.nodes[ni].connectors[ci].image_view != vk::ImageView::null() {
                    vkd.destroy_image_view(g.nodes[ni].connectors[ci].image_view, None);
                }
                let view_info = vk::ImageViewCreateInfo::default()
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .image(image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                let view = vkd.create_image_view(&view_info, None).map_err(Error::Vk)?;
                let c = &mut g.nodes[ni].connectors[ci];
                c.image_view = view;
            }
            img_info[ci] = vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: g.nodes[ni].connectors[ci].image_view,
                image_layout: vk::ImageLayout::GENERAL,
            };
            bound[ci] = true;

            if is_source {
                let c = &g.nodes[ni].connectors[ci];
                unsafe {
                    vkd.bind_buffer_memory(c.staging, g.vkmem_staging, c.offset_staging)
                        .map_err(Error::Vk)?;
                }
            }
        } else {
            let (mi, mc, is_sink, smooth) = {
                let c = &g.nodes[ni].connectors[ci];
                (
                    c.connected_mi,
                    c.connected_mc,
                    c.is_sink(),
                    c.flags.contains(crate::connector::ConnectorFlags::SMOOTH),
                )
            };
            if mi >= 0 {
                let (image, view) = {
                    let up = &g.nodes[mi as usize].connectors[mc as usize];
                    (up.image, up.image_view)
                };
                {
                    let c = &mut g.nodes[ni].connectors[ci];
                    c.image = image;
                    c.image_view = view;
                }
                img_info[ci] = vk::DescriptorImageInfo {
                    sampler: if smooth {
                        device.sampler_linear()
                    } else {
                        device.sampler_nearest()
                    },
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                };
                bound[ci] = true;
            }
            if is_sink {
                let c = &g.nodes[ni].connectors[ci];
                unsafe {
                    vkd.bind_buffer_memory(c.staging, g.vkmem_staging, c.offset_staging)
                        .map_err(Error::Vk)?;
                }
            }
        }
    }

    if g.nodes[ni].dset != vk::DescriptorSet::null() {
        let mut writes = Vec::with_capacity(nc);
        for ci in 0..nc {
            if !bound[ci] {
                continue;
            }
            let ty = if g.nodes[ni].connectors[ci].is_output() {
                vk::DescriptorType::STORAGE_IMAGE
            } else {
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            };
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(g.nodes[ni].dset)
                    .dst_binding(ci as u32)
                    .descriptor_type(ty)
                    .image_info(std::slice::from_ref(&img_info[ci])),
            );
        }
        unsafe { vkd.update_descriptor_sets(&writes, &[]) };
    }
    Ok(())
}
