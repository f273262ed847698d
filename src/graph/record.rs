//! Command buffer recording.
//!
//! One post-order pass over the node graph emits, per node: image layout
//! barriers for every connector, the staging copies for sources and sinks,
//! the pipeline and descriptor binds, the uniform update (ROIs plus
//! committed parameters), the dispatch, and a pair of timestamps around
//! it. Post-order guarantees a producer's commands land in the buffer
//! before any consumer's.
//!
//! Nodes whose module (and every module before it in recording order) has
//! unchanged parameters are skipped; their images still hold last run's
//! result. Uploading sources forces recording from the start.

use ash::vk;
use bytemuck::bytes_of;

use crate::connector::{Connector, ConnectorFlags};
use crate::device::Device;
use crate::error::Result;
use crate::graph::{Graph, QUERY_MAX, UNIFORM_SIZE};

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

fn image_barrier(
    device: &Device,
    cb: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old)
        .new_layout(new)
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE);
    unsafe {
        device.vk().cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

fn buffer_barrier(device: &Device, cb: vk::CommandBuffer, buffer: vk::Buffer) {
    let barrier = vk::BufferMemoryBarrier::default()
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED);
    unsafe {
        device.vk().cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[barrier],
            &[],
        );
    }
}

/// Transitions the image behind connector `(ni, ci)`. The layout is
/// tracked on the output connector that owns the image, so fan-out readers
/// see each other's transitions instead of re-deriving a stale old layout.
fn transition(g: &mut Graph, device: &Device, ni: usize, ci: usize, new: vk::ImageLayout) {
    let (owner_n, owner_c) = {
        let c = &g.nodes[ni].connectors[ci];
        if c.is_input() {
            if c.connected_mi < 0 {
                return;
            }
            (c.connected_mi as usize, c.connected_mc as usize)
        } else {
            (ni, ci)
        }
    };
    let (image, old) = {
        let c = &g.nodes[owner_n].connectors[owner_c];
        (c.image, c.layout)
    };
    if image == vk::Image::null() {
        return;
    }
    image_barrier(device, g.command_buffer, image, old, new);
    g.nodes[owner_n].connectors[owner_c].layout = new;
}

fn copy_region(wd: u32, ht: u32) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D { width: wd, height: ht, depth: 1 },
    }
}

/// Concatenates the per-connector ROIs (each padded to 16 bytes) and the
/// flattened module parameters; this is the uniform block every kernel
/// sees at set 0 binding 0.
pub(crate) fn build_uniform(connectors: &[Connector], params: &[u8], out: &mut [u8]) -> usize {
    let mut pos = 0;
    for c in connectors {
        let bytes = bytes_of(&c.roi);
        debug_assert!(pos + 16 <= out.len());
        out[pos..pos + bytes.len()].copy_from_slice(bytes);
        pos += (bytes.len() + 15) / 16 * 16;
    }
    let n = params.len().min(out.len() - pos);
    out[pos..pos + n].copy_from_slice(&params[..n]);
    pos + n
}

pub(crate) fn record_command_buffer(
    g: &mut Graph,
    device: &Device,
    ni: usize,
    runflag: &mut bool,
) -> Result<()> {
    if !g.node_live(ni, runflag) {
        return Ok(()); // cached prefix, nothing to do yet
    }
    let vkd = device.vk();
    let cb = g.command_buffer;

    // wait for the inputs and move them to read-only; outputs go to
    // general so the kernel can store, clearing first where requested
    for ci in 0..g.nodes[ni].connectors.len() {
        let (is_input, connected, clear) = {
            let c = &g.nodes[ni].connectors[ci];
            (
                c.is_input(),
                c.connected_mi >= 0,
                c.flags.contains(ConnectorFlags::CLEAR),
            )
        };
        if is_input {
            if connected {
                transition(g, device, ni, ci, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            }
        } else if clear {
            transition(g, device, ni, ci, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            let image = g.nodes[ni].connectors[ci].image;
            unsafe {
                vkd.cmd_clear_color_image(
                    cb,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &vk::ClearColorValue { float32: [0.0; 4] },
                    &[COLOR_RANGE],
                );
            }
            transition(g, device, ni, ci, vk::ImageLayout::GENERAL);
        } else {
            transition(g, device, ni, ci, vk::ImageLayout::GENERAL);
        }
    }

    let (wd, ht) = {
        let roi = &g.nodes[ni].connectors[0].roi;
        (roi.wd, roi.ht)
    };

    if g.nodes[ni].is_sink() {
        // only schedule the copy back if the module wants the pixels
        if g.ops(g.nodes[ni].module).write_sink.is_some() {
            transition(g, device, ni, 0, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            let c = &g.nodes[ni].connectors[0];
            unsafe {
                vkd.cmd_copy_image_to_buffer(
                    cb,
                    c.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    c.staging,
                    &[copy_region(wd, ht)],
                );
            }
            let staging = g.nodes[ni].connectors[0].staging;
            buffer_barrier(device, cb, staging);
        }
        return Ok(());
    }
    if g.nodes[ni].is_source() {
        transition(g, device, ni, 0, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let c = &g.nodes[ni].connectors[0];
        unsafe {
            vkd.cmd_copy_buffer_to_image(
                cb,
                c.staging,
                c.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy_region(wd, ht)],
            );
        }
        // consumers will flip it to read-only themselves
        transition(g, device, ni, 0, vk::ImageLayout::GENERAL);
        return Ok(());
    }

    // interior nodes without a pipeline can only mean the allocation pass
    // has not run; nothing to dispatch
    if g.nodes[ni].pipeline == vk::Pipeline::null() {
        return Ok(());
    }

    // timestamps come in pairs or not at all
    let stamp = g.query_cnt + 1 < QUERY_MAX;
    if stamp {
        unsafe {
            vkd.cmd_write_timestamp(
                cb,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                g.query_pool,
                g.query_cnt,
            );
        }
        let i = g.query_cnt as usize;
        g.query_name[i] = g.nodes[ni].name;
        g.query_cnt += 1;
    }

    unsafe {
        vkd.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, g.nodes[ni].pipeline);
        let dsets = [g.uniform_dset, g.nodes[ni].dset];
        vkd.cmd_bind_descriptor_sets(
            cb,
            vk::PipelineBindPoint::COMPUTE,
            g.nodes[ni].pipeline_layout,
            0,
            &dsets,
            &[],
        );
        if !g.nodes[ni].push_constant.is_empty() {
            vkd.cmd_push_constants(
                cb,
                g.nodes[ni].pipeline_layout,
                vk::ShaderStageFlags::ALL,
                0,
                &g.nodes[ni].push_constant,
            );
        }
    }

    // roi block + committed params for the kernel
    let mi = g.nodes[ni].module;
    let mut uniform = [0u8; UNIFORM_SIZE as usize];
    let pos = {
        let params: &[u8] = if g.ops(mi).commit_params.is_some() {
            &g.modules[mi].committed
        } else {
            g.module_params(mi)
        };
        build_uniform(&g.nodes[ni].connectors, params, &mut uniform)
    };
    // offset and size must be multiples of 4 for the inline update
    let pos = (pos + 3) & !3;
    unsafe {
        vkd.cmd_update_buffer(cb, g.uniform_buffer, 0, &uniform[..pos]);
    }
    buffer_barrier(device, cb, g.uniform_buffer);

    unsafe {
        vkd.cmd_dispatch(
            cb,
            (g.nodes[ni].wd + 31) / 32,
            (g.nodes[ni].ht + 31) / 32,
            g.nodes[ni].dp,
        );
    }

    if stamp {
        unsafe {
            vkd.cmd_write_timestamp(
                cb,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                g.query_pool,
                g.query_cnt,
            );
        }
        let i = g.query_cnt as usize;
        g.query_name[i] = g.nodes[ni].name;
        g.query_cnt += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Roi, ROLE_READ, ROLE_WRITE};
    use crate::token::Token;

    #[test]
    fn uniform_payload_layout() {
        let mut read = Connector::new(
            Token::new("input"),
            ROLE_READ,
            Token::new("rggb"),
            Token::new("ui16"),
        );
        read.roi = Roi { full_wd: 100, full_ht: 100, wd: 100, ht: 100, x: 0, y: 0, scale: 1.0 };
        let mut write = Connector::new(
            Token::new("output"),
            ROLE_WRITE,
            Token::new("rgb"),
            Token::new("f16"),
        );
        write.roi = Roi { full_wd: 50, full_ht: 50, wd: 50, ht: 50, x: 0, y: 0, scale: 1.0 };

        let params = [0xaau8, 0xbb, 0xcc, 0xdd];
        let mut out = [0u8; 256];
        let pos = build_uniform(&[read.clone(), write], &params, &mut out);

        // each 28-byte roi is padded to a 16-byte boundary
        assert_eq!(pos, 32 + 32 + 4);
        assert_eq!(&out[0..4], &100u32.to_ne_bytes());
        assert_eq!(&out[28..32], &[0u8; 4]); // padding
        assert_eq!(&out[32..36], &50u32.to_ne_bytes());
        assert_eq!(&out[64..68], &params);
    }

    #[test]
    fn uniform_payload_truncates_params_at_capacity() {
        let mut c = Connector::new(
            Token::new("output"),
            ROLE_WRITE,
            Token::new("rgb"),
            Token::new("f16"),
        );
        c.roi.wd = 1;
        c.roi.ht = 1;
        let params = vec![7u8; 64];
        let mut out = [0u8; 48];
        let pos = build_uniform(&[c], &params, &mut out);
        assert_eq!(pos, 48);
        assert_eq!(&out[32..48], &params[..16]);
    }
}
