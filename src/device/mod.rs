//! Vulkan device bootstrap.
//!
//! The graph engine needs little from the GPU surface: one compute queue
//! with timestamp support, device-local and host-visible-coherent memory,
//! storage/sampled/transfer images, and two samplers (nearest and linear,
//! mirrored repeat). This module owns exactly that and nothing else; no
//! swapchain, no graphics pipeline.

use std::ffi::CStr;

use ash::vk;
use log::{debug, info};

use crate::error::{Error, Result};

pub struct Device {
    // field order is drop order documentation only; teardown is explicit
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue_family: u32,
    queue: vk::Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Nanoseconds per timestamp tick.
    timestamp_period: f32,
    sampler_linear: vk::Sampler,
    sampler_nearest: vk::Sampler,
}

impl Device {
    /// Picks the first physical device exposing a compute queue family
    /// with valid timestamps and brings up a single queue on it.
    pub fn new() -> Result<Device> {
        let entry = unsafe { ash::Entry::load().map_err(|e| Error::Loader(e.to_string()))? };

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"rawpipe")
            .engine_name(c"rawpipe")
            .api_version(vk::API_VERSION_1_1);
        let instance_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&instance_info, None).map_err(Error::Vk)? };

        let physical_devices =
            unsafe { instance.enumerate_physical_devices().map_err(Error::Vk)? };

        let mut picked = None;
        for &pd in &physical_devices {
            let families =
                unsafe { instance.get_physical_device_queue_family_properties(pd) };
            let family = families.iter().position(|f| {
                f.queue_flags.contains(vk::QueueFlags::COMPUTE) && f.timestamp_valid_bits > 0
            });
            if let Some(family) = family {
                let props = unsafe { instance.get_physical_device_properties(pd) };
                let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
                info!(target: "qvk", "picked device: {}", name.to_string_lossy());
                picked = Some((pd, family as u32, props));
                break;
            }
        }
        let Some((physical_device, queue_family, props)) = picked else {
            unsafe { instance.destroy_instance(None) };
            return Err(Error::Loader("no compute-capable vulkan device".into()));
        };

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities);
        let queue_infos = [queue_info];
        let device_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_infos);
        let device = unsafe {
            instance
                .create_device(physical_device, &device_info, None)
                .map_err(Error::Vk)?
        };
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let sampler_linear = create_sampler(&device, vk::Filter::LINEAR)?;
        let sampler_nearest = create_sampler(&device, vk::Filter::NEAREST)?;

        debug!(
            target: "qvk",
            "compute queue family {} timestamp period {}",
            queue_family, props.limits.timestamp_period
        );

        Ok(Device {
            entry,
            instance,
            physical_device,
            device,
            queue_family,
            queue,
            memory_properties,
            timestamp_period: props.limits.timestamp_period,
            sampler_linear,
            sampler_nearest,
        })
    }

    pub fn vk(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn sampler_linear(&self) -> vk::Sampler {
        self.sampler_linear
    }

    pub fn sampler_nearest(&self) -> vk::Sampler {
        self.sampler_nearest
    }

    pub fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    /// First memory type allowed by `type_bits` that carries all
    /// `required` flags.
    pub fn memory_type_index(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .find(|(i, mt)| {
                (type_bits & (1 << *i as u32)) != 0 && mt.property_flags.contains(required)
            })
            .map(|(i, _)| i as u32)
            .ok_or(Error::Loader("no suitable memory type".into()))
    }
}

fn create_sampler(device: &ash::Device, filter: vk::Filter) -> Result<vk::Sampler> {
    let mipmap = if filter == vk::Filter::LINEAR {
        vk::SamplerMipmapMode::LINEAR
    } else {
        vk::SamplerMipmapMode::NEAREST
    };
    let info = vk::SamplerCreateInfo::default()
        .mag_filter(filter)
        .min_filter(filter)
        .address_mode_u(vk::SamplerAddressMode::MIRRORED_REPEAT)
        .address_mode_v(vk::SamplerAddressMode::MIRRORED_REPEAT)
        .address_mode_w(vk::SamplerAddressMode::MIRRORED_REPEAT)
        .anisotropy_enable(false)
        .max_anisotropy(16.0)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .mipmap_mode(mipmap)
        .min_lod(0.0)
        .max_lod(128.0);
    unsafe { device.create_sampler(&info, None).map_err(Error::Vk) }
}

impl Drop for Device {
    fn drop(&mut self) {
        // graphs must have been cleaned up by now
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_sampler(self.sampler_linear, None);
            self.device.destroy_sampler(self.sampler_nearest, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        let _ = &self.entry;
    }
}
