//! Export-image engine: the auxiliary image the backbuffer is copied into,
//! its DMA-BUF export, and the per-queue command-buffer rings that carry the
//! per-present copy.
//!
//! The copy is bracketed by symmetric image barriers that hand the export
//! image between `VK_QUEUE_FAMILY_EXTERNAL` and the presenting queue's
//! family. Without that ownership transfer the consumer's import may read
//! undefined memory; the consumer additionally waits for the readiness
//! message before sampling.

use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::ptr;

use ash::vk;
use ash::vk::Handle;
use log::{debug, warn};

use crate::layer::{DeviceInner, DeviceState, QueueState, SwapchainState};
use crate::producer;
use crate::protocol::{self, DRM_FORMAT_MOD_INVALID, TextureInfo};
use crate::{CaptureError, Result, lock};

/// The exported side of a swapchain generation: one LINEAR image, its
/// dedicated allocation, and the DMA-BUF fd handed to the broker. The fd is
/// closed exactly once, when this struct drops.
pub struct ExportImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub layout: vk::SubresourceLayout,
    pub fd: OwnedFd,
}

pub struct FrameSlot {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    busy: bool,
}

/// Ring of command buffers sized to the swapchain image count so submits can
/// overlap completion. A slot is busy from submit until its fence has been
/// waited and reset.
#[derive(Default)]
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    index: usize,
}

impl FrameRing {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Lowest-indexed memory type allowed by `type_bits` that has all of
/// `required` set.
pub fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&index| {
        type_bits & (1 << index) != 0
            && props.memory_types[index as usize]
                .property_flags
                .contains(required)
    })
}

/// Per-present capture hook. Never propagates failure to the application;
/// anything that goes wrong tears capture down and logs.
pub fn capture_present(
    device: &DeviceState,
    queue: vk::Queue,
    swapchain: vk::SwapchainKHR,
    image_index: u32,
) {
    let connected = producer::update_socket();

    let mut guard = lock(&device.inner);
    let inner = &mut *guard;

    let Some(queue_state) = inner.queues.get(&queue.as_raw()) else {
        return;
    };
    if !queue_state.supports_transfer {
        return;
    }

    // Tear down when the broker went away or the application switched
    // swapchains mid-stream.
    if let Some(current) = inner.current {
        if !connected || current != swapchain.as_raw() {
            teardown_current(device, inner);
        }
    }

    // Lazy init: first present of a valid-extent swapchain while connected.
    if connected && inner.current.is_none() {
        if let Some(entry) = inner.swapchains.get_mut(&swapchain.as_raw()) {
            if entry.extent.width > 0 && entry.extent.height > 0 {
                match unsafe { setup_export(device, entry) } {
                    Ok(()) => {
                        inner.current = Some(swapchain.as_raw());
                        producer::start_capture();
                        debug!(
                            "capture started: {}x{} {:?}",
                            entry.extent.width, entry.extent.height, entry.format
                        );
                    }
                    Err(err) => warn!("export setup failed: {err}"),
                }
            }
        }
    }

    if inner.current != Some(swapchain.as_raw()) {
        return;
    }
    let DeviceInner {
        queues, swapchains, ..
    } = &mut *inner;
    let (Some(queue_state), Some(entry)) = (
        queues.get_mut(&queue.as_raw()),
        swapchains.get_mut(&swapchain.as_raw()),
    ) else {
        return;
    };
    if let Err(err) = unsafe { record_copy(device, queue, queue_state, entry, image_index) } {
        warn!("frame capture failed: {err}");
        teardown_current(device, inner);
    }
}

/// Drop the capture state of the current swapchain, if any, and tell the
/// connection singleton capture has stopped.
pub fn teardown_current(device: &DeviceState, inner: &mut DeviceInner) {
    if let Some(current) = inner.current.take() {
        if let Some(entry) = inner.swapchains.get_mut(&current) {
            if let Some(export) = entry.export.take() {
                unsafe { destroy_export(device, export) };
            }
        }
        producer::stop_capture();
        debug!("capture stopped");
    }
}

/// One-time export setup for a swapchain generation: image, dedicated
/// device-local allocation, DMA-BUF fd, and the `TextureInfo` announcement.
unsafe fn setup_export(device: &DeviceState, entry: &mut SwapchainState) -> Result<()> {
    unsafe {
        let fns = &device.dispatch.core;

        let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(entry.format)
            .extent(vk::Extent3D {
                width: entry.extent.width,
                height: entry.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::GENERAL)
            .push_next(&mut external_info);

        let mut image = vk::Image::null();
        (fns.create_image)(device.handle, &image_info, device.alloc_ptr(), &mut image).result()?;

        // Single LINEAR plane; its pitch and offset go out on the wire.
        let subresource = vk::ImageSubresource::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .array_layer(0);
        let mut layout = vk::SubresourceLayout::default();
        (fns.get_image_subresource_layout)(device.handle, image, &subresource, &mut layout);

        let mut dedicated_reqs = vk::MemoryDedicatedRequirements::default();
        let mut reqs2 = vk::MemoryRequirements2::default().push_next(&mut dedicated_reqs);
        let reqs_info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        (device.dispatch.core_11.get_image_memory_requirements2)(
            device.handle,
            &reqs_info,
            &mut reqs2,
        );
        let requirements = reqs2.memory_requirements;

        let Some(type_index) = select_memory_type(
            &device.memory_props,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) else {
            (fns.destroy_image)(device.handle, image, device.alloc_ptr());
            return Err(CaptureError::NoMemoryType);
        };

        let mut export_alloc = vk::ExportMemoryAllocateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let mut dedicated_alloc = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index)
            .push_next(&mut export_alloc)
            .push_next(&mut dedicated_alloc);
        let mut memory = vk::DeviceMemory::null();
        if let Err(err) =
            (fns.allocate_memory)(device.handle, &alloc_info, device.alloc_ptr(), &mut memory)
                .result()
        {
            (fns.destroy_image)(device.handle, image, device.alloc_ptr());
            return Err(err.into());
        }

        let bind_info = vk::BindImageMemoryInfo::default().image(image).memory(memory);
        if let Err(err) =
            (device.dispatch.core_11.bind_image_memory2)(device.handle, 1, &bind_info).result()
        {
            (fns.free_memory)(device.handle, memory, device.alloc_ptr());
            (fns.destroy_image)(device.handle, image, device.alloc_ptr());
            return Err(err.into());
        }

        let fd_info = vk::MemoryGetFdInfoKHR::default()
            .memory(memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let mut raw_fd: libc::c_int = -1;
        if let Err(err) = (device.dispatch.external_memory_fd.get_memory_fd_khr)(
            device.handle,
            &fd_info,
            &mut raw_fd,
        )
        .result()
        {
            (fns.free_memory)(device.handle, memory, device.alloc_ptr());
            (fns.destroy_image)(device.handle, image, device.alloc_ptr());
            return Err(err.into());
        }
        let fd = OwnedFd::from_raw_fd(raw_fd);

        let mut info = TextureInfo {
            width: entry.extent.width,
            height: entry.extent.height,
            format: protocol::drm_format_for(entry.format),
            flip: false,
            nfd: 1,
            strides: [0; protocol::MAX_PLANES],
            offsets: [0; protocol::MAX_PLANES],
            modifier: DRM_FORMAT_MOD_INVALID,
            winid: 0,
        };
        info.strides[0] = layout.row_pitch as u32;
        info.offsets[0] = layout.offset as u32;

        if let Err(err) = producer::send_texture_info(&info, &[fd.as_fd()]) {
            (fns.free_memory)(device.handle, memory, device.alloc_ptr());
            (fns.destroy_image)(device.handle, image, device.alloc_ptr());
            return Err(err);
        }

        entry.export = Some(ExportImage {
            image,
            memory,
            layout,
            fd,
        });
        Ok(())
    }
}

/// Free an export image and its allocation. Dropping `export.fd` closes the
/// producer's copy of the DMA-BUF fd; the broker's copy is its own to close.
pub unsafe fn destroy_export(device: &DeviceState, export: ExportImage) {
    unsafe {
        let fns = &device.dispatch.core;
        (fns.destroy_image)(device.handle, export.image, device.alloc_ptr());
        (fns.free_memory)(device.handle, export.memory, device.alloc_ptr());
    }
}

/// Grow the ring to the swapchain image count, tearing down any smaller one.
unsafe fn ensure_ring(device: &DeviceState, queue_state: &mut QueueState, count: usize) -> Result<()> {
    if queue_state.ring.len() >= count {
        return Ok(());
    }
    unsafe {
        destroy_ring(device, &mut queue_state.ring);
        let fns = &device.dispatch.core;
        for _ in 0..count {
            let pool_info =
                vk::CommandPoolCreateInfo::default().queue_family_index(queue_state.family_index);
            let mut pool = vk::CommandPool::null();
            (fns.create_command_pool)(device.handle, &pool_info, device.alloc_ptr(), &mut pool)
                .result()?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let mut cmd = vk::CommandBuffer::null();
            if let Err(err) =
                (fns.allocate_command_buffers)(device.handle, &alloc_info, &mut cmd).result()
            {
                (fns.destroy_command_pool)(device.handle, pool, device.alloc_ptr());
                return Err(err.into());
            }

            let fence_info = vk::FenceCreateInfo::default();
            let mut fence = vk::Fence::null();
            if let Err(err) =
                (fns.create_fence)(device.handle, &fence_info, device.alloc_ptr(), &mut fence)
                    .result()
            {
                (fns.destroy_command_pool)(device.handle, pool, device.alloc_ptr());
                return Err(err.into());
            }

            queue_state.ring.slots.push(FrameSlot {
                pool,
                cmd,
                fence,
                busy: false,
            });
        }
    }
    Ok(())
}

/// Wait out busy slots and free every pool and fence in the ring.
pub unsafe fn destroy_ring(device: &DeviceState, ring: &mut FrameRing) {
    unsafe {
        let fns = &device.dispatch.core;
        for slot in ring.slots.drain(..) {
            if slot.busy {
                let _ = (fns.wait_for_fences)(device.handle, 1, &slot.fence, vk::TRUE, u64::MAX);
            }
            (fns.destroy_fence)(device.handle, slot.fence, device.alloc_ptr());
            (fns.destroy_command_pool)(device.handle, slot.pool, device.alloc_ptr());
        }
        ring.index = 0;
    }
}

/// Record and submit the backbuffer → export-image copy for one present.
unsafe fn record_copy(
    device: &DeviceState,
    queue: vk::Queue,
    queue_state: &mut QueueState,
    entry: &SwapchainState,
    image_index: u32,
) -> Result<()> {
    let Some(export) = entry.export.as_ref() else {
        return Ok(());
    };
    let Some(&backbuffer) = entry.images.get(image_index as usize) else {
        return Err(CaptureError::Protocol("present index out of range"));
    };

    unsafe {
        ensure_ring(device, queue_state, entry.images.len())?;
        let fns = &device.dispatch.core;

        let ring = &mut queue_state.ring;
        ring.index = (ring.index + 1) % ring.slots.len();
        let slot = &mut ring.slots[ring.index];
        if slot.busy {
            (fns.wait_for_fences)(device.handle, 1, &slot.fence, vk::TRUE, u64::MAX).result()?;
            (fns.reset_fences)(device.handle, 1, &slot.fence).result()?;
            slot.busy = false;
        }
        (fns.reset_command_pool)(device.handle, slot.pool, vk::CommandPoolResetFlags::empty())
            .result()?;

        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        (fns.begin_command_buffer)(slot.cmd, &begin_info).result()?;

        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);

        let family = queue_state.family_index;
        let to_transfer = [
            vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::MEMORY_READ)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(backbuffer)
                .subresource_range(range),
            // Acquire the export image from the external consumer.
            vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::GENERAL)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_EXTERNAL)
                .dst_queue_family_index(family)
                .image(export.image)
                .subresource_range(range),
        ];
        (fns.cmd_pipeline_barrier)(
            slot.cmd,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            0,
            ptr::null(),
            0,
            ptr::null(),
            to_transfer.len() as u32,
            to_transfer.as_ptr(),
        );

        let layers = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(1);
        let region = vk::ImageCopy::default()
            .src_subresource(layers)
            .dst_subresource(layers)
            .extent(vk::Extent3D {
                width: entry.extent.width,
                height: entry.extent.height,
                depth: 1,
            });
        (fns.cmd_copy_image)(
            slot.cmd,
            backbuffer,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            export.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            1,
            &region,
        );

        // Release the export image back to the external consumer and restore
        // the backbuffer for presentation.
        let from_transfer = [
            vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_READ)
                .dst_access_mask(vk::AccessFlags::MEMORY_READ)
                .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(backbuffer)
                .subresource_range(range),
            vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::empty())
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(family)
                .dst_queue_family_index(vk::QUEUE_FAMILY_EXTERNAL)
                .image(export.image)
                .subresource_range(range),
        ];
        (fns.cmd_pipeline_barrier)(
            slot.cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            0,
            ptr::null(),
            0,
            ptr::null(),
            from_transfer.len() as u32,
            from_transfer.as_ptr(),
        );

        (fns.end_command_buffer)(slot.cmd).result()?;

        let commands = [slot.cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&commands);
        (fns.queue_submit)(queue, 1, &submit, slot.fence).result()?;
        slot.busy = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (index, &property_flags) in flags.iter().enumerate() {
            props.memory_types[index].property_flags = property_flags;
        }
        props
    }

    #[test]
    fn memory_type_selection_prefers_the_lowest_allowed_index() {
        let props = memory_props(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        // all types allowed: index 1 is the first device-local one
        assert_eq!(
            select_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(1)
        );
        // type 1 masked out
        assert_eq!(
            select_memory_type(&props, 0b101, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(2)
        );
        // nothing device-local allowed
        assert_eq!(
            select_memory_type(&props, 0b001, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }

    #[test]
    fn empty_requirement_matches_any_allowed_type() {
        let props = memory_props(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        assert_eq!(
            select_memory_type(&props, 0b1, vk::MemoryPropertyFlags::empty()),
            Some(0)
        );
    }
}
