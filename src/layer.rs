//! The Vulkan layer: loader negotiation and intercepted entry points.
//!
//! The layer tracks instances, devices, queues and swapchains, and hooks
//! `QueuePresentKHR` to copy the presented backbuffer into an exportable
//! image (see [`crate::export`]). Everything it cannot handle is forwarded to
//! the next layer in the chain; a missing required entry point downgrades the
//! affected instance/device to pure pass-through instead of failing the
//! application.

use std::collections::HashMap;
use std::ffi::{CStr, c_char};
use std::mem;
use std::ptr;
use std::slice;
use std::sync::{Arc, Mutex, Once};

use ash::vk;
use ash::vk::Handle;
use log::{debug, error, warn};
use once_cell::sync::Lazy;

use crate::dispatch::{
    self, DeviceDispatch, InstanceDispatch, LAYER_NEGOTIATE_INTERFACE_STRUCT,
    LOADER_LAYER_INTERFACE_VERSION, NegotiateLayerInterface,
};
use crate::export::{self, ExportImage, FrameRing};
use crate::registry::{Registry, dispatch_key};
use crate::{lock, producer};

static LAYER_INIT: Once = Once::new();
static INSTANCES: Lazy<Registry<InstanceState>> = Lazy::new(Registry::new);
static DEVICES: Lazy<Registry<DeviceState>> = Lazy::new(Registry::new);

pub struct InstanceState {
    pub handle: vk::Instance,
    pub dispatch: InstanceDispatch,
    /// False when a required next-layer entry point is missing; the layer
    /// then forwards everything untouched.
    pub valid: bool,
}

// Raw handles and function pointers; shared read-only after creation.
unsafe impl Send for InstanceState {}
unsafe impl Sync for InstanceState {}

pub struct DeviceState {
    pub handle: vk::Device,
    pub physical_device: vk::PhysicalDevice,
    pub dispatch: DeviceDispatch,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    pub allocator: Option<vk::AllocationCallbacks<'static>>,
    pub valid: bool,
    pub inner: Mutex<DeviceInner>,
}

unsafe impl Send for DeviceState {}
unsafe impl Sync for DeviceState {}

impl DeviceState {
    pub fn alloc_ptr(&self) -> *const vk::AllocationCallbacks<'static> {
        self.allocator
            .as_ref()
            .map_or(ptr::null(), |callbacks| callbacks as *const _)
    }
}

#[derive(Default)]
pub struct DeviceInner {
    /// Keyed by raw queue handle.
    pub queues: HashMap<u64, QueueState>,
    /// Keyed by raw swapchain handle.
    pub swapchains: HashMap<u64, SwapchainState>,
    /// Raw handle of the swapchain currently being captured, if any.
    pub current: Option<u64>,
}

pub struct QueueState {
    pub family_index: u32,
    pub supports_transfer: bool,
    pub ring: FrameRing,
}

pub struct SwapchainState {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub images: Vec<vk::Image>,
    pub export: Option<ExportImage>,
}

fn instance_state<H: Handle>(handle: H) -> Option<Arc<InstanceState>> {
    INSTANCES.get(dispatch_key(handle))
}

fn device_state<H: Handle>(handle: H) -> Option<Arc<DeviceState>> {
    DEVICES.get(dispatch_key(handle))
}

macro_rules! layer_proc {
    ($pfn:ty, $f:expr) => {
        Some(unsafe { mem::transmute::<$pfn, unsafe extern "system" fn()>($f) })
    };
}

/// Loader negotiation entry point, named by the layer manifest.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "system" fn vkNegotiateLoaderLayerInterfaceVersion(
    p_interface: *mut NegotiateLayerInterface,
) -> vk::Result {
    LAYER_INIT.call_once(|| {
        Lazy::force(&INSTANCES);
        Lazy::force(&DEVICES);
        producer::init();
        debug!("capture layer initialized");
    });

    let Some(interface) = (unsafe { p_interface.as_mut() }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    if interface.s_type != LAYER_NEGOTIATE_INTERFACE_STRUCT
        || interface.loader_layer_interface_version < 2
    {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    interface.loader_layer_interface_version = interface
        .loader_layer_interface_version
        .min(LOADER_LAYER_INTERFACE_VERSION);
    interface.pfn_get_instance_proc_addr = Some(vkGetInstanceProcAddr);
    interface.pfn_get_device_proc_addr = Some(vkGetDeviceProcAddr);
    interface.pfn_get_physical_device_proc_addr = None;
    vk::Result::SUCCESS
}

#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "system" fn vkGetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    match unsafe { CStr::from_ptr(p_name) }.to_bytes() {
        b"vkGetInstanceProcAddr" => {
            layer_proc!(vk::PFN_vkGetInstanceProcAddr, vkGetInstanceProcAddr)
        }
        b"vkGetDeviceProcAddr" => layer_proc!(vk::PFN_vkGetDeviceProcAddr, vkGetDeviceProcAddr),
        b"vkCreateInstance" => layer_proc!(vk::PFN_vkCreateInstance, create_instance),
        b"vkDestroyInstance" => layer_proc!(vk::PFN_vkDestroyInstance, destroy_instance),
        b"vkCreateDevice" => layer_proc!(vk::PFN_vkCreateDevice, create_device),
        b"vkDestroyDevice" => layer_proc!(vk::PFN_vkDestroyDevice, destroy_device),
        _ => {
            let state = instance_state(instance)?;
            unsafe { (state.dispatch.gipa)(instance, p_name) }
        }
    }
}

#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub unsafe extern "system" fn vkGetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(p_name) }.to_bytes();
    match name {
        b"vkGetDeviceProcAddr" => layer_proc!(vk::PFN_vkGetDeviceProcAddr, vkGetDeviceProcAddr),
        b"vkDestroyDevice" => layer_proc!(vk::PFN_vkDestroyDevice, destroy_device),
        // Interpose the swapchain path only where the next layer implements it.
        b"vkCreateSwapchainKHR" | b"vkDestroySwapchainKHR" | b"vkQueuePresentKHR" => {
            let state = device_state(device)?;
            unsafe { (state.dispatch.gdpa)(device, p_name) }?;
            match name {
                b"vkCreateSwapchainKHR" => {
                    layer_proc!(vk::PFN_vkCreateSwapchainKHR, create_swapchain_khr)
                }
                b"vkDestroySwapchainKHR" => {
                    layer_proc!(vk::PFN_vkDestroySwapchainKHR, destroy_swapchain_khr)
                }
                _ => layer_proc!(vk::PFN_vkQueuePresentKHR, queue_present_khr),
            }
        }
        _ => {
            let state = device_state(device)?;
            unsafe { (state.dispatch.gdpa)(device, p_name) }
        }
    }
}

const REQUIRED_INSTANCE_FNS: &[&CStr] = &[
    c"vkGetPhysicalDeviceQueueFamilyProperties",
    c"vkGetPhysicalDeviceMemoryProperties",
    c"vkDestroyInstance",
];

unsafe extern "system" fn create_instance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    unsafe {
        let create_info = &*p_create_info;
        let Some(link) = dispatch::find_instance_link(create_info.p_next) else {
            error!("no loader link info on the instance chain");
            return vk::Result::ERROR_INITIALIZATION_FAILED;
        };
        let layer_info = &mut *link.u.p_layer_info;
        let next_gipa = layer_info.pfn_next_get_instance_proc_addr;
        // advance the chain for the layer below us
        link.u.p_layer_info = layer_info.p_next;

        let Some(raw_create) = next_gipa(vk::Instance::null(), c"vkCreateInstance".as_ptr()) else {
            return vk::Result::ERROR_INITIALIZATION_FAILED;
        };
        let next_create: vk::PFN_vkCreateInstance = mem::transmute(raw_create);

        // The export path needs the 1.1/1.2 external-memory and dedicated
        // allocation machinery, so raise the requested API version.
        let mut app_info = if create_info.p_application_info.is_null() {
            vk::ApplicationInfo::default()
        } else {
            *create_info.p_application_info
        };
        if app_info.api_version < vk::API_VERSION_1_2 {
            app_info.api_version = vk::API_VERSION_1_2;
        }
        let mut patched = *create_info;
        patched.p_application_info = &app_info;

        let mut result = next_create(&patched, p_allocator, p_instance);
        if result != vk::Result::SUCCESS {
            result = next_create(p_create_info, p_allocator, p_instance);
        }
        if result != vk::Result::SUCCESS {
            return result;
        }

        let instance = *p_instance;
        let valid = REQUIRED_INSTANCE_FNS
            .iter()
            .all(|name| next_gipa(instance, name.as_ptr()).is_some());
        if !valid {
            warn!("missing instance entry points, capture disabled for this instance");
        }
        let dispatch = InstanceDispatch::load(next_gipa, instance);
        INSTANCES.insert(
            dispatch_key(instance),
            Arc::new(InstanceState {
                handle: instance,
                dispatch,
                valid,
            }),
        );
        result
    }
}

unsafe extern "system" fn destroy_instance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    let Some(state) = INSTANCES.remove(dispatch_key(instance)) else {
        error!("destroying an unknown instance");
        return;
    };
    unsafe { (state.dispatch.core.destroy_instance)(instance, p_allocator) };
}

const REQUIRED_DEVICE_FNS: &[&CStr] = &[
    c"vkCreateImage",
    c"vkDestroyImage",
    c"vkGetImageSubresourceLayout",
    c"vkGetImageMemoryRequirements2",
    c"vkAllocateMemory",
    c"vkFreeMemory",
    c"vkBindImageMemory2",
    c"vkGetMemoryFdKHR",
    c"vkCreateCommandPool",
    c"vkDestroyCommandPool",
    c"vkResetCommandPool",
    c"vkAllocateCommandBuffers",
    c"vkBeginCommandBuffer",
    c"vkEndCommandBuffer",
    c"vkCmdPipelineBarrier",
    c"vkCmdCopyImage",
    c"vkGetDeviceQueue",
    c"vkQueueSubmit",
    c"vkCreateFence",
    c"vkDestroyFence",
    c"vkWaitForFences",
    c"vkResetFences",
    c"vkDestroyDevice",
];

const CAPTURE_DEVICE_EXTENSIONS: &[&CStr] = &[
    ash::khr::external_memory_fd::NAME,
    ash::ext::external_memory_dma_buf::NAME,
];

unsafe extern "system" fn create_device(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    unsafe {
        let create_info = &*p_create_info;
        let Some(link) = dispatch::find_device_link(create_info.p_next) else {
            error!("no loader link info on the device chain");
            return vk::Result::ERROR_INITIALIZATION_FAILED;
        };
        let layer_info = &mut *link.u.p_layer_info;
        let next_gipa = layer_info.pfn_next_get_instance_proc_addr;
        let next_gdpa = layer_info.pfn_next_get_device_proc_addr;
        link.u.p_layer_info = layer_info.p_next;

        let Some(raw_create) = next_gipa(vk::Instance::null(), c"vkCreateDevice".as_ptr()) else {
            return vk::Result::ERROR_INITIALIZATION_FAILED;
        };
        let next_create: vk::PFN_vkCreateDevice = mem::transmute(raw_create);

        // Make sure the fd-export extensions are on; the application's own
        // list is left untouched if it already has them.
        let requested: &[*const c_char] = if create_info.enabled_extension_count == 0 {
            &[]
        } else {
            slice::from_raw_parts(
                create_info.pp_enabled_extension_names,
                create_info.enabled_extension_count as usize,
            )
        };
        let mut extensions = requested.to_vec();
        for required in CAPTURE_DEVICE_EXTENSIONS {
            let present = requested
                .iter()
                .any(|&name| CStr::from_ptr(name) == *required);
            if !present {
                extensions.push(required.as_ptr());
            }
        }
        let mut patched = *create_info;
        patched.enabled_extension_count = extensions.len() as u32;
        patched.pp_enabled_extension_names = extensions.as_ptr();

        let result = next_create(physical_device, &patched, p_allocator, p_device);
        if result != vk::Result::SUCCESS {
            return result;
        }
        let device = *p_device;

        let mut valid = REQUIRED_DEVICE_FNS
            .iter()
            .all(|name| next_gdpa(device, name.as_ptr()).is_some());
        if !valid {
            warn!("missing device entry points, capture disabled for this device");
        }
        let dispatch = DeviceDispatch::load(next_gdpa, device);

        let mut inner = DeviceInner::default();
        let mut memory_props = vk::PhysicalDeviceMemoryProperties::default();
        // Physical devices alias their instance's dispatch pointer.
        match instance_state(physical_device) {
            Some(inst) if inst.valid => {
                let mut count = 0u32;
                (inst.dispatch.core.get_physical_device_queue_family_properties)(
                    physical_device,
                    &mut count,
                    ptr::null_mut(),
                );
                let mut families = vec![vk::QueueFamilyProperties::default(); count as usize];
                (inst.dispatch.core.get_physical_device_queue_family_properties)(
                    physical_device,
                    &mut count,
                    families.as_mut_ptr(),
                );
                (inst.dispatch.core.get_physical_device_memory_properties)(
                    physical_device,
                    &mut memory_props,
                );

                let queue_infos = slice::from_raw_parts(
                    create_info.p_queue_create_infos,
                    create_info.queue_create_info_count as usize,
                );
                for queue_info in queue_infos {
                    let family = queue_info.queue_family_index;
                    let supports_transfer = families
                        .get(family as usize)
                        .map(|props| {
                            props.queue_flags.intersects(
                                vk::QueueFlags::GRAPHICS
                                    | vk::QueueFlags::COMPUTE
                                    | vk::QueueFlags::TRANSFER,
                            )
                        })
                        .unwrap_or(false);
                    for index in 0..queue_info.queue_count {
                        let mut queue = vk::Queue::null();
                        (dispatch.core.get_device_queue)(device, family, index, &mut queue);
                        inner.queues.insert(
                            queue.as_raw(),
                            QueueState {
                                family_index: family,
                                supports_transfer,
                                ring: FrameRing::default(),
                            },
                        );
                    }
                }
            }
            _ => valid = false,
        }

        let allocator = (!p_allocator.is_null())
            .then(|| *(p_allocator as *const vk::AllocationCallbacks<'static>));
        DEVICES.insert(
            dispatch_key(device),
            Arc::new(DeviceState {
                handle: device,
                physical_device,
                dispatch,
                memory_props,
                allocator,
                valid,
                inner: Mutex::new(inner),
            }),
        );
        result
    }
}

unsafe extern "system" fn destroy_device(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    let Some(state) = DEVICES.remove(dispatch_key(device)) else {
        error!("destroying an unknown device");
        return;
    };
    {
        let mut inner = lock(&state.inner);
        let inner = &mut *inner;
        for queue in inner.queues.values_mut() {
            unsafe { export::destroy_ring(&state, &mut queue.ring) };
        }
        for swapchain in inner.swapchains.values_mut() {
            if let Some(export) = swapchain.export.take() {
                unsafe { export::destroy_export(&state, export) };
            }
        }
        if inner.current.take().is_some() {
            producer::stop_capture();
        }
    }
    unsafe { (state.dispatch.core.destroy_device)(device, p_allocator) };
}

unsafe extern "system" fn create_swapchain_khr(
    device: vk::Device,
    p_create_info: *const vk::SwapchainCreateInfoKHR<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    let Some(state) = device_state(device) else {
        error!("swapchain creation on an unknown device");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    unsafe {
        let create_info = &*p_create_info;
        // The backbuffer must be copyable into the export image.
        let mut patched = *create_info;
        patched.image_usage |= vk::ImageUsageFlags::TRANSFER_SRC;

        let next_create = state.dispatch.swapchain.create_swapchain_khr;
        let mut result = next_create(device, &patched, p_allocator, p_swapchain);
        if result != vk::Result::SUCCESS {
            result = next_create(device, p_create_info, p_allocator, p_swapchain);
        }
        if result != vk::Result::SUCCESS {
            return result;
        }

        let swapchain = *p_swapchain;
        let mut count = 0u32;
        let mut images = Vec::new();
        let enumerate = state.dispatch.swapchain.get_swapchain_images_khr;
        if enumerate(device, swapchain, &mut count, ptr::null_mut()) == vk::Result::SUCCESS {
            images = vec![vk::Image::null(); count as usize];
            if enumerate(device, swapchain, &mut count, images.as_mut_ptr()) != vk::Result::SUCCESS
            {
                images.clear();
            }
        }

        lock(&state.inner).swapchains.insert(
            swapchain.as_raw(),
            SwapchainState {
                extent: create_info.image_extent,
                format: create_info.image_format,
                images,
                export: None,
            },
        );
        debug!(
            "swapchain created: {}x{} {:?}",
            create_info.image_extent.width, create_info.image_extent.height,
            create_info.image_format
        );
        result
    }
}

unsafe extern "system" fn destroy_swapchain_khr(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    let Some(state) = device_state(device) else {
        error!("destroying a swapchain on an unknown device");
        return;
    };
    {
        let mut inner = lock(&state.inner);
        if let Some(mut entry) = inner.swapchains.remove(&swapchain.as_raw()) {
            if let Some(export) = entry.export.take() {
                unsafe { export::destroy_export(&state, export) };
            }
        }
        if inner.current == Some(swapchain.as_raw()) {
            inner.current = None;
            producer::stop_capture();
        }
    }
    unsafe { (state.dispatch.swapchain.destroy_swapchain_khr)(device, swapchain, p_allocator) };
}

unsafe extern "system" fn queue_present_khr(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    let Some(state) = device_state(queue) else {
        error!("present on an unknown queue");
        return vk::Result::ERROR_DEVICE_LOST;
    };
    unsafe {
        let present_info = &*p_present_info;
        if state.valid && present_info.swapchain_count > 0 {
            let swapchains =
                slice::from_raw_parts(present_info.p_swapchains, present_info.swapchain_count as usize);
            let indices = slice::from_raw_parts(
                present_info.p_image_indices,
                present_info.swapchain_count as usize,
            );
            // Only the first presented swapchain is captured.
            export::capture_present(&state, queue, swapchains[0], indices[0]);
        }
        (state.dispatch.swapchain.queue_present_khr)(queue, p_present_info)
    }
}
