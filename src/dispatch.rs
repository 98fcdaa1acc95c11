//! Loader-negotiation ABI and next-layer dispatch tables.
//!
//! The negotiation structs mirror `vk_layer.h`, which `ash` does not bind
//! (they are part of the loader contract, not the Vulkan API). Layout and
//! semantics follow the loader's layer-interface documentation: the loader
//! hands each layer a chain link carrying the next layer's
//! `GetInstanceProcAddr`/`GetDeviceProcAddr`, and the layer must advance the
//! chain before calling down.

use std::ffi::{c_char, c_void};
use std::mem;

use ash::vk;

/// `VkNegotiateLayerStructType::LAYER_NEGOTIATE_INTERFACE_STRUCT`.
pub const LAYER_NEGOTIATE_INTERFACE_STRUCT: i32 = 1;
/// Highest loader-layer interface version this layer speaks.
pub const LOADER_LAYER_INTERFACE_VERSION: u32 = 2;
/// `VkLayerFunction::VK_LAYER_LINK_INFO`.
pub const LAYER_LINK_INFO: i32 = 0;

pub type PfnGetPhysicalDeviceProcAddr =
    unsafe extern "system" fn(vk::Instance, *const c_char) -> vk::PFN_vkVoidFunction;

/// `VkNegotiateLayerInterface`.
#[repr(C)]
pub struct NegotiateLayerInterface {
    pub s_type: i32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    pub pfn_get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
}

/// One link of the loader's instance-creation chain.
#[repr(C)]
pub struct LayerInstanceLink {
    pub p_next: *mut LayerInstanceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_physical_device_proc_addr: *const c_void,
}

#[repr(C)]
pub union LayerInstanceInfoUnion {
    pub p_layer_info: *mut LayerInstanceLink,
    pub pfn_set_instance_loader_data: *const c_void,
}

/// `VkLayerInstanceCreateInfo`, found on the `VkInstanceCreateInfo` pNext
/// chain with `s_type == LOADER_INSTANCE_CREATE_INFO`.
#[repr(C)]
pub struct LayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub u: LayerInstanceInfoUnion,
}

#[repr(C)]
pub struct LayerDeviceLink {
    pub p_next: *mut LayerDeviceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
pub union LayerDeviceInfoUnion {
    pub p_layer_info: *mut LayerDeviceLink,
    pub pfn_set_device_loader_data: *const c_void,
}

/// `VkLayerDeviceCreateInfo`, found on the `VkDeviceCreateInfo` pNext chain.
#[repr(C)]
pub struct LayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub u: LayerDeviceInfoUnion,
}

/// Find the loader's link-info node on an instance-creation pNext chain.
pub unsafe fn find_instance_link<'a>(p_next: *const c_void) -> Option<&'a mut LayerInstanceCreateInfo> {
    let mut node = p_next as *mut LayerInstanceCreateInfo;
    while !node.is_null() {
        let candidate = unsafe { &mut *node };
        if candidate.s_type == vk::StructureType::LOADER_INSTANCE_CREATE_INFO
            && candidate.function == LAYER_LINK_INFO
            && !unsafe { candidate.u.p_layer_info }.is_null()
        {
            return Some(candidate);
        }
        node = candidate.p_next as *mut LayerInstanceCreateInfo;
    }
    None
}

/// Find the loader's link-info node on a device-creation pNext chain.
pub unsafe fn find_device_link<'a>(p_next: *const c_void) -> Option<&'a mut LayerDeviceCreateInfo> {
    let mut node = p_next as *mut LayerDeviceCreateInfo;
    while !node.is_null() {
        let candidate = unsafe { &mut *node };
        if candidate.s_type == vk::StructureType::LOADER_DEVICE_CREATE_INFO
            && candidate.function == LAYER_LINK_INFO
            && !unsafe { candidate.u.p_layer_info }.is_null()
        {
            return Some(candidate);
        }
        node = candidate.p_next as *mut LayerDeviceCreateInfo;
    }
    None
}

/// Instance-level entry points of the next layer.
pub struct InstanceDispatch {
    pub gipa: vk::PFN_vkGetInstanceProcAddr,
    pub core: ash::InstanceFnV1_0,
}

impl InstanceDispatch {
    pub unsafe fn load(gipa: vk::PFN_vkGetInstanceProcAddr, instance: vk::Instance) -> Self {
        let core = ash::InstanceFnV1_0::load(|name| unsafe {
            mem::transmute::<vk::PFN_vkVoidFunction, *const c_void>(gipa(instance, name.as_ptr()))
        });
        Self { gipa, core }
    }
}

/// Device-level entry points of the next layer, loaded through its
/// `GetDeviceProcAddr` so calls skip the loader trampoline.
pub struct DeviceDispatch {
    pub gdpa: vk::PFN_vkGetDeviceProcAddr,
    pub core: ash::DeviceFnV1_0,
    pub core_11: ash::DeviceFnV1_1,
    pub swapchain: ash::khr::swapchain::DeviceFn,
    pub external_memory_fd: ash::khr::external_memory_fd::DeviceFn,
}

impl DeviceDispatch {
    pub unsafe fn load(gdpa: vk::PFN_vkGetDeviceProcAddr, device: vk::Device) -> Self {
        let loader = |name: &std::ffi::CStr| unsafe {
            mem::transmute::<vk::PFN_vkVoidFunction, *const c_void>(gdpa(device, name.as_ptr()))
        };
        Self {
            gdpa,
            core: ash::DeviceFnV1_0::load(loader),
            core_11: ash::DeviceFnV1_1::load(loader),
            swapchain: ash::khr::swapchain::DeviceFn::load(loader),
            external_memory_fd: ash::khr::external_memory_fd::DeviceFn::load(loader),
        }
    }
}
