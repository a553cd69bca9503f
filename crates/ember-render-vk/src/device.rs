// SPDX-License-Identifier: CEPL-1.0
use crate::error::{CheckVk, VkError, VkResult};
use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, Allocator, AllocatorCreateDesc};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use std::ffi::{c_void, CStr};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    /// Dedicated transfer family, or `graphics` when the device has none.
    pub transfer: u32,
}

impl QueueFamilies {
    fn unique(&self) -> Vec<u32> {
        let mut v = vec![self.graphics, self.present, self.transfer];
        v.sort_unstable();
        v.dedup();
        v
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EnabledFeatures {
    pub sampler_anisotropy: bool,
    pub sample_rate_shading: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceRequest {
    pub preferred_index: Option<usize>,
    pub validation: bool,
}

/// Graphics family first, present on the same family when possible,
/// transfer on a family without graphics when one exists.
pub(crate) fn select_queue_families(
    props: &[vk::QueueFamilyProperties],
    can_present: impl Fn(u32) -> bool,
) -> Option<QueueFamilies> {
    let graphics = props
        .iter()
        .position(|p| p.queue_count > 0 && p.queue_flags.contains(vk::QueueFlags::GRAPHICS))?
        as u32;
    let present = if can_present(graphics) {
        graphics
    } else {
        (0..props.len() as u32).find(|&i| props[i as usize].queue_count > 0 && can_present(i))?
    };
    let transfer = props
        .iter()
        .position(|p| {
            p.queue_count > 0
                && p.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !p.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .map(|i| i as u32)
        .unwrap_or(graphics);
    Some(QueueFamilies {
        graphics,
        present,
        transfer,
    })
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Candidate {
    pub device_type: vk::PhysicalDeviceType,
    pub suitable: bool,
}

fn type_rank(t: vk::PhysicalDeviceType) -> u32 {
    match t {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

/// Preferred index wins when it names a suitable device; otherwise the
/// best-ranked suitable device, earliest on ties.
pub(crate) fn choose_physical_device(
    candidates: &[Candidate],
    preferred: Option<usize>,
) -> Option<usize> {
    if let Some(i) = preferred {
        match candidates.get(i) {
            Some(c) if c.suitable => return Some(i),
            _ => warn!("vk: preferred device {i} unavailable or unsuitable; auto-selecting"),
        }
    }
    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.suitable)
        .max_by(|(ia, a), (ib, b)| {
            type_rank(a.device_type)
                .cmp(&type_rank(b.device_type))
                .then(ib.cmp(ia))
        })
        .map(|(i, _)| i)
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader hands us a valid callback struct for the duration of the call.
    let msg = unsafe {
        let p = (*data).p_message;
        if p.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr(p).to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[validation] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[validation] {msg}");
    } else {
        debug!("[validation] {msg}");
    }
    vk::FALSE
}

fn has_layer(entry: &Entry, name: &CStr) -> bool {
    unsafe { entry.enumerate_instance_layer_properties() }
        .unwrap_or_default()
        .iter()
        .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == name))
}

unsafe fn create_instance(
    entry: &Entry,
    display_raw: RawDisplayHandle,
    validation: bool,
) -> VkResult<Instance> {
    let app = c"ember";
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: 0,
        p_engine_name: app.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_1,
        ..Default::default()
    };

    let mut exts = ash_window::enumerate_required_extensions(display_raw)
        .check("enumerate_required_extensions")?
        .to_vec();
    let layers = [VALIDATION_LAYER.as_ptr()];
    let (layer_count, layer_ptr) = if validation {
        exts.push(debug_utils::NAME.as_ptr());
        (layers.len() as u32, layers.as_ptr())
    } else {
        (0, std::ptr::null())
    };

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: exts.len() as u32,
        pp_enabled_extension_names: exts.as_ptr(),
        enabled_layer_count: layer_count,
        pp_enabled_layer_names: layer_ptr,
        ..Default::default()
    };
    unsafe { entry.create_instance(&create_info, None) }.check("vkCreateInstance")
}

unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> VkResult<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = unsafe { loader.create_debug_utils_messenger(&ci, None) }
        .check("vkCreateDebugUtilsMessengerEXT")?;
    Ok((loader, messenger))
}

unsafe fn supports_swapchain(instance: &Instance, phys: vk::PhysicalDevice) -> bool {
    unsafe { instance.enumerate_device_extension_properties(phys) }
        .unwrap_or_default()
        .iter()
        .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == swapchain::NAME))
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    props
        .device_name_as_c_str()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Instance, surface, logical device, queues and the memory allocator.
/// Shared by every other engine object and immutable after creation.
pub struct Device {
    _entry: Entry,
    instance: Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    physical: vk::PhysicalDevice,
    raw: ash::Device,
    swapchain_loader: swapchain::Device,
    families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    transfer_queue: vk::Queue,
    properties: vk::PhysicalDeviceProperties,
    features: EnabledFeatures,
    allocator: Mutex<Option<Allocator>>,
}

impl Device {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        req: &DeviceRequest,
    ) -> VkResult<Self> {
        // STRICT ORDER:
        // 1) Instance (WSI extensions + optional validation)
        // 2) Surface from THIS instance
        // 3) Physical device + queue families checked AGAINST the surface
        // 4) Logical device, queues, allocator
        let dh = display.display_handle()?.as_raw();
        let wh = window.window_handle()?.as_raw();

        let entry = unsafe { Entry::load()? };
        let validation = if req.validation && !has_layer(&entry, VALIDATION_LAYER) {
            warn!("vk: validation requested but VK_LAYER_KHRONOS_validation is not installed");
            false
        } else {
            req.validation
        };
        let instance = unsafe { create_instance(&entry, dh, validation)? };
        let debug = if validation {
            Some(unsafe { create_debug_messenger(&entry, &instance)? })
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = unsafe { ash_window::create_surface(&entry, &instance, dh, wh, None) }
            .check("vkCreateSurfaceKHR")?;

        let physicals =
            unsafe { instance.enumerate_physical_devices() }.check("vkEnumeratePhysicalDevices")?;
        let mut candidates = Vec::with_capacity(physicals.len());
        let mut families = Vec::with_capacity(physicals.len());
        for &phys in &physicals {
            let qprops = unsafe { instance.get_physical_device_queue_family_properties(phys) };
            let fam = select_queue_families(&qprops, |i| unsafe {
                surface_loader
                    .get_physical_device_surface_support(phys, i, surface)
                    .unwrap_or(false)
            });
            let props = unsafe { instance.get_physical_device_properties(phys) };
            let suitable = fam.is_some() && unsafe { supports_swapchain(&instance, phys) };
            debug!(
                "vk: device candidate '{}' type={:?} suitable={}",
                device_name(&props),
                props.device_type,
                suitable
            );
            candidates.push(Candidate {
                device_type: props.device_type,
                suitable,
            });
            families.push(fam);
        }

        let chosen = choose_physical_device(&candidates, req.preferred_index);
        let (index, families) = match chosen.and_then(|i| families[i].map(|f| (i, f))) {
            Some(pair) => pair,
            None => {
                unsafe {
                    surface_loader.destroy_surface(surface, None);
                    if let Some((loader, messenger)) = &debug {
                        loader.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(VkError::NoSuitableDevice);
            }
        };
        let physical = physicals[index];
        let properties = unsafe { instance.get_physical_device_properties(physical) };
        info!(
            "vk: using device {} '{}' (graphics={}, present={}, transfer={})",
            index,
            device_name(&properties),
            families.graphics,
            families.present,
            families.transfer
        );

        let supported = unsafe { instance.get_physical_device_features(physical) };
        let features = EnabledFeatures {
            sampler_anisotropy: supported.sampler_anisotropy == vk::TRUE,
            sample_rate_shading: supported.sample_rate_shading == vk::TRUE,
        };
        let enabled = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: supported.sampler_anisotropy,
            sample_rate_shading: supported.sample_rate_shading,
            ..Default::default()
        };

        let priorities = [1.0_f32];
        let queue_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();
        let device_exts = [swapchain::NAME.as_ptr()];
        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: queue_infos.len() as u32,
            p_queue_create_infos: queue_infos.as_ptr(),
            enabled_extension_count: device_exts.len() as u32,
            pp_enabled_extension_names: device_exts.as_ptr(),
            p_enabled_features: &enabled,
            ..Default::default()
        };
        let raw = unsafe { instance.create_device(physical, &dinfo, None) }
            .check("vkCreateDevice")?;

        let graphics_queue = unsafe { raw.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { raw.get_device_queue(families.present, 0) };
        let transfer_queue = unsafe { raw.get_device_queue(families.transfer, 0) };
        let swapchain_loader = swapchain::Device::new(&instance, &raw);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: raw.clone(),
            physical_device: physical,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            _entry: entry,
            instance,
            debug,
            surface_loader,
            surface,
            physical,
            raw,
            swapchain_loader,
            families,
            graphics_queue,
            present_queue,
            transfer_queue,
            properties,
            features,
            allocator: Mutex::new(Some(allocator)),
        })
    }

    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }
    pub fn instance(&self) -> &Instance {
        &self.instance
    }
    pub fn physical(&self) -> vk::PhysicalDevice {
        self.physical
    }
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }
    pub fn surface_loader(&self) -> &surface::Instance {
        &self.surface_loader
    }
    pub fn swapchain_loader(&self) -> &swapchain::Device {
        &self.swapchain_loader
    }
    pub fn families(&self) -> QueueFamilies {
        self.families
    }
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }
    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }
    pub fn features(&self) -> EnabledFeatures {
        self.features
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical, format)
        }
    }

    /// Sample counts usable for both color and depth framebuffer attachments.
    pub fn framebuffer_sample_counts(&self) -> vk::SampleCountFlags {
        let l = self.limits();
        l.framebuffer_color_sample_counts & l.framebuffer_depth_sample_counts
    }

    pub fn allocate(&self, desc: &AllocationCreateDesc<'_>) -> VkResult<Allocation> {
        let mut guard = self.allocator.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(a) => Ok(a.allocate(desc)?),
            None => Err(VkError::Api {
                call: "allocate",
                result: vk::Result::ERROR_INITIALIZATION_FAILED,
            }),
        }
    }

    pub fn free(&self, allocation: Allocation) {
        let mut guard = self.allocator.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(a) = guard.as_mut() {
            if let Err(e) = a.free(allocation) {
                warn!("vk: allocator free failed: {e}");
            }
        }
    }

    pub fn wait_idle(&self) {
        if let Err(e) = unsafe { self.raw.device_wait_idle() } {
            warn!("vk: device_wait_idle: {}", crate::error_to_string(e));
        }
    }
}

// STRICT TEARDOWN ORDER:
// - Allocator (frees its memory blocks through the device)
// - Device
// - Surface
// - Debug messenger
// - Instance last.
impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.raw.device_wait_idle().ok();
            drop(
                self.allocator
                    .get_mut()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take(),
            );
            self.raw.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
