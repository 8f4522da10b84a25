// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, adapter and logical device.

use anyhow::{anyhow, Context, Result};
use ash::ext::debug_utils;
use ash::khr::{dynamic_rendering, surface, swapchain};
use ash::{vk, Entry};
use bitflags::bitflags;
use orbit_render::RenderError;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use std::ffi::{c_char, c_void, CStr, CString};
use tracing::{debug, error, info, trace, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const PORTABILITY_ENUMERATION: &CStr = c"VK_KHR_portability_enumeration";
const PORTABILITY_SUBSET: &CStr = c"VK_KHR_portability_subset";

const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

bitflags! {
    /// Optional capabilities found on the selected adapter.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DeviceFeatures: u32 {
        /// Vulkan 1.3 core `dynamicRendering`.
        const CORE_DYNAMIC_RENDERING = 1 << 0;
        /// `VK_KHR_dynamic_rendering` on a Vulkan 1.2 device.
        const KHR_DYNAMIC_RENDERING = 1 << 1;
        const SAMPLER_ANISOTROPY = 1 << 2;
        /// Non-conformant implementation (MoltenVK and friends).
        const PORTABILITY_SUBSET = 1 << 3;
    }
}

/// How frames reach their attachments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderPath {
    /// Vulkan 1.3 core dynamic rendering.
    Core13,
    /// Vulkan 1.2 + VK_KHR_dynamic_rendering.
    KhrDynamic,
    /// Explicit render pass + one framebuffer per swapchain image.
    RenderPass,
}

impl RenderPath {
    pub fn is_dynamic(self) -> bool {
        !matches!(self, Self::RenderPass)
    }
}

/// The version a device may be driven at: capped by what the instance asked for.
pub fn effective_api_version(instance_api: u32, device_api: u32) -> u32 {
    instance_api.min(device_api)
}

/// `api_version` must already be the effective version, see [`effective_api_version`].
pub fn choose_render_path(
    features: DeviceFeatures,
    api_version: u32,
    force_render_pass: bool,
) -> RenderPath {
    if force_render_pass {
        RenderPath::RenderPass
    } else if api_version >= vk::API_VERSION_1_3
        && features.contains(DeviceFeatures::CORE_DYNAMIC_RENDERING)
    {
        RenderPath::Core13
    } else if api_version >= vk::API_VERSION_1_2
        && features.contains(DeviceFeatures::KHR_DYNAMIC_RENDERING)
    {
        RenderPath::KhrDynamic
    } else {
        RenderPath::RenderPass
    }
}

/// Lower is better.
pub fn device_type_rank(ty: vk::PhysicalDeviceType) -> u32 {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 3,
        _ => 4,
    }
}

/// First queue family that can both draw and present.
pub fn graphics_present_family(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .filter(|(_, q)| q.queue_count > 0 && q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(i, _)| i as u32)
        .find(|&i| supports_present(i))
}

pub fn memory_type_index(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && props.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

/// First candidate whose properties for `tiling` include every bit of `features`.
pub fn first_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    props_of: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&f| {
        let props = props_of(f);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let p_message = unsafe { (*data).p_message };
    if p_message.is_null() {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr(p_message) }.to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", ?types, "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", ?types, "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", ?types, "{msg}");
    } else {
        trace!(target: "vulkan", ?types, "{msg}");
    }
    vk::FALSE
}

#[derive(Clone, Debug)]
pub struct ContextDesc<'a> {
    pub app_name: &'a str,
    pub validation: bool,
    pub force_render_pass: bool,
}

struct Adapter {
    phys: vk::PhysicalDevice,
    queue_family: u32,
    // effective: min(instance, device)
    api_version: u32,
    name: String,
    rank: u32,
    features: DeviceFeatures,
    max_anisotropy: f32,
}

/// The one connection to the GPU. Everything else borrows from it and must be
/// dropped before it.
pub struct GraphicsContext {
    _entry: Entry,
    instance: ash::Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    features: DeviceFeatures,
    path: RenderPath,
    max_anisotropy: f32,
    mem_props: vk::PhysicalDeviceMemoryProperties,
    khr_dynamic: Option<dynamic_rendering::Device>,
    adapter_name: String,
}

impl GraphicsContext {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        desc: &ContextDesc<'_>,
    ) -> Result<Self> {
        // STRICT ORDER:
        // 1) VkInstance (WSI + optional debug/portability exts)
        // 2) debug messenger, if validation asked for and available
        // 3) VkSurfaceKHR FROM THIS INSTANCE
        // 4) adapter + queue family chosen AGAINST THIS SURFACE (present support)
        // 5) VkDevice with the feature chain matching the chosen render path
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        let entry = unsafe { Entry::load() }.context("load Vulkan loader")?;
        let (instance, instance_api, debug_enabled) = unsafe { create_instance(&entry, dh, desc) }?;

        let debug = if debug_enabled {
            match unsafe { create_debug_messenger(&entry, &instance) } {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("debug messenger unavailable: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = match unsafe { ash_window::create_surface(&entry, &instance, dh, wh, None) }
        {
            Ok(s) => s,
            Err(e) => {
                unsafe { destroy_instance(&instance, debug.as_ref()) };
                return Err(RenderError::driver("vkCreateSurfaceKHR", e).into());
            }
        };

        let opened = unsafe { pick_adapter(&instance, instance_api, &surface_loader, surface) }
            .and_then(|a| {
                let path = choose_render_path(a.features, a.api_version, desc.force_render_pass);
                let device = unsafe { create_device(&instance, &a, path) }?;
                Ok((a, path, device))
            });
        let (adapter, path, device) = match opened {
            Ok(v) => v,
            Err(e) => {
                unsafe {
                    surface_loader.destroy_surface(surface, None);
                    destroy_instance(&instance, debug.as_ref());
                }
                return Err(e);
            }
        };

        let queue = unsafe { device.get_device_queue(adapter.queue_family, 0) };
        let mem_props = unsafe { instance.get_physical_device_memory_properties(adapter.phys) };
        let khr_dynamic = (path == RenderPath::KhrDynamic)
            .then(|| dynamic_rendering::Device::new(&instance, &device));

        info!(
            adapter = %adapter.name,
            api = %format!(
                "{}.{}",
                vk::api_version_major(adapter.api_version),
                vk::api_version_minor(adapter.api_version)
            ),
            ?path,
            features = ?adapter.features,
            queue_family = adapter.queue_family,
            "vk: device ready"
        );

        Ok(Self {
            _entry: entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys: adapter.phys,
            device,
            queue,
            queue_family: adapter.queue_family,
            features: adapter.features,
            path,
            max_anisotropy: adapter.max_anisotropy,
            mem_props,
            khr_dynamic,
            adapter_name: adapter.name,
        })
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.phys
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn surface_loader(&self) -> &surface::Instance {
        &self.surface_loader
    }

    pub fn features(&self) -> DeviceFeatures {
        self.features
    }

    pub fn render_path(&self) -> RenderPath {
        self.path
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// `Some(limit)` when anisotropic filtering was enabled on the device.
    pub fn max_sampler_anisotropy(&self) -> Option<f32> {
        self.features
            .contains(DeviceFeatures::SAMPLER_ANISOTROPY)
            .then_some(self.max_anisotropy)
    }

    pub fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32, RenderError> {
        memory_type_index(&self.mem_props, type_bits, required).ok_or_else(|| {
            RenderError::NoSuitableMemoryType {
                type_bits,
                properties: format!("{required:?}"),
            }
        })
    }

    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
        what: &'static str,
    ) -> Result<vk::Format, RenderError> {
        first_supported_format(candidates, tiling, features, |f| unsafe {
            self.instance
                .get_physical_device_format_properties(self.phys, f)
        })
        .ok_or(RenderError::NoSupportedFormat { what })
    }

    pub fn find_depth_format(&self) -> Result<vk::Format, RenderError> {
        self.find_supported_format(
            &DEPTH_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            "depth attachment",
        )
    }

    /// Dynamic rendering through whichever entry point the device was created with.
    ///
    /// # Safety
    /// `cb` must be in the recording state and `info` must describe live attachments.
    pub unsafe fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, info: &vk::RenderingInfo<'_>) {
        match &self.khr_dynamic {
            Some(khr) => unsafe { khr.cmd_begin_rendering(cb, info) },
            None => unsafe { self.device.cmd_begin_rendering(cb, info) },
        }
    }

    /// # Safety
    /// Must close a scope opened by [`Self::cmd_begin_rendering`].
    pub unsafe fn cmd_end_rendering(&self, cb: vk::CommandBuffer) {
        match &self.khr_dynamic {
            Some(khr) => unsafe { khr.cmd_end_rendering(cb) },
            None => unsafe { self.device.cmd_end_rendering(cb) },
        }
    }

    pub fn wait_idle(&self) -> Result<(), RenderError> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| RenderError::driver("vkDeviceWaitIdle", e))
    }
}

// STRICT TEARDOWN ORDER:
// - device_wait_idle()
// - device
// - debug messenger, surface (both instance children)
// - instance last
impl Drop for GraphicsContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            destroy_instance(&self.instance, self.debug.as_ref());
        }
    }
}

unsafe fn destroy_instance(
    instance: &ash::Instance,
    debug: Option<&(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
) {
    if let Some((loader, messenger)) = debug {
        unsafe { loader.destroy_debug_utils_messenger(*messenger, None) };
    }
    unsafe { instance.destroy_instance(None) };
}

fn has_name(props: &[vk::ExtensionProperties], name: &CStr) -> bool {
    props
        .iter()
        .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == name)
}

unsafe fn create_instance(
    entry: &Entry,
    display: RawDisplayHandle,
    desc: &ContextDesc<'_>,
) -> Result<(ash::Instance, u32, bool)> {
    let loader_version = unsafe { entry.try_enumerate_instance_version() }
        .context("vkEnumerateInstanceVersion")?
        .unwrap_or(vk::API_VERSION_1_0);
    if loader_version < vk::API_VERSION_1_1 {
        return Err(RenderError::MissingCapability("Vulkan 1.1 instance".into()).into());
    }
    let api_version = loader_version.min(vk::API_VERSION_1_3);

    let app = CString::new(desc.app_name).context("application name")?;
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: 0,
        p_engine_name: app.as_ptr(),
        engine_version: 0,
        api_version,
        ..Default::default()
    };

    let mut exts: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
        .map_err(|e| RenderError::MissingCapability(format!("window-system extensions: {e:?}")))?
        .to_vec();
    let available = unsafe { entry.enumerate_instance_extension_properties(None) }
        .context("vkEnumerateInstanceExtensionProperties")?;

    let mut flags = vk::InstanceCreateFlags::empty();
    if has_name(&available, PORTABILITY_ENUMERATION) {
        exts.push(PORTABILITY_ENUMERATION.as_ptr());
        flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let mut layers: Vec<*const c_char> = Vec::new();
    let mut debug_enabled = false;
    if desc.validation {
        let installed = unsafe { entry.enumerate_instance_layer_properties() }
            .context("vkEnumerateInstanceLayerProperties")?
            .iter()
            .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if installed {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        if has_name(&available, debug_utils::NAME) {
            exts.push(debug_utils::NAME.as_ptr());
            debug_enabled = true;
        }
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        flags,
        p_application_info: &app_info,
        enabled_extension_count: exts.len() as u32,
        pp_enabled_extension_names: exts.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| RenderError::driver("vkCreateInstance", e))?;
    Ok((instance, api_version, debug_enabled))
}

unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = unsafe { loader.create_debug_utils_messenger(&ci, None) }
        .map_err(|e| RenderError::driver("vkCreateDebugUtilsMessengerEXT", e))?;
    Ok((loader, messenger))
}

unsafe fn pick_adapter(
    instance: &ash::Instance,
    instance_api: u32,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<Adapter> {
    let mut best: Option<Adapter> = None;

    for phys in unsafe { instance.enumerate_physical_devices() }
        .map_err(|e| RenderError::driver("vkEnumeratePhysicalDevices", e))?
    {
        let props = unsafe { instance.get_physical_device_properties(phys) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let api_version = effective_api_version(instance_api, props.api_version);
        if api_version < vk::API_VERSION_1_1 {
            debug!(%name, "skip adapter: below Vulkan 1.1");
            continue;
        }

        let exts = unsafe { instance.enumerate_device_extension_properties(phys) }
            .unwrap_or_default();
        if !has_name(&exts, swapchain::NAME) {
            debug!(%name, "skip adapter: no VK_KHR_swapchain");
            continue;
        }

        let families = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        let Some(queue_family) = graphics_present_family(&families, |i| unsafe {
            surface_loader
                .get_physical_device_surface_support(phys, i, surface)
                .unwrap_or(false)
        }) else {
            debug!(%name, "skip adapter: no graphics+present queue family");
            continue;
        };

        let formats = unsafe { surface_loader.get_physical_device_surface_formats(phys, surface) }
            .unwrap_or_default();
        let modes =
            unsafe { surface_loader.get_physical_device_surface_present_modes(phys, surface) }
                .unwrap_or_default();
        if formats.is_empty() || modes.is_empty() {
            debug!(%name, "skip adapter: surface exposes no formats/present modes");
            continue;
        }

        let features = unsafe { query_features(instance, phys, api_version, &exts) };
        let candidate = Adapter {
            phys,
            queue_family,
            api_version,
            name,
            rank: device_type_rank(props.device_type),
            features,
            max_anisotropy: props.limits.max_sampler_anisotropy,
        };
        debug!(adapter = %candidate.name, rank = candidate.rank, ?features, "adapter candidate");
        if best.as_ref().map_or(true, |b| candidate.rank < b.rank) {
            best = Some(candidate);
        }
    }

    best.ok_or_else(|| RenderError::NoSuitableDevice.into())
}

unsafe fn query_features(
    instance: &ash::Instance,
    phys: vk::PhysicalDevice,
    api_version: u32,
    exts: &[vk::ExtensionProperties],
) -> DeviceFeatures {
    let mut out = DeviceFeatures::empty();

    let base = unsafe { instance.get_physical_device_features(phys) };
    if base.sampler_anisotropy == vk::TRUE {
        out |= DeviceFeatures::SAMPLER_ANISOTROPY;
    }
    if has_name(exts, PORTABILITY_SUBSET) {
        out |= DeviceFeatures::PORTABILITY_SUBSET;
    }

    if api_version >= vk::API_VERSION_1_3 {
        let mut f13 = vk::PhysicalDeviceVulkan13Features {
            s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES,
            ..Default::default()
        };
        let mut f2 = vk::PhysicalDeviceFeatures2 {
            s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
            p_next: (&mut f13) as *mut _ as *mut c_void,
            ..Default::default()
        };
        unsafe { instance.get_physical_device_features2(phys, &mut f2) };
        if f13.dynamic_rendering == vk::TRUE {
            out |= DeviceFeatures::CORE_DYNAMIC_RENDERING;
        }
    }

    if api_version >= vk::API_VERSION_1_2 && has_name(exts, dynamic_rendering::NAME) {
        let mut fdr = vk::PhysicalDeviceDynamicRenderingFeaturesKHR {
            s_type: vk::StructureType::PHYSICAL_DEVICE_DYNAMIC_RENDERING_FEATURES_KHR,
            ..Default::default()
        };
        let mut f2 = vk::PhysicalDeviceFeatures2 {
            s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
            p_next: (&mut fdr) as *mut _ as *mut c_void,
            ..Default::default()
        };
        unsafe { instance.get_physical_device_features2(phys, &mut f2) };
        if fdr.dynamic_rendering == vk::TRUE {
            out |= DeviceFeatures::KHR_DYNAMIC_RENDERING;
        }
    }

    out
}

unsafe fn create_device(
    instance: &ash::Instance,
    adapter: &Adapter,
    path: RenderPath,
) -> Result<ash::Device> {
    // STRICT ORDER (feature pNext chain):
    // Core13:     features2 -> Vulkan13Features
    // KhrDynamic: features2 -> DynamicRenderingFeaturesKHR
    // RenderPass: features2 alone
    // p_enabled_features stays null because features2 rides in pNext.
    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: adapter.queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    let mut device_exts: Vec<*const c_char> = vec![swapchain::NAME.as_ptr()];
    if path == RenderPath::KhrDynamic {
        device_exts.push(dynamic_rendering::NAME.as_ptr());
    }
    if adapter.features.contains(DeviceFeatures::PORTABILITY_SUBSET) {
        device_exts.push(PORTABILITY_SUBSET.as_ptr());
    }

    let mut f13 = vk::PhysicalDeviceVulkan13Features {
        s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES,
        dynamic_rendering: vk::TRUE,
        ..Default::default()
    };
    let mut fdr = vk::PhysicalDeviceDynamicRenderingFeaturesKHR {
        s_type: vk::StructureType::PHYSICAL_DEVICE_DYNAMIC_RENDERING_FEATURES_KHR,
        dynamic_rendering: vk::TRUE,
        ..Default::default()
    };
    let mut f2 = vk::PhysicalDeviceFeatures2 {
        s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
        features: vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::Bool32::from(
                adapter.features.contains(DeviceFeatures::SAMPLER_ANISOTROPY),
            ),
            ..Default::default()
        },
        ..Default::default()
    };
    match path {
        RenderPath::Core13 => f2.p_next = (&mut f13) as *mut _ as *mut c_void,
        RenderPath::KhrDynamic => f2.p_next = (&mut fdr) as *mut _ as *mut c_void,
        RenderPath::RenderPass => {}
    }

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        p_next: (&f2) as *const _ as *const c_void,
        queue_create_info_count: 1,
        p_queue_create_infos: &qinfo,
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };

    let device = unsafe { instance.create_device(adapter.phys, &dinfo, None) }
        .map_err(|e| RenderError::driver("vkCreateDevice", e))?;
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            p.memory_types[i].property_flags = flags;
        }
        p
    }

    #[test]
    fn memory_type_respects_mask_and_properties() {
        use vk::MemoryPropertyFlags as M;
        let props = mem_props(&[M::DEVICE_LOCAL, M::HOST_VISIBLE, M::HOST_VISIBLE | M::HOST_COHERENT]);
        let host = M::HOST_VISIBLE | M::HOST_COHERENT;

        assert_eq!(memory_type_index(&props, 0b111, M::DEVICE_LOCAL), Some(0));
        assert_eq!(memory_type_index(&props, 0b111, host), Some(2));
        assert_eq!(memory_type_index(&props, 0b011, M::HOST_VISIBLE), Some(1));
        assert_eq!(memory_type_index(&props, 0b011, host), None);
        // bits past memory_type_count are ignored
        assert_eq!(memory_type_index(&props, 0b1000, M::empty()), None);
    }

    #[test]
    fn first_supported_format_wins_in_order() {
        let props_of = |f: vk::Format| {
            let mut p = vk::FormatProperties::default();
            if f == vk::Format::D32_SFLOAT_S8_UINT || f == vk::Format::D24_UNORM_S8_UINT {
                p.optimal_tiling_features = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
            }
            p
        };
        let feat = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        assert_eq!(
            first_supported_format(&DEPTH_CANDIDATES, vk::ImageTiling::OPTIMAL, feat, props_of),
            Some(vk::Format::D32_SFLOAT_S8_UINT)
        );
        assert_eq!(
            first_supported_format(&DEPTH_CANDIDATES, vk::ImageTiling::LINEAR, feat, props_of),
            None
        );
    }

    #[test]
    fn render_path_follows_capabilities() {
        let all = DeviceFeatures::CORE_DYNAMIC_RENDERING | DeviceFeatures::KHR_DYNAMIC_RENDERING;
        let v13 = vk::API_VERSION_1_3;
        assert_eq!(choose_render_path(all, v13, false), RenderPath::Core13);
        assert_eq!(
            choose_render_path(DeviceFeatures::KHR_DYNAMIC_RENDERING, v13, false),
            RenderPath::KhrDynamic
        );
        assert_eq!(
            choose_render_path(DeviceFeatures::SAMPLER_ANISOTROPY, v13, false),
            RenderPath::RenderPass
        );
        assert_eq!(choose_render_path(all, v13, true), RenderPath::RenderPass);
        assert!(!RenderPath::RenderPass.is_dynamic());
    }

    #[test]
    fn instance_version_caps_render_path() {
        let all = DeviceFeatures::CORE_DYNAMIC_RENDERING | DeviceFeatures::KHR_DYNAMIC_RENDERING;

        // 1.2 loader, 1.3 driver: core 1.3 entry points are off limits
        let api = effective_api_version(vk::API_VERSION_1_2, vk::API_VERSION_1_3);
        assert_eq!(api, vk::API_VERSION_1_2);
        assert_eq!(choose_render_path(all, api, false), RenderPath::KhrDynamic);
        assert_eq!(
            choose_render_path(DeviceFeatures::CORE_DYNAMIC_RENDERING, api, false),
            RenderPath::RenderPass
        );

        // 1.1 instance: the KHR extension's 1.2 dependencies are not core
        let api = effective_api_version(vk::API_VERSION_1_1, vk::API_VERSION_1_3);
        assert_eq!(choose_render_path(all, api, false), RenderPath::RenderPass);

        // a newer instance never lifts an older device
        assert_eq!(
            effective_api_version(vk::API_VERSION_1_3, vk::API_VERSION_1_1),
            vk::API_VERSION_1_1
        );
    }

    #[test]
    fn queue_family_needs_graphics_and_present() {
        let fam = |flags| vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        };
        let families = [
            fam(vk::QueueFlags::COMPUTE),
            fam(vk::QueueFlags::GRAPHICS),
            fam(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(graphics_present_family(&families, |_| true), Some(1));
        assert_eq!(graphics_present_family(&families, |i| i == 2), Some(2));
        assert_eq!(graphics_present_family(&families, |i| i == 0), None);
    }

    #[test]
    fn discrete_beats_integrated() {
        assert!(
            device_type_rank(vk::PhysicalDeviceType::DISCRETE_GPU)
                < device_type_rank(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_type_rank(vk::PhysicalDeviceType::CPU)
                < device_type_rank(vk::PhysicalDeviceType::OTHER)
        );
    }
}
