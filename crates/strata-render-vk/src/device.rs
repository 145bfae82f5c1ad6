// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, physical device and logical device ownership.

use std::ffi::{c_char, c_void, CStr, CString};

use anyhow::{anyhow, Context, Result};
use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use strata_render::RenderError;
use tracing::{debug, error, info, trace, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const APP_NAME: &CStr = c"strata";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// One entry per distinct family; the logical device opens one queue each.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilySupport {
    pub graphics: bool,
    pub present: bool,
}

/// Everything device selection needs to know about one physical device.
#[derive(Clone, Debug, Default)]
pub struct DeviceCandidate {
    pub name: String,
    pub families: Vec<QueueFamilySupport>,
    pub has_swapchain: bool,
    pub surface_formats: usize,
    pub present_modes: usize,
    pub sampler_anisotropy: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("no graphics queue family")]
    NoGraphicsQueue,
    #[error("no queue family can present to the surface")]
    NoPresentQueue,
    #[error("VK_KHR_swapchain is not supported")]
    MissingSwapchain,
    #[error("the surface reports no formats")]
    NoSurfaceFormats,
    #[error("the surface reports no present modes")]
    NoPresentModes,
    #[error("anisotropic sampling is not supported")]
    NoAnisotropy,
}

impl DeviceCandidate {
    pub fn evaluate(&self) -> Result<QueueFamilies, Rejection> {
        let families = self.queue_families()?;
        if !self.has_swapchain {
            return Err(Rejection::MissingSwapchain);
        }
        if self.surface_formats == 0 {
            return Err(Rejection::NoSurfaceFormats);
        }
        if self.present_modes == 0 {
            return Err(Rejection::NoPresentModes);
        }
        if !self.sampler_anisotropy {
            return Err(Rejection::NoAnisotropy);
        }
        Ok(families)
    }

    // A family that does both wins; otherwise the first of each.
    fn queue_families(&self) -> Result<QueueFamilies, Rejection> {
        if let Some(i) = self.families.iter().position(|f| f.graphics && f.present) {
            return Ok(QueueFamilies {
                graphics: i as u32,
                present: i as u32,
            });
        }
        let graphics = self
            .families
            .iter()
            .position(|f| f.graphics)
            .ok_or(Rejection::NoGraphicsQueue)?;
        let present = self
            .families
            .iter()
            .position(|f| f.present)
            .ok_or(Rejection::NoPresentQueue)?;
        Ok(QueueFamilies {
            graphics: graphics as u32,
            present: present as u32,
        })
    }
}

/// First suitable device in enumeration order. No scoring: a discrete GPU
/// listed after an integrated one loses.
pub fn first_suitable(candidates: &[DeviceCandidate]) -> Option<(usize, QueueFamilies)> {
    candidates.iter().enumerate().find_map(|(i, c)| match c.evaluate() {
        Ok(families) => Some((i, families)),
        Err(why) => {
            info!("vk: skipping device '{}': {why}", c.name);
            None
        }
    })
}

pub fn memory_type_index(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && memory.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

/// Maps a failed Vulkan call to an error callers can match on.
pub(crate) fn vk_failure(op: &'static str, result: vk::Result) -> anyhow::Error {
    match result {
        vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost(op).into(),
        other => RenderError::Vulkan {
            op,
            detail: format!("{other:?}"),
        }
        .into(),
    }
}

/// Validation hooks, present only when the layer and `VK_EXT_debug_utils`
/// were both available at startup.
pub trait DebugReporter {
    /// Binds device-level entry points once the logical device exists.
    fn attach_device(&mut self, instance: &ash::Instance, device: &ash::Device);
    fn name_object(&self, object_type: vk::ObjectType, raw: u64, name: &str);
}

struct DebugUtilsReporter {
    instance_fns: debug_utils::Instance,
    device_fns: Option<debug_utils::Device>,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugUtilsReporter {
    unsafe fn new(entry: &Entry, instance: &ash::Instance) -> Result<Self> {
        let instance_fns = debug_utils::Instance::new(entry, instance);
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
        let messenger = instance_fns
            .create_debug_utils_messenger(&ci, None)
            .context("create_debug_utils_messenger")?;
        Ok(Self {
            instance_fns,
            device_fns: None,
            messenger,
        })
    }
}

impl DebugReporter for DebugUtilsReporter {
    fn attach_device(&mut self, instance: &ash::Instance, device: &ash::Device) {
        self.device_fns = Some(debug_utils::Device::new(instance, device));
    }

    fn name_object(&self, object_type: vk::ObjectType, raw: u64, name: &str) {
        let Some(fns) = &self.device_fns else {
            return;
        };
        let Ok(cname) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT {
            s_type: vk::StructureType::DEBUG_UTILS_OBJECT_NAME_INFO_EXT,
            object_type,
            object_handle: raw,
            p_object_name: cname.as_ptr(),
            ..Default::default()
        };
        if let Err(e) = unsafe { fns.set_debug_utils_object_name(&info) } {
            trace!("vk: naming {name} failed: {e:?}");
        }
    }
}

impl Drop for DebugUtilsReporter {
    fn drop(&mut self) {
        unsafe {
            self.instance_fns
                .destroy_debug_utils_messenger(self.messenger, None);
        }
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
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

unsafe fn validation_available(entry: &Entry) -> bool {
    let layers = entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default();
    let has_layer = layers
        .iter()
        .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER);
    let exts = entry
        .enumerate_instance_extension_properties(None)
        .unwrap_or_default();
    let has_utils = exts
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == debug_utils::NAME);

    if !has_layer {
        warn!("vk: validation requested but {VALIDATION_LAYER:?} is not installed");
    } else if !has_utils {
        warn!("vk: validation requested but VK_EXT_debug_utils is missing");
    }
    has_layer && has_utils
}

unsafe fn create_instance(
    entry: &Entry,
    display: raw_window_handle::RawDisplayHandle,
    validation: bool,
) -> Result<ash::Instance> {
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: APP_NAME.as_ptr(),
        application_version: 0,
        p_engine_name: APP_NAME.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let mut extensions = ash_window::enumerate_required_extensions(display)
        .context("enumerate_required_extensions")?
        .to_vec();
    let mut layers: Vec<*const c_char> = Vec::new();
    if validation {
        extensions.push(debug_utils::NAME.as_ptr());
        layers.push(VALIDATION_LAYER.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };
    entry
        .create_instance(&create_info, None)
        .context("create_instance")
}

unsafe fn describe_device(
    instance: &ash::Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
) -> Result<DeviceCandidate> {
    let props = instance.get_physical_device_properties(phys);
    let name = CStr::from_ptr(props.device_name.as_ptr())
        .to_string_lossy()
        .into_owned();

    let families = instance
        .get_physical_device_queue_family_properties(phys)
        .iter()
        .enumerate()
        .map(|(i, q)| QueueFamilySupport {
            graphics: q.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            present: surface_loader
                .get_physical_device_surface_support(phys, i as u32, surface)
                .unwrap_or(false),
        })
        .collect();

    let exts = instance
        .enumerate_device_extension_properties(phys)
        .context("enumerate_device_extension_properties")?;
    let has_swapchain = exts
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME);

    let surface_formats = surface_loader
        .get_physical_device_surface_formats(phys, surface)
        .map_or(0, |f| f.len());
    let present_modes = surface_loader
        .get_physical_device_surface_present_modes(phys, surface)
        .map_or(0, |m| m.len());
    let features = instance.get_physical_device_features(phys);

    Ok(DeviceCandidate {
        name,
        families,
        has_swapchain,
        surface_formats,
        present_modes,
        sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
    })
}

unsafe fn create_logical_device(
    instance: &ash::Instance,
    phys: vk::PhysicalDevice,
    queues: QueueFamilies,
) -> Result<ash::Device> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = queues
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

    let features = vk::PhysicalDeviceFeatures {
        sampler_anisotropy: vk::TRUE,
        ..Default::default()
    };
    let extensions = [swapchain::NAME.as_ptr()];

    let create_info = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        p_enabled_features: &features,
        ..Default::default()
    };
    instance
        .create_device(phys, &create_info, None)
        .context("create_device")
}

/// Owns the Vulkan instance, surface and logical device for the renderer's
/// lifetime. Everything created from the device must be destroyed before
/// this drops.
pub struct DeviceContext {
    _entry: Entry,
    pub instance: ash::Instance,
    debug: Option<Box<dyn DebugReporter>>,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub phys: vk::PhysicalDevice,
    pub props: vk::PhysicalDeviceProperties,
    memory: vk::PhysicalDeviceMemoryProperties,
    pub device: ash::Device,
    pub queues: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub swapchain_loader: swapchain::Device,
}

impl DeviceContext {
    // STRICT ORDER:
    // 1) instance (+ debug messenger when validation is on)
    // 2) surface from THIS instance
    // 3) physical device chosen against THIS surface (present support)
    // 4) logical device + queues
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        validation: bool,
    ) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        unsafe {
            let entry = Entry::load().context("load Vulkan loader")?;
            let validation = validation && validation_available(&entry);
            let instance = create_instance(&entry, dh, validation)?;

            let mut debug: Option<Box<dyn DebugReporter>> = if validation {
                Some(Box::new(DebugUtilsReporter::new(&entry, &instance)?))
            } else {
                None
            };

            let surface_loader = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
                .context("ash_window::create_surface")?;

            let physical = instance
                .enumerate_physical_devices()
                .context("enumerate_physical_devices")?;
            let candidates = physical
                .iter()
                .map(|&phys| describe_device(&instance, &surface_loader, surface, phys))
                .collect::<Result<Vec<_>>>()?;
            let (index, queues) =
                first_suitable(&candidates).ok_or(RenderError::NoSuitableDevice)?;
            let phys = physical[index];
            let props = instance.get_physical_device_properties(phys);
            let memory = instance.get_physical_device_memory_properties(phys);

            info!(
                "vk: device '{}' (api {}.{}), graphics family {}, present family {}, validation={}",
                candidates[index].name,
                vk::api_version_major(props.api_version),
                vk::api_version_minor(props.api_version),
                queues.graphics,
                queues.present,
                validation,
            );

            let device = create_logical_device(&instance, phys, queues)?;
            if let Some(debug) = debug.as_mut() {
                debug.attach_device(&instance, &device);
            }
            let graphics_queue = device.get_device_queue(queues.graphics, 0);
            let present_queue = device.get_device_queue(queues.present, 0);
            let swapchain_loader = swapchain::Device::new(&instance, &device);

            let ctx = Self {
                _entry: entry,
                instance,
                debug,
                surface_loader,
                surface,
                phys,
                props,
                memory,
                device,
                queues,
                graphics_queue,
                present_queue,
                swapchain_loader,
            };
            ctx.set_name(ctx.graphics_queue, "graphics queue");
            if !queues.is_shared() {
                ctx.set_name(ctx.present_queue, "present queue");
            }
            Ok(ctx)
        }
    }

    pub fn set_name<H: vk::Handle>(&self, handle: H, name: &str) {
        if let Some(debug) = &self.debug {
            debug.name_object(H::TYPE, handle.as_raw(), name);
        }
    }

    pub fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        memory_type_index(&self.memory, type_bits, required).ok_or_else(|| {
            RenderError::NoMemoryType {
                type_bits,
                properties: format!("{required:?}"),
            }
            .into()
        })
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(|e| vk_failure("device_wait_idle", e))
    }
}

// STRICT TEARDOWN ORDER (reverse of creation):
// device -> surface -> debug messenger -> instance
impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            drop(self.debug.take());
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capable(name: &str, families: Vec<QueueFamilySupport>) -> DeviceCandidate {
        DeviceCandidate {
            name: name.into(),
            families,
            has_swapchain: true,
            surface_formats: 2,
            present_modes: 1,
            sampler_anisotropy: true,
        }
    }

    const BOTH: QueueFamilySupport = QueueFamilySupport {
        graphics: true,
        present: true,
    };
    const GRAPHICS: QueueFamilySupport = QueueFamilySupport {
        graphics: true,
        present: false,
    };
    const PRESENT: QueueFamilySupport = QueueFamilySupport {
        graphics: false,
        present: true,
    };
    const COMPUTE: QueueFamilySupport = QueueFamilySupport {
        graphics: false,
        present: false,
    };

    #[test]
    fn shared_family_is_preferred() {
        let c = capable("gpu", vec![GRAPHICS, PRESENT, BOTH]);
        let q = c.evaluate().unwrap();
        assert_eq!(q, QueueFamilies { graphics: 2, present: 2 });
        assert_eq!(q.unique(), vec![2]);
    }

    #[test]
    fn split_families_open_two_queues() {
        let c = capable("gpu", vec![COMPUTE, GRAPHICS, PRESENT]);
        let q = c.evaluate().unwrap();
        assert_eq!(q, QueueFamilies { graphics: 1, present: 2 });
        assert!(!q.is_shared());
        assert_eq!(q.unique(), vec![1, 2]);
    }

    #[test]
    fn rejection_reasons() {
        assert_eq!(
            capable("a", vec![PRESENT]).evaluate(),
            Err(Rejection::NoGraphicsQueue)
        );
        assert_eq!(
            capable("b", vec![GRAPHICS]).evaluate(),
            Err(Rejection::NoPresentQueue)
        );

        let mut c = capable("c", vec![BOTH]);
        c.has_swapchain = false;
        assert_eq!(c.evaluate(), Err(Rejection::MissingSwapchain));

        let mut c = capable("d", vec![BOTH]);
        c.surface_formats = 0;
        assert_eq!(c.evaluate(), Err(Rejection::NoSurfaceFormats));

        let mut c = capable("e", vec![BOTH]);
        c.present_modes = 0;
        assert_eq!(c.evaluate(), Err(Rejection::NoPresentModes));

        let mut c = capable("f", vec![BOTH]);
        c.sampler_anisotropy = false;
        assert_eq!(c.evaluate(), Err(Rejection::NoAnisotropy));
    }

    #[test]
    fn first_suitable_in_enumeration_order() {
        let mut software = capable("llvmpipe", vec![BOTH]);
        software.sampler_anisotropy = false;
        let candidates = vec![
            software,
            capable("integrated", vec![GRAPHICS, PRESENT]),
            capable("discrete", vec![BOTH]),
        ];
        let (index, q) = first_suitable(&candidates).unwrap();
        assert_eq!(index, 1);
        assert_eq!(q, QueueFamilies { graphics: 0, present: 1 });
    }

    #[test]
    fn no_devices_means_none() {
        assert!(first_suitable(&[]).is_none());
        assert!(first_suitable(&[capable("x", vec![COMPUTE])]).is_none());
    }

    #[test]
    fn memory_type_respects_bits_and_flags() {
        let mut mem = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        mem.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        mem.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        mem.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(memory_type_index(&mem, 0b111, host), Some(1));
        assert_eq!(memory_type_index(&mem, 0b100, host), Some(2));
        assert_eq!(
            memory_type_index(&mem, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(memory_type_index(&mem, 0b001, host), None);
        // types past memory_type_count are ignored
        assert_eq!(memory_type_index(&mem, 0b1000, vk::MemoryPropertyFlags::empty()), None);
    }

    #[test]
    fn device_lost_is_classified() {
        let err = vk_failure("queue_submit", vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::DeviceLost("queue_submit"))
        ));
        let err = vk_failure("queue_submit", vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::Vulkan { op: "queue_submit", .. })
        ));
    }
}
