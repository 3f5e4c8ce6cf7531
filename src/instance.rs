use std::ffi::{CString, c_char};
use std::sync::{Arc, Weak};

use ash::vk;
use parking_lot::Mutex;
use thiserror::Error;

use crate::device::{CreateDeviceError, Device};
use crate::physical_device::PhysicalDevice;

/// Process-wide driver loader state.
///
/// Populated exactly once by [`init`]; every [`Instance`] created afterwards
/// clones the resolved entry. The entry is never torn down — it lives for the
/// remainder of the process, matching the lifetime of the loaded driver
/// library.
static LOADER: Mutex<Option<ash::Entry>> = Mutex::new(None);

#[derive(Debug, Error)]
pub enum LoaderInitError {
    #[error("Could not load the Vulkan library: {0}")]
    LibraryLoading(libloading::Error),

    #[error("Could not resolve vkGetInstanceProcAddr from the Vulkan library")]
    MissingEntryPoint,
}

/// One-time, idempotent driver-loader initialization.
///
/// When `get_instance_proc_addr` is `None` the Vulkan shared library is
/// loaded dynamically and the bootstrap entry point resolved from it. A host
/// that already owns a loader (e.g. a media framework embedding this crate)
/// passes its own entry point instead.
///
/// Calls after the first successful one return `Ok` without doing any work,
/// even when a different entry point is supplied. The check-and-initialize
/// sequence is serialized on a mutex, so concurrent callers observe either
/// "not yet initialized" or "done", never a partial state.
///
/// # Safety
/// Loading the driver library executes arbitrary initialization code. A
/// supplied `get_instance_proc_addr` must be a genuine Vulkan bootstrap
/// function valid for the remainder of the process.
pub unsafe fn init(
    get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
) -> Result<(), LoaderInitError> {
    let mut loader = LOADER.lock();
    if loader.is_some() {
        return Ok(());
    }

    let entry = match get_instance_proc_addr {
        Some(get_instance_proc_addr) => {
            let static_fn = ash::StaticFn {
                get_instance_proc_addr,
            };
            // SAFETY: Caller guarantees the bootstrap function is genuine and
            // outlives the process.
            unsafe { ash::Entry::from_static_fn(static_fn) }
        }
        // SAFETY: We pass the burden of loading a shared library on to the
        // caller via this function's safety contract.
        None => unsafe { ash::Entry::load() }.map_err(|e| match e {
            ash::LoadingError::LibraryLoadFailure(error) => LoaderInitError::LibraryLoading(error),
            ash::LoadingError::MissingEntryPoint(_) => LoaderInitError::MissingEntryPoint,
        })?,
    };

    *loader = Some(entry);
    Ok(())
}

#[derive(Debug, Error)]
pub enum CreateInstanceError {
    #[error(transparent)]
    Loader(#[from] LoaderInitError),

    #[error("Driver loader is not initialized")]
    LoaderNotInitialized,

    #[error("Invalid application name was passed to Instance::new")]
    InvalidAppName,

    #[error("Vulkan error creating instance: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum EnumerateDevicesError {
    #[error("No compatible devices found")]
    NoCompatibleDevices,

    #[error("Vulkan error enumerating physical devices: {0}")]
    Vulkan(vk::Result),
}

/// The driver connection.
///
/// Owns the `vk::Instance` and remembers at most one live logical [`Device`]
/// through a weak reference, so handing out the active device never extends
/// its lifetime.
pub struct Instance {
    _entry: ash::Entry,
    handle: ash::Instance,
    /// The active device slot. Guarded so create/reset/read never observe a
    /// half-updated weak reference.
    device_slot: Mutex<Weak<Device>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .finish_non_exhaustive()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        //SAFETY: We are in drop so this is the last use of the instance. Any
        //derived object holds an Arc to this Instance and is already gone.
        unsafe { self.handle.destroy_instance(None) };
    }
}

impl Instance {
    /// Create the driver connection.
    ///
    /// Initializes the process-wide loader if [`init`] has not been called
    /// yet (with no injected entry point). `enable_validation` turns on
    /// `VK_LAYER_KHRONOS_validation` when the layer is actually installed;
    /// a missing layer downgrades to a warning rather than an error.
    ///
    /// # Safety
    /// May load the Vulkan shared library, executing arbitrary code. See
    /// [`init`].
    pub unsafe fn new(
        app_name: impl AsRef<str>,
        enable_validation: bool,
    ) -> Result<Arc<Self>, CreateInstanceError> {
        // SAFETY: Forwarded to this function's safety contract.
        unsafe { init(None) }?;
        let entry = LOADER
            .lock()
            .clone()
            .ok_or(CreateInstanceError::LoaderNotInitialized)?;

        let app_name_cstring = CString::new(app_name.as_ref())
            .map_err(|_| CreateInstanceError::InvalidAppName)?;

        //SAFETY: Basically always fine
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .unwrap_or(Some(vk::API_VERSION_1_0))
            .unwrap_or(vk::API_VERSION_1_0);

        let validation_layer_name = c"VK_LAYER_KHRONOS_validation";
        let mut enabled_layers: Vec<*const c_char> = Vec::new();
        if enable_validation {
            //SAFETY: Pretty much always okay
            let layers_avail = unsafe { entry.enumerate_instance_layer_properties() };
            let validation_available = layers_avail
                .map(|layers| {
                    layers
                        .iter()
                        .any(|layer| layer.layer_name_as_c_str() == Ok(validation_layer_name))
                })
                .unwrap_or(false);
            if validation_available {
                enabled_layers.push(validation_layer_name.as_ptr());
            } else {
                tracing::warn!(
                    "Validation requested but VK_LAYER_KHRONOS_validation is not installed"
                );
            }
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstring)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"mvk")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&enabled_layers);

        //SAFETY: create_info only references locals that outlive this call
        let handle = unsafe { entry.create_instance(&create_info, None) }
            .map_err(CreateInstanceError::Vulkan)?;

        Ok(Arc::new(Self {
            _entry: entry,
            handle,
            device_slot: Mutex::new(Weak::new()),
        }))
    }

    /// Enumerate adapters, freshly wrapped on every call.
    ///
    /// With `compatible_only` set, adapters failing
    /// [`PhysicalDevice::is_compatible`] are dropped from the result. An
    /// empty result is an error in both modes — a machine with no usable
    /// adapter cannot run any GPU path.
    pub fn enumerate_physical_devices(
        self: &Arc<Self>,
        compatible_only: bool,
    ) -> Result<Vec<Arc<PhysicalDevice>>, EnumerateDevicesError> {
        //SAFETY: Pretty much always fine
        let raw_devices = unsafe { self.handle.enumerate_physical_devices() }
            .map_err(EnumerateDevicesError::Vulkan)?;

        let mut physical_devices = Vec::with_capacity(raw_devices.len());
        for raw in raw_devices {
            let physical_device = Arc::new(PhysicalDevice::new(Arc::clone(self), raw));
            if !compatible_only || physical_device.is_compatible() {
                physical_devices.push(physical_device);
            }
        }

        if physical_devices.is_empty() {
            return Err(EnumerateDevicesError::NoCompatibleDevices);
        }
        Ok(physical_devices)
    }

    /// Open a logical device on `physical_device` and make it the active
    /// device of this instance.
    ///
    /// Resolves a queue family satisfying `queue_flags`, intersects
    /// `extensions` with the adapter's supported set, and delegates
    /// construction to the adapter. The previously remembered device (if any)
    /// is only unregistered, never destroyed — external strong references
    /// keep it fully usable.
    pub fn create_device(
        self: &Arc<Self>,
        physical_device: &Arc<PhysicalDevice>,
        queue_flags: vk::QueueFlags,
        features: &vk::PhysicalDeviceFeatures,
        extensions: &[&str],
        max_queue_count: u32,
    ) -> Result<Arc<Device>, CreateDeviceError> {
        if !Arc::ptr_eq(physical_device.instance(), self) {
            return Err(CreateDeviceError::MismatchedInstance);
        }

        let queue_family_index = physical_device
            .queue_family_index(queue_flags)
            .ok_or(CreateDeviceError::NoQueueFamily(queue_flags))?;
        let extensions = physical_device.filter_available_extensions(extensions);

        let device =
            physical_device.create_device(queue_family_index, features, extensions, max_queue_count)?;

        *self.device_slot.lock() = Arc::downgrade(&device);
        Ok(device)
    }

    /// Unregister `device` if it is still the active device.
    ///
    /// A no-op when another device has already superseded it. This lets a
    /// device announce its own teardown without the instance forcing any
    /// destruction order.
    pub fn reset_device(&self, device: &Arc<Device>) {
        let mut slot = self.device_slot.lock();
        if slot.upgrade().is_some_and(|active| Arc::ptr_eq(&active, device)) {
            *slot = Weak::new();
        }
    }

    /// The currently remembered device, or `None` once it has been dropped
    /// or reset.
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device_slot.lock().upgrade()
    }

    pub fn raw_handle(&self) -> vk::Instance {
        self.handle.handle()
    }

    pub fn ash_handle(&self) -> &ash::Instance {
        &self.handle
    }
}

// Physical-device query wrappers used by PhysicalDevice during construction.
impl Instance {
    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        // SAFETY: Caller guarantees handle provenance.
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: Caller guarantees handle provenance.
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: Caller guarantees handle provenance.
        unsafe {
            self.handle
                .get_physical_device_memory_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn enumerate_raw_device_extension_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, vk::Result> {
        // SAFETY: Caller guarantees handle provenance.
        unsafe {
            self.handle
                .enumerate_device_extension_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance,
    /// and `create_info` must reference data valid for the duration of the
    /// call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: Caller guarantees handle provenance and create_info validity.
        unsafe { self.handle.create_device(physical_device, create_info, None) }
    }
}
