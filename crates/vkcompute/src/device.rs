//! Instance creation, physical device selection and logical device setup.

use std::ffi::{c_char, CStr, CString};
use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, Ordering};

use ash::vk;
use tracing::{debug, info, warn};

use crate::config::{ComputeConfig, DeviceCriteria};
use crate::error::{ComputeError, Result, VkResultExt};

/// What the driver reports about one physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Position in enumeration order.
    pub index: usize,
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: vk::PhysicalDeviceType,
}

impl DeviceIdentity {
    fn from_properties(index: usize, props: &vk::PhysicalDeviceProperties) -> Self {
        let name = CStr::from_bytes_until_nul(bytemuck::cast_slice(&props.device_name))
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            index,
            name,
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            device_type: props.device_type,
        }
    }

    pub fn matches(&self, criteria: &DeviceCriteria) -> bool {
        self.vendor_id == criteria.vendor_id && self.device_id == criteria.device_id
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} [{:04x}:{:04x}] ({:?})",
            self.index, self.name, self.vendor_id, self.device_id, self.device_type
        )
    }
}

/// Why a device was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// Vendor and device ids both matched.
    PreferredMatch,
    /// Nothing matched and strict mode was off.
    Fallback,
}

/// Pick a device: the first one matching both ids, else the first one
/// enumerated unless `criteria.strict` is set.
pub fn choose_device(
    devices: &[DeviceIdentity],
    criteria: &DeviceCriteria,
) -> Result<(usize, SelectionReason)> {
    if devices.is_empty() {
        return Err(ComputeError::NoSuitableDevice("no physical devices enumerated".into()));
    }
    if let Some(pos) = devices.iter().position(|d| d.matches(criteria)) {
        return Ok((pos, SelectionReason::PreferredMatch));
    }
    if criteria.strict {
        return Err(ComputeError::NoSuitableDevice(format!(
            "strict selection: no device with vendor {:#06x} and device {:#06x} among {} candidates",
            criteria.vendor_id,
            criteria.device_id,
            devices.len()
        )));
    }
    Ok((0, SelectionReason::Fallback))
}

/// Index of the first queue family that supports compute and has a queue.
pub fn find_compute_queue_family(families: &[vk::QueueFamilyProperties]) -> Result<u32> {
    families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE) && f.queue_count > 0)
        .map(|i| i as u32)
        .ok_or_else(|| {
            ComputeError::NoSuitableDevice(format!(
                "none of {} queue families supports compute",
                families.len()
            ))
        })
}

/// A physical device chosen by [`ComputeInstance::select_device`].
#[derive(Debug, Clone)]
pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub identity: DeviceIdentity,
    pub reason: SelectionReason,
}

/// Loaded Vulkan entry points and an instance. Destroys the instance on drop.
pub struct ComputeInstance {
    instance: ash::Instance,
    entry: ash::Entry,
}

impl ComputeInstance {
    /// Load the Vulkan loader and create an API 1.0 instance.
    pub fn create(config: &ComputeConfig) -> Result<Self> {
        // SAFETY: dynamically loads the system Vulkan loader; no other Vulkan
        // state exists yet.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| ComputeError::init(format!("failed to load Vulkan loader: {e}")))?;

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|_| ComputeError::init("application name contains a NUL byte"))?;
        let layers = config
            .validation_layers
            .iter()
            .map(|l| CString::new(l.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| ComputeError::init("layer name contains a NUL byte"))?;
        let layer_ptrs: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .engine_name(c"vkcompute")
            .api_version(vk::API_VERSION_1_0);
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs);

        // SAFETY: create_info and everything it points to outlive the call.
        let instance =
            unsafe { entry.create_instance(&create_info, None) }.or_init("vkCreateInstance")?;

        debug!(
            application = %config.application_name,
            layers = ?config.validation_layers,
            "created Vulkan instance"
        );
        Ok(Self { instance, entry })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Every physical device with its identity, in enumeration order.
    pub fn physical_devices(&self) -> Result<Vec<(vk::PhysicalDevice, DeviceIdentity)>> {
        // SAFETY: valid instance handle.
        let handles = unsafe { self.instance.enumerate_physical_devices() }
            .or_init("vkEnumeratePhysicalDevices")?;
        Ok(handles
            .into_iter()
            .enumerate()
            .map(|(index, pd)| {
                // SAFETY: pd was just enumerated from this instance.
                let props = unsafe { self.instance.get_physical_device_properties(pd) };
                (pd, DeviceIdentity::from_properties(index, &props))
            })
            .collect())
    }

    /// Apply [`choose_device`] to the enumerated devices.
    pub fn select_device(&self, criteria: &DeviceCriteria) -> Result<SelectedDevice> {
        let devices = self.physical_devices()?;
        for (_, identity) in &devices {
            debug!(device = %identity, "enumerated physical device");
        }
        let identities: Vec<DeviceIdentity> = devices.iter().map(|(_, id)| id.clone()).collect();
        let (index, reason) = choose_device(&identities, criteria)?;
        let (physical_device, identity) = devices[index].clone();

        match reason {
            SelectionReason::PreferredMatch => info!(
                vendor_id = identity.vendor_id,
                device_id = identity.device_id,
                name = %identity.name,
                "selected preferred physical device"
            ),
            SelectionReason::Fallback => warn!(
                wanted_vendor = criteria.vendor_id,
                wanted_device = criteria.device_id,
                name = %identity.name,
                "preferred device not found, falling back to first device"
            ),
        }
        Ok(SelectedDevice { physical_device, identity, reason })
    }

    /// Create a logical device with one compute queue on `selected`.
    ///
    /// Consumes the instance; on failure it is destroyed before returning.
    pub fn open_device(self, selected: SelectedDevice) -> Result<DeviceContext> {
        // SAFETY: physical device belongs to this instance.
        let families = unsafe {
            self.instance.get_physical_device_queue_family_properties(selected.physical_device)
        };
        let queue_family_index = find_compute_queue_family(&families)?;

        let priorities = [1.0_f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);
        let device_info =
            vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_info));

        // SAFETY: device_info is valid for the duration of the call.
        let device = unsafe {
            self.instance.create_device(selected.physical_device, &device_info, None)
        }
        .or_init("vkCreateDevice")?;
        // SAFETY: one queue was requested from this family.
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        // SAFETY: valid physical device.
        let memory_properties = unsafe {
            self.instance.get_physical_device_memory_properties(selected.physical_device)
        };

        info!(
            queue_family = queue_family_index,
            memory_types = memory_properties.memory_type_count,
            device = %selected.identity,
            "opened logical device"
        );

        Ok(DeviceContext {
            device,
            physical_device: selected.physical_device,
            queue,
            queue_family_index,
            memory_properties,
            identity: selected.identity,
            reason: selected.reason,
            hang: HangFlag::default(),
            instance: ManuallyDrop::new(self),
        })
    }
}

impl Drop for ComputeInstance {
    fn drop(&mut self) {
        // SAFETY: every child object was destroyed by its owner first.
        unsafe { self.instance.destroy_instance(None) };
        debug!("destroyed Vulkan instance");
    }
}

/// Raised when submitted work never completed.
///
/// Once raised, the device may never go idle again, so teardown must not
/// wait on it.
#[derive(Debug, Default)]
pub struct HangFlag(AtomicBool);

impl HangFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The selected device, its logical device and compute queue.
///
/// Everything else in this crate borrows a `DeviceContext` and must be
/// released before it drops.
pub struct DeviceContext {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    queue: vk::Queue,
    queue_family_index: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    identity: DeviceIdentity,
    reason: SelectionReason,
    hang: HangFlag,
    // Released after the logical device in `Drop`, or leaked with it.
    instance: ManuallyDrop<ComputeInstance>,
}

impl DeviceContext {
    /// Instance, device selection and logical device in one step.
    pub fn create(config: &ComputeConfig) -> Result<Self> {
        let instance = ComputeInstance::create(config)?;
        let selected = instance.select_device(&config.device)?;
        instance.open_device(selected)
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        self.instance.instance()
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn selection_reason(&self) -> SelectionReason {
        self.reason
    }

    /// Raised by the dispatcher when a fence wait times out.
    pub fn hang_flag(&self) -> &HangFlag {
        &self.hang
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if self.hang.is_raised() {
            // vkDeviceWaitIdle has no timeout and the device cannot be
            // destroyed with work pending, so both handles are leaked.
            warn!(
                device = %self.identity,
                "leaking logical device and instance after a hung submission"
            );
            return;
        }
        // SAFETY: the device is idle once wait_idle returns; no child object
        // outlives the context because they all borrow it.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!(error = %e, "vkDeviceWaitIdle failed during teardown");
            }
            self.device.destroy_device(None);
        }
        debug!(device = %self.identity, "destroyed logical device");
        // SAFETY: the instance is not touched again after this point.
        unsafe { ManuallyDrop::drop(&mut self.instance) };
    }
}
