//! Slicing of physical GPUs into schedulable virtual devices.
//!
//! Every physical device is exposed as `gpu_memory` virtual devices, one per
//! memory quantum. The slice count is derived from the *first* enumerated
//! device and applied to all of them, so nodes are expected to carry a single
//! GPU model.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::config::MemoryUnit;
use crate::domain::backend::PhysicalDevice;
use crate::domain::health::UnhealthyDevices;

/// Separator between the physical identity and the slice index in a fake id.
pub const FAKE_ID_SEPARATOR: &str = "-_-";

/// Builds the fake id of slice `slice` of physical device `uuid`.
pub fn generate_fake_device_id(uuid: &str, slice: u64) -> String {
    format!("{uuid}{FAKE_ID_SEPARATOR}{slice}")
}

/// Returns the physical identity a fake id was generated from.
pub fn extract_physical_id(fake_id: &str) -> &str {
    match fake_id.split_once(FAKE_ID_SEPARATOR) {
        Some((uuid, _)) => uuid,
        None => fake_id,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDevice {
    pub fake_id: String,
    pub physical_id: Arc<str>,
    pub health: Health,
}

/// Physical identity to device minor number, both directions.
#[derive(Debug, Clone, Default)]
pub struct ReverseIndex {
    by_uuid: HashMap<String, u32>,
    by_index: HashMap<u32, String>,
}

impl ReverseIndex {
    fn build(devices: &[PhysicalDevice]) -> Self {
        let mut index = Self::default();
        for device in devices {
            index.by_uuid.insert(device.uuid.clone(), device.index);
            index.by_index.insert(device.index, device.uuid.clone());
        }
        index
    }

    pub fn index_of(&self, uuid: &str) -> Option<u32> {
        self.by_uuid.get(uuid).copied()
    }

    pub fn device_name_by_index(&self, index: u32) -> Option<&str> {
        self.by_index.get(&index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }
}

/// Ordered set of virtual devices owned by one plugin instance.
#[derive(Debug, Clone)]
pub struct VirtualDeviceSet {
    devices: Vec<VirtualDevice>,
    positions: HashMap<String, usize>,
    physical_ids: Vec<Arc<str>>,
    reverse_index: ReverseIndex,
    gpu_memory: u64,
    memory_unit: MemoryUnit,
}

impl VirtualDeviceSet {
    pub fn iter(&self) -> impl Iterator<Item = &VirtualDevice> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, fake_id: &str) -> bool {
        self.positions.contains_key(fake_id)
    }

    pub fn get(&self, fake_id: &str) -> Option<&VirtualDevice> {
        self.positions.get(fake_id).map(|&pos| &self.devices[pos])
    }

    /// Physical identities in enumeration order.
    pub fn physical_ids(&self) -> &[Arc<str>] {
        &self.physical_ids
    }

    pub fn reverse_index(&self) -> &ReverseIndex {
        &self.reverse_index
    }

    /// Slices per physical device, in [`Self::memory_unit`].
    pub fn gpu_memory(&self) -> u64 {
        self.gpu_memory
    }

    pub fn memory_unit(&self) -> MemoryUnit {
        self.memory_unit
    }

    pub fn healthy_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.health == Health::Healthy)
            .count()
    }

    /// Marks the targeted devices unhealthy and returns how many changed.
    /// There is no way back to healthy.
    pub fn mark_unhealthy(&mut self, target: &UnhealthyDevices) -> usize {
        let mut changed = 0;
        for device in &mut self.devices {
            let matches = match target {
                UnhealthyDevices::All => true,
                UnhealthyDevices::Physical(uuid) => *device.physical_id == **uuid,
            };
            if matches && device.health == Health::Healthy {
                device.health = Health::Unhealthy;
                changed += 1;
            }
        }
        changed
    }
}

/// Turns enumerated physical devices into a [`VirtualDeviceSet`].
#[derive(Debug, Clone, Copy)]
pub struct DeviceVirtualizer {
    memory_unit: MemoryUnit,
}

impl DeviceVirtualizer {
    pub fn new(memory_unit: MemoryUnit) -> Self {
        Self { memory_unit }
    }

    pub fn slice(&self, physical: &[PhysicalDevice]) -> VirtualDeviceSet {
        let gpu_memory = physical
            .first()
            .map(|first| self.memory_unit.convert(first.memory_mib))
            .unwrap_or(0);
        info!(gpu_memory, unit = %self.memory_unit, "set gpu memory");

        let capacity = usize::try_from(gpu_memory)
            .unwrap_or(usize::MAX)
            .saturating_mul(physical.len());
        let mut devices = Vec::with_capacity(capacity);
        let mut positions = HashMap::with_capacity(capacity);
        let mut physical_ids = Vec::with_capacity(physical.len());

        for device in physical {
            info!(
                uuid = %device.uuid,
                index = device.index,
                memory_mib = device.memory_mib,
                "slicing device"
            );
            let physical_id: Arc<str> = Arc::from(device.uuid.as_str());
            physical_ids.push(physical_id.clone());

            for slice in 0..gpu_memory {
                let fake_id = generate_fake_device_id(&device.uuid, slice);
                if slice == 0 {
                    info!("add first device id: {fake_id}");
                }
                if slice + 1 == gpu_memory {
                    info!("add last device id: {fake_id}");
                }
                positions.insert(fake_id.clone(), devices.len());
                devices.push(VirtualDevice {
                    fake_id,
                    physical_id: physical_id.clone(),
                    health: Health::Healthy,
                });
            }
        }

        VirtualDeviceSet {
            devices,
            positions,
            physical_ids,
            reverse_index: ReverseIndex::build(physical),
            gpu_memory,
            memory_unit: self.memory_unit,
        }
    }
}
