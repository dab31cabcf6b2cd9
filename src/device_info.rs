//! Remote device capability cache.
//!
//! Each transaction checks out the record of its peer when it is created and
//! releases it when it terminates. Records are learned from I-Am messages,
//! from reading the remote Device object, or lazily from the flags carried by
//! confirmed requests.
//!
//! ## Record Lifecycle
//!
//! ```text
//! I-Am / ReadProperty          Transaction Manager               SSM
//!        |                             |                          |
//!        |--update_device_info-------->|                          |
//!        |                             |--acquire_device_info---->|
//!        |                             |        (ref_count + 1)   |
//!        |                             |<--release_device_info----|
//!        |                             |        (ref_count - 1)   |
//! ```

use std::collections::HashMap;

use log::{debug, trace};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::apdu::Segmentation;
use crate::config::DEFAULT_MAX_APDU_LENGTH;
use crate::error::{Result, TsmError};

/// Capabilities of a remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    /// Address the device is reached at
    pub address: Address,
    /// Device object instance, once known
    pub device_instance: Option<u32>,
    /// Largest APDU the device accepts
    pub max_apdu_length_accepted: usize,
    /// Largest NPDU that can reach the device, if a router limits it
    pub max_npdu_length: Option<usize>,
    /// Which directions the device can segment
    pub segmentation_supported: Segmentation,
    /// Largest number of segments the device accepts; `None` if unknown
    pub max_segments_accepted: Option<u8>,
    /// Vendor identifier
    pub vendor_id: Option<u16>,
}

impl DeviceInfo {
    /// A record with conservative defaults: no segmentation, 1024 byte APDUs.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            device_instance: None,
            max_apdu_length_accepted: DEFAULT_MAX_APDU_LENGTH,
            max_npdu_length: None,
            segmentation_supported: Segmentation::None,
            max_segments_accepted: None,
            vendor_id: None,
        }
    }

    /// Largest payload that can be delivered to this device in one APDU.
    pub fn max_deliverable_length(&self) -> usize {
        match self.max_npdu_length {
            Some(npdu) => npdu.min(self.max_apdu_length_accepted),
            None => self.max_apdu_length_accepted,
        }
    }
}

/// Contents of an I-Am announcement relevant to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAm {
    pub device_instance: u32,
    pub max_apdu_length_accepted: usize,
    pub segmentation_supported: Segmentation,
    pub vendor_id: u16,
}

/// Collaborator contract between the transaction layer and the device
/// information store.
pub trait DeviceInfoCache {
    /// Look up a record without checking it out.
    fn get_device_info(&self, address: &Address) -> Option<DeviceInfo>;

    /// Look up a record and check it out for the lifetime of a transaction.
    fn acquire_device_info(&mut self, address: &Address) -> Option<DeviceInfo>;

    /// Return a record checked out by [`acquire_device_info`](Self::acquire_device_info).
    fn release_device_info(&mut self, info: &DeviceInfo) -> Result<()>;

    /// Store an updated record.
    fn update_device_info(&mut self, info: DeviceInfo);
}

#[derive(Debug, Clone)]
struct CacheEntry {
    info: DeviceInfo,
    ref_count: usize,
}

/// In-memory [`DeviceInfoCache`] keyed by address and by device instance.
#[derive(Debug, Default)]
pub struct DeviceInfoTable {
    entries: HashMap<Address, CacheEntry>,
    instances: HashMap<u32, Address>,
}

impl DeviceInfoTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a record exists for the address
    pub fn has_device_info(&self, address: &Address) -> bool {
        self.entries.contains_key(address)
    }

    /// Look up a record by device instance
    pub fn get_by_instance(&self, device_instance: u32) -> Option<&DeviceInfo> {
        let address = self.instances.get(&device_instance)?;
        self.entries.get(address).map(|entry| &entry.info)
    }

    /// Learn capabilities from an I-Am sent by `address`
    pub fn iam_device_info(&mut self, address: Address, iam: IAm) {
        let mut info = self
            .get_by_instance(iam.device_instance)
            .cloned()
            .or_else(|| self.entries.get(&address).map(|entry| entry.info.clone()))
            .unwrap_or_else(|| DeviceInfo::new(address.clone()));

        info.address = address;
        info.device_instance = Some(iam.device_instance);
        info.max_apdu_length_accepted = iam.max_apdu_length_accepted;
        info.segmentation_supported = iam.segmentation_supported;
        info.vendor_id = Some(iam.vendor_id);

        self.update_device_info(info);
    }

    /// Number of transactions currently holding the record
    pub fn ref_count(&self, address: &Address) -> usize {
        self.entries.get(address).map_or(0, |entry| entry.ref_count)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode every record into a bincode snapshot.
    ///
    /// Reference counts are not part of the snapshot.
    #[cfg(feature = "serde")]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut records: Vec<&DeviceInfo> = self.entries.values().map(|entry| &entry.info).collect();
        records.sort_by(|a, b| a.address.cmp(&b.address));
        bincode::serialize(&records).map_err(|e| TsmError::Persistence(e.to_string()))
    }

    /// Rebuild a table from a snapshot produced by [`to_bytes`](Self::to_bytes).
    #[cfg(feature = "serde")]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let records: Vec<DeviceInfo> =
            bincode::deserialize(bytes).map_err(|e| TsmError::Persistence(e.to_string()))?;
        let mut table = Self::new();
        for info in records {
            table.update_device_info(info);
        }
        Ok(table)
    }
}

impl DeviceInfoCache for DeviceInfoTable {
    fn get_device_info(&self, address: &Address) -> Option<DeviceInfo> {
        self.entries.get(address).map(|entry| entry.info.clone())
    }

    fn acquire_device_info(&mut self, address: &Address) -> Option<DeviceInfo> {
        let entry = self.entries.get_mut(address)?;
        entry.ref_count += 1;
        trace!("Acquired device info {} (refs={})", address, entry.ref_count);
        Some(entry.info.clone())
    }

    fn release_device_info(&mut self, info: &DeviceInfo) -> Result<()> {
        // The device may have moved while the record was checked out
        let address = match info.device_instance.and_then(|i| self.instances.get(&i)) {
            Some(current) if !self.entries.contains_key(&info.address) => current.clone(),
            _ => info.address.clone(),
        };
        let entry = self
            .entries
            .get_mut(&address)
            .filter(|entry| entry.ref_count > 0)
            .ok_or_else(|| TsmError::ReferenceCount(info.address.clone()))?;
        entry.ref_count -= 1;
        trace!("Released device info {} (refs={})", address, entry.ref_count);
        Ok(())
    }

    fn update_device_info(&mut self, info: DeviceInfo) {
        let mut ref_count = 0;

        // A known instance at a new address moves, keeping its checkouts
        if let Some(instance) = info.device_instance {
            if let Some(old_address) = self.instances.get(&instance).cloned() {
                if old_address != info.address {
                    if let Some(old) = self.entries.remove(&old_address) {
                        debug!(
                            "Device {} moved from {} to {}",
                            instance, old_address, info.address
                        );
                        ref_count = old.ref_count;
                    }
                }
            }
        }

        // The address may have belonged to another instance
        if let Some(existing) = self.entries.get(&info.address) {
            ref_count += existing.ref_count;
            if let Some(old_instance) = existing.info.device_instance {
                if Some(old_instance) != info.device_instance {
                    self.instances.remove(&old_instance);
                }
            }
        }

        if let Some(instance) = info.device_instance {
            self.instances.insert(instance, info.address.clone());
        }

        debug!(
            "Device info {}: max_apdu={} segmentation={:?}",
            info.address, info.max_apdu_length_accepted, info.segmentation_supported
        );
        self.entries
            .insert(info.address.clone(), CacheEntry { info, ref_count });
    }
}
