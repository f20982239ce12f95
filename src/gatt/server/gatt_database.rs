//! A registry of local services with pre-allocated handles, able to answer
//! the discovery and read requests of a remote GATT client.

use std::{collections::BTreeMap, rc::Rc};

use anyhow::{bail, Result};
use log::error;

use crate::{
    core::uuid::Uuid,
    gatt::{
        channel::{DiscoveryRequest, DiscoveryResult},
        characteristic::CharacteristicProperties,
        ids::AttHandle,
    },
};

/// An ATT error code (Core Spec 5.3 Vol 3F 3.4.1.1)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttErrorCode(pub u8);

impl AttErrorCode {
    pub const INVALID_HANDLE: Self = Self(0x01);
    pub const READ_NOT_PERMITTED: Self = Self(0x02);
    pub const INSUFFICIENT_AUTHENTICATION: Self = Self(0x05);
}

/// Supplies the values of the attributes of one service
pub trait GattDatastore {
    /// Read a characteristic value or descriptor
    fn read(&self, handle: AttHandle) -> Result<Vec<u8>, AttErrorCode>;
}

/// A datastore backed by fixed values
#[derive(Debug, Default)]
pub struct StaticDatastore(BTreeMap<AttHandle, Vec<u8>>);

impl StaticDatastore {
    /// Constructor
    pub fn new(values: impl IntoIterator<Item = (AttHandle, Vec<u8>)>) -> Self {
        Self(values.into_iter().collect())
    }
}

impl GattDatastore for StaticDatastore {
    fn read(&self, handle: AttHandle) -> Result<Vec<u8>, AttErrorCode> {
        self.0.get(&handle).cloned().ok_or(AttErrorCode::READ_NOT_PERMITTED)
    }
}

/// A primary service, with the handle of its declaration and its contained
/// characteristics
#[derive(Debug, Clone)]
pub struct GattServiceWithHandle {
    /// The handle of the service declaration
    pub handle: AttHandle,
    /// The type of the service
    pub type_: Uuid,
    pub characteristics: Vec<GattCharacteristicWithHandle>,
}

/// A characteristic. Its declaration lives one handle before its value.
#[derive(Debug, Clone)]
pub struct GattCharacteristicWithHandle {
    /// The handle of the characteristic value attribute
    pub handle: AttHandle,
    /// The UUID representing the type of the characteristic value
    pub type_: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<GattDescriptorWithHandle>,
}

#[derive(Debug, Clone)]
pub struct GattDescriptorWithHandle {
    pub handle: AttHandle,
    pub type_: Uuid,
}

struct RegisteredService {
    service: GattServiceWithHandle,
    end_handle: AttHandle,
    datastore: Rc<dyn GattDatastore>,
}

/// The local attribute table
#[derive(Default)]
pub struct GattDatabase {
    services: BTreeMap<AttHandle, RegisteredService>,
}

impl GattDatabase {
    /// Constructor
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service with pre-allocated handles. Handles must be strictly
    /// increasing in declaration order and must not overlap any service
    /// already registered.
    pub fn add_service_with_handles(
        &mut self,
        service: GattServiceWithHandle,
        datastore: Rc<dyn GattDatastore>,
    ) -> Result<()> {
        if !service.handle.is_valid() {
            bail!("service {} declared at the invalid handle", service.type_);
        }

        let mut last = service.handle;
        for characteristic in &service.characteristics {
            let declaration = AttHandle(characteristic.handle.0.wrapping_sub(1));
            if declaration <= last {
                bail!("characteristic handle {:?} out of order", characteristic.handle);
            }
            last = characteristic.handle;
            for descriptor in &characteristic.descriptors {
                if descriptor.handle <= last {
                    bail!("descriptor handle {:?} out of order", descriptor.handle);
                }
                last = descriptor.handle;
            }
        }
        let end_handle = last;

        if let Some(existing) = self.services.values().find(|existing| {
            existing.service.handle <= end_handle && service.handle <= existing.end_handle
        }) {
            bail!(
                "service {} ({:?}..={end_handle:?}) overlaps service {} ({:?}..={:?})",
                service.type_,
                service.handle,
                existing.service.type_,
                existing.service.handle,
                existing.end_handle
            );
        }

        self.services.insert(service.handle, RegisteredService { service, end_handle, datastore });
        Ok(())
    }

    /// Remove the service declared at this handle
    pub fn remove_service_at_handle(&mut self, handle: AttHandle) -> Result<()> {
        if self.services.remove(&handle).is_none() {
            bail!("no service declared at {handle:?}");
        }
        Ok(())
    }

    /// Answer one discovery request the way a peer's ATT server would
    pub fn discover(&self, request: &DiscoveryRequest) -> Vec<DiscoveryResult> {
        match *request {
            DiscoveryRequest::PrimaryServices => self
                .services
                .values()
                .map(|registered| DiscoveryResult::Service {
                    uuid: registered.service.type_,
                    start_handle: registered.service.handle,
                    end_handle: registered.end_handle,
                })
                .collect(),
            DiscoveryRequest::Characteristics { start, end } => self
                .characteristics()
                .filter_map(|characteristic| {
                    let declaration_handle = AttHandle(characteristic.handle.0 - 1);
                    (start <= declaration_handle && declaration_handle <= end).then_some(
                        DiscoveryResult::Characteristic {
                            declaration_handle,
                            value_handle: characteristic.handle,
                            uuid: characteristic.type_,
                            properties: characteristic.properties,
                        },
                    )
                })
                .collect(),
            DiscoveryRequest::Descriptors { start, end } => self
                .characteristics()
                .flat_map(|characteristic| characteristic.descriptors.iter())
                .filter(|descriptor| start <= descriptor.handle && descriptor.handle <= end)
                .map(|descriptor| DiscoveryResult::Descriptor {
                    handle: descriptor.handle,
                    uuid: descriptor.type_,
                })
                .collect(),
        }
    }

    /// Read a characteristic value or descriptor
    pub fn read(&self, handle: AttHandle) -> Result<Vec<u8>, AttErrorCode> {
        let Some(registered) = self.services.values().find(|registered| {
            registered.service.handle <= handle && handle <= registered.end_handle
        }) else {
            error!("read of {handle:?} outside every service");
            return Err(AttErrorCode::INVALID_HANDLE);
        };
        let readable = registered.service.characteristics.iter().any(|characteristic| {
            characteristic.handle == handle
                || characteristic.descriptors.iter().any(|descriptor| descriptor.handle == handle)
        });
        if !readable {
            return Err(AttErrorCode::READ_NOT_PERMITTED);
        }
        registered.datastore.read(handle)
    }

    fn characteristics(&self) -> impl Iterator<Item = &GattCharacteristicWithHandle> {
        self.services.values().flat_map(|registered| registered.service.characteristics.iter())
    }
}
