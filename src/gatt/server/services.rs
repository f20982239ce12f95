//! This module initializes the built-in services included in every
//! GATT server.

pub mod gap;
pub mod gatt;

use anyhow::Result;

use self::{gap::register_gap_service, gatt::register_gatt_service};

use super::gatt_database::GattDatabase;

/// Register all built-in services with the provided database
pub fn register_builtin_services(database: &mut GattDatabase) -> Result<()> {
    register_gap_service(database)?;
    register_gatt_service(database)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use crate::gatt::channel::{DiscoveryRequest, DiscoveryResult};

    use super::*;

    #[test]
    fn test_builtin_services_do_not_overlap() {
        let mut database = GattDatabase::new();

        register_builtin_services(&mut database).unwrap();

        let services = database.discover(&DiscoveryRequest::PrimaryServices);
        assert_eq!(services.len(), 2);
        assert!(matches!(
            services[0],
            DiscoveryResult::Service { uuid: gatt::GATT_SERVICE_UUID, .. }
        ));
        assert!(matches!(
            services[1],
            DiscoveryResult::Service { uuid: gap::GAP_SERVICE_UUID, .. }
        ));
    }

    #[test]
    fn test_registering_twice_fails() {
        let mut database = GattDatabase::new();
        register_builtin_services(&mut database).unwrap();

        assert!(register_builtin_services(&mut database).is_err());
    }
}
