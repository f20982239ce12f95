//! Tunables for the GATT client, parsed from `INIT_<flag>=<value>` strings

use log::{error, info};
use std::collections::BTreeMap;

/// The tracker stores client interfaces as bits of a u32
pub const MAX_CLIENT_APPS: usize = 32;

macro_rules! gatt_flags {
    (
        name: $name:ident
        flags: { $($flag:ident : $type:ty = $default:expr,)* }
    ) => {
        /// Configuration of the GATT client. Each field can be overridden by
        /// passing `INIT_<field>=<value>` to [`Self::parse`].
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            $(
                #[allow(missing_docs)]
                pub $flag: $type,
            )*
        }

        impl Default for $name {
            fn default() -> Self {
                Self { $($flag: $default,)* }
            }
        }

        impl $name {
            /// Parse flags of the form `INIT_<flag>=<value>`, ignoring (and
            /// logging) anything unknown or malformed
            pub fn parse(flags: Vec<String>) -> Self {
                let mut parsed = Self::default();
                for flag in flags {
                    let values: Vec<&str> = flag.split('=').collect();
                    if values.len() != 2 {
                        error!("Bad flag {}, must be in <FLAG>=<VALUE> format", flag);
                        continue;
                    }
                    match values[0] {
                        $(concat!("INIT_", stringify!($flag)) => {
                            match values[1].parse::<$type>() {
                                Ok(value) => parsed.$flag = value,
                                Err(e) => error!("Parse failure on '{}': {}", flag, e),
                            }
                        })*
                        _ => error!("Unsaved flag: {} = {}", values[0], values[1]),
                    }
                }
                let parsed = parsed.reconcile();
                info!("GATT client flags: {:?}", parsed);
                parsed
            }

            /// Current values, keyed by flag name
            pub fn dump(&self) -> BTreeMap<&'static str, String> {
                [$((stringify!($flag), self.$flag.to_string()),)*].into()
            }
        }
    }
}

gatt_flags! {
    name: GattClientFlags
    flags: {
        max_client_apps: usize = MAX_CLIENT_APPS,
        max_clcb: usize = 32,
        max_background_entries: usize = 16,
        max_notification_registrations: usize = 15,
        cache_chunk_size: usize = 10,
        persist_server_cache: bool = true,
        log_level: log::LevelFilter = log::LevelFilter::Info,
    }
}

impl GattClientFlags {
    fn reconcile(mut self) -> Self {
        if self.max_client_apps == 0 || self.max_client_apps > MAX_CLIENT_APPS {
            error!("max_client_apps {} out of range, clamping", self.max_client_apps);
            self.max_client_apps = self.max_client_apps.clamp(1, MAX_CLIENT_APPS);
        }
        self.cache_chunk_size = self.cache_chunk_size.max(1);
        self
    }
}
