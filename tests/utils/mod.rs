use std::future::Future;

use bluetooth_gattc::core::logging::init_logging;
use log::LevelFilter;
use tokio::task::LocalSet;

pub fn start_test(f: impl Future<Output = ()>) {
    tokio_test::block_on(async move {
        init_logging(LevelFilter::Debug);
        LocalSet::new().run_until(f).await;
    });
}
