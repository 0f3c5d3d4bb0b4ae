//! Switch-wide context threaded through subsystem constructors.

use std::sync::Arc;
use switchyd_sad::{SadResult, SwitchDriver, SwitchInfo};

/// The driver handle plus the switch facts read once at startup:
/// switch MAC, CPU port, default virtual router, default trap group
/// and capability limits. Read-only after construction.
#[derive(Clone)]
pub struct SwitchContext {
    driver: Arc<dyn SwitchDriver>,
    info: SwitchInfo,
}

impl SwitchContext {
    pub fn new(driver: Arc<dyn SwitchDriver>) -> SadResult<Self> {
        let info = driver.switch_info()?;
        Ok(Self { driver, info })
    }

    /// The switch abstraction driver.
    pub fn sad(&self) -> &dyn SwitchDriver {
        self.driver.as_ref()
    }

    pub fn driver(&self) -> Arc<dyn SwitchDriver> {
        Arc::clone(&self.driver)
    }

    pub fn info(&self) -> &SwitchInfo {
        &self.info
    }
}
