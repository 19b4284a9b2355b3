use tracing::info;

use crate::error::Result;
use crate::timer::Timer;

/// Hooks invoked by whatever registry hosts a managed component.
pub trait Registration {
    /// Returns the name the component should be registered under.
    fn pre_register(&self, requested: Option<&str>) -> Result<String>;

    fn post_register(&self, _registration_done: bool) {}

    fn pre_deregister(&self) -> Result<()> {
        Ok(())
    }

    fn post_deregister(&self) {}
}

impl Registration for Timer {
    fn pre_register(&self, requested: Option<&str>) -> Result<String> {
        Ok(requested.unwrap_or(self.name()).to_string())
    }

    /// A deregistered timer must not keep firing.
    fn pre_deregister(&self) -> Result<()> {
        info!(timer = %self.name(), "stopping timer before deregistration");
        self.stop();
        Ok(())
    }
}
