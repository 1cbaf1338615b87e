use super::EnvironmentHandler;
use crate::CoreError;
use cvengine_schema::EnvironmentDescriptor;

/// The machine cvengine itself runs on. Nothing to acquire or release.
#[derive(Debug, Default)]
pub struct LocalEnvironment {
    descriptor: Option<EnvironmentDescriptor>,
}

impl LocalEnvironment {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnvironmentHandler for LocalEnvironment {
    fn name(&self) -> &str {
        "local"
    }

    fn prepare(&mut self) -> Result<EnvironmentDescriptor, CoreError> {
        let descriptor = EnvironmentDescriptor::local();
        self.descriptor = Some(descriptor.clone());
        Ok(descriptor)
    }

    fn describe(&self) -> Option<&EnvironmentDescriptor> {
        self.descriptor.as_ref()
    }

    fn teardown(&mut self) {
        self.descriptor = None;
    }
}
