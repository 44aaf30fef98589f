mod docker;

pub use docker::DockerRuntime;

/// Label marking containers managed by this agent.
pub const MANAGED_LABEL: &str = "io.lattice.managed";
pub const APP_ID_LABEL: &str = "io.lattice.app-id";
pub const SERVICE_ID_LABEL: &str = "io.lattice.service-id";
pub const SERVICE_NAME_LABEL: &str = "io.lattice.service-name";
