// Domain models

mod container;
mod favicon;
mod routes;
mod version;

pub use container::{
    ContainerSnapshot, ContainerStatus, ContainerUsage, DaemonSnapshot, DockerStateSnapshot,
};
pub use favicon::{FaviconCacheEntry, favicon_key};
pub use routes::{RouteEntry, RouteTable, RoutesResponse};
pub use version::{LatestRelease, Version};
pub(crate) use version::{CurrentVersionResponse, LatestVersionResponse};
