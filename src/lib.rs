// Waypoint - Service registration and discovery for Consul and etcd
//
// This library registers a process in a coordination store, keeps it alive
// with heartbeats, and resolves other services by name and version range.

// Re-export discovery functionality
pub use waypoint_discovery::*;

// Re-export the configuration crate
pub use waypoint_config;
pub use waypoint_config::{ConfigManager, ConfigService, ConfigSource};
