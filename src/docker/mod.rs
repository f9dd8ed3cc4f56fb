mod client;
mod progress;
mod volume;

pub use client::{ExecHandle, RuntimeClient, RuntimeError, RuntimeResult};
pub use progress::{follow_progress, PullOutcome};
pub use volume::{VolumeManager, VOLUME_MOUNT_POINT};

/// Network mode for created workloads: host networking on unix keeps the
/// declared port bindings 1:1 with the host, elsewhere the runtime bridge
/// does the mapping.
pub fn default_network_mode() -> &'static str {
    if cfg!(unix) {
        "host"
    } else {
        "bridge"
    }
}
