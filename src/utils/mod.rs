pub mod helpers;
pub mod image_processing;
pub mod uid;

// Re-export commonly used items
pub use helpers::*;
pub use image_processing::{channel_mean, decode_image, flatten_to_gray8, GrayImage8};
pub use uid::{is_valid_uid, uuid_to_uid, UidGenerator};

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set, otherwise `debug` in verbose mode and `info` without.
/// The global subscriber can only be set once per process; later calls are ignored.
pub fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .finish(),
    );
}
