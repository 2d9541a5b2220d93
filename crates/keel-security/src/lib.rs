mod checksum;
mod ed25519;

pub use checksum::{sha256_dir_hex, sha256_hex, verify_sha256_dir};
pub use ed25519::verify_release_signature;
