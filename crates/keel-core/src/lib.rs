mod error;
mod release;
mod state;
mod version;

pub use error::{find_install_error, InstallError};
pub use release::{validate_component_name, ReleaseComponent, ReleaseManifest, ReleaseMigration};
pub use state::{ComponentManifest, InstallStatus, InstallationState, InstalledComponentState};
pub use version::{PreReleaseIdentifier, VersionDescriptor};
