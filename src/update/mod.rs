//! Verified update pipeline: release discovery, signature gating, and
//! atomic installation.

mod controller;
mod installer;
mod release;

pub use controller::{InstallOutcome, PendingInstall, UpdateController, UpdateError, UpdatePolicy};
pub use installer::{atomic_install, validate_installed, InstallError, INSTALL_MODE};
pub use release::{
    surface_release_page, FetchError, GithubReleases, ReleaseAsset, ReleaseInfo, ReleaseSource,
};
