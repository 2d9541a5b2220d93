use anyhow::Result;
use keel_core::VersionDescriptor;
use semver::VersionReq;

use crate::ReleaseSource;

/// Picks the release an unqualified or requirement-qualified `upgrade` should target.
///
/// Without a requirement, pre-releases are only chosen when nothing else exists.
pub fn select_target(
    source: &impl ReleaseSource,
    requirement: Option<&VersionReq>,
) -> Result<Option<VersionDescriptor>> {
    let versions = source.available_versions()?;

    let Some(requirement) = requirement else {
        let newest_stable = versions
            .iter()
            .filter(|version| !version.is_pre_release())
            .max_by(|a, b| a.compare_precedence(b));
        return Ok(newest_stable
            .or_else(|| versions.iter().max_by(|a, b| a.compare_precedence(b)))
            .cloned());
    };

    let mut best: Option<&VersionDescriptor> = None;
    for version in &versions {
        if !requirement.matches(&version.to_semver()?) {
            continue;
        }
        if best.map_or(true, |current| version.compare_precedence(current).is_gt()) {
            best = Some(version);
        }
    }
    Ok(best.cloned())
}
