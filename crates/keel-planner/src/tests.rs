use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use keel_core::{
    find_install_error, ComponentManifest, InstallError, InstallationState,
    InstalledComponentState, ReleaseManifest, VersionDescriptor,
};
use semver::VersionReq;

use super::*;

fn v(text: &str) -> VersionDescriptor {
    VersionDescriptor::parse(text).expect("version should parse")
}

fn sha(ch: char) -> String {
    std::iter::repeat(ch).take(64).collect()
}

#[derive(Default)]
struct FakeReleases {
    releases: BTreeMap<String, ResolvedRelease>,
}

impl FakeReleases {
    fn with_release(mut self, toml: &str) -> Self {
        let manifest = ReleaseManifest::from_toml_str(toml).expect("release must parse");
        let root = PathBuf::from("/releases").join(manifest.version.to_string());
        self.releases
            .insert(manifest.version.to_string(), ResolvedRelease { manifest, root });
        self
    }
}

impl ReleaseSource for FakeReleases {
    fn available_versions(&self) -> Result<Vec<VersionDescriptor>> {
        Ok(self
            .releases
            .values()
            .map(|release| release.manifest.version.clone())
            .collect())
    }

    fn release(&self, version: &VersionDescriptor) -> Result<Option<ResolvedRelease>> {
        Ok(self
            .releases
            .values()
            .find(|release| release.manifest.version.same_precedence(version))
            .cloned())
    }
}

#[derive(Default)]
struct FakeBackups {
    snapshots: Vec<BackupSnapshot>,
}

impl BackupIndex for FakeBackups {
    fn snapshot(&self, version: &VersionDescriptor) -> Result<Option<BackupSnapshot>> {
        Ok(self
            .snapshots
            .iter()
            .find(|snapshot| snapshot.version.same_precedence(version))
            .cloned())
    }
}

fn installed(name: &str, version: &str, checksum: char) -> (String, InstalledComponentState) {
    (
        name.to_string(),
        InstalledComponentState {
            version: v(version),
            checksum: sha(checksum),
            install_path: PathBuf::from("/opt/keel/components").join(name),
        },
    )
}

fn stable_state(version: &str, components: &[(&str, char)]) -> InstallationState {
    InstallationState::new(
        v(version),
        components
            .iter()
            .map(|(name, checksum)| installed(name, version, *checksum))
            .collect(),
    )
}

fn release_1_3_0() -> String {
    format!(
        r#"
version = "1.3.0"

[components.platform]
checksum = "{platform}"
path = "payload/platform"

[components.ui]
checksum = "{ui}"
path = "payload/ui"
"#,
        platform = sha('c'),
        ui = sha('b')
    )
}

#[test]
fn same_version_plans_nothing() {
    let releases = FakeReleases::default();
    let backups = FakeBackups::default();
    let planner = TransitionPlanner::new(&releases, &backups, "/opt/keel/components");

    for state in [
        stable_state("1.2.0", &[("platform", 'a')]),
        stable_state("1.2.0", &[("platform", 'a')])
            .begin_transition("tx-open")
            .expect("must begin"),
        InstallationState::empty(),
    ] {
        let target = state.current_version().clone();
        let plan = planner.plan(&state, &target).expect("no-op must plan");
        assert!(plan.is_empty());
        assert_eq!(plan.direction, TransitionDirection::Noop);
        assert_eq!(&plan.resulting_manifest, state.manifest());
    }
}

#[test]
fn build_metadata_only_difference_is_a_no_op() {
    let releases = FakeReleases::default();
    let backups = FakeBackups::default();
    let planner = TransitionPlanner::new(&releases, &backups, "/opt/keel/components");
    let state = stable_state("1.2.0", &[("platform", 'a')]);

    let plan = planner.plan(&state, &v("1.2.0+rebuild")).expect("must plan");
    assert!(plan.is_empty());
}

#[test]
fn upgrade_replaces_only_changed_components() {
    let releases = FakeReleases::default().with_release(&release_1_3_0());
    let backups = FakeBackups::default();
    let planner = TransitionPlanner::new(&releases, &backups, "/opt/keel/components");
    let current = stable_state("1.2.0", &[("platform", 'a'), ("ui", 'b')]);

    let plan = planner.plan(&current, &v("1.3.0")).expect("upgrade must plan");

    assert_eq!(plan.direction, TransitionDirection::Upgrade);
    assert_eq!(
        plan.kinds(),
        vec![
            StepKind::Backup,
            StepKind::Replace,
            StepKind::Verify,
            StepKind::Activate
        ]
    );
    assert_eq!(plan.steps[0].target, "1.2.0");
    assert_eq!(plan.steps[1].target, "platform");
    assert_eq!(plan.steps[3].target, "1.3.0");
    assert!(plan.steps.iter().all(|step| step.idempotent));

    let payload = plan.payloads.get("platform").expect("platform payload");
    assert_eq!(
        payload.source,
        PathBuf::from("/releases/1.3.0/payload/platform")
    );
    assert_eq!(payload.checksum, sha('c'));
    assert!(!plan.payloads.contains_key("ui"));

    let ui = plan.resulting_manifest.get("ui").expect("ui stays installed");
    assert_eq!(ui.version, v("1.3.0"));
    assert_eq!(ui.install_path, PathBuf::from("/opt/keel/components/ui"));
}

#[test]
fn upgrade_installs_new_components_and_removes_dropped_ones_last() {
    let releases = FakeReleases::default().with_release(&release_1_3_0());
    let backups = FakeBackups::default();
    let planner = TransitionPlanner::new(&releases, &backups, "/opt/keel/components");
    let current = stable_state("1.2.0", &[("platform", 'c'), ("legacy-agent", 'd')]);

    let plan = planner.plan(&current, &v("1.3.0")).expect("upgrade must plan");

    assert_eq!(
        plan.steps
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        vec![
            "backup 1.2.0",
            "replace ui",
            "verify installation",
            "activate 1.3.0",
            "remove legacy-agent",
        ]
    );
    assert!(!plan.resulting_manifest.contains("legacy-agent"));
}

#[test]
fn fresh_install_skips_backup_and_migrations() {
    let release = format!(
        r#"
version = "2.0.0"

[components.platform]
checksum = "{}"
path = "platform"

[[migrations]]
id = "0001-init"
introduced_in = "1.0.0"
command = ["sh", "migrate.sh"]
"#,
        sha('e')
    );
    let releases = FakeReleases::default().with_release(&release);
    let backups = FakeBackups::default();
    let planner = TransitionPlanner::new(&releases, &backups, "/opt/keel/components");

    let plan = planner
        .plan(&InstallationState::empty(), &v("2.0.0"))
        .expect("install must plan");

    assert_eq!(plan.direction, TransitionDirection::Install);
    assert_eq!(
        plan.kinds(),
        vec![StepKind::Replace, StepKind::Verify, StepKind::Activate]
    );
    assert!(plan.migrations.is_empty());
}

#[test]
fn upgrade_includes_migrations_inside_the_version_span_in_order() {
    let release = format!(
        r#"
version = "1.5.0"

[components.platform]
checksum = "{}"
path = "platform"

[[migrations]]
id = "b-reindex"
introduced_in = "1.4.0"
command = ["sh", "reindex.sh"]

[[migrations]]
id = "a-schema"
introduced_in = "1.4.0"
command = ["sh", "schema.sh"]
revert = ["sh", "schema-revert.sh"]

[[migrations]]
id = "old"
introduced_in = "1.2.0"
command = ["sh", "old.sh"]

[[migrations]]
id = "newest"
introduced_in = "1.5.0"
command = ["sh", "newest.sh"]
"#,
        sha('f')
    );
    let releases = FakeReleases::default().with_release(&release);
    let backups = FakeBackups::default();
    let planner = TransitionPlanner::new(&releases, &backups, "/opt/keel/components");
    let current = stable_state("1.2.0", &[("platform", 'a')]);

    let plan = planner.plan(&current, &v("1.5.0")).expect("upgrade must plan");

    let migrate_steps = plan
        .steps
        .iter()
        .filter(|step| step.kind == StepKind::Migrate)
        .map(|step| (step.target.as_str(), step.idempotent))
        .collect::<Vec<_>>();
    assert_eq!(
        migrate_steps,
        vec![("a-schema", false), ("b-reindex", false), ("newest", false)]
    );
    let schema = plan.migrations.get("a-schema").expect("migration spec");
    assert_eq!(schema.revert, vec!["sh", "schema-revert.sh"]);
    assert_eq!(schema.working_dir, PathBuf::from("/releases/1.5.0"));

    let verify_index = plan
        .steps
        .iter()
        .position(|step| step.kind == StepKind::Verify)
        .expect("verify step");
    assert!(plan.steps[..verify_index]
        .iter()
        .any(|step| step.kind == StepKind::Migrate));
}

#[test]
fn upgrade_to_unknown_release_is_invalid() {
    let releases = FakeReleases::default();
    let backups = FakeBackups::default();
    let planner = TransitionPlanner::new(&releases, &backups, "/opt/keel/components");
    let current = stable_state("1.2.0", &[("platform", 'a')]);

    let err = planner
        .plan(&current, &v("9.0.0"))
        .expect_err("missing release must fail");
    assert!(matches!(
        find_install_error(&err),
        Some(InstallError::InvalidTransition { reason, .. }) if reason.contains("no release 9.0.0")
    ));
}

#[test]
fn rollback_without_snapshot_is_invalid() {
    let releases = FakeReleases::default();
    let backups = FakeBackups::default();
    let planner = TransitionPlanner::new(&releases, &backups, "/opt/keel/components");
    let current = stable_state("2.0.0", &[("platform", 'a')]);

    let err = planner
        .plan(&current, &v("1.9.0"))
        .expect_err("rollback without backup must fail");
    match find_install_error(&err) {
        Some(InstallError::InvalidTransition { from, to, reason }) => {
            assert_eq!(from, "2.0.0");
            assert_eq!(to, "1.9.0");
            assert!(reason.contains("no backup snapshot covers 1.9.0"));
        }
        other => panic!("unexpected error: {other:?} ({err:#})"),
    }
}

#[test]
fn rollback_restores_snapshot_components() {
    let releases = FakeReleases::default();
    let snapshot_manifest: ComponentManifest = [
        installed("platform", "1.9.0", 'a'),
        installed("ui", "1.9.0", 'b'),
    ]
    .into_iter()
    .collect();
    let backups = FakeBackups {
        snapshots: vec![BackupSnapshot {
            version: v("1.9.0"),
            manifest: snapshot_manifest,
            components_root: PathBuf::from("/opt/keel/backups/1.9.0/components"),
            txid: "tx-earlier".to_string(),
            created_at_unix: 1,
        }],
    };
    let planner = TransitionPlanner::new(&releases, &backups, "/opt/keel/components");
    let current = stable_state("2.0.0", &[("platform", 'c'), ("ui", 'b'), ("search", 'd')]);

    let plan = planner.plan(&current, &v("1.9.0")).expect("rollback must plan");

    assert_eq!(plan.direction, TransitionDirection::Rollback);
    assert_eq!(
        plan.steps
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        vec![
            "backup 2.0.0",
            "replace platform",
            "verify installation",
            "activate 1.9.0",
            "remove search",
        ]
    );
    assert_eq!(
        plan.payloads.get("platform").map(|payload| payload.source.clone()),
        Some(PathBuf::from("/opt/keel/backups/1.9.0/components/platform"))
    );
    assert_eq!(plan.resulting_manifest.len(), 2);
    assert!(plan.migrations.is_empty());
}

#[test]
fn unresolved_transitions_block_planning() {
    let releases = FakeReleases::default().with_release(&release_1_3_0());
    let backups = FakeBackups::default();
    let planner = TransitionPlanner::new(&releases, &backups, "/opt/keel/components");

    let in_progress = stable_state("1.2.0", &[("platform", 'a')])
        .begin_transition("tx-open")
        .expect("must begin");
    let err = planner
        .plan(&in_progress, &v("1.3.0"))
        .expect_err("in-progress state must block planning");
    assert!(format!("{err:#}").contains("tx-open is still in progress"));

    let failed = in_progress.mark_failed();
    let err = planner
        .plan(&failed, &v("1.3.0"))
        .expect_err("failed state must block planning");
    assert!(matches!(
        find_install_error(&err),
        Some(InstallError::InvalidTransition { reason, .. }) if reason.contains("keelctl repair")
    ));
}

#[test]
fn transition_ids_are_unique() {
    let first = next_transition_id().expect("id");
    let second = next_transition_id().expect("id");
    assert_ne!(first, second);
    assert!(first.starts_with("tx-"));
}

#[test]
fn plan_survives_serialization_for_checkpoints() {
    let releases = FakeReleases::default().with_release(&release_1_3_0());
    let backups = FakeBackups::default();
    let planner = TransitionPlanner::new(&releases, &backups, "/opt/keel/components");
    let plan = planner
        .plan(&stable_state("1.2.0", &[("platform", 'a')]), &v("1.3.0"))
        .expect("must plan");

    let encoded = serde_json::to_string(&plan).expect("must serialize");
    assert!(encoded.contains("\"kind\":\"replace\""));
    let decoded: TransitionPlan = serde_json::from_str(&encoded).expect("must deserialize");
    assert_eq!(decoded, plan);
}

#[test]
fn select_target_prefers_newest_stable_or_matching_release() {
    let component = |version: &str| {
        format!(
            "version = \"{version}\"\n[components.platform]\nchecksum = \"{}\"\npath = \"p\"\n",
            sha('a')
        )
    };
    let releases = FakeReleases::default()
        .with_release(&component("1.2.0"))
        .with_release(&component("1.10.0"))
        .with_release(&component("2.0.0-rc.1"))
        .with_release(&component("1.9.3"));

    assert_eq!(
        select_target(&releases, None).expect("must select"),
        Some(v("1.10.0"))
    );

    let req = VersionReq::parse("~1.9").expect("valid requirement");
    assert_eq!(
        select_target(&releases, Some(&req)).expect("must select"),
        Some(v("1.9.3"))
    );

    let req = VersionReq::parse(">=2.0.0-rc.1").expect("valid requirement");
    assert_eq!(
        select_target(&releases, Some(&req)).expect("must select"),
        Some(v("2.0.0-rc.1"))
    );

    let req = VersionReq::parse("^3").expect("valid requirement");
    assert_eq!(select_target(&releases, Some(&req)).expect("must select"), None);

    let only_pre = FakeReleases::default().with_release(&component("0.1.0-beta.1"));
    assert_eq!(
        select_target(&only_pre, None).expect("must select"),
        Some(v("0.1.0-beta.1"))
    );
}
