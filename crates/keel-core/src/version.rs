use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::InstallError;

/// One dot-separated field of a pre-release tag.
///
/// Variant order matters: a numeric identifier always has lower precedence
/// than an alphanumeric one at the same position, which is exactly what the
/// derived `Ord` gives us.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PreReleaseIdentifier {
    Numeric(u64),
    AlphaNumeric(String),
}

impl fmt::Display for PreReleaseIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(value) => write!(f, "{value}"),
            Self::AlphaNumeric(value) => f.write_str(value),
        }
    }
}

/// A parsed `major[.minor[.patch]][-pre][+build]` version.
///
/// Precedence ignores build metadata (see [`VersionDescriptor::compare_precedence`]).
/// The `Ord` impl breaks precedence ties on build metadata so that it stays
/// consistent with `Eq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionDescriptor {
    major: u64,
    minor: u64,
    patch: u64,
    pre_release: Vec<PreReleaseIdentifier>,
    build: Vec<String>,
}

impl VersionDescriptor {
    pub const ZERO: Self = Self::new(0, 0, 0);

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: Vec::new(),
            build: Vec::new(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, InstallError> {
        let fail = |reason: String| InstallError::Format {
            input: text.to_string(),
            reason,
        };

        if text.trim().is_empty() {
            return Err(fail("version must not be empty".to_string()));
        }

        let (rest, build) = match text.split_once('+') {
            Some((rest, build)) => (rest, Some(build)),
            None => (text, None),
        };
        let (core, pre_release) = match rest.split_once('-') {
            Some((core, pre_release)) => (core, Some(pre_release)),
            None => (rest, None),
        };

        let fields = core.split('.').collect::<Vec<_>>();
        if fields.len() > 3 {
            return Err(fail(format!(
                "expected at most 3 numeric fields, found {}",
                fields.len()
            )));
        }
        let mut numbers = [0_u64; 3];
        for (index, field) in fields.iter().enumerate() {
            numbers[index] = parse_numeric(field).map_err(|reason| {
                fail(format!(
                    "{} field '{field}' {reason}",
                    ["major", "minor", "patch"][index]
                ))
            })?;
        }

        let pre_release = match pre_release {
            Some(raw) => parse_pre_release(raw).map_err(fail)?,
            None => Vec::new(),
        };
        let build = match build {
            Some(raw) => parse_build(raw).map_err(fail)?,
            None => Vec::new(),
        };

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            pre_release,
            build,
        })
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    pub fn patch(&self) -> u64 {
        self.patch
    }

    pub fn pre_release(&self) -> &[PreReleaseIdentifier] {
        &self.pre_release
    }

    pub fn build(&self) -> &[String] {
        &self.build
    }

    pub fn is_pre_release(&self) -> bool {
        !self.pre_release.is_empty()
    }

    /// Semantic-version precedence. Build metadata does not take part.
    pub fn compare_precedence(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| compare_pre_release(&self.pre_release, &other.pre_release))
    }

    pub fn same_precedence(&self, other: &Self) -> bool {
        self.compare_precedence(other) == Ordering::Equal
    }

    pub fn to_semver(&self) -> anyhow::Result<semver::Version> {
        let pre = join_fields(&self.pre_release);
        let build = self.build.join(".");
        Ok(semver::Version {
            major: self.major,
            minor: self.minor,
            patch: self.patch,
            pre: semver::Prerelease::new(&pre)
                .with_context(|| format!("invalid pre-release for semver: {pre}"))?,
            build: semver::BuildMetadata::new(&build)
                .with_context(|| format!("invalid build metadata for semver: {build}"))?,
        })
    }
}

fn compare_pre_release(left: &[PreReleaseIdentifier], right: &[PreReleaseIdentifier]) -> Ordering {
    match (left.is_empty(), right.is_empty()) {
        (true, true) => Ordering::Equal,
        // a release outranks any pre-release of the same numbers
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => left.cmp(right),
    }
}

fn parse_numeric(field: &str) -> Result<u64, String> {
    if field.is_empty() {
        return Err("must not be empty".to_string());
    }
    if !field.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err("must be a non-negative integer".to_string());
    }
    if field.len() > 1 && field.starts_with('0') {
        return Err("must not have leading zeros".to_string());
    }
    field.parse::<u64>().map_err(|_| "is too large".to_string())
}

fn parse_pre_release(raw: &str) -> Result<Vec<PreReleaseIdentifier>, String> {
    raw.split('.')
        .map(|identifier| {
            validate_identifier(identifier, "pre-release")?;
            if identifier.bytes().all(|byte| byte.is_ascii_digit()) {
                let value = parse_numeric(identifier)
                    .map_err(|reason| format!("pre-release identifier '{identifier}' {reason}"))?;
                Ok(PreReleaseIdentifier::Numeric(value))
            } else {
                Ok(PreReleaseIdentifier::AlphaNumeric(identifier.to_string()))
            }
        })
        .collect()
}

fn parse_build(raw: &str) -> Result<Vec<String>, String> {
    raw.split('.')
        .map(|identifier| {
            validate_identifier(identifier, "build metadata")?;
            Ok(identifier.to_string())
        })
        .collect()
}

fn validate_identifier(identifier: &str, what: &str) -> Result<(), String> {
    if identifier.is_empty() {
        return Err(format!("{what} identifiers must not be empty"));
    }
    if let Some(bad) = identifier
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || *ch == '-'))
    {
        return Err(format!(
            "{what} identifier '{identifier}' contains invalid character '{bad}'"
        ));
    }
    Ok(())
}

fn join_fields(fields: &[PreReleaseIdentifier]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

impl PartialOrd for VersionDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_precedence(other)
            .then_with(|| self.build.cmp(&other.build))
    }
}

impl fmt::Display for VersionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre_release.is_empty() {
            write!(f, "-{}", join_fields(&self.pre_release))?;
        }
        if !self.build.is_empty() {
            write!(f, "+{}", self.build.join("."))?;
        }
        Ok(())
    }
}

impl FromStr for VersionDescriptor {
    type Err = InstallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for VersionDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionDescriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}
