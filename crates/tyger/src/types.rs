use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a Duration from either a string (human-readable) or u64 (seconds)
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(secs) => Ok(Duration::from_secs(secs)),
    }
}

/// Serialize a Duration as whole seconds so it roundtrips with deserialize_duration
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

pub const MAX_TAGS: usize = 10;
pub const MAX_TAG_KEY_LEN: usize = 128;
pub const MAX_TAG_VALUE_LEN: usize = 256;

/// Validate a buffer tag map against the tag grammar: at most
/// [`MAX_TAGS`] entries, keys 1-128 chars and values 0-256 chars drawn from
/// `[A-Za-z0-9_.-]`.
pub fn validate_tags(tags: &BTreeMap<String, String>) -> crate::error::Result<()> {
    use crate::error::Error;

    if tags.len() > MAX_TAGS {
        return Err(Error::validation(format!(
            "too many tags: {} exceeds the limit of {}",
            tags.len(),
            MAX_TAGS
        )));
    }
    for (key, value) in tags {
        if key.is_empty() || key.len() > MAX_TAG_KEY_LEN {
            return Err(Error::validation(format!(
                "tag key {:?} must be between 1 and {} characters",
                key, MAX_TAG_KEY_LEN
            )));
        }
        if value.len() > MAX_TAG_VALUE_LEN {
            return Err(Error::validation(format!(
                "tag value for {:?} exceeds {} characters",
                key, MAX_TAG_VALUE_LEN
            )));
        }
        if !key.chars().all(is_tag_char) {
            return Err(Error::validation(format!(
                "tag key {:?} contains characters outside [A-Za-z0-9_.-]",
                key
            )));
        }
        if !value.chars().all(is_tag_char) {
            return Err(Error::validation(format!(
                "tag value for {:?} contains characters outside [A-Za-z0-9_.-]",
                key
            )));
        }
    }
    Ok(())
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Compute resource requests and limits for a codespec container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// Requested resources, e.g. `cpu: "2"`, `memory: "4G"`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    /// Resource limits, same keys as requests.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
    /// Number of GPUs the container needs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<u32>,
}

impl ResourceSpec {
    pub fn needs_gpu(&self) -> bool {
        self.gpu.is_some_and(|n| n > 0)
    }
}

/// Declared buffer parameters of a job codespec. Names must be unique across
/// inputs and outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferParameters {
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl BufferParameters {
    /// All declared parameter names with their writeability
    /// (outputs are writeable).
    pub fn all(&self) -> impl Iterator<Item = (&str, bool)> {
        self.inputs
            .iter()
            .map(|n| (n.as_str(), false))
            .chain(self.outputs.iter().map(|n| (n.as_str(), true)))
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }
}

/// Fields common to job and worker codespecs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodespecCommon {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
    /// Identity hint propagated to the backend for image pulls and signing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

/// A job codespec: the container template a run's main containers are
/// created from, plus its declared buffer parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCodespec {
    #[serde(flatten)]
    pub common: CodespecCommon,
    #[serde(default, skip_serializing_if = "BufferParameters::is_empty")]
    pub buffers: BufferParameters,
}

/// A worker codespec: replicated containers addressable from the main pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCodespec {
    #[serde(flatten)]
    pub common: CodespecCommon,
    /// Named endpoint ports exposed by each replica.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, u16>,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CodespecDetails {
    Job(JobCodespec),
    Worker(WorkerCodespec),
}

impl CodespecDetails {
    pub fn common(&self) -> &CodespecCommon {
        match self {
            CodespecDetails::Job(j) => &j.common,
            CodespecDetails::Worker(w) => &w.common,
        }
    }

    pub fn as_job(&self) -> Option<&JobCodespec> {
        match self {
            CodespecDetails::Job(j) => Some(j),
            CodespecDetails::Worker(_) => None,
        }
    }

    pub fn as_worker(&self) -> Option<&WorkerCodespec> {
        match self {
            CodespecDetails::Job(_) => None,
            CodespecDetails::Worker(w) => Some(w),
        }
    }
}

/// A stored codespec. Immutable; versions are assigned monotonically per
/// name by the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Codespec {
    pub name: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub details: CodespecDetails,
}

impl Codespec {
    /// The fully qualified `name/versions/N` reference to this codespec.
    pub fn qualified_ref(&self) -> CodespecRef {
        CodespecRef {
            name: self.name.clone(),
            version: Some(self.version),
        }
    }
}

/// A reference to a codespec, either by bare name (resolves to the latest
/// version) or in the fully qualified `name/versions/N` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodespecRef {
    pub name: String,
    pub version: Option<i32>,
}

impl CodespecRef {
    pub fn parse(s: &str) -> crate::error::Result<Self> {
        use crate::error::Error;

        if s.is_empty() {
            return Err(Error::validation("codespec reference must not be empty"));
        }
        match s.split_once('/') {
            None => Ok(Self {
                name: s.to_string(),
                version: None,
            }),
            Some((name, rest)) => {
                let version = rest
                    .strip_prefix("versions/")
                    .and_then(|v| v.parse::<i32>().ok())
                    .ok_or_else(|| {
                        Error::validation(format!(
                            "invalid codespec reference {:?}; expected \"name\" or \"name/versions/N\"",
                            s
                        ))
                    })?;
                if name.is_empty() {
                    return Err(Error::validation(format!(
                        "invalid codespec reference {:?}: empty name",
                        s
                    )));
                }
                Ok(Self {
                    name: name.to_string(),
                    version: Some(version),
                })
            }
        }
    }
}

impl std::fmt::Display for CodespecRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.version {
            Some(v) => write!(f, "{}/versions/{}", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Serialize for CodespecRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CodespecRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CodespecRef::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A buffer: a content-addressed opaque byte container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Buffer {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Logical region matching a configured storage account.
    pub location: String,
    /// Stable id of the storage account the buffer was placed on.
    pub account_id: i32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub soft_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Opaque versioning token; changes on every mutation.
    pub etag: String,
}

/// A logical storage account record. Assigned a stable integer id on first
/// registration; a buffer's owning account id never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageAccount {
    pub id: i32,
    pub name: String,
    pub location: String,
    pub endpoint: String,
}

/// A signed access grant for one buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferAccess {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunKind {
    User,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Whether the status is terminal. Terminal statuses never regress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "canceled" => Ok(RunStatus::Canceled),
            other => Err(format!("unknown run status {:?}", other)),
        }
    }
}

/// The job half of a run: a codespec reference plus the buffer bindings for
/// its declared parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunSpec {
    pub codespec: CodespecRef,
    /// Parameter name -> buffer id (or an ephemeral `temp-...` marker on
    /// creation).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub buffers: BTreeMap<String, String>,
    /// Tags applied to buffers created for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

/// The optional worker half of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRunSpec {
    pub codespec: CodespecRef,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

/// A run creation request, before admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRun {
    pub kind: RunKind,
    pub job: JobRunSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerRunSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// A stored run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: i64,
    pub kind: RunKind,
    pub job: JobRunSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerRunSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_archived_at: Option<DateTime<Utc>>,
    /// Whether backend objects were ever created for this run.
    #[serde(default)]
    pub resources_created: bool,
    /// DB-terminal and reclaimed: terminal status observed, logs archived,
    /// backend objects removed.
    #[serde(default)]
    pub is_final: bool,
}

/// Tag predicate applied to buffer listings: every `include` pair must be
/// present and no `exclude` pair may be.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferFilter {
    pub include_tags: BTreeMap<String, String>,
    pub exclude_tags: BTreeMap<String, String>,
    pub soft_deleted: bool,
}

impl BufferFilter {
    pub fn matches(&self, buffer: &Buffer) -> bool {
        if buffer.soft_deleted != self.soft_deleted {
            return false;
        }
        for (k, v) in &self.include_tags {
            if buffer.tags.get(k) != Some(v) {
                return false;
            }
        }
        for (k, v) in &self.exclude_tags {
            if buffer.tags.get(k) == Some(v) {
                return false;
            }
        }
        true
    }
}

/// One page of a buffer listing with an opaque continuation token.
#[derive(Debug, Clone, Default)]
pub struct BufferPage {
    pub buffers: Vec<Buffer>,
    pub continuation: Option<String>,
}

/// Encode a keyset continuation token for `(created_at, id)` paging.
pub fn encode_continuation(created_at: DateTime<Utc>, id: &str) -> String {
    use base64::Engine;
    let raw = format!("{}:{}", created_at.timestamp_micros(), id);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

/// Decode a keyset continuation token produced by [`encode_continuation`].
pub fn decode_continuation(token: &str) -> crate::error::Result<(DateTime<Utc>, String)> {
    use crate::error::Error;
    use base64::Engine;

    let invalid = || Error::validation("invalid continuation token");
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| invalid())?;
    let raw = String::from_utf8(raw).map_err(|_| invalid())?;
    let (micros, id) = raw.split_once(':').ok_or_else(invalid)?;
    let micros: i64 = micros.parse().map_err(|_| invalid())?;
    let created_at = DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(invalid)?;
    Ok((created_at, id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn tag_validation_accepts_well_formed_maps() {
        let t = tags(&[("phase", "final"), ("subject_id", "a.b-c_d")]);
        assert!(validate_tags(&t).is_ok());
    }

    #[test]
    fn tag_validation_rejects_too_many_entries() {
        let t: BTreeMap<String, String> = (0..11)
            .map(|i| (format!("key{}", i), "v".to_string()))
            .collect();
        assert!(validate_tags(&t).is_err());
    }

    #[test]
    fn tag_validation_rejects_empty_and_oversized_keys() {
        assert!(validate_tags(&tags(&[("", "v")])).is_err());
        let long_key = "k".repeat(129);
        let mut t = BTreeMap::new();
        t.insert(long_key, "v".to_string());
        assert!(validate_tags(&t).is_err());
    }

    #[test]
    fn tag_validation_rejects_bad_characters() {
        assert!(validate_tags(&tags(&[("sp ace", "v")])).is_err());
        assert!(validate_tags(&tags(&[("key", "na\u{ef}ve")])).is_err());
        assert!(validate_tags(&tags(&[("key", "semi;colon")])).is_err());
    }

    #[test]
    fn tag_validation_allows_empty_values() {
        assert!(validate_tags(&tags(&[("marker", "")])).is_ok());
    }

    #[test]
    fn codespec_ref_parses_bare_name() {
        let r = CodespecRef::parse("recon").expect("parse");
        assert_eq!(r.name, "recon");
        assert_eq!(r.version, None);
        assert_eq!(r.to_string(), "recon");
    }

    #[test]
    fn codespec_ref_parses_qualified_form() {
        let r = CodespecRef::parse("recon/versions/7").expect("parse");
        assert_eq!(r.name, "recon");
        assert_eq!(r.version, Some(7));
        assert_eq!(r.to_string(), "recon/versions/7");
    }

    #[test]
    fn codespec_ref_rejects_malformed_forms() {
        assert!(CodespecRef::parse("").is_err());
        assert!(CodespecRef::parse("recon/7").is_err());
        assert!(CodespecRef::parse("recon/versions/x").is_err());
        assert!(CodespecRef::parse("/versions/1").is_err());
    }

    #[test]
    fn codespec_ref_roundtrips_through_serde() {
        let r = CodespecRef::parse("recon/versions/3").expect("parse");
        let json = serde_json::to_string(&r).expect("serialize");
        assert_eq!(json, "\"recon/versions/3\"");
        let back: CodespecRef = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, r);
    }

    #[test]
    fn terminal_statuses_are_exactly_the_three() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
    }

    #[test]
    fn run_status_parses_its_display_form() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Canceled,
        ] {
            let parsed: RunStatus = status.to_string().parse().expect("parse");
            assert_eq!(parsed, status);
        }
        assert!("unknown".parse::<RunStatus>().is_err());
    }

    #[test]
    fn buffer_filter_applies_include_and_exclude() {
        let buffer = Buffer {
            id: "abc".to_string(),
            created_at: Utc::now(),
            location: "eastus".to_string(),
            account_id: 1,
            tags: tags(&[("phase", "final"), ("site", "a")]),
            soft_deleted: false,
            expires_at: None,
            etag: "t1".to_string(),
        };

        let mut filter = BufferFilter::default();
        assert!(filter.matches(&buffer));

        filter.include_tags = tags(&[("phase", "final")]);
        assert!(filter.matches(&buffer));

        filter.exclude_tags = tags(&[("site", "a")]);
        assert!(!filter.matches(&buffer));

        filter.exclude_tags = tags(&[("site", "b")]);
        assert!(filter.matches(&buffer));

        filter.soft_deleted = true;
        assert!(!filter.matches(&buffer));
    }

    #[test]
    fn continuation_token_roundtrips() {
        let at = Utc::now();
        let token = encode_continuation(at, "yf4ewpecgcpmkzkgjrsv6r5bcu");
        let (decoded_at, id) = decode_continuation(&token).expect("decode");
        assert_eq!(decoded_at.timestamp_micros(), at.timestamp_micros());
        assert_eq!(id, "yf4ewpecgcpmkzkgjrsv6r5bcu");
    }

    #[test]
    fn continuation_token_rejects_garbage() {
        assert!(decode_continuation("!!!").is_err());
        assert!(decode_continuation("aGVsbG8").is_err());
    }

    #[test]
    fn codespec_details_serializes_with_kind_tag() {
        let details = CodespecDetails::Job(JobCodespec {
            common: CodespecCommon {
                image: "alpine".to_string(),
                ..Default::default()
            },
            buffers: BufferParameters {
                inputs: vec!["input".to_string()],
                outputs: vec!["output".to_string()],
            },
        });
        let json = serde_json::to_string(&details).expect("serialize");
        assert!(json.contains("\"kind\":\"job\""));
        let back: CodespecDetails = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, details);
    }

    #[test]
    fn buffer_parameters_iterate_with_writeability() {
        let params = BufferParameters {
            inputs: vec!["a".to_string()],
            outputs: vec!["b".to_string()],
        };
        let all: Vec<(&str, bool)> = params.all().collect();
        assert_eq!(all, vec![("a", false), ("b", true)]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any map drawn from the tag grammar validates.
            #[test]
            fn grammar_conforming_tags_validate(
                entries in proptest::collection::btree_map(
                    "[A-Za-z0-9_.-]{1,128}",
                    "[A-Za-z0-9_.-]{0,256}",
                    0..=10,
                )
            ) {
                prop_assert!(validate_tags(&entries).is_ok());
            }

            // Continuation tokens roundtrip for arbitrary ids and times.
            #[test]
            fn continuation_roundtrip(
                micros in 0i64..4_102_444_800_000_000,
                id in "[a-z2-7]{26}",
            ) {
                let at = DateTime::<Utc>::from_timestamp_micros(micros).unwrap();
                let token = encode_continuation(at, &id);
                let (decoded_at, decoded_id) = decode_continuation(&token).unwrap();
                prop_assert_eq!(decoded_at.timestamp_micros(), micros);
                prop_assert_eq!(decoded_id, id);
            }
        }
    }
}
