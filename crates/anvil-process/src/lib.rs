use std::{collections::BTreeSet, fmt, str::FromStr};

/// Stable instance identifier, assigned by the registry at creation time.
///
/// NOTE: Also used as the on-disk directory name, so it stays filesystem-safe.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct BackupId(pub String);

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackupId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct UploadId(pub String);

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of an instance.
///
/// The upper-snake names are only a wire concern; code always matches on the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    NotInstalled,
    Installing,
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotInstalled => "NOT_INSTALLED",
            Status::Installing => "INSTALLING",
            Status::Stopped => "STOPPED",
            Status::Starting => "STARTING",
            Status::Running => "RUNNING",
            Status::Stopping => "STOPPING",
            Status::Error => "ERROR",
        }
    }

    /// A child process may exist in these states.
    pub fn is_live(self) -> bool {
        matches!(self, Status::Starting | Status::Running | Status::Stopping)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of live event an observer can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Output,
    Metrics,
    Players,
    Status,
}

impl Subject {
    pub const ALL: [Subject; 4] = [
        Subject::Output,
        Subject::Metrics,
        Subject::Players,
        Subject::Status,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Subject::Output => "output",
            Subject::Metrics => "metrics",
            Subject::Players => "players",
            Subject::Status => "status",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subject {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "output" => Ok(Subject::Output),
            "metrics" | "system_metrics" => Ok(Subject::Metrics),
            "players" => Ok(Subject::Players),
            "status" => Ok(Subject::Status),
            other => Err(format!("unknown subject: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub sampled_at_unix_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlayerSet {
    #[serde(rename = "online_players")]
    pub online: BTreeSet<String>,
    #[serde(rename = "op_players")]
    pub operators: BTreeSet<String>,
    #[serde(rename = "banned_players")]
    pub banned: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusChange {
    pub status: Status,
    pub previous: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One message on an instance's live event stream.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum InstanceEvent {
    Output(String),
    Metrics(ResourceSample),
    Players(PlayerSet),
    Status(StatusChange),
}

impl InstanceEvent {
    pub fn subject(&self) -> Subject {
        match self {
            InstanceEvent::Output(_) => Subject::Output,
            InstanceEvent::Metrics(_) => Subject::Metrics,
            InstanceEvent::Players(_) => Subject::Players,
            InstanceEvent::Status(_) => Subject::Status,
        }
    }
}

/// Scalar configuration value ("property").
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WorldGenerationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_structures: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WorldInfo {
    pub name: String,
    pub path: String,
    pub version: Option<String>,
    #[serde(rename = "type")]
    pub world_type: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BackupInfo {
    pub backup_id: BackupId,
    pub instance_id: InstanceId,
    pub world: String,
    pub archive_path: String,
    pub created_at_unix_ms: u64,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub name: String,
    pub version: String,
    pub installed: bool,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// State handed to an observer right before its live subscriptions start.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstanceSnapshot {
    pub instance: InstanceSummary,
    pub players: PlayerSet,
    pub logs: Vec<String>,
    pub metrics: Option<ResourceSample>,
}
