use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn index(&self) -> usize {
        match self {
            Role::User => 0,
            Role::Assistant => 1,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Voice,
    Text,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Voice => "voice",
            Channel::Text => "text",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(role, channel)` pair. Every per-pair piece of tracking state is keyed
/// by this closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    UserVoice,
    UserText,
    AssistantVoice,
    AssistantText,
}

impl Lane {
    pub fn new(role: Role, channel: Channel) -> Self {
        match (role, channel) {
            (Role::User, Channel::Voice) => Lane::UserVoice,
            (Role::User, Channel::Text) => Lane::UserText,
            (Role::Assistant, Channel::Voice) => Lane::AssistantVoice,
            (Role::Assistant, Channel::Text) => Lane::AssistantText,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Lane::UserVoice | Lane::UserText => Role::User,
            Lane::AssistantVoice | Lane::AssistantText => Role::Assistant,
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            Lane::UserVoice | Lane::AssistantVoice => Channel::Voice,
            Lane::UserText | Lane::AssistantText => Channel::Text,
        }
    }

    fn index(&self) -> usize {
        match self {
            Lane::UserVoice => 0,
            Lane::UserText => 1,
            Lane::AssistantVoice => 2,
            Lane::AssistantText => 3,
        }
    }
}

/// Fixed lookup table with one slot per [`Lane`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaneTable<T> {
    slots: [T; 4],
}

impl<T> LaneTable<T> {
    pub fn get(&self, lane: Lane) -> &T {
        &self.slots[lane.index()]
    }

    pub fn get_mut(&mut self, lane: Lane) -> &mut T {
        &mut self.slots[lane.index()]
    }
}

impl<T: Default> LaneTable<T> {
    pub fn clear(&mut self) {
        self.slots = Default::default();
    }
}

/// Fixed lookup table with one slot per [`Role`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleTable<T> {
    slots: [T; 2],
}

impl<T> RoleTable<T> {
    pub fn get(&self, role: Role) -> &T {
        &self.slots[role.index()]
    }

    pub fn get_mut(&mut self, role: Role) -> &mut T {
        &mut self.slots[role.index()]
    }
}

impl<T: Default> RoleTable<T> {
    pub fn clear(&mut self) {
        self.slots = Default::default();
    }
}

/// One conversational utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub role: Role,
    pub channel: Channel,
    pub text: String,
    /// Epoch milliseconds at utterance start.
    pub timestamp: u64,
    pub sequence: u64,
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl Turn {
    pub fn lane(&self) -> Lane {
        Lane::new(self.role, self.channel)
    }

    /// Sort key of the turn log.
    pub fn order_key(&self) -> (u64, u64) {
        (self.timestamp, self.sequence)
    }
}

/// An incremental piece of a turn's text, as delivered by either channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub role: Role,
    pub channel: Channel,
    pub text: String,
    pub is_final: bool,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl Fragment {
    pub fn new(
        role: Role,
        channel: Channel,
        text: impl Into<String>,
        is_final: bool,
        timestamp: u64,
    ) -> Self {
        Self {
            role,
            channel,
            text: text.into(),
            is_final,
            timestamp,
            item_id: None,
        }
    }

    pub fn with_item_id(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn lane(&self) -> Lane {
        Lane::new(self.role, self.channel)
    }
}

/// Wall-clock epoch milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Normalize text for equality checks: case-folded, punctuation stripped,
/// whitespace collapsed.
pub fn normalize_text(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else if c == '\'' || c == '\u{2019}' {
                '\0'
            } else {
                ' '
            }
        })
        .filter(|c| *c != '\0')
        .flat_map(char::to_lowercase)
        .collect();

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Identity of a delivered final used to recognize re-deliveries.
///
/// Transport item ids are preferred; without one the key falls back to the
/// role, normalized text and a coarse timestamp bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Item(String),
    Content { role: Role, digest: String, bucket: u64 },
}

impl DedupKey {
    pub fn content(role: Role, text: &str, timestamp: u64, bucket_ms: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(role.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_text(text).as_bytes());
        let digest: String = hasher
            .finalize()
            .iter()
            .take(12)
            .map(|b| format!("{:02x}", b))
            .collect();

        DedupKey::Content {
            role,
            digest,
            bucket: timestamp / bucket_ms.max(1),
        }
    }
}
