//! In-memory record set for one lane run.

use std::collections::BTreeMap;

use chatlake_shared::{ConversationRecord, FeedbackEntry, UserProfile};

/// Everything a scan produced, deduplicated by conversation identity.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    profiles: BTreeMap<String, UserProfile>,
    conversations: BTreeMap<(String, String), ConversationRecord>,
    feedback: Vec<FeedbackEntry>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a profile snapshot; the first non-empty value per field wins.
    pub fn add_profile(&mut self, profile: UserProfile) {
        let merged = self
            .profiles
            .entry(profile.user_id.clone())
            .or_insert_with(|| UserProfile {
                user_id: profile.user_id.clone(),
                ..UserProfile::default()
            });
        merged.name = merged.name.take().or(profile.name);
        merged.department = merged.department.take().or(profile.department);
        merged.city = merged.city.take().or(profile.city);
    }

    /// Add a conversation. A repeated `(user, conversation)` pair keeps the
    /// earliest record; returns `false` for a repeat.
    pub fn add_conversation(&mut self, record: ConversationRecord) -> bool {
        let key = (record.user_id.clone(), record.conversation_id.clone());
        match self.conversations.get_mut(&key) {
            Some(existing) => {
                if record.chronological(existing).is_lt() {
                    *existing = record;
                }
                false
            }
            None => {
                self.conversations.insert(key, record);
                true
            }
        }
    }

    pub fn add_feedback(&mut self, entry: FeedbackEntry) {
        self.feedback.push(entry);
    }

    pub fn profile(&self, user_id: &str) -> Option<&UserProfile> {
        self.profiles.get(user_id)
    }

    /// Conversations ordered by user, then conversation id.
    pub fn conversations(&self) -> impl Iterator<Item = &ConversationRecord> {
        self.conversations.values()
    }

    /// Feedback entries in scan order.
    pub fn feedback(&self) -> &[FeedbackEntry] {
        &self.feedback
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}
