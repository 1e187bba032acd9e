use std::collections::VecDeque;

use crate::models::Notification;

pub const ACTIVITY_LIMIT: usize = 50;

/// Newest-first log of user-facing notifications
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: VecDeque<Notification>,
}

impl ActivityLog {
    pub fn push(&mut self, notification: Notification) {
        self.entries.push_front(notification);
        self.entries.truncate(ACTIVITY_LIMIT);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&Notification> {
        self.entries.front()
    }
}
