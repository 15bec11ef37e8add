// =============================================================================
// Audit Log — bounded ring of order submissions and risk rejections
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of audit entries retained in memory.
const MAX_ENTRIES: usize = 1_000;

/// What the entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    OrderSubmitted,
    RiskRejected,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub kind: AuditKind,
    pub bot_id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Append-only bounded audit ring. Every order submission and every risk
/// rejection receives an entry.
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn record(
        &self,
        kind: AuditKind,
        bot_id: Uuid,
        user_id: Uuid,
        symbol: impl Into<String>,
        detail: impl Into<String>,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            kind,
            bot_id,
            user_id,
            symbol: symbol.into(),
            detail: detail.into(),
            at: Utc::now(),
        };
        let mut entries = self.entries.write();
        entries.push(entry);
        while entries.len() > MAX_ENTRIES {
            entries.remove(0);
        }
    }

    /// Most recent `count` entries, newest first.
    pub fn recent(&self, count: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read();
        entries.iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_ring_bounded_and_newest_first() {
        let log = AuditLog::new();
        let bot = Uuid::new_v4();
        let user = Uuid::new_v4();
        for i in 0..(MAX_ENTRIES + 10) {
            log.record(
                AuditKind::OrderSubmitted,
                bot,
                user,
                "BTCUSDT",
                format!("order {i}"),
            );
        }
        assert_eq!(log.len(), MAX_ENTRIES);
        let recent = log.recent(1);
        assert_eq!(recent[0].detail, format!("order {}", MAX_ENTRIES + 9));
    }

    #[test]
    fn rejections_are_recorded() {
        let log = AuditLog::new();
        log.record(
            AuditKind::RiskRejected,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "BTCUSDT",
            "Position size 6.0% exceeds max 5%",
        );
        assert_eq!(log.recent(10)[0].kind, AuditKind::RiskRejected);
    }
}
