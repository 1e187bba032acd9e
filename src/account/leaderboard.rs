use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LEADERBOARD_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub score: f64,
    pub at: DateTime<Utc>,
}

/// Local best-wealth table, highest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Leaderboard {
    entries: Vec<LeaderboardEntry>,
}

impl Leaderboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a score; returns its 1-based rank if it made the table
    pub fn record(&mut self, score: f64, at: DateTime<Utc>) -> Option<usize> {
        if !score.is_finite() {
            return None;
        }
        let rank = self.entries.partition_point(|e| e.score >= score);
        if rank >= LEADERBOARD_SIZE {
            return None;
        }
        self.entries.insert(rank, LeaderboardEntry { score, at });
        self.entries.truncate(LEADERBOARD_SIZE);
        Some(rank + 1)
    }

    pub fn entries(&self) -> &[LeaderboardEntry] {
        &self.entries
    }

    pub fn best(&self) -> Option<f64> {
        self.entries.first().map(|e| e.score)
    }

    /// Rebuild from persisted entries, re-sorting and trimming
    pub fn from_entries(mut entries: Vec<LeaderboardEntry>) -> Self {
        entries.retain(|e| e.score.is_finite());
        entries.sort_by(|a, b| b.score.total_cmp(&a.score));
        entries.truncate(LEADERBOARD_SIZE);
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_descending_and_capped() {
        let mut board = Leaderboard::new();
        let now = Utc::now();
        for score in [5.0, 1.0, 9.0, 3.0, 7.0, 2.0, 8.0, 4.0, 6.0, 10.0, 11.0, 0.5] {
            board.record(score, now);
        }

        let scores: Vec<f64> = board.entries().iter().map(|e| e.score).collect();
        assert_eq!(
            scores,
            vec![11.0, 10.0, 9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0]
        );
        assert_eq!(board.best(), Some(11.0));
    }

    #[test]
    fn test_record_returns_rank() {
        let mut board = Leaderboard::new();
        let now = Utc::now();
        assert_eq!(board.record(100.0, now), Some(1));
        assert_eq!(board.record(200.0, now), Some(1));
        assert_eq!(board.record(150.0, now), Some(2));
        assert_eq!(board.record(f64::NAN, now), None);

        for _ in 0..10 {
            board.record(1000.0, now);
        }
        assert_eq!(board.record(1.0, now), None);
        assert_eq!(board.entries().len(), LEADERBOARD_SIZE);
    }

    #[test]
    fn test_from_entries_resorts() {
        let now = Utc::now();
        let board = Leaderboard::from_entries(vec![
            LeaderboardEntry { score: 1.0, at: now },
            LeaderboardEntry { score: 3.0, at: now },
            LeaderboardEntry { score: 2.0, at: now },
        ]);
        assert_eq!(board.best(), Some(3.0));
        assert_eq!(board.entries()[2].score, 1.0);
    }
}
