//! Channel G: pure conflict resolution between a device-side and a
//! local-side [`DocumentVersion`]. No I/O, no state — a direct function of
//! its three inputs, so it is trivial to test exhaustively.

use crate::model::{ConflictStrategy, DocumentVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    NoConflict,
    KeepDevice,
    KeepLocal,
}

/// Resolves a conflict between `device` and `local` versions of the same
/// document under `strategy`.
///
/// Equal content hashes are never a conflict regardless of what the
/// timestamps say — a document touched on both sides but saved to the same
/// bytes did not actually diverge. `Manual` defers to `on_manual`; if that
/// callback declines to pick, the contract falls back to `NewestWins`.
pub fn resolve(
    device: &DocumentVersion,
    local: &DocumentVersion,
    strategy: ConflictStrategy,
    on_manual: impl FnOnce(&DocumentVersion, &DocumentVersion) -> Option<Resolution>,
) -> Resolution {
    if device.hash == local.hash {
        return Resolution::NoConflict;
    }

    match strategy {
        ConflictStrategy::DeviceWins => Resolution::KeepDevice,
        ConflictStrategy::LocalWins => Resolution::KeepLocal,
        ConflictStrategy::NewestWins => newest_wins(device, local),
        ConflictStrategy::Manual => on_manual(device, local).unwrap_or_else(|| newest_wins(device, local)),
    }
}

/// Ties (equal timestamps, differing hashes) favor the device.
fn newest_wins(device: &DocumentVersion, local: &DocumentVersion) -> Resolution {
    if local.modified_at > device.modified_at {
        Resolution::KeepLocal
    } else {
        Resolution::KeepDevice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn version(hash: &str, modified_at: chrono::DateTime<Utc>) -> DocumentVersion {
        DocumentVersion {
            hash: hash.to_string(),
            modified_at,
        }
    }

    #[test]
    fn equal_hashes_never_conflict_regardless_of_strategy() {
        let now = Utc::now();
        let device = version("a".repeat(64).as_str(), now);
        let local = version("a".repeat(64).as_str(), now + Duration::hours(1));
        for strategy in [
            ConflictStrategy::DeviceWins,
            ConflictStrategy::LocalWins,
            ConflictStrategy::NewestWins,
            ConflictStrategy::Manual,
        ] {
            assert_eq!(resolve(&device, &local, strategy, |_, _| None), Resolution::NoConflict);
        }
    }

    #[test]
    fn device_wins_strategy_always_keeps_device() {
        let now = Utc::now();
        let device = version(&"a".repeat(64), now);
        let local = version(&"b".repeat(64), now + Duration::hours(1));
        assert_eq!(
            resolve(&device, &local, ConflictStrategy::DeviceWins, |_, _| None),
            Resolution::KeepDevice
        );
    }

    #[test]
    fn newest_wins_favors_device_on_exact_tie() {
        let now = Utc::now();
        let device = version(&"a".repeat(64), now);
        let local = version(&"b".repeat(64), now);
        assert_eq!(
            resolve(&device, &local, ConflictStrategy::NewestWins, |_, _| None),
            Resolution::KeepDevice
        );
    }

    #[test]
    fn newest_wins_picks_the_later_timestamp() {
        let now = Utc::now();
        let device = version(&"a".repeat(64), now);
        let local = version(&"b".repeat(64), now + Duration::seconds(1));
        assert_eq!(
            resolve(&device, &local, ConflictStrategy::NewestWins, |_, _| None),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn manual_defers_to_callback() {
        let now = Utc::now();
        let device = version(&"a".repeat(64), now);
        let local = version(&"b".repeat(64), now + Duration::seconds(1));
        assert_eq!(
            resolve(&device, &local, ConflictStrategy::Manual, |_, _| Some(Resolution::KeepLocal)),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn manual_falls_back_to_newest_wins_when_callback_declines() {
        let now = Utc::now();
        let device = version(&"a".repeat(64), now);
        let local = version(&"b".repeat(64), now - Duration::seconds(1));
        assert_eq!(
            resolve(&device, &local, ConflictStrategy::Manual, |_, _| None),
            Resolution::KeepDevice
        );
    }
}
