//! Group call topology: hub election and stream forwarding bookkeeping
//!
//! There is no coordinator. Every participant runs [`elect_hub`] over the
//! membership list distributed by the relay and arrives at the same hub because
//! the ordering is total: earliest join time first, identity order on ties.
//! The hub connects to every other participant and relays each participant's
//! stream to all the others; everyone else connects to the hub only.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::types::{ParticipantId, ParticipantRecord};

/// Elect the hub for a membership snapshot
pub fn elect_hub<'a>(
    members: impl IntoIterator<Item = &'a ParticipantRecord>,
) -> Option<ParticipantId> {
    members
        .into_iter()
        .min_by(|a, b| a.election_key().cmp(&b.election_key()))
        .map(|record| record.id.clone())
}

/// Local participant's role in the topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// No hub elected yet
    Undecided,
    Hub,
    /// Connected to the given hub only
    Spoke { hub: ParticipantId },
}

/// Result of applying an election
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubChange {
    pub previous: Option<ParticipantId>,
    pub current: Option<ParticipantId>,
}

impl HubChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// source -> target -> ids of source tracks already forwarded to target
pub type ForwardingRecord = BTreeMap<ParticipantId, BTreeMap<ParticipantId, BTreeSet<String>>>;

/// Tracks of one source that one target has not received yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardGap {
    pub source: ParticipantId,
    pub target: ParticipantId,
    pub tracks: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyState {
    pub hub: Option<ParticipantId>,
    pub is_hub: bool,
    pub forwarded: ForwardingRecord,
}

pub struct TopologyManager {
    local: ParticipantId,
    state: TopologyState,
}

impl TopologyManager {
    pub fn new(local: ParticipantId) -> Self {
        Self {
            local,
            state: TopologyState::default(),
        }
    }

    pub fn state(&self) -> &TopologyState {
        &self.state
    }

    pub fn hub(&self) -> Option<&ParticipantId> {
        self.state.hub.as_ref()
    }

    pub fn is_hub(&self) -> bool {
        self.state.is_hub
    }

    pub fn role(&self) -> Role {
        match &self.state.hub {
            None => Role::Undecided,
            Some(_) if self.state.is_hub => Role::Hub,
            Some(hub) => Role::Spoke { hub: hub.clone() },
        }
    }

    /// Adopt an election result
    ///
    /// The forwarding record is reset whenever the hub changes: only the current
    /// hub may hold one, and a new hub starts with fresh connections.
    pub fn assign_hub(&mut self, hub: Option<ParticipantId>) -> HubChange {
        let previous = self.state.hub.clone();
        if previous == hub {
            return HubChange {
                previous,
                current: hub,
            };
        }

        self.state.is_hub = hub.as_ref() == Some(&self.local);
        self.state.hub = hub.clone();
        self.state.forwarded.clear();

        info!(
            "Hub elected: {}, local is hub: {}",
            hub.as_ref().map_or("none", |h| h.as_str()),
            self.state.is_hub
        );

        HubChange {
            previous,
            current: hub,
        }
    }

    /// Whether the local participant should hold a session with `remote`, and
    /// if so whether it makes the offer
    pub fn connection_plan(&self, remote: &ParticipantId) -> Option<bool> {
        if remote == &self.local {
            return None;
        }
        match self.role() {
            Role::Hub => Some(true),
            Role::Spoke { hub } if &hub == remote => Some(false),
            _ => None,
        }
    }

    /// Whether any track of `source` reaches `target` through us
    pub fn is_forwarded(&self, source: &ParticipantId, target: &ParticipantId) -> bool {
        self.state
            .forwarded
            .get(source)
            .and_then(|targets| targets.get(target))
            .is_some_and(|tracks| !tracks.is_empty())
    }

    pub fn is_track_forwarded(
        &self,
        source: &ParticipantId,
        target: &ParticipantId,
        track: &str,
    ) -> bool {
        self.state
            .forwarded
            .get(source)
            .and_then(|targets| targets.get(target))
            .is_some_and(|tracks| tracks.contains(track))
    }

    /// Tracks each target is still missing, per source
    ///
    /// `sources` maps a participant to the ids of the tracks it captured. Never
    /// pairs a source with itself or targets the hub. Empty unless the local
    /// participant is the hub.
    pub fn missing_forwards(
        &self,
        sources: &BTreeMap<ParticipantId, Vec<String>>,
        targets: &[ParticipantId],
    ) -> Vec<ForwardGap> {
        if !self.state.is_hub {
            return Vec::new();
        }

        let mut missing = Vec::new();
        for (source, tracks) in sources {
            for target in targets {
                if source == target || target == &self.local {
                    continue;
                }
                let tracks: Vec<String> = tracks
                    .iter()
                    .filter(|track| !self.is_track_forwarded(source, target, track))
                    .cloned()
                    .collect();
                if !tracks.is_empty() {
                    missing.push(ForwardGap {
                        source: source.clone(),
                        target: target.clone(),
                        tracks,
                    });
                }
            }
        }
        missing
    }

    /// Returns false if the track was already recorded or forwarding is not ours
    pub fn record_forwarded(
        &mut self,
        source: &ParticipantId,
        target: &ParticipantId,
        track: &str,
    ) -> bool {
        if !self.state.is_hub || source == target {
            return false;
        }
        self.state
            .forwarded
            .entry(source.clone())
            .or_default()
            .entry(target.clone())
            .or_default()
            .insert(track.to_string())
    }

    /// Drop every forwarding entry involving `id` as source or target
    pub fn forget(&mut self, id: &ParticipantId) {
        let removed_source = self.state.forwarded.remove(id).is_some();
        for targets in self.state.forwarded.values_mut() {
            targets.remove(id);
        }
        self.state.forwarded.retain(|_, targets| !targets.is_empty());
        if removed_source {
            debug!("Forwarding record for {} cleared", id);
        }
    }

    pub fn reset(&mut self) {
        self.state = TopologyState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn record(id: &str, offset_secs: i64) -> ParticipantRecord {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        ParticipantRecord {
            id: id.into(),
            display_name: id.to_uppercase(),
            joined_at: base + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn test_earliest_joiner_is_hub() {
        let members = vec![record("c", 2), record("a", 0), record("b", 1)];
        assert_eq!(elect_hub(&members), Some("a".into()));
    }

    #[test]
    fn test_election_independent_of_list_order() {
        let members = vec![record("zed", 5), record("amy", 5), record("kim", 9)];
        let mut reversed = members.clone();
        reversed.reverse();
        // Same join time: identity decides
        assert_eq!(elect_hub(&members), Some("amy".into()));
        assert_eq!(elect_hub(&members), elect_hub(&reversed));
    }

    #[test]
    fn test_reelection_without_departed_hub() {
        let members = vec![record("a", 0), record("b", 1), record("c", 2)];
        let remaining: Vec<_> = members.iter().filter(|m| m.id.as_str() != "a").collect();
        assert_eq!(elect_hub(remaining), Some("b".into()));
        assert_eq!(elect_hub(Vec::<&ParticipantRecord>::new()), None);
    }

    #[test]
    fn test_roles_and_connection_plan() {
        let mut hub = TopologyManager::new("a".into());
        hub.assign_hub(Some("a".into()));
        assert_eq!(hub.role(), Role::Hub);
        assert_eq!(hub.connection_plan(&"b".into()), Some(true));
        assert_eq!(hub.connection_plan(&"a".into()), None);

        let mut spoke = TopologyManager::new("b".into());
        assert_eq!(spoke.role(), Role::Undecided);
        spoke.assign_hub(Some("a".into()));
        assert_eq!(spoke.connection_plan(&"a".into()), Some(false));
        assert_eq!(spoke.connection_plan(&"c".into()), None);
    }

    /// (source, track id) pairs grouped by source
    fn sources(tracks: &[(&str, &str)]) -> BTreeMap<ParticipantId, Vec<String>> {
        let mut sources: BTreeMap<ParticipantId, Vec<String>> = BTreeMap::new();
        for (source, track) in tracks {
            sources
                .entry((*source).into())
                .or_default()
                .push(track.to_string());
        }
        sources
    }

    #[test]
    fn test_missing_forwards_skip_self_and_recorded() {
        let mut topology = TopologyManager::new("a".into());
        topology.assign_hub(Some("a".into()));

        let sources = sources(&[("a", "a-mic"), ("b", "b-mic"), ("c", "c-mic")]);
        let targets: Vec<ParticipantId> = vec!["b".into(), "c".into()];

        let missing = topology.missing_forwards(&sources, &targets);
        assert_eq!(missing.len(), 4);
        assert!(!missing.iter().any(|gap| gap.source == gap.target));

        for gap in &missing {
            for track in &gap.tracks {
                assert!(topology.record_forwarded(&gap.source, &gap.target, track));
            }
        }
        assert!(topology.missing_forwards(&sources, &targets).is_empty());
        assert!(!topology.record_forwarded(&"b".into(), &"c".into(), "b-mic"));
    }

    #[test]
    fn test_later_track_of_forwarded_source_is_missing() {
        let mut topology = TopologyManager::new("a".into());
        topology.assign_hub(Some("a".into()));
        topology.record_forwarded(&"b".into(), &"c".into(), "b-mic");

        let sources = sources(&[("b", "b-mic"), ("b", "b-cam")]);
        let missing = topology.missing_forwards(&sources, &["c".into()]);
        assert_eq!(
            missing,
            vec![ForwardGap {
                source: "b".into(),
                target: "c".into(),
                tracks: vec!["b-cam".to_string()],
            }]
        );
        assert!(topology.is_forwarded(&"b".into(), &"c".into()));
        assert!(!topology.is_track_forwarded(&"b".into(), &"c".into(), "b-cam"));
    }

    #[test]
    fn test_forwarding_only_on_hub() {
        let mut spoke = TopologyManager::new("b".into());
        spoke.assign_hub(Some("a".into()));
        assert!(!spoke.record_forwarded(&"a".into(), &"c".into(), "a-mic"));
        assert!(spoke
            .missing_forwards(&sources(&[("a", "a-mic")]), &["c".into()])
            .is_empty());
    }

    #[test]
    fn test_hub_change_clears_forwarding() {
        let mut topology = TopologyManager::new("a".into());
        topology.assign_hub(Some("a".into()));
        topology.record_forwarded(&"b".into(), &"c".into(), "b-mic");

        let change = topology.assign_hub(Some("b".into()));
        assert!(change.changed());
        assert!(!topology.is_hub());
        assert!(topology.state().forwarded.is_empty());

        let unchanged = topology.assign_hub(Some("b".into()));
        assert!(!unchanged.changed());
    }

    #[test]
    fn test_forget_removes_source_and_target() {
        let mut topology = TopologyManager::new("a".into());
        topology.assign_hub(Some("a".into()));
        topology.record_forwarded(&"b".into(), &"c".into(), "b-mic");
        topology.record_forwarded(&"c".into(), &"b".into(), "c-mic");
        topology.record_forwarded(&"d".into(), &"b".into(), "d-mic");

        topology.forget(&"b".into());
        assert!(!topology.is_forwarded(&"c".into(), &"b".into()));
        assert!(!topology.is_forwarded(&"b".into(), &"c".into()));
        assert!(topology.state().forwarded.is_empty());
    }
}
