use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::consent::ConsentLedger;
use crate::events::EventLog;
use crate::export::DataExporter;
use crate::identity::IdentityStore;
use crate::merge::MergeCoordinator;
use crate::participation::ParticipationTracker;
use crate::requirements::RequirementEvaluator;
use crate::store::{MemoryStore, Store};

/// Dependencies every component shares.
#[derive(Clone)]
pub(crate) struct Shared {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<EngineConfig>,
}

impl Shared {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn max_depth(&self) -> usize {
        self.config.max_merge_depth
    }
}

/// Respondent identity & consent reconciliation engine.
///
/// All components operate over the same store; each public operation runs in
/// its own transaction and either commits fully or not at all.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    identity: IdentityStore,
    consent: ConsentLedger,
    requirements: RequirementEvaluator,
    merge: MergeCoordinator,
    events: EventLog,
    participation: ParticipationTracker,
    export: DataExporter,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let shared = Shared {
            store: store.clone(),
            clock,
            config: Arc::new(config),
        };
        Self {
            store,
            identity: IdentityStore::new(shared.clone()),
            consent: ConsentLedger::new(shared.clone()),
            requirements: RequirementEvaluator::new(shared.clone()),
            merge: MergeCoordinator::new(shared.clone()),
            events: EventLog::new(shared.clone()),
            participation: ParticipationTracker::new(shared.clone()),
            export: DataExporter::new(shared),
        }
    }

    /// Engine over a fresh in-memory store with the system clock.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            EngineConfig::default(),
            Arc::new(SystemClock),
        )
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    pub fn consent(&self) -> &ConsentLedger {
        &self.consent
    }

    pub fn requirements(&self) -> &RequirementEvaluator {
        &self.requirements
    }

    pub fn merge(&self) -> &MergeCoordinator {
        &self.merge
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn participation(&self) -> &ParticipationTracker {
        &self.participation
    }

    pub fn export(&self) -> &DataExporter {
        &self.export
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::Engine;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::store::MemoryStore;

    pub struct Harness {
        pub engine: Engine,
        pub store: MemoryStore,
        pub clock: Arc<ManualClock>,
    }

    impl Harness {
        pub fn advance(&self, secs: i64) {
            self.clock.advance(Duration::seconds(secs));
        }
    }

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    /// In-memory engine on a manual clock starting at [`t0`].
    pub fn harness() -> Harness {
        harness_with(EngineConfig::default())
    }

    pub fn harness_with(config: EngineConfig) -> Harness {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = Engine::new(Arc::new(store.clone()), config, clock.clone());
        Harness {
            engine,
            store,
            clock,
        }
    }
}
