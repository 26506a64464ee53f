//! Shared fixtures for the integration suites

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use progressive_filter::engine::content::TextCleaner;
use progressive_filter::engine::{
    compute_fingerprint, CacheKey, Criteria, EngineConfig, LockRegistry, Orchestrator,
};
use progressive_filter::simulation::{ChannelMutationSource, ScriptedClassifier, SimulatedDocument};

pub const VIEWPORT_HEIGHT: f64 = 600.0;

pub struct Harness {
    pub document: Arc<SimulatedDocument>,
    pub classifier: Arc<ScriptedClassifier>,
    pub mutations: Arc<ChannelMutationSource>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new(config: EngineConfig, classifier: ScriptedClassifier) -> Self {
        Self::with_locks(config, classifier, Arc::new(LockRegistry::new()))
    }

    pub fn with_locks(
        config: EngineConfig,
        classifier: ScriptedClassifier,
        locks: Arc<LockRegistry>,
    ) -> Self {
        let document = Arc::new(SimulatedDocument::new(VIEWPORT_HEIGHT));
        let classifier = Arc::new(classifier);
        let mutations = Arc::new(ChannelMutationSource::new());
        let orchestrator = Orchestrator::builder(config)
            .document(document.clone())
            .classifier(classifier.clone())
            .mutation_source(mutations.clone())
            .lock_registry(locks)
            .build()
            .expect("orchestrator builds");
        Self {
            document,
            classifier,
            mutations,
            orchestrator,
        }
    }

    /// Default config with a classifier that never answers within a test
    pub fn silent() -> Self {
        Self::new(
            EngineConfig::default(),
            ScriptedClassifier::new().with_delay(Duration::from_secs(3600)),
        )
    }

    /// Cache key the engine uses for `text` under `criteria`
    pub fn cache_key(&self, text: &str, criteria: &Criteria) -> CacheKey {
        let config = self.orchestrator.config();
        let cleaned = TextCleaner::new(config.min_text_length).clean(text);
        let fingerprint = compute_fingerprint(&cleaned, config.shingle_size, config.min_text_length)
            .expect("text long enough to fingerprint");
        CacheKey::new(fingerprint, criteria.fingerprint())
    }
}

/// Posts with no wording in common
pub const DISTINCT_POSTS: [&str; 6] = [
    "Local bakery shares its sourdough starter recipe with the whole neighbourhood",
    "Quarterly meetup covers async traits, pinning and the borrow checker in depth",
    "Photos from the weekend hiking trip along the northern ridge trail",
    "Community garden is looking for volunteers to plant tomatoes this spring",
    "New library release adds streaming decompression and faster checksums",
    "Harbour festival returns with boat races, lanterns and street food stalls",
];
