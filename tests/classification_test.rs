//! Instant matching, caching and classifier decision handling

mod common;

use std::time::Duration;

use common::{Harness, DISTINCT_POSTS};
use progressive_filter::engine::{
    CollaboratorError, Criteria, Decision, DecisionSource, EngineConfig, FilterEvent, RequestId,
    SessionCause, Verdict,
};
use progressive_filter::simulation::ScriptedClassifier;

const CLICKBAIT: &str = "You will never guess this CLICKBAIT headline about celebrity diets";
const ELECTION: &str = "Election night results are coming in from every district tonight";

#[tokio::test]
async fn test_clickbait_viewport_scenario() {
    let harness = Harness::silent();
    harness.document.add_fragment(DISTINCT_POSTS[0], 0.0);
    let clickbait = harness.document.add_fragment(CLICKBAIT, 150.0);
    harness.document.add_fragment(DISTINCT_POSTS[1], 300.0);

    let criteria = Criteria::deny(["clickbait"]);
    let outcome = harness
        .orchestrator
        .start_session(SessionCause::Scroll, criteria.clone())
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.viewport.processed, 3);
    assert_eq!(outcome.viewport.filtered, 1);
    assert_eq!(outcome.viewport.kept, 2);
    assert!(!outcome.viewport.timed_out);
    assert!(outcome.viewport.elapsed <= harness.orchestrator.config().viewport_timeout());

    assert!(harness.document.is_hidden(clickbait));
    assert_eq!(harness.document.hidden(), vec![clickbait]);

    let key = harness.cache_key(CLICKBAIT, &criteria);
    assert_eq!(harness.orchestrator.cache_keys(), vec![key]);
    let cached = harness.orchestrator.cached_decision(&key).unwrap();
    assert_eq!(cached.verdict, Verdict::Filter);
    assert_eq!(cached.source, DecisionSource::InstantMatch);
}

#[tokio::test(start_paused = true)]
async fn test_cache_entry_expires_after_ttl() {
    let config = EngineConfig {
        cache_ttl_ms: 1_000,
        ..EngineConfig::default()
    };
    let harness = Harness::new(
        config,
        ScriptedClassifier::new().with_delay(Duration::from_secs(3600)),
    );
    harness.document.add_fragment(CLICKBAIT, 0.0);

    let criteria = Criteria::deny(["clickbait"]);
    harness
        .orchestrator
        .start_session(SessionCause::Manual, criteria.clone())
        .unwrap();
    let key = harness.cache_key(CLICKBAIT, &criteria);

    tokio::time::sleep(Duration::from_millis(999)).await;
    assert!(harness.orchestrator.cached_decision(&key).is_some());

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert!(harness.orchestrator.cached_decision(&key).is_none());
    assert_eq!(harness.orchestrator.sweep_cache(), 1);
    assert_eq!(harness.orchestrator.cache_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_classifier_filter_hides_fragment_and_near_duplicates() {
    let harness = Harness::new(EngineConfig::default(), ScriptedClassifier::topics(["election"]));
    let original = harness.document.add_fragment(ELECTION, 0.0);
    let repost = harness
        .document
        .add_fragment(format!("{}!", ELECTION), 200.0);
    let unrelated = harness.document.add_fragment(DISTINCT_POSTS[2], 400.0);

    let outcome = harness
        .orchestrator
        .start_session(SessionCause::Manual, Criteria::deny(["clickbait"]))
        .unwrap();
    // Nothing matches the deny term, so the instant pass keeps everything
    assert_eq!(outcome.viewport.filtered, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;

    // The repost was never submitted: it looked like content already in flight
    let submissions = harness.classifier.submissions();
    assert_eq!(submissions.len(), 1);
    assert!(submissions[0].batch.iter().all(|d| d.fragment != repost));

    assert!(harness.document.is_hidden(original));
    assert!(harness.document.is_hidden(repost));
    assert!(!harness.document.is_hidden(unrelated));
    assert_eq!(harness.orchestrator.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_allow_term_overrides_classifier_filter() {
    let harness = Harness::new(EngineConfig::default(), ScriptedClassifier::topics(["election"]));
    let official = harness
        .document
        .add_fragment("Official election commission statement on recount procedures", 0.0);

    harness
        .orchestrator
        .start_session(SessionCause::Manual, Criteria::new(["official"], ["clickbait"]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(harness.classifier.submission_count(), 1);
    assert!(!harness.document.is_hidden(official));
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_is_retried() {
    let harness = Harness::new(EngineConfig::default(), ScriptedClassifier::topics(["election"]));
    harness
        .classifier
        .fail_next(CollaboratorError::Unavailable("connection reset".to_string()));
    let fragment = harness.document.add_fragment(ELECTION, 0.0);

    harness
        .orchestrator
        .start_session(SessionCause::Manual, Criteria::deny(["clickbait"]))
        .unwrap();
    assert!(!harness.document.is_hidden(fragment));

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(harness.classifier.submission_count(), 2);
    assert!(harness.document.is_hidden(fragment));
    assert_eq!(harness.orchestrator.telemetry().snapshot().classifier_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_request_is_abandoned() {
    let harness = Harness::new(EngineConfig::default(), ScriptedClassifier::topics(["election"]));
    harness
        .classifier
        .fail_next(CollaboratorError::Rejected("quota exceeded".to_string()));
    let fragment = harness.document.add_fragment(ELECTION, 0.0);

    harness
        .orchestrator
        .start_session(SessionCause::Manual, Criteria::deny(["clickbait"]))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(harness.classifier.submission_count(), 1);
    assert!(!harness.document.is_hidden(fragment));
    assert_eq!(harness.orchestrator.pending_requests(), 0);
    assert_eq!(harness.orchestrator.telemetry().snapshot().classifier_failures, 1);
    assert_eq!(harness.orchestrator.events().of_type("classifier_failed").len(), 1);
    // Instant matching keeps serving the session
    assert!(harness.orchestrator.is_filtering_active());
}

#[tokio::test(start_paused = true)]
async fn test_slow_classifier_times_out() {
    let config = EngineConfig {
        analysis_timeout_ms: 100,
        classifier_max_retries: 0,
        ..EngineConfig::default()
    };
    let harness = Harness::new(
        config,
        ScriptedClassifier::topics(["election"]).with_delay(Duration::from_secs(5)),
    );
    let fragment = harness.document.add_fragment(ELECTION, 0.0);

    harness
        .orchestrator
        .start_session(SessionCause::Manual, Criteria::deny(["clickbait"]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(harness.orchestrator.pending_requests(), 0);
    assert!(!harness.document.is_hidden(fragment));
    let failed = harness.orchestrator.events().of_type("classifier_failed");
    assert!(matches!(
        &failed[0],
        FilterEvent::ClassifierFailed { error, .. } if error.contains("timed out")
    ));
}

#[tokio::test]
async fn test_decisions_for_unsubmitted_fragments_are_dropped() {
    let harness = Harness::silent();
    let submitted = harness.document.add_fragment(DISTINCT_POSTS[3], 0.0);
    let stranger = harness.document.add_fragment(DISTINCT_POSTS[4], 5_000.0);

    let outcome = harness
        .orchestrator
        .start_session(SessionCause::Manual, Criteria::deny(["clickbait"]))
        .unwrap();
    assert!(outcome.success);
    assert_eq!(harness.orchestrator.pending_requests(), 1);

    // Both fragments went out in request 1; answer for a fragment that did not
    let applied = harness.orchestrator.on_decisions(
        RequestId(1),
        vec![
            Decision::filter(submitted, "topic:gardening"),
            Decision::filter(progressive_filter::engine::FragmentRef(999), "ghost"),
        ],
    );

    assert_eq!(applied, 1);
    assert!(harness.document.is_hidden(submitted));
    assert!(!harness.document.is_hidden(stranger));
    assert_eq!(harness.orchestrator.pending_requests(), 0);
    assert_eq!(harness.orchestrator.telemetry().snapshot().decisions_discarded, 1);
}

#[tokio::test]
async fn test_decisions_after_session_end_are_discarded() {
    let harness = Harness::silent();
    let fragment = harness.document.add_fragment(DISTINCT_POSTS[3], 0.0);

    harness
        .orchestrator
        .start_session(SessionCause::Manual, Criteria::deny(["clickbait"]))
        .unwrap();
    assert!(harness.orchestrator.stop());

    let applied = harness
        .orchestrator
        .on_decisions(RequestId(1), vec![Decision::filter(fragment, "late")]);

    assert_eq!(applied, 0);
    assert!(!harness.document.is_hidden(fragment));
    let discarded = harness.orchestrator.events().of_type("decisions_discarded");
    assert!(matches!(
        &discarded[0],
        FilterEvent::DecisionsDiscarded { reason: "unknown_request", count: 1, .. }
    ));
}

#[tokio::test]
async fn test_criteria_change_partitions_cache() {
    let harness = Harness::new(EngineConfig::default(), ScriptedClassifier::new());
    harness.document.add_fragment(CLICKBAIT, 0.0);

    let first = Criteria::deny(["clickbait"]);
    harness
        .orchestrator
        .start_session(SessionCause::Manual, first.clone())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.orchestrator.stop();

    let second = Criteria::deny(["celebrity"]);
    let outcome = harness
        .orchestrator
        .start_session(SessionCause::Manual, second.clone())
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.viewport.filtered, 1);

    let keys = harness.orchestrator.cache_keys();
    assert!(keys.contains(&harness.cache_key(CLICKBAIT, &first)));
    assert!(keys.contains(&harness.cache_key(CLICKBAIT, &second)));
    assert_eq!(harness.orchestrator.criteria(), second);
}

#[tokio::test(start_paused = true)]
async fn test_refused_hide_is_retried_once_document_recovers() {
    let harness = Harness::silent();
    let clickbait = harness.document.add_fragment(CLICKBAIT, 0.0);
    harness.document.fail_visibility(true);

    let outcome = harness
        .orchestrator
        .start_session(SessionCause::Manual, Criteria::deny(["clickbait"]))
        .unwrap();

    // The document refused the hide: nothing counts as filtered, nothing cached
    assert!(outcome.success);
    assert_eq!(outcome.viewport.processed, 1);
    assert_eq!(outcome.viewport.filtered, 0);
    assert_eq!(outcome.viewport.skipped, 1);
    assert!(!harness.document.is_hidden(clickbait));
    assert!(harness.orchestrator.hidden_fragments().is_empty());
    assert!(harness.orchestrator.cache_keys().is_empty());
    assert_eq!(harness.orchestrator.telemetry().snapshot().visibility_errors, 1);

    // The session carries on
    assert!(harness.orchestrator.is_filtering_active());
    assert_eq!(harness.orchestrator.current_session(), outcome.session_id);

    harness.document.fail_visibility(false);
    let interval = harness.orchestrator.config().continuous_analysis_interval();
    tokio::time::sleep(interval * 3).await;

    assert!(harness.document.is_hidden(clickbait));
    assert_eq!(harness.orchestrator.hidden_fragments(), vec![clickbait]);
    assert_eq!(harness.orchestrator.cache_len(), 1);
    assert_eq!(harness.orchestrator.current_session(), outcome.session_id);
}
