//! Queue fairness, scroll handling and mutation batching

mod common;

use std::time::Duration;

use common::{Harness, DISTINCT_POSTS, VIEWPORT_HEIGHT};
use progressive_filter::engine::{
    AddedNode, Criteria, FilterEvent, FragmentRef, PriorityClass, PriorityHint,
    PriorityWorkQueue, RawChange, SessionCause,
};
use progressive_filter::simulation::SimulatedDocument;

#[test]
fn test_late_viewport_items_overtake_background_backlog() {
    let document = SimulatedDocument::new(VIEWPORT_HEIGHT);
    let mut queue = PriorityWorkQueue::new(800.0);
    let batch_size = 10;

    let background: Vec<FragmentRef> = (0..30)
        .map(|i| document.add_fragment(format!("old post {}", i), 5_000.0 + i as f64 * 100.0))
        .collect();
    for &fragment in &background {
        queue.enqueue(fragment, PriorityHint::Auto, &document);
    }

    // Background work has started before the viewport items show up
    let first = queue.drain(batch_size);
    assert!(first.iter().all(|item| item.class == PriorityClass::Background));

    let viewport: Vec<FragmentRef> = (0..5)
        .map(|i| document.add_fragment(format!("fresh post {}", i), i as f64 * 100.0))
        .collect();
    for &fragment in &viewport {
        queue.enqueue(fragment, PriorityHint::Auto, &document);
    }

    let next = queue.drain(batch_size);
    let drained_viewport: Vec<FragmentRef> = next
        .iter()
        .filter(|item| item.class == PriorityClass::Viewport)
        .map(|item| item.fragment)
        .collect();
    assert_eq!(drained_viewport, viewport);
    assert_eq!(next.len(), batch_size);
    assert!(next[..viewport.len()]
        .iter()
        .all(|item| item.class == PriorityClass::Viewport));
}

#[tokio::test(start_paused = true)]
async fn test_mutation_burst_coalesces_into_one_batch() {
    let harness = Harness::silent();
    harness
        .orchestrator
        .start_session(SessionCause::Manual, Criteria::deny(["clickbait"]))
        .unwrap();

    for i in 0..20 {
        let fragment = harness.document.add_fragment(
            format!("Reader letter number {} about the new tram line schedule", i),
            1_000.0 + i as f64 * 120.0,
        );
        assert!(harness
            .mutations
            .emit(RawChange::added([AddedNode::element(fragment, 2)])));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    let batches = harness.orchestrator.events().of_type("mutation_batch");
    assert_eq!(batches.len(), 1);
    assert!(matches!(
        batches[0],
        FilterEvent::MutationBatch { added: 20, removed: 0, .. }
    ));
    assert_eq!(harness.orchestrator.telemetry().snapshot().mutation_batches, 1);
}

#[tokio::test(start_paused = true)]
async fn test_insignificant_changes_are_ignored() {
    let harness = Harness::silent();
    harness
        .orchestrator
        .start_session(SessionCause::Manual, Criteria::deny(["clickbait"]))
        .unwrap();

    let fragment = harness.document.add_fragment("caption", 100.0);
    harness
        .mutations
        .emit(RawChange::added([AddedNode::text(fragment)]));
    harness
        .mutations
        .emit(RawChange::added([AddedNode::element(fragment, 0)]));
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(harness.orchestrator.events().of_type("mutation_batch").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_added_fragments_are_filtered_and_removals_forgotten() {
    let harness = Harness::silent();
    harness.document.add_fragment(DISTINCT_POSTS[0], 0.0);
    harness
        .orchestrator
        .start_session(SessionCause::Manual, Criteria::deny(["clickbait"]))
        .unwrap();

    let bait = harness
        .document
        .add_fragment("Doctors hate this CLICKBAIT trick for better sleep", 150.0);
    harness
        .mutations
        .emit(RawChange::added([AddedNode::element(bait, 4)]));
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(harness.document.is_hidden(bait));
    assert_eq!(harness.orchestrator.hidden_fragments(), vec![bait]);

    harness.document.remove_fragment(bait);
    harness.mutations.emit(RawChange::removed([bait]));
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(harness.orchestrator.hidden_fragments().is_empty());
    assert_eq!(harness.orchestrator.events().of_type("mutation_batch").len(), 2);
}

#[tokio::test]
async fn test_scroll_processes_newly_visible_fragments() {
    let harness = Harness::silent();
    harness.document.add_fragment(DISTINCT_POSTS[0], 0.0);
    let far = harness
        .document
        .add_fragment("Another CLICKBAIT listicle nobody asked for today", 3_000.0);

    let outcome = harness
        .orchestrator
        .start_session(SessionCause::Scroll, Criteria::deny(["clickbait"]))
        .unwrap();
    assert_eq!(outcome.viewport.processed, 1);
    assert!(!harness.document.is_hidden(far));

    let report = harness
        .orchestrator
        .on_scroll(harness.document.scroll_to(2_800.0))
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.filtered, 1);
    assert!(harness.document.is_hidden(far));
}

#[tokio::test(start_paused = true)]
async fn test_rapid_scrolls_are_debounced() {
    let harness = Harness::silent();
    for (i, post) in DISTINCT_POSTS.iter().enumerate() {
        harness.document.add_fragment(*post, i as f64 * 900.0);
    }
    harness
        .orchestrator
        .start_session(SessionCause::Scroll, Criteria::deny(["clickbait"]))
        .unwrap();

    let first = harness
        .orchestrator
        .on_scroll(harness.document.scroll_to(100.0));
    let second = harness
        .orchestrator
        .on_scroll(harness.document.scroll_to(200.0));
    assert!(first.is_some());
    assert!(second.is_none());

    tokio::time::sleep(harness.orchestrator.config().scroll_debounce() * 3).await;
    let third = harness
        .orchestrator
        .on_scroll(harness.document.scroll_to(300.0));
    assert!(third.is_some());

    let snapshot = harness.orchestrator.telemetry().snapshot();
    assert_eq!(snapshot.scroll_events, 3);
    assert_eq!(snapshot.scroll_events_throttled, 1);
}
