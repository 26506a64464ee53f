//! Viewport-aware priority work queue
//!
//! Priority is a three-class partition (viewport, near-viewport, background),
//! not a continuous score. Viewport work therefore never waits behind a
//! background backlog of any size. Within the viewport classes items follow
//! document order; background items follow the scroll direction so content
//! approaching the viewport is judged before content receding from it.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::collaborators::{Document, FragmentRef, ScrollPosition};

/// Scheduling class, highest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Viewport,
    NearViewport,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityHint {
    /// Classify from the viewport predicate
    #[default]
    Auto,
    /// Always drained first, never demoted
    ForceImmediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScrollDirection {
    #[default]
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub u64);

/// One fragment awaiting a decision
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: ItemId,
    pub fragment: FragmentRef,
    pub class: PriorityClass,
    /// Vertical document offset at the last (re)classification
    pub position: f64,
    pub enqueued_at: Instant,
    pub forced: bool,
}

fn class_for(margin: f64, visible: bool, position: Option<f64>, viewport: ScrollPosition) -> PriorityClass {
    if visible {
        return PriorityClass::Viewport;
    }
    match position {
        Some(pos) if pos >= viewport.top - margin && pos < viewport.bottom() + margin => {
            PriorityClass::NearViewport
        }
        _ => PriorityClass::Background,
    }
}

/// Work queue keyed by fragment; a fragment is queued at most once
#[derive(Debug)]
pub struct PriorityWorkQueue {
    items: Vec<WorkItem>,
    by_fragment: HashMap<FragmentRef, ItemId>,
    next_id: u64,
    near_margin: f64,
    direction: ScrollDirection,
    last_top: Option<f64>,
    sorted: bool,
}

impl PriorityWorkQueue {
    pub fn new(near_margin: f64) -> Self {
        Self {
            items: Vec::new(),
            by_fragment: HashMap::new(),
            next_id: 0,
            near_margin,
            direction: ScrollDirection::Down,
            last_top: None,
            sorted: true,
        }
    }

    /// Class of a fragment given its visibility and position
    pub fn classify(&self, visible: bool, position: Option<f64>, viewport: ScrollPosition) -> PriorityClass {
        class_for(self.near_margin, visible, position, viewport)
    }

    /// Queue `fragment`; `None` when it is already queued
    pub fn enqueue(
        &mut self,
        fragment: FragmentRef,
        hint: PriorityHint,
        document: &dyn Document,
    ) -> Option<ItemId> {
        if self.by_fragment.contains_key(&fragment) {
            return None;
        }

        let position = document.position(fragment);
        let forced = hint == PriorityHint::ForceImmediate;
        let class = if forced {
            PriorityClass::Viewport
        } else {
            self.classify(document.is_visible(fragment), position, document.viewport())
        };

        self.next_id += 1;
        let id = ItemId(self.next_id);
        self.items.push(WorkItem {
            id,
            fragment,
            class,
            position: position.unwrap_or(f64::MAX),
            enqueued_at: Instant::now(),
            forced,
        });
        self.by_fragment.insert(fragment, id);
        self.sorted = false;
        Some(id)
    }

    fn compare(direction: ScrollDirection, a: &WorkItem, b: &WorkItem) -> Ordering {
        b.forced
            .cmp(&a.forced)
            .then(a.class.cmp(&b.class))
            .then_with(|| match (a.class, direction) {
                (PriorityClass::Background, ScrollDirection::Up) => b.position.total_cmp(&a.position),
                _ => a.position.total_cmp(&b.position),
            })
            .then(a.id.cmp(&b.id))
    }

    fn ensure_sorted(&mut self) {
        if !self.sorted {
            let direction = self.direction;
            self.items.sort_by(|a, b| Self::compare(direction, a, b));
            self.sorted = true;
        }
    }

    /// Take up to `max` items in priority order
    pub fn drain(&mut self, max: usize) -> Vec<WorkItem> {
        self.drain_up_to(PriorityClass::Background, max)
    }

    /// Take up to `max` items whose class is at least as urgent as `class`
    pub fn drain_up_to(&mut self, class: PriorityClass, max: usize) -> Vec<WorkItem> {
        self.ensure_sorted();
        let eligible = self
            .items
            .iter()
            .take(max)
            .take_while(|item| item.forced || item.class <= class)
            .count();

        let taken: Vec<WorkItem> = self.items.drain(..eligible).collect();
        for item in &taken {
            self.by_fragment.remove(&item.fragment);
        }
        taken
    }

    /// Re-evaluate every item against a new viewport
    ///
    /// Records the scroll direction used to order background items. Forced
    /// items keep their class.
    pub fn reprioritize(&mut self, scroll: ScrollPosition, document: &dyn Document) {
        if let Some(last) = self.last_top {
            if scroll.top > last {
                self.direction = ScrollDirection::Down;
            } else if scroll.top < last {
                self.direction = ScrollDirection::Up;
            }
        }
        self.last_top = Some(scroll.top);

        let margin = self.near_margin;
        for item in self.items.iter_mut() {
            let position = document.position(item.fragment);
            if let Some(pos) = position {
                item.position = pos;
            }
            if !item.forced {
                item.class = class_for(margin, document.is_visible(item.fragment), position, scroll);
            }
        }
        self.sorted = false;
    }

    /// Drop the queued item for `fragment`, if any
    pub fn remove(&mut self, fragment: FragmentRef) -> bool {
        match self.by_fragment.remove(&fragment) {
            Some(id) => {
                self.items.retain(|item| item.id != id);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, fragment: FragmentRef) -> bool {
        self.by_fragment.contains_key(&fragment)
    }

    pub fn has_pending(&self) -> bool {
        !self.items.is_empty()
    }

    /// Whether any viewport-class (or forced) item is queued
    pub fn has_urgent(&self) -> bool {
        self.items
            .iter()
            .any(|item| item.forced || item.class == PriorityClass::Viewport)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.by_fragment.clear();
        self.sorted = true;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn direction(&self) -> ScrollDirection {
        self.direction
    }

    /// Queued items per class: viewport, near-viewport, background
    pub fn class_counts(&self) -> [usize; 3] {
        let mut counts = [0usize; 3];
        for item in &self.items {
            counts[item.class as usize] += 1;
        }
        counts
    }
}
