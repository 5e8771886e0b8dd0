//! The append-only event store and its query sub-language.
//!
//! The store is a per-iteration log of memory events. Appends take the single
//! writer lock; queries copy the log out under a reader lock, so a query view
//! is immune to concurrent appends and can be restarted or refined freely.
//!
//! The query shape follows `select().where_(pred).get()`: `where_` composes
//! predicates over `(iteration, event)` pairs, `get` materializes an
//! [`EventSet`] view that itself supports further `select()` refinement.

use crate::{EventError, EventResult, MemoryEvent};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

type Item = (u32, MemoryEvent);
type Predicate = Arc<dyn Fn(&Item) -> bool + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    iteration: u32,
    events: BTreeMap<u32, Vec<MemoryEvent>>,
}

/// Append-only multimap `iteration → events`.
#[derive(Default)]
pub struct EventStore {
    inner: RwLock<StoreInner>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to the current iteration, stamping it.
    pub fn submit(&self, mut event: MemoryEvent) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        event.iteration = inner.iteration;
        let iteration = inner.iteration;
        inner.events.entry(iteration).or_default().push(event);
    }

    pub fn iteration(&self) -> u32 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iteration
    }

    /// Advance the iteration marker. Returns the new iteration number.
    pub fn new_iteration(&self) -> u32 {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.iteration += 1;
        debug!(target: "events.store", iteration = inner.iteration, "iteration marker");
        inner.iteration
    }

    /// Force the iteration counter. Rewinding onto an iteration that already
    /// holds events would double-book it, which is a conflict.
    pub fn set_iteration(&self, iteration: u32) -> EventResult<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if iteration < inner.iteration && inner.events.contains_key(&iteration) {
            return Err(EventError::Conflict(iteration));
        }
        inner.iteration = iteration;
        Ok(())
    }

    /// Begin a query over a snapshot of the whole log. Items are ordered by
    /// iteration, then timestamp within an iteration.
    pub fn select(&self) -> EventQuery {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut items: Vec<Item> = Vec::new();
        for (&iteration, events) in &inner.events {
            for event in events {
                items.push((iteration, event.clone()));
            }
        }
        let items = Arc::new(items);
        let selected = (0..items.len()).collect();
        EventQuery {
            items,
            base: Arc::new(selected),
            predicate: None,
        }
    }
}

/// A composable query: a base selection plus an optional conjunction of
/// predicates. Nothing is evaluated until `get`.
pub struct EventQuery {
    items: Arc<Vec<Item>>,
    base: Arc<Vec<usize>>,
    predicate: Option<Predicate>,
}

impl EventQuery {
    /// Conjoin a predicate over `(iteration, event)`.
    pub fn where_<F>(self, pred: F) -> Self
    where
        F: Fn(&Item) -> bool + Send + Sync + 'static,
    {
        let predicate: Predicate = match self.predicate {
            None => Arc::new(pred),
            Some(prev) => Arc::new(move |item| prev(item) && pred(item)),
        };
        Self {
            items: self.items,
            base: self.base,
            predicate: Some(predicate),
        }
    }

    /// Materialize the view.
    pub fn get(self) -> EventSet {
        let selected = match &self.predicate {
            None => self.base.as_ref().clone(),
            Some(pred) => self
                .base
                .iter()
                .copied()
                .filter(|&i| pred(&self.items[i]))
                .collect(),
        };
        EventSet {
            items: self.items,
            selected: Arc::new(selected),
        }
    }
}

/// A restartable view over selected events. Cheap to clone; refinable via
/// `select()`.
#[derive(Clone)]
pub struct EventSet {
    items: Arc<Vec<Item>>,
    selected: Arc<Vec<usize>>,
}

impl EventSet {
    /// Refine this view with further predicates.
    pub fn select(&self) -> EventQuery {
        EventQuery {
            items: self.items.clone(),
            base: self.selected.clone(),
            predicate: None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Item> + '_ {
        self.selected.iter().map(move |&i| &self.items[i])
    }

    pub fn first(&self) -> Option<&Item> {
        self.selected.first().map(|&i| &self.items[i])
    }

    pub fn last(&self) -> Option<&Item> {
        self.selected.last().map(|&i| &self.items[i])
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}
