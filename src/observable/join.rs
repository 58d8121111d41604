//! Multi-condition join.

use futures::stream::{self, BoxStream, StreamExt};

use super::entry::Observable;

/// One `(observable, predicate)` pair for [`wait_all`].
pub struct Condition {
    initial: bool,
    transitions: BoxStream<'static, bool>,
}

impl Condition {
    /// Whether the predicate held when the condition was created
    pub fn initially_met(&self) -> bool {
        self.initial
    }
}

impl<T: Clone + Send + 'static> Observable<T> {
    /// Build a [`Condition`] for [`wait_all`].
    pub fn condition<F>(&self, predicate: F) -> Condition
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let transitions = self.observe(predicate);
        Condition {
            initial: transitions.initial(),
            transitions: transitions.boxed(),
        }
    }
}

/// Resolve once every condition holds simultaneously.
///
/// A condition that flips back to false before the others are met re-arms the
/// join. All listeners are deregistered when the future completes or is dropped.
pub async fn wait_all(conditions: Vec<Condition>) {
    let mut met: Vec<bool> = conditions.iter().map(|c| c.initial).collect();
    if met.iter().all(|m| *m) {
        return;
    }

    let mut transitions = stream::select_all(
        conditions
            .into_iter()
            .enumerate()
            .map(|(index, condition)| condition.transitions.map(move |now| (index, now))),
    );

    while let Some((index, now)) = transitions.next().await {
        met[index] = now;
        if met.iter().all(|m| *m) {
            return;
        }
    }
}
