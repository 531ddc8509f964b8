use std::sync::Arc;

use parking_lot::Mutex;
use sweep_types::{ChosenBy, Configuration, SelectionState};
use tokio::sync::watch;

/// First caller wins. The winner and its frozen configuration stay put
/// until `reset`.
#[derive(Clone)]
pub struct SelectionArbiter {
    state: Arc<Mutex<SelectionState>>,
    chosen_tx: watch::Sender<ChosenBy>,
}

impl SelectionArbiter {
    pub fn new() -> Self {
        let (chosen_tx, _) = watch::channel(ChosenBy::None);
        Self {
            state: Arc::new(Mutex::new(SelectionState::default())),
            chosen_tx,
        }
    }

    pub fn choose(&self, by: ChosenBy, snapshot: Configuration) -> bool {
        if !by.is_chosen() {
            return false;
        }
        let mut state = self.state.lock();
        if state.chosen_by.is_chosen() {
            return false;
        }
        state.chosen_by = by;
        state.frozen = Some(snapshot);
        self.chosen_tx.send_replace(by);
        true
    }

    pub async fn wait_for_choice(&self) -> ChosenBy {
        let mut rx = self.chosen_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let by = match rx.wait_for(|by| by.is_chosen()).await {
            Ok(by) => *by,
            Err(_) => self.state.lock().chosen_by,
        };
        by
    }

    pub fn chosen_by(&self) -> ChosenBy {
        self.state.lock().chosen_by
    }

    pub fn snapshot(&self) -> Option<Configuration> {
        self.state.lock().frozen.clone()
    }

    pub fn state(&self) -> SelectionState {
        self.state.lock().clone()
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = SelectionState::default();
        self.chosen_tx.send_replace(ChosenBy::None);
    }
}

impl Default for SelectionArbiter {
    fn default() -> Self {
        Self::new()
    }
}
