//! Vector clock owned by a dedicated task (spec.md §4.7 step 2, §5, §9).
//!
//! Rather than share the clock behind a lock, one task owns it exclusively
//! and services an `increment` / `updated` channel pair. The broker sends
//! the replica name to tick, then receives the resulting full clock back —
//! a rendezvous that guarantees the stamped clock reflects every message
//! already accepted ahead of it, without any lock in the broker's hot path.

use tokio::sync::mpsc;

use crate::model::VectorClock;

/// Handle to the running vector-clock task. Not `Clone` — intended for
/// exclusive use by the broker loop that stamps outgoing messages.
pub struct VectorClockHandle {
    increment_tx: mpsc::Sender<String>,
    updated_rx: mpsc::Receiver<VectorClock>,
}

impl VectorClockHandle {
    /// Increment `replica`'s counter and return the resulting full clock.
    pub async fn tick(&mut self, replica: &str) -> VectorClock {
        self.increment_tx
            .send(replica.to_owned())
            .await
            .expect("vector clock task must outlive its handle");
        self.updated_rx
            .recv()
            .await
            .expect("vector clock task must outlive its handle")
    }
}

/// Spawn the task that owns the vector clock for the lifetime of the
/// replica, and return the handle used to tick it.
pub fn spawn() -> VectorClockHandle {
    let (increment_tx, mut increment_rx) = mpsc::channel::<String>(1);
    let (updated_tx, updated_rx) = mpsc::channel::<VectorClock>(1);

    tokio::spawn(async move {
        let mut clock = VectorClock::new();
        while let Some(replica) = increment_rx.recv().await {
            clock.increment(&replica);
            if updated_tx.send(clock.clone()).await.is_err() {
                break;
            }
        }
    });

    VectorClockHandle {
        increment_tx,
        updated_rx,
    }
}
