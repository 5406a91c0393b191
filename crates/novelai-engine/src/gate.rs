use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::{IndexMap, IndexSet};
use log::debug;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("channel {0} already runs the maximum number of jobs")]
    ChannelFull(String),
}

#[derive(Debug, Default)]
struct GateState {
    channels: HashMap<String, IndexSet<String>>,
    global: IndexSet<String>,
    /// Parked tokens in arrival order, each with the sender that wakes it.
    pending: IndexMap<String, Sender<()>>,
}

/// Per-channel and global admission control for generation tasks.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGate {
    state: Arc<Mutex<GateState>>,
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserves `count` task tokens in `channel`. With `max_concurrency > 0`
    /// the batch is refused while the channel already holds that many.
    pub fn admit(
        &self,
        channel: &str,
        count: usize,
        max_concurrency: usize,
    ) -> Result<TaskBatch, GateError> {
        let tokens: Vec<String> = (0..count.max(1))
            .map(|_| Uuid::new_v4().to_string())
            .collect();
        let mut state = self.lock();
        let store = state.channels.entry(channel.to_string()).or_default();
        if max_concurrency > 0 && store.len() >= max_concurrency {
            if store.is_empty() {
                state.channels.remove(channel);
            }
            return Err(GateError::ChannelFull(channel.to_string()));
        }
        store.extend(tokens.iter().cloned());
        debug!("admitted {} task(s) in channel {channel}", tokens.len());
        Ok(TaskBatch {
            gate: self.clone(),
            channel: channel.to_string(),
            tokens,
        })
    }

    pub fn global_len(&self) -> usize {
        self.lock().global.len()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn channel_len(&self, channel: &str) -> usize {
        self.lock().channels.get(channel).map_or(0, IndexSet::len)
    }

    fn release(&self, channel: &str, token: &str) {
        let mut state = self.lock();
        if let Some(store) = state.channels.get_mut(channel) {
            store.shift_remove(token);
            if store.is_empty() {
                state.channels.remove(channel);
            }
        }
        state.global.shift_remove(token);
        state.pending.shift_remove(token);
        if let Some((promoted, wake)) = state.pending.shift_remove_index(0) {
            debug!("promoting pending task {promoted}");
            // A parked task that has gone away simply never wakes.
            let _ = wake.send(());
        }
    }
}

/// Tokens reserved by one invocation. Dropping the batch releases every token
/// it still holds.
#[derive(Debug)]
pub struct TaskBatch {
    gate: ConcurrencyGate,
    channel: String,
    tokens: Vec<String>,
}

impl TaskBatch {
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Joins the global set. When `global_concurrency > 0` and the global set
    /// is full, the newest token is parked and this call blocks until a
    /// release promotes it. Returns whether the batch had to wait.
    pub fn enter_global(&mut self, global_concurrency: usize) -> bool {
        let waiter = {
            let mut state = self.gate.lock();
            if global_concurrency > 0 && state.global.len() >= global_concurrency {
                match self.tokens.last() {
                    Some(token) => {
                        let (wake, wait) = mpsc::channel();
                        state.pending.insert(token.clone(), wake);
                        debug!("task {token} parked behind {} global task(s)", state.global.len());
                        Some(wait)
                    }
                    None => None,
                }
            } else {
                state.global.extend(self.tokens.iter().cloned());
                None
            }
        };
        let Some(wait) = waiter else {
            return false;
        };
        // A dropped sender also ends the wait; the gate lost track of us.
        let _ = wait.recv();
        let mut state = self.gate.lock();
        state.global.extend(self.tokens.iter().cloned());
        true
    }

    /// Releases the newest remaining token.
    pub fn release_next(&mut self) -> Option<String> {
        let token = self.tokens.pop()?;
        self.gate.release(&self.channel, &token);
        Some(token)
    }
}

impl Drop for TaskBatch {
    fn drop(&mut self) {
        while self.release_next().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn channel_cap_refuses_then_admits_exactly_one_after_cleanup() -> anyhow::Result<()> {
        let gate = ConcurrencyGate::new();
        let mut first = gate.admit("room", 1, 2)?;
        let _second = gate.admit("room", 1, 2)?;
        assert_eq!(
            gate.admit("room", 1, 2).err(),
            Some(GateError::ChannelFull("room".to_string()))
        );
        assert!(gate.admit("elsewhere", 1, 2).is_ok());

        first.release_next();
        let _third = gate.admit("room", 1, 2)?;
        assert!(gate.admit("room", 1, 2).is_err());
        Ok(())
    }

    #[test]
    fn whole_batch_counts_and_drop_releases_everything() -> anyhow::Result<()> {
        let gate = ConcurrencyGate::new();
        {
            let mut batch = gate.admit("room", 3, 0)?;
            assert_eq!(batch.len(), 3);
            assert!(!batch.enter_global(0));
            assert_eq!(gate.channel_len("room"), 3);
            assert_eq!(gate.global_len(), 3);
            batch.release_next();
            assert_eq!(gate.global_len(), 2);
        }
        assert_eq!(gate.channel_len("room"), 0);
        assert_eq!(gate.global_len(), 0);
        Ok(())
    }

    #[test]
    fn full_global_set_parks_until_promoted() -> anyhow::Result<()> {
        let gate = ConcurrencyGate::new();
        let mut running = gate.admit("a", 1, 0)?;
        assert!(!running.enter_global(1));

        let waiter_gate = gate.clone();
        let waiter = thread::spawn(move || -> anyhow::Result<(bool, usize)> {
            let mut batch = waiter_gate.admit("b", 2, 0)?;
            let parked = batch.enter_global(1);
            Ok((parked, waiter_gate.global_len()))
        });

        assert!(wait_until(|| gate.pending_len() == 1));
        assert_eq!(gate.global_len(), 1);
        running.release_next();

        let (parked, global_after) = match waiter.join() {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("waiter thread panicked"),
        };
        assert!(parked);
        assert_eq!(global_after, 2);
        assert_eq!(gate.pending_len(), 0);
        assert!(wait_until(|| gate.global_len() == 0));
        Ok(())
    }

    #[test]
    fn pending_tasks_are_promoted_in_arrival_order() -> anyhow::Result<()> {
        let gate = ConcurrencyGate::new();
        let mut running = gate.admit("a", 2, 0)?;
        running.enter_global(1);

        let (done_tx, done_rx) = mpsc::channel();
        let mut handles = Vec::new();
        for name in ["first", "second"] {
            let worker_gate = gate.clone();
            let done = done_tx.clone();
            handles.push(thread::spawn(move || {
                if let Ok(mut batch) = worker_gate.admit(name, 1, 0) {
                    batch.enter_global(1);
                    let _ = done.send(name);
                    thread::sleep(Duration::from_millis(50));
                }
            }));
            let expected = handles.len();
            assert!(wait_until(|| gate.pending_len() == expected));
        }

        running.release_next();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5))?, "first");
        running.release_next();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5))?, "second");
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}
