//! Deterministic backend for unit tests.

use super::{Backend, PollError, Readiness, Source, SourceId};
use std::collections::VecDeque;
use std::time::Duration;

/// Replays queued batches. Batch entries name sources by registration order.
/// With nothing queued, every armed source reports `TimerFired`.
#[derive(Debug, Default)]
pub(crate) struct ScriptedBackend {
    pub(crate) registered: Vec<SourceId>,
    pub(crate) armed: Vec<SourceId>,
    pub(crate) cancelled: Vec<SourceId>,
    pub(crate) fail_start: bool,
    script: VecDeque<Vec<(usize, Readiness)>>,
}

impl ScriptedBackend {
    pub(crate) fn push_batch(&mut self, batch: Vec<(usize, Readiness)>) {
        self.script.push_back(batch);
    }
}

impl Backend for ScriptedBackend {
    fn start(&mut self, id: SourceId, _source: &Source) -> Result<(), PollError> {
        if self.fail_start {
            return Err(PollError::Unsupported("scripted failure".to_string()));
        }
        self.registered.push(id);
        self.armed.push(id);
        Ok(())
    }

    fn cancel(&mut self, id: SourceId) {
        self.armed.retain(|armed| *armed != id);
        self.cancelled.push(id);
    }

    fn wait(
        &mut self,
        _timeout: Option<Duration>,
        ready: &mut Vec<(SourceId, Readiness)>,
    ) -> Result<(), PollError> {
        match self.script.pop_front() {
            Some(batch) => {
                for (index, readiness) in batch {
                    if let Some(id) = self.registered.get(index) {
                        ready.push((*id, readiness));
                    }
                }
            }
            None => ready.extend(self.armed.iter().map(|id| (*id, Readiness::TimerFired))),
        }
        Ok(())
    }
}
