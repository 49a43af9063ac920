//! In-process stand-ins for remote build agents.
//!
//! Each agent owns a working root and a worker thread. Cache messages travel
//! to it as JSON, the same form they take on the wire, and are applied to
//! the agent's own cache root under the agent's own lock table.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use gitsync_cache::{AgentBroadcaster, CacheLockRegistry, CacheMessage, CachePaths, apply_message};

enum AgentRequest {
    /// A serialized [`CacheMessage`].
    Message(String),
    Shutdown,
}

struct Agent {
    name: String,
    receiver: Receiver<AgentRequest>,
    paths: CachePaths,
    locks: CacheLockRegistry,
}

impl Agent {
    /// Runs until shut down. Requests queued before the shutdown are handled
    /// first.
    fn run(self) {
        log::debug!("Agent {} started", self.name);

        loop {
            match self.receiver.recv() {
                Ok(AgentRequest::Message(json)) => self.handle(&json),
                Ok(AgentRequest::Shutdown) | Err(_) => {
                    log::debug!("Agent {} stopping", self.name);
                    break;
                }
            }
        }
    }

    fn handle(&self, json: &str) {
        let message = match CacheMessage::from_json(json) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Agent {} ignored malformed cache message: {}", self.name, e);
                return;
            }
        };

        match apply_message(&message, &self.paths, &self.locks) {
            Ok(report) => {
                for line in report.messages() {
                    log::info!("Agent {}: {}", self.name, line);
                }
            }
            Err(e) => log::error!("Agent {} failed to apply {:?}: {}", self.name, message, e),
        }
    }
}

struct AgentHandle {
    sender: Sender<AgentRequest>,
    thread: Option<JoinHandle<()>>,
}

impl AgentHandle {
    fn shutdown(&mut self) {
        let _ = self.sender.send(AgentRequest::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The set of online agents.
#[derive(Default)]
pub struct AgentHub {
    agents: Mutex<BTreeMap<String, AgentHandle>>,
}

impl AgentHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Brings an agent online with `working_root` as its root. Replaces an
    /// agent of the same name.
    pub fn register(&self, name: &str, working_root: impl Into<PathBuf>) -> io::Result<()> {
        let (sender, receiver) = bounded(64);
        let agent = Agent {
            name: name.to_string(),
            receiver,
            paths: CachePaths::new(working_root),
            locks: CacheLockRegistry::new(),
        };
        let thread = thread::Builder::new()
            .name(format!("gitsync-agent-{}", name))
            .spawn(move || agent.run())?;

        let previous = self.lock().insert(
            name.to_string(),
            AgentHandle {
                sender,
                thread: Some(thread),
            },
        );
        if let Some(mut previous) = previous {
            previous.shutdown();
        }
        Ok(())
    }

    /// Takes an agent offline after it drains its queue.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.lock().remove(name);
        match removed {
            Some(mut handle) => {
                handle.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Stops every agent, waiting for queued messages to be applied.
    pub fn shutdown(&self) {
        let agents = std::mem::take(&mut *self.lock());
        for (_, mut handle) in agents {
            handle.shutdown();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, AgentHandle>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AgentBroadcaster for AgentHub {
    fn broadcast(&self, message: &CacheMessage) -> Vec<String> {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                log::error!("Unable to serialize cache message {:?}: {}", message, e);
                return Vec::new();
            }
        };

        self.lock()
            .iter()
            .filter_map(|(name, handle)| match handle.sender.send(AgentRequest::Message(json.clone())) {
                Ok(()) => Some(name.clone()),
                Err(_) => {
                    log::warn!("Agent {} is not accepting messages", name);
                    None
                }
            })
            .collect()
    }
}

impl Drop for AgentHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}
