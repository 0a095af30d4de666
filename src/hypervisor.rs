//! Multiplexer over many independent hosts.
//!
//! Hosts share no mutable state, so lifecycle operations on "all hosts" fan
//! out one thread per host and join before returning, collecting per-host
//! results under a single mutex. The host table lock is never held across a
//! lifecycle operation, so pausing one host while another runs on the
//! caller's thread cannot deadlock.

use crate::error::{Result, RuntimeError};
use crate::host::{Host, HostState};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type HostId = u64;

pub struct HostHypervisor {
    next_host_id: AtomicU64,
    hosts: Mutex<BTreeMap<HostId, Arc<Host>>>,
}

impl HostHypervisor {
    pub fn new() -> Self {
        Self {
            next_host_id: AtomicU64::new(0),
            hosts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_host(&self, host: Host) -> HostId {
        let id = self.next_host_id.fetch_add(1, Ordering::Relaxed);
        self.lock_hosts().insert(id, Arc::new(host));
        id
    }

    /// Dropping a host cancels its execution and joins its worker.
    pub fn remove_host(&self, id: HostId) -> Result<()> {
        self.lock_hosts()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| unknown_host(id))
    }

    pub fn remove_all_hosts(&self) {
        self.lock_hosts().clear();
    }

    pub fn host_name(&self, id: HostId) -> Result<String> {
        Ok(self.host(id)?.name().to_string())
    }

    pub fn host_state(&self, id: HostId) -> Result<HostState> {
        Ok(self.host(id)?.state())
    }

    pub fn setup_host(&self, id: HostId) -> Result<()> {
        self.host(id)?.setup()
    }

    pub fn run_host(&self, id: HostId) -> Result<()> {
        self.host(id)?.run()
    }

    pub fn pause_host(&self, id: HostId) -> Result<()> {
        self.host(id)?.pause()
    }

    pub fn host_names(&self) -> BTreeMap<HostId, String> {
        self.for_each_host(|host| host.name().to_string())
    }

    pub fn host_states(&self) -> BTreeMap<HostId, HostState> {
        self.for_each_host(Host::state)
    }

    pub fn setup_hosts(&self) -> BTreeMap<HostId, Result<()>> {
        self.for_each_host(Host::setup)
    }

    pub fn run_hosts(&self) -> BTreeMap<HostId, Result<()>> {
        self.for_each_host(Host::run)
    }

    pub fn pause_hosts(&self) -> BTreeMap<HostId, Result<()>> {
        self.for_each_host(Host::pause)
    }

    /// Run every host but the first detached, then the first one on the
    /// calling thread. Returns once the current-thread host pauses or
    /// exits; the detached workers are joined by their hosts' `exit`.
    pub fn run_hosts_on_current_thread(&self) -> BTreeMap<HostId, Result<()>> {
        let hosts = self.snapshot();
        let mut results = BTreeMap::new();
        let mut iter = hosts.into_iter();
        let Some((first_id, first)) = iter.next() else {
            return results;
        };
        for (id, host) in iter {
            results.insert(id, host.run());
        }
        results.insert(first_id, first.run_on_current_thread());
        results
    }

    fn host(&self, id: HostId) -> Result<Arc<Host>> {
        self.lock_hosts()
            .get(&id)
            .cloned()
            .ok_or_else(|| unknown_host(id))
    }

    fn snapshot(&self) -> Vec<(HostId, Arc<Host>)> {
        self.lock_hosts()
            .iter()
            .map(|(&id, host)| (id, Arc::clone(host)))
            .collect()
    }

    fn for_each_host<R: Send>(&self, f: impl Fn(&Host) -> R + Sync) -> BTreeMap<HostId, R> {
        let hosts = self.snapshot();
        let results = Mutex::new(BTreeMap::new());
        std::thread::scope(|scope| {
            for (id, host) in &hosts {
                let results = &results;
                let f = &f;
                scope.spawn(move || {
                    let result = f(host);
                    results
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(*id, result);
                });
            }
        });
        results.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_hosts(&self) -> std::sync::MutexGuard<'_, BTreeMap<HostId, Arc<Host>>> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for HostHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_host(id: HostId) -> RuntimeError {
    RuntimeError::structure(format!("unknown host id {id}"))
}
