use std::collections::HashSet;

/// Hosts with a probe in flight.
///
/// Not synchronised itself: the scheduler keeps it inside the same mutex as
/// the picker, so checking a host and activating it happen atomically.
#[derive(Debug, Default)]
pub struct HostExclusionSet {
    active: HashSet<String>,
}

impl HostExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `host` active. Returns false if it already was.
    pub fn try_activate(&mut self, host: &str) -> bool {
        if self.active.contains(host) {
            return false;
        }
        self.active.insert(host.to_owned())
    }

    /// Release `host`. Returns false if it was not active.
    pub fn release(&mut self, host: &str) -> bool {
        self.active.remove(host)
    }

    pub fn is_active(&self, host: &str) -> bool {
        self.active.contains(host)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Active hosts, for excluding them from the next pick
    pub fn active(&self) -> Vec<String> {
        self.active.iter().cloned().collect()
    }
}
