use crate::pool::ConnectionPool;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// One collector pool in the rotation, with the business streams using it
#[derive(Debug)]
pub struct EndpointPoolLink {
    /// Name of the link (the collector's configured name)
    pub name: String,

    /// Connection pool for this collector
    pub pool: Arc<ConnectionPool>,

    /// Business streams currently attached
    businesses: Mutex<BTreeSet<String>>,
}

impl EndpointPoolLink {
    pub fn new(name: impl Into<String>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            name: name.into(),
            pool,
            businesses: Mutex::new(BTreeSet::new()),
        }
    }

    fn businesses(&self) -> MutexGuard<'_, BTreeSet<String>> {
        match self.businesses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a business stream as a user of this link
    pub fn attach_business(&self, business: &str) -> bool {
        self.businesses().insert(business.to_string())
    }

    /// Remove a business stream's registration; returns whether it was attached
    pub fn detach_business(&self, business: &str) -> bool {
        self.businesses().remove(business)
    }

    pub fn is_attached(&self, business: &str) -> bool {
        self.businesses().contains(business)
    }

    /// Snapshot of attached business names, sorted
    pub fn businesses_snapshot(&self) -> Vec<String> {
        self.businesses().iter().cloned().collect()
    }
}
