use super::link::EndpointPoolLink;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Rotating registry of collector pool links
///
/// Selection takes the link at the tail, moves it to the head and returns it.
/// From a quiescent registry of M links, M consecutive selections visit every
/// link exactly once in a stable cyclic order. The rotation is a
/// read-modify-write on shared state, so it runs under a mutex.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    links: Mutex<VecDeque<Arc<EndpointPoolLink>>>,
}

impl EndpointRegistry {
    /// Create a registry with links in registration order
    pub fn new(links: Vec<Arc<EndpointPoolLink>>) -> Self {
        Self {
            links: Mutex::new(links.into_iter().collect()),
        }
    }

    fn links_mut(&self) -> MutexGuard<'_, VecDeque<Arc<EndpointPoolLink>>> {
        match self.links.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Select the next link, round-robin
    pub fn select(&self) -> Option<Arc<EndpointPoolLink>> {
        let mut links = self.links_mut();
        let link = links.pop_back()?;
        links.push_front(Arc::clone(&link));
        Some(link)
    }

    /// Register `business` on every link
    pub fn attach_business(&self, business: &str) {
        for link in self.links_mut().iter() {
            link.attach_business(business);
        }
    }

    /// Remove `business` from every link's usage set, walking tail to head.
    /// Links themselves stay in the rotation.
    pub fn detach_business(&self, business: &str) -> usize {
        let links = self.links_mut();
        let mut detached = 0;
        for link in links.iter().rev() {
            if link.detach_business(business) {
                debug!(link = %link.name, business = %business, "Detached business");
                detached += 1;
            }
        }
        detached
    }

    /// Snapshot of the current ordering, head first
    pub fn links(&self) -> Vec<Arc<EndpointPoolLink>> {
        self.links_mut().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.links_mut().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links_mut().is_empty()
    }
}
