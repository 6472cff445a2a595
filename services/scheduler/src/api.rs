//! Leader-aware request routing for the API layer.
//!
//! The HTTP server itself lives outside this crate. It asks the router where
//! each request should go: served here, or forwarded to the current leader.

use std::sync::{PoisonError, RwLock};

use tracing::info;

/// Where a request should be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Serve from this process.
    Local,
    /// Proxy to the leader at this address.
    Forward(String),
    /// A write arrived before any leader is known.
    NoLeader,
}

/// Tracks the current leader address for request forwarding.
#[derive(Debug)]
pub struct LeaderRouter {
    listen_addr: String,
    leader: RwLock<Option<String>>,
}

impl LeaderRouter {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            leader: RwLock::new(None),
        }
    }

    /// Record the current leader's address.
    pub fn update(&self, leader_addr: &str) {
        let mut leader = self.leader.write().unwrap_or_else(PoisonError::into_inner);
        if leader.as_deref() != Some(leader_addr) {
            info!(leader = %leader_addr, local = leader_addr == self.listen_addr, "API leader updated");
            *leader = Some(leader_addr.to_string());
        }
    }

    pub fn leader(&self) -> Option<String> {
        self.leader
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_leader(&self) -> bool {
        self.leader().as_deref() == Some(self.listen_addr.as_str())
    }

    /// Route a request by HTTP method. Followers serve reads and forward writes.
    pub fn route(&self, method: &str) -> Route {
        if is_read_only(method) || self.is_leader() {
            return Route::Local;
        }
        match self.leader() {
            Some(addr) => Route::Forward(addr),
            None => Route::NoLeader,
        }
    }
}

fn is_read_only(method: &str) -> bool {
    ["GET", "HEAD", "OPTIONS"]
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("GET", Route::Local)]
    #[case("head", Route::Local)]
    #[case("POST", Route::Forward("10.0.0.1:9999".into()))]
    #[case("DELETE", Route::Forward("10.0.0.1:9999".into()))]
    fn test_follower_routes(#[case] method: &str, #[case] expected: Route) {
        let router = LeaderRouter::new("10.0.0.2:9999");
        router.update("10.0.0.1:9999");
        assert_eq!(router.route(method), expected);
    }

    #[test]
    fn test_leader_serves_everything() {
        let router = LeaderRouter::new("10.0.0.1:9999");
        router.update("10.0.0.1:9999");
        assert!(router.is_leader());
        assert_eq!(router.route("POST"), Route::Local);
    }

    #[test]
    fn test_unknown_leader() {
        let router = LeaderRouter::new("10.0.0.1:9999");
        assert_eq!(router.route("GET"), Route::Local);
        assert_eq!(router.route("PUT"), Route::NoLeader);
    }
}
