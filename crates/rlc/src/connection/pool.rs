use serde::{Deserialize, Serialize};

/// How a pool picks the member that receives a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    /// Rotate through ready members; the cursor advances on every send
    #[default]
    RoundRobin,
    /// Pick the ready member with the shortest outbound queue
    LeastQueued,
}

/// Per-pool figures reported in the system metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub connection_count: usize,
    pub policy: LoadBalancePolicy,
}

/// A member chosen by a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PoolPick {
    Ready(String),
    /// No member was ready; this one is next in line and may queue
    Unready(String),
}

/// A named, ordered set of connections sharing a load-balancing policy
#[derive(Debug)]
pub struct Pool {
    id: String,
    policy: LoadBalancePolicy,
    members: Vec<String>,
    cursor: usize,
}

impl Pool {
    pub(crate) fn new(id: String, policy: LoadBalancePolicy) -> Self {
        Self {
            id,
            policy,
            members: Vec::new(),
            cursor: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn policy(&self) -> LoadBalancePolicy {
        self.policy
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn set_policy(&mut self, policy: LoadBalancePolicy) {
        self.policy = policy;
    }

    pub(crate) fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            connection_count: self.members.len(),
            policy: self.policy,
        }
    }

    pub(crate) fn add(&mut self, connection_id: &str) {
        if !self.members.iter().any(|id| id == connection_id) {
            self.members.push(connection_id.to_string());
        }
    }

    /// Remove a member, keeping the cursor on the member that was next
    pub(crate) fn remove(&mut self, connection_id: &str) -> bool {
        let Some(index) = self.members.iter().position(|id| id == connection_id) else {
            return false;
        };

        self.members.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.members.len() {
            self.cursor = 0;
        }
        true
    }

    /// Choose the member that receives the next message
    ///
    /// `is_ready` reports whether a member can send now; `queue_depth` is
    /// consulted by [`LoadBalancePolicy::LeastQueued`].
    pub(crate) fn pick<R, Q>(&mut self, is_ready: R, queue_depth: Q) -> Option<PoolPick>
    where
        R: Fn(&str) -> bool,
        Q: Fn(&str) -> usize,
    {
        let len = self.members.len();
        if len == 0 {
            return None;
        }

        let start = self.cursor % len;
        let rotation = (0..len).map(|offset| (start + offset) % len);

        let chosen = match self.policy {
            LoadBalancePolicy::RoundRobin => rotation
                .into_iter()
                .find(|&index| is_ready(&self.members[index])),
            LoadBalancePolicy::LeastQueued => rotation
                .filter(|&index| is_ready(&self.members[index]))
                .min_by_key(|&index| queue_depth(&self.members[index])),
        };

        match chosen {
            Some(index) => {
                self.cursor = (index + 1) % len;
                Some(PoolPick::Ready(self.members[index].clone()))
            }
            None => {
                self.cursor = (start + 1) % len;
                Some(PoolPick::Unready(self.members[start].clone()))
            }
        }
    }
}
