//! Cluster registry and request routing.
//!
//! Requests are forwarded to one member of the target cluster under a
//! relay-scoped route id, so ids chosen by different clients never collide.
//! Replies are mapped back to the origin's own id.

use bytes::Bytes;
use dashmap::DashMap;
use iris_protocol::{Envelope, ErrorCode, Message, ReplyError, RequestId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Upper bound on how long a route is kept, whatever timeout the requester asked for.
pub const MAX_ROUTE_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Relay-wide id of a connected member.
pub type MemberId = u64;

/// Outbound queue of one member connection.
struct MemberHandle {
    cluster: String,
    tx: mpsc::Sender<Message>,
}

/// Members of one cluster, served round-robin.
#[derive(Default)]
struct ClusterMembers {
    members: Vec<MemberId>,
    next: usize,
}

impl ClusterMembers {
    fn pick(&mut self) -> Option<MemberId> {
        if self.members.is_empty() {
            return None;
        }
        let member = self.members[self.next % self.members.len()];
        self.next = self.next.wrapping_add(1);
        Some(member)
    }
}

/// An in-flight request awaiting its reply.
#[derive(Debug, Clone)]
struct Route {
    origin: MemberId,
    origin_id: RequestId,
    target: MemberId,
    deadline: Instant,
}

/// Routing statistics.
#[derive(Debug, Default)]
pub struct RouterStats {
    pub requests_routed: AtomicU64,
    pub replies_routed: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub replies_dropped: AtomicU64,
    pub routes_expired: AtomicU64,
}

/// Tracks cluster membership and in-flight requests.
pub struct Router {
    members: DashMap<MemberId, MemberHandle>,
    clusters: DashMap<String, ClusterMembers>,
    routes: DashMap<RequestId, Route>,
    next_member: AtomicU64,
    next_route: AtomicU64,
    stats: RouterStats,
}

impl Router {
    pub fn new() -> Self {
        Self {
            members: DashMap::new(),
            clusters: DashMap::new(),
            routes: DashMap::new(),
            next_member: AtomicU64::new(1),
            next_route: AtomicU64::new(1),
            stats: RouterStats::default(),
        }
    }

    /// Adds a member to `cluster`. Messages for it are pushed into `tx`.
    pub fn join(&self, cluster: &str, tx: mpsc::Sender<Message>) -> MemberId {
        let member = self.next_member.fetch_add(1, Ordering::Relaxed);
        self.members.insert(
            member,
            MemberHandle {
                cluster: cluster.to_string(),
                tx,
            },
        );
        self.clusters
            .entry(cluster.to_string())
            .or_default()
            .members
            .push(member);
        tracing::debug!("member {} joined cluster {}", member, cluster);
        member
    }

    /// Removes a member.
    ///
    /// Requests it was serving fail with `MEMBER_LOST`; requests it sent are
    /// forgotten. Returns the number of routes dropped.
    pub fn leave(&self, member: MemberId) -> usize {
        let Some((_, handle)) = self.members.remove(&member) else {
            return 0;
        };
        if let Some(mut cluster) = self.clusters.get_mut(&handle.cluster) {
            cluster.members.retain(|m| *m != member);
        }
        self.clusters
            .remove_if(&handle.cluster, |_, cluster| cluster.members.is_empty());

        let mut orphaned = Vec::new();
        let mut dropped = 0;
        self.routes.retain(|_, route| {
            if route.target == member {
                orphaned.push(route.clone());
            }
            let keep = route.target != member && route.origin != member;
            if !keep {
                dropped += 1;
            }
            keep
        });

        for route in orphaned {
            if route.origin == member {
                continue;
            }
            self.deliver(
                route.origin,
                Message::error_reply(
                    route.origin_id,
                    ReplyError::new(ErrorCode::MemberLost, "serving member disconnected"),
                ),
            );
        }

        tracing::debug!(
            "member {} left cluster {} ({} routes dropped)",
            member,
            handle.cluster,
            dropped
        );
        dropped
    }

    /// Forwards a request from `origin` to a member of `cluster`.
    ///
    /// If it cannot be forwarded the origin gets an error reply instead.
    pub fn route_request(
        &self,
        origin: MemberId,
        id: RequestId,
        cluster: &str,
        timeout: Duration,
        payload: Bytes,
    ) {
        let target = self
            .clusters
            .get_mut(cluster)
            .and_then(|mut members| members.pick());
        let Some(target) = target else {
            self.reject(origin, id, ErrorCode::NoMembers, format!("no members in cluster {}", cluster));
            return;
        };

        let route_id = RequestId(self.next_route.fetch_add(1, Ordering::Relaxed));
        self.routes.insert(
            route_id,
            Route {
                origin,
                origin_id: id,
                target,
                deadline: Instant::now() + timeout.min(MAX_ROUTE_LIFETIME),
            },
        );

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let forwarded = Message::request(route_id, cluster, timeout_ms, payload);
        match self.try_deliver(target, forwarded) {
            Ok(()) => {
                self.stats.requests_routed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "request {}:{} -> member {} as route {}",
                    origin,
                    id,
                    target,
                    route_id
                );
            }
            Err(reason) => {
                self.routes.remove(&route_id);
                self.reject(origin, id, ErrorCode::InternalError, reason);
            }
        }
    }

    /// Forwards a reply (or error reply) sent by `from` back to the request's
    /// origin. Replies for unknown or expired routes, or from a member that
    /// was not asked, are dropped.
    pub fn route_reply(&self, from: MemberId, message: Message) {
        let Some(route_id) = message.envelope.request_id() else {
            return;
        };
        let Some((_, route)) = self.routes.remove_if(&route_id, |_, route| route.target == from)
        else {
            self.stats.replies_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("dropping reply for unknown route {} from member {}", route_id, from);
            return;
        };

        let reply = match message.envelope {
            Envelope::Reply { .. } => Message::reply(route.origin_id, message.payload),
            Envelope::ErrorReply { error, .. } => Message::error_reply(route.origin_id, error),
            other => {
                tracing::warn!("route_reply called with {} message", other.kind());
                return;
            }
        };
        if self.deliver(route.origin, reply) {
            self.stats.replies_routed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Forgets routes whose deadline has passed. Their origins have already
    /// timed out locally. Returns the number removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, route| route.deadline > now);
        let removed = before.saturating_sub(self.routes.len());
        if removed > 0 {
            self.stats
                .routes_expired
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!("swept {} expired routes", removed);
        }
        removed
    }

    /// Number of live members of `cluster`.
    pub fn member_count(&self, cluster: &str) -> usize {
        self.clusters
            .get(cluster)
            .map(|c| c.members.len())
            .unwrap_or(0)
    }

    /// Number of requests awaiting a reply.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    fn reject(&self, origin: MemberId, id: RequestId, code: ErrorCode, message: String) {
        self.stats.requests_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("rejecting request {}:{}: {}", origin, id, message);
        self.deliver(origin, Message::error_reply(id, ReplyError::new(code, message)));
    }

    fn deliver(&self, member: MemberId, message: Message) -> bool {
        match self.try_deliver(member, message) {
            Ok(()) => true,
            Err(reason) => {
                self.stats.replies_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("dropping message for member {}: {}", member, reason);
                false
            }
        }
    }

    fn try_deliver(&self, member: MemberId, message: Message) -> Result<(), String> {
        let tx = match self.members.get(&member) {
            Some(handle) => handle.tx.clone(),
            None => return Err(format!("member {} is gone", member)),
        };
        tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => format!("member {} outbound queue full", member),
            TrySendError::Closed(_) => format!("member {} is gone", member),
        })
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
