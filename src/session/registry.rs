use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{Session, SessionId};

/// Live sessions keyed by id.
///
/// Fan-out never runs under the registry lock: matching sessions are cloned
/// out first, then visited.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id(), session);
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner).remove(&id)
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions for which `predicate` holds.
    pub fn sessions_matching<P>(&self, predicate: P) -> Vec<Arc<Session>>
    where
        P: Fn(&Session) -> bool,
    {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| predicate(s))
            .cloned()
            .collect()
    }

    /// Calls `f` for every session for which `predicate` holds.
    pub fn for_each_session<P, F>(&self, predicate: P, mut f: F)
    where
        P: Fn(&Session) -> bool,
        F: FnMut(&Arc<Session>),
    {
        for session in self.sessions_matching(predicate) {
            f(&session);
        }
    }

    #[must_use]
    pub fn any<P>(&self, predicate: P) -> bool
    where
        P: Fn(&Session) -> bool,
    {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|s| predicate(s))
    }

    /// Closes every session.
    pub fn close_all(&self) {
        self.for_each_session(|_| true, |s| s.close());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeId, NodeType};
    use crate::session::test_support::loopback_channel;
    use crate::session::SessionInfo;
    use crate::time::from_unix;

    fn session(node_type: Option<NodeType>) -> (Arc<Session>, std::net::TcpStream) {
        let (channel, client) = loopback_channel();
        let session = Arc::new(Session::new(channel, from_unix(0)));
        if let Some(node_type) = node_type {
            session.set_info(SessionInfo {
                node_id: NodeId(1),
                node_type,
                username: "node".to_string(),
                alert_levels: Vec::new(),
            });
            session.mark_initialized();
        }
        (session, client)
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = SessionRegistry::new();
        let (s, _c) = session(None);
        registry.insert(Arc::clone(&s));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(s.id()).is_some());
        assert!(registry.remove(s.id()).is_some());
        assert!(registry.is_empty());
        assert!(registry.remove(s.id()).is_none());
    }

    #[test]
    fn test_for_each_session_filters_by_role() {
        let registry = SessionRegistry::new();
        let (manager, _c1) = session(Some(NodeType::Manager));
        let (alert, _c2) = session(Some(NodeType::Alert));
        let (pending, _c3) = session(None);
        for s in [&manager, &alert, &pending] {
            registry.insert(Arc::clone(s));
        }

        let mut visited = Vec::new();
        registry.for_each_session(|s| s.serves(NodeType::Manager), |s| visited.push(s.id()));
        assert_eq!(visited, vec![manager.id()]);

        assert!(registry.any(|s| s.info().is_none()));
        registry.close_all();
        assert!(alert.channel().is_closed());
        assert!(pending.channel().is_closed());
    }
}
