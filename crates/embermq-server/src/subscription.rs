//! Topic tree of subscribers with MQTT wildcard matching.
//!
//! `+` and `#` live in dedicated child slots, not in the `children`
//! map: a literal `+` in a publish topic is an ordinary subtopic and
//! must never collide with the wildcard child. Topics whose first
//! subtopic starts with `$` live under a separate root so `#`/`+` at
//! the top level never match them.
//!
//! Subscriptions hold weak session references. Expired entries are
//! skipped during fan-out and physically removed by the periodic
//! `clean_subscriptions` sweep; nodes are never pruned eagerly.

use std::sync::{Arc, Weak};

use ahash::AHashMap;

use crate::session::Session;

/// Split a topic or filter into its slash-delimited subtopics. Empty
/// components are preserved: `a//b` has three levels.
pub fn split_topic(topic: &str) -> Vec<String> {
    topic.split('/').map(str::to_string).collect()
}

/// Validate a subscription filter: `#` must be terminal and both
/// wildcards must occupy a whole level.
pub fn valid_subscribe_filter(subtopics: &[String]) -> bool {
    if subtopics.is_empty() {
        return false;
    }
    for (i, subtopic) in subtopics.iter().enumerate() {
        match subtopic.as_str() {
            "#" => {
                if i != subtopics.len() - 1 {
                    return false;
                }
            }
            "+" => {}
            other => {
                if other.contains(['+', '#']) {
                    return false;
                }
            }
        }
    }
    true
}

/// One client's subscription at a node.
pub struct Subscription {
    pub session: Weak<Session>,
    pub qos: u8,
}

/// A resolved fan-out recipient.
pub struct ReceivingSubscriber {
    pub session: Arc<Session>,
    pub qos: u8,
}

#[derive(Default)]
struct SubscriptionNode {
    /// Client id → subscription.
    subscribers: AHashMap<String, Subscription>,
    children: AHashMap<String, Box<SubscriptionNode>>,
    plus_child: Option<Box<SubscriptionNode>>,
    pound_child: Option<Box<SubscriptionNode>>,
}

impl SubscriptionNode {
    fn upsert(&mut self, subtopics: &[String], session: &Arc<Session>, qos: u8) {
        match subtopics.first().map(String::as_str) {
            None => {
                self.subscribers.insert(
                    session.client_id().to_string(),
                    Subscription {
                        session: Arc::downgrade(session),
                        qos,
                    },
                );
            }
            Some("#") => {
                let node = self.pound_child.get_or_insert_with(Default::default);
                node.upsert(&subtopics[1..], session, qos);
            }
            Some("+") => {
                let node = self.plus_child.get_or_insert_with(Default::default);
                node.upsert(&subtopics[1..], session, qos);
            }
            Some(subtopic) => {
                let node = self.children.entry(subtopic.to_string()).or_default();
                node.upsert(&subtopics[1..], session, qos);
            }
        }
    }

    fn remove(&mut self, subtopics: &[String], client_id: &str) {
        match subtopics.first().map(String::as_str) {
            None => {
                self.subscribers.remove(client_id);
            }
            Some("#") => {
                if let Some(node) = &mut self.pound_child {
                    node.remove(&subtopics[1..], client_id);
                }
            }
            Some("+") => {
                if let Some(node) = &mut self.plus_child {
                    node.remove(&subtopics[1..], client_id);
                }
            }
            Some(subtopic) => {
                if let Some(node) = self.children.get_mut(subtopic) {
                    node.remove(&subtopics[1..], client_id);
                }
            }
        }
    }

    fn emit(&self, out: &mut AHashMap<String, ReceivingSubscriber>) {
        for (client_id, sub) in &self.subscribers {
            let Some(session) = sub.session.upgrade() else {
                continue;
            };
            out.entry(client_id.clone())
                .and_modify(|existing| existing.qos = existing.qos.max(sub.qos))
                .or_insert(ReceivingSubscriber { session, qos: sub.qos });
        }
    }

    /// The recursive publish walk: `#` matches at every level it is
    /// reachable from (including the parent level itself), `+` matches
    /// exactly one level, and exact children match their own.
    fn collect(&self, subtopics: &[String], out: &mut AHashMap<String, ReceivingSubscriber>) {
        if let Some(pound) = &self.pound_child {
            pound.emit(out);
        }

        let Some(current) = subtopics.first() else {
            self.emit(out);
            return;
        };

        if let Some(plus) = &self.plus_child {
            plus.collect(&subtopics[1..], out);
        }
        if let Some(child) = self.children.get(current) {
            child.collect(&subtopics[1..], out);
        }
    }

    /// Drop expired subscribers and empty subtrees. Returns the number
    /// of pruned subscriber entries.
    fn clean(&mut self) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|_, sub| sub.session.strong_count() > 0);
        let mut pruned = before - self.subscribers.len();

        for slot in [&mut self.plus_child, &mut self.pound_child] {
            if let Some(node) = slot {
                pruned += node.clean();
                if node.is_empty() {
                    *slot = None;
                }
            }
        }

        self.children.retain(|_, node| {
            pruned += node.clean();
            !node.is_empty()
        });

        pruned
    }

    fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
            && self.children.is_empty()
            && self.plus_child.is_none()
            && self.pound_child.is_none()
    }

    fn count(&self) -> usize {
        let mut total = self.subscribers.len();
        if let Some(node) = &self.plus_child {
            total += node.count();
        }
        if let Some(node) = &self.pound_child {
            total += node.count();
        }
        for node in self.children.values() {
            total += node.count();
        }
        total
    }

    fn for_each(&self, path: &mut Vec<String>, f: &mut impl FnMut(&str, &str, u8)) {
        let filter = path.join("/");
        for (client_id, sub) in &self.subscribers {
            if sub.session.strong_count() > 0 {
                f(client_id, &filter, sub.qos);
            }
        }
        if let Some(node) = &self.plus_child {
            path.push("+".to_string());
            node.for_each(path, f);
            path.pop();
        }
        if let Some(node) = &self.pound_child {
            path.push("#".to_string());
            node.for_each(path, f);
            path.pop();
        }
        for (subtopic, node) in &self.children {
            path.push(subtopic.clone());
            node.for_each(path, f);
            path.pop();
        }
    }
}

/// The broker's subscription store: one root for ordinary topics, one
/// for `$`-prefixed ones.
#[derive(Default)]
pub struct SubscriptionTree {
    root: SubscriptionNode,
    root_dollar: SubscriptionNode,
}

fn is_dollar(subtopics: &[String]) -> bool {
    subtopics.first().is_some_and(|s| s.starts_with('$'))
}

impl SubscriptionTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn root_for(&self, subtopics: &[String]) -> &SubscriptionNode {
        if is_dollar(subtopics) {
            &self.root_dollar
        } else {
            &self.root
        }
    }

    fn root_for_mut(&mut self, subtopics: &[String]) -> &mut SubscriptionNode {
        if is_dollar(subtopics) {
            &mut self.root_dollar
        } else {
            &mut self.root
        }
    }

    /// Insert or replace the subscription of `session` on this filter.
    pub fn add_subscription(&mut self, session: &Arc<Session>, subtopics: &[String], qos: u8) {
        self.root_for_mut(subtopics).upsert(subtopics, session, qos);
    }

    pub fn remove_subscription(&mut self, client_id: &str, subtopics: &[String]) {
        self.root_for_mut(subtopics).remove(subtopics, client_id);
    }

    /// Resolve fan-out recipients for a publish topic, deduplicated by
    /// client id at the maximum matching QoS. Top-level wildcards can
    /// never match a `$` topic because filters starting with `+`/`#`
    /// are stored under the ordinary root.
    pub fn collect_receivers(
        &self,
        subtopics: &[String],
        out: &mut AHashMap<String, ReceivingSubscriber>,
    ) {
        self.root_for(subtopics).collect(subtopics, out);
    }

    /// Sweep expired weak sessions and prune empty subtrees.
    pub fn clean_subscriptions(&mut self) -> usize {
        self.root.clean() + self.root_dollar.clean()
    }

    pub fn subscription_count(&self) -> usize {
        self.root.count() + self.root_dollar.count()
    }

    /// Visit every live `(client_id, filter, qos)`, for persistence.
    pub fn for_each_subscription(&self, mut f: impl FnMut(&str, &str, u8)) {
        let mut path = Vec::new();
        self.root.for_each(&mut path, &mut f);
        self.root_dollar.for_each(&mut path, &mut f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> Arc<Session> {
        Arc::new(Session::new(id, 300))
    }

    fn subscribe(tree: &mut SubscriptionTree, session: &Arc<Session>, filter: &str, qos: u8) {
        tree.add_subscription(session, &split_topic(filter), qos);
    }

    fn matches(tree: &SubscriptionTree, topic: &str) -> Vec<(String, u8)> {
        let mut out = AHashMap::new();
        tree.collect_receivers(&split_topic(topic), &mut out);
        let mut result: Vec<(String, u8)> = out
            .into_iter()
            .map(|(id, r)| (id, r.qos))
            .collect();
        result.sort();
        result
    }

    #[test]
    fn exact_match() {
        let mut tree = SubscriptionTree::new();
        let s1 = session("c1");
        subscribe(&mut tree, &s1, "sensors/temp", 0);

        assert_eq!(matches(&tree, "sensors/temp"), vec![("c1".to_string(), 0)]);
        assert!(matches(&tree, "sensors/humidity").is_empty());
    }

    #[test]
    fn plus_matches_single_level() {
        let mut tree = SubscriptionTree::new();
        let s1 = session("c1");
        subscribe(&mut tree, &s1, "a/+/c", 1);

        assert_eq!(matches(&tree, "a/b/c"), vec![("c1".to_string(), 1)]);
        assert!(matches(&tree, "a/b/d").is_empty());
        assert!(matches(&tree, "a/b/c/d").is_empty());
        assert!(matches(&tree, "a/c").is_empty());
    }

    #[test]
    fn pound_matches_subtree_and_parent() {
        let mut tree = SubscriptionTree::new();
        let s1 = session("c1");
        subscribe(&mut tree, &s1, "a/#", 0);

        assert_eq!(matches(&tree, "a").len(), 1);
        assert_eq!(matches(&tree, "a/b").len(), 1);
        assert_eq!(matches(&tree, "a/b/c/d").len(), 1);
        assert!(matches(&tree, "b").is_empty());
    }

    #[test]
    fn literal_plus_subtopic_does_not_collide_with_wildcard() {
        let mut tree = SubscriptionTree::new();
        let s1 = session("wildcard");
        let s2 = session("literal");
        subscribe(&mut tree, &s1, "a/+", 0);
        subscribe(&mut tree, &s2, "a/x", 0);

        // A publish to the literal topic "a/+" reaches the wildcard
        // subscriber but not the "a/x" one.
        assert_eq!(matches(&tree, "a/+"), vec![("wildcard".to_string(), 0)]);
    }

    #[test]
    fn dollar_topics_are_isolated_from_top_level_wildcards() {
        let mut tree = SubscriptionTree::new();
        let s1 = session("c1");
        let s2 = session("c2");
        subscribe(&mut tree, &s1, "#", 0);
        subscribe(&mut tree, &s2, "$SYS/#", 0);

        assert_eq!(matches(&tree, "$SYS/x"), vec![("c2".to_string(), 0)]);
        assert_eq!(matches(&tree, "normal/topic"), vec![("c1".to_string(), 0)]);
    }

    #[test]
    fn overlapping_filters_dedupe_at_max_qos() {
        let mut tree = SubscriptionTree::new();
        let s1 = session("c1");
        subscribe(&mut tree, &s1, "a/b", 0);
        subscribe(&mut tree, &s1, "a/+", 2);
        subscribe(&mut tree, &s1, "a/#", 1);

        assert_eq!(matches(&tree, "a/b"), vec![("c1".to_string(), 2)]);
    }

    #[test]
    fn resubscribe_replaces_qos() {
        let mut tree = SubscriptionTree::new();
        let s1 = session("c1");
        subscribe(&mut tree, &s1, "a/b", 0);
        subscribe(&mut tree, &s1, "a/b", 2);

        assert_eq!(matches(&tree, "a/b"), vec![("c1".to_string(), 2)]);
        assert_eq!(tree.subscription_count(), 1);
    }

    #[test]
    fn expired_sessions_are_skipped_and_swept() {
        let mut tree = SubscriptionTree::new();
        let s1 = session("gone");
        let s2 = session("alive");
        subscribe(&mut tree, &s1, "a/b", 1);
        subscribe(&mut tree, &s2, "a/b", 1);
        drop(s1);

        assert_eq!(matches(&tree, "a/b"), vec![("alive".to_string(), 1)]);

        let pruned = tree.clean_subscriptions();
        assert_eq!(pruned, 1);
        assert_eq!(tree.subscription_count(), 1);
    }

    #[test]
    fn sweep_prunes_empty_subtrees() {
        let mut tree = SubscriptionTree::new();
        let s1 = session("c1");
        subscribe(&mut tree, &s1, "deep/a/b/c/#", 0);
        drop(s1);

        tree.clean_subscriptions();
        assert_eq!(tree.subscription_count(), 0);
        assert!(tree.root.is_empty());
    }

    #[test]
    fn filter_validation() {
        assert!(valid_subscribe_filter(&split_topic("a/+/c")));
        assert!(valid_subscribe_filter(&split_topic("#")));
        assert!(valid_subscribe_filter(&split_topic("a//b")));
        assert!(!valid_subscribe_filter(&split_topic("a/#/c")));
        assert!(!valid_subscribe_filter(&split_topic("a/b+/c")));
        assert!(!valid_subscribe_filter(&split_topic("a/#b")));
    }

    #[test]
    fn for_each_subscription_reports_filters() {
        let mut tree = SubscriptionTree::new();
        let s1 = session("c1");
        subscribe(&mut tree, &s1, "a/+/c", 1);
        subscribe(&mut tree, &s1, "x/#", 2);

        let mut seen = Vec::new();
        tree.for_each_subscription(|client_id, filter, qos| {
            seen.push((client_id.to_string(), filter.to_string(), qos));
        });
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("c1".to_string(), "a/+/c".to_string(), 1),
                ("c1".to_string(), "x/#".to_string(), 2),
            ]
        );
    }
}
