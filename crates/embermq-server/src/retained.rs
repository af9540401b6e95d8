//! Topic tree of retained messages.
//!
//! Publish topics contain no wildcards, so the tree only has exact
//! children; the wildcard logic lives in the replay walk, which
//! mirrors the subscription tree's matching. A `#` in the filter
//! switches the walk into pound mode and emits every retained message
//! in the subtree. `$`-prefixed topics live under their own root.

use ahash::AHashMap;
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
}

#[derive(Default)]
struct RetainedNode {
    children: AHashMap<String, Box<RetainedNode>>,
    /// Keyed by full topic; a terminal node holds at most one entry
    /// per exact topic.
    retained: AHashMap<String, RetainedMessage>,
}

impl RetainedNode {
    fn set(&mut self, subtopics: &[String], message: RetainedMessage) -> i64 {
        match subtopics.first() {
            None => {
                let delete = message.payload.is_empty();
                if delete {
                    if self.retained.remove(&message.topic).is_some() {
                        -1
                    } else {
                        0
                    }
                } else if self.retained.insert(message.topic.clone(), message).is_none() {
                    1
                } else {
                    0
                }
            }
            Some(subtopic) => {
                let node = self.children.entry(subtopic.clone()).or_default();
                node.set(&subtopics[1..], message)
            }
        }
    }

    fn emit(&self, out: &mut Vec<RetainedMessage>) {
        out.extend(self.retained.values().cloned());
    }

    fn emit_subtree(&self, out: &mut Vec<RetainedMessage>) {
        self.emit(out);
        for child in self.children.values() {
            child.emit_subtree(out);
        }
    }

    fn collect(&self, filter: &[String], out: &mut Vec<RetainedMessage>) {
        let Some(current) = filter.first() else {
            self.emit(out);
            return;
        };

        match current.as_str() {
            "#" => self.emit_subtree(out),
            "+" => {
                for child in self.children.values() {
                    child.collect(&filter[1..], out);
                }
            }
            _ => {
                if let Some(child) = self.children.get(current) {
                    child.collect(&filter[1..], out);
                }
            }
        }
    }
}

#[derive(Default)]
pub struct RetainedTree {
    root: RetainedNode,
    root_dollar: RetainedNode,
    count: i64,
}

impl RetainedTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn root_for_mut(&mut self, subtopics: &[String]) -> &mut RetainedNode {
        if subtopics.first().is_some_and(|s| s.starts_with('$')) {
            &mut self.root_dollar
        } else {
            &mut self.root
        }
    }

    fn root_for(&self, subtopics: &[String]) -> &RetainedNode {
        if subtopics.first().is_some_and(|s| s.starts_with('$')) {
            &self.root_dollar
        } else {
            &self.root
        }
    }

    /// Insert or replace the retained message on an exact topic. An
    /// empty payload deletes.
    pub fn set_retained_message(
        &mut self,
        topic: &str,
        subtopics: &[String],
        payload: Bytes,
        qos: u8,
    ) {
        let message = RetainedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        };
        self.count += self.root_for_mut(subtopics).set(subtopics, message);
    }

    /// All retained messages matching a subscription filter.
    pub fn collect_matching(&self, filter: &[String], out: &mut Vec<RetainedMessage>) {
        self.root_for(filter).collect(filter, out);
    }

    /// Every retained message, for persistence.
    pub fn collect_all(&self, out: &mut Vec<RetainedMessage>) {
        self.root.emit_subtree(out);
        self.root_dollar.emit_subtree(out);
    }

    pub fn retained_count(&self) -> i64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::split_topic;

    fn set(tree: &mut RetainedTree, topic: &str, payload: &'static [u8], qos: u8) {
        tree.set_retained_message(topic, &split_topic(topic), Bytes::from_static(payload), qos);
    }

    fn replay(tree: &RetainedTree, filter: &str) -> Vec<String> {
        let mut out = Vec::new();
        tree.collect_matching(&split_topic(filter), &mut out);
        let mut topics: Vec<String> = out.into_iter().map(|m| m.topic).collect();
        topics.sort();
        topics
    }

    #[test]
    fn exact_and_wildcard_replay() {
        let mut tree = RetainedTree::new();
        set(&mut tree, "home/kitchen/temp", b"21", 0);
        set(&mut tree, "home/kitchen/humidity", b"40", 1);
        set(&mut tree, "home/hall/temp", b"19", 0);

        assert_eq!(replay(&tree, "home/kitchen/temp"), ["home/kitchen/temp"]);
        assert_eq!(
            replay(&tree, "home/+/temp"),
            ["home/hall/temp", "home/kitchen/temp"]
        );
        assert_eq!(
            replay(&tree, "home/#"),
            ["home/hall/temp", "home/kitchen/humidity", "home/kitchen/temp"]
        );
        assert_eq!(replay(&tree, "#").len(), 3);
        assert!(replay(&tree, "office/#").is_empty());
    }

    #[test]
    fn pound_matches_parent_level() {
        let mut tree = RetainedTree::new();
        set(&mut tree, "a", b"1", 0);
        set(&mut tree, "a/b", b"2", 0);

        assert_eq!(replay(&tree, "a/#"), ["a", "a/b"]);
    }

    #[test]
    fn empty_payload_deletes() {
        let mut tree = RetainedTree::new();
        set(&mut tree, "a/b", b"1", 0);
        assert_eq!(tree.retained_count(), 1);

        set(&mut tree, "a/b", b"", 0);
        assert_eq!(tree.retained_count(), 0);
        assert!(replay(&tree, "a/#").is_empty());

        // Deleting what is not there is a no-op.
        set(&mut tree, "a/b", b"", 0);
        assert_eq!(tree.retained_count(), 0);
    }

    #[test]
    fn replace_keeps_count_and_latest_payload() {
        let mut tree = RetainedTree::new();
        set(&mut tree, "a/b", b"old", 0);
        set(&mut tree, "a/b", b"new", 2);
        assert_eq!(tree.retained_count(), 1);

        let mut out = Vec::new();
        tree.collect_matching(&split_topic("a/b"), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].payload[..], b"new");
        assert_eq!(out[0].qos, 2);
    }

    #[test]
    fn dollar_topics_need_explicit_filters() {
        let mut tree = RetainedTree::new();
        set(&mut tree, "$SYS/broker/uptime", b"42", 0);
        set(&mut tree, "normal/topic", b"x", 0);

        assert!(replay(&tree, "#").iter().all(|t| !t.starts_with('$')));
        assert_eq!(replay(&tree, "$SYS/#"), ["$SYS/broker/uptime"]);
    }

    #[test]
    fn collect_all_spans_both_roots() {
        let mut tree = RetainedTree::new();
        set(&mut tree, "$SYS/x", b"1", 0);
        set(&mut tree, "a/b", b"2", 0);

        let mut out = Vec::new();
        tree.collect_all(&mut out);
        assert_eq!(out.len(), 2);
    }
}
