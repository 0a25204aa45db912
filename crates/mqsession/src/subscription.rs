//! Subscription registry and topic filter matching.

use ahash::AHashMap;

use crate::engine::QoS;

/// An active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic filter, possibly containing `+` / `#` wildcards.
    pub topic_filter: String,
    /// QoS asked for in the SUBSCRIBE.
    pub requested_qos: QoS,
    /// QoS the broker granted in the SUBACK.
    pub granted_qos: Option<QoS>,
}

/// Topic filter to subscription metadata. One entry per filter.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: AHashMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `subscription.topic_filter`.
    ///
    /// Returns the previous entry for the same filter, if any.
    pub fn upsert(&mut self, subscription: Subscription) -> Option<Subscription> {
        self.entries
            .insert(subscription.topic_filter.clone(), subscription)
    }

    /// Remove the entry for `topic_filter`.
    pub fn remove(&mut self, topic_filter: &str) -> Option<Subscription> {
        self.entries.remove(topic_filter)
    }

    pub fn get(&self, topic_filter: &str) -> Option<&Subscription> {
        self.entries.get(topic_filter)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries whose filter matches `topic`.
    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.entries
            .values()
            .filter(move |sub| topic_matches_filter(topic, &sub.topic_filter))
    }

    /// Whether any registered filter matches `topic`.
    pub fn matches(&self, topic: &str) -> bool {
        self.matching(topic).next().is_some()
    }

    /// Copy of every entry, sorted by filter.
    pub fn snapshot(&self) -> Vec<Subscription> {
        let mut subs: Vec<_> = self.entries.values().cloned().collect();
        subs.sort_by(|a, b| a.topic_filter.cmp(&b.topic_filter));
        subs
    }
}

/// Check if a topic name matches a topic filter.
///
/// `+` matches exactly one level, `#` matches the remaining levels
/// (including none). Topics starting with `$` are never matched by a
/// filter whose first level is a wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(filter: &str, qos: QoS) -> Subscription {
        Subscription {
            topic_filter: filter.to_string(),
            requested_qos: qos,
            granted_qos: Some(qos),
        }
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(!topic_matches_filter("a/b", "a/c"));
        assert!(!topic_matches_filter("a/b/c", "a/b"));
        assert!(!topic_matches_filter("a", "a/b"));

        assert!(topic_matches_filter("a/b", "a/+"));
        assert!(topic_matches_filter("a//c", "a/+/c"));
        assert!(!topic_matches_filter("a/b/c", "a/+"));

        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(topic_matches_filter("anything/at/all", "#"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!topic_matches_filter("$SYS/broker/uptime", "#"));
        assert!(!topic_matches_filter("$SYS/broker/uptime", "+/broker/uptime"));
        assert!(topic_matches_filter("$SYS/broker/uptime", "$SYS/#"));
    }

    #[test]
    fn test_upsert_replaces() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.upsert(sub("a/b", QoS::AtMostOnce)).is_none());

        let old = registry.upsert(sub("a/b", QoS::ExactlyOnce)).unwrap();
        assert_eq!(old.requested_qos, QoS::AtMostOnce);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("a/b").unwrap().granted_qos,
            Some(QoS::ExactlyOnce)
        );
    }

    #[test]
    fn test_matching_and_remove() {
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(sub("sensors/+/temp", QoS::AtLeastOnce));
        registry.upsert(sub("sensors/#", QoS::AtMostOnce));
        registry.upsert(sub("alerts", QoS::AtMostOnce));

        assert_eq!(registry.matching("sensors/7/temp").count(), 2);
        assert!(registry.matches("alerts"));
        assert!(!registry.matches("other"));

        registry.remove("sensors/#");
        assert_eq!(registry.matching("sensors/7/humidity").count(), 0);

        let filters: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|s| s.topic_filter)
            .collect();
        assert_eq!(filters, vec!["alerts", "sensors/+/temp"]);
    }
}
