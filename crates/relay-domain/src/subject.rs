//! Subject matching and wire-subject construction
//!
//! Subjects are dot-delimited token lists with two wildcard forms:
//! - `*` matches exactly one token
//! - `>` is only valid as the final token and matches any trailing tokens
//!
//! A pattern ending in `>` also matches the bare prefix with nothing after
//! it, which older publishers rely on.

/// Check whether `pattern` matches `subject`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut s_idx = 0;
    for (p_idx, token) in pattern_tokens.iter().enumerate() {
        match *token {
            ">" if p_idx == pattern_tokens.len() - 1 => return true,
            "*" => {
                if s_idx >= subject_tokens.len() {
                    return false;
                }
                s_idx += 1;
            }
            literal => {
                if s_idx >= subject_tokens.len() || subject_tokens[s_idx] != literal {
                    return false;
                }
                s_idx += 1;
            }
        }
    }

    s_idx == subject_tokens.len()
}

/// Check whether any of `patterns` matches `subject`.
pub fn covered<S: AsRef<str>>(patterns: &[S], subject: &str) -> bool {
    patterns.iter().any(|p| matches(p.as_ref(), subject))
}

/// Check whether two patterns can both match at least one common subject.
///
/// Walks both patterns token-wise: a `>` on either side overlaps with
/// anything remaining, `*` overlaps with any single token, and differing
/// literals rule the pair out.
pub fn overlap(a: &str, b: &str) -> bool {
    let a_tokens: Vec<&str> = a.split('.').collect();
    let b_tokens: Vec<&str> = b.split('.').collect();

    let mut i = 0;
    let mut j = 0;
    loop {
        match (a_tokens.get(i), b_tokens.get(j)) {
            (Some(&">"), _) | (_, Some(&">")) => return true,
            (Some(x), Some(y)) => {
                if *x != "*" && *y != "*" && x != y {
                    return false;
                }
                i += 1;
                j += 1;
            }
            (None, None) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
        }
    }
}

/// Composes and parses wire subjects for one `{env}.{app}` deployment.
///
/// The canonical wire form is `{env}.{app}.{topic}`. Legacy events use
/// `{env}.events.{domain}.{resource}.{action}`.
#[derive(Debug, Clone)]
pub struct SubjectBuilder {
    env: String,
    app: String,
}

/// Parsed parts of a canonical wire subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParts {
    pub env: String,
    pub app: String,
    pub topic: String,
}

impl SubjectBuilder {
    pub fn new(env: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            app: app.into(),
        }
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// Build the canonical wire subject `{env}.{app}.{topic}` for a topic.
    pub fn topic_subject(&self, topic: &str) -> String {
        format!("{}.{}.{}", self.env, self.app, normalize_topic(topic))
    }

    /// Build the legacy wire subject `{env}.events.{domain}.{resource}.{action}`.
    pub fn legacy_subject(&self, domain: &str, resource: &str, action: &str) -> String {
        format!(
            "{}.events.{}.{}.{}",
            self.env,
            normalize_topic(domain),
            normalize_topic(resource),
            normalize_topic(action)
        )
    }

    /// Subject pattern covering every topic this deployment publishes.
    pub fn app_pattern(&self) -> String {
        format!("{}.{}.>", self.env, self.app)
    }

    /// Subject pattern covering legacy events in this environment.
    pub fn legacy_pattern(&self) -> String {
        format!("{}.events.>", self.env)
    }

    /// Split a canonical wire subject back into its parts.
    ///
    /// Returns `None` when the subject does not carry this builder's
    /// `{env}.{app}.` prefix.
    pub fn parse_topic(&self, wire_subject: &str) -> Option<TopicParts> {
        let prefix = format!("{}.{}.", self.env, self.app);
        let topic = wire_subject.strip_prefix(&prefix)?;
        if topic.is_empty() {
            return None;
        }
        Some(TopicParts {
            env: self.env.clone(),
            app: self.app.clone(),
            topic: topic.to_string(),
        })
    }
}

/// Normalize a topic for use inside a wire subject.
///
/// Lower-cases and replaces every character outside `[a-z0-9_.>*-]` with
/// `_`. Dots and wildcard characters pass through untouched.
pub fn normalize_topic(topic: &str) -> String {
    topic
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '.' | '>' | '*' | '-' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_exact() {
        assert!(matches("orders.created", "orders.created"));
        assert!(!matches("orders.created", "orders.updated"));
        assert!(!matches("orders", "orders.created"));
        assert!(!matches("orders.created", "orders"));
    }

    #[test]
    fn test_matches_single_wildcard() {
        assert!(matches("orders.*", "orders.created"));
        assert!(matches("*.created", "orders.created"));
        assert!(!matches("orders.*", "orders.created.v2"));
        assert!(!matches("orders.*", "orders"));
        assert!(matches("*", "orders"));
    }

    #[test]
    fn test_matches_tail_wildcard() {
        assert!(matches("orders.>", "orders.created"));
        assert!(matches("orders.>", "orders.created.v2"));
        assert!(matches(">", "orders"));
        assert!(!matches("billing.>", "orders.created"));
    }

    #[test]
    fn test_matches_tail_wildcard_zero_tail() {
        // A pattern ending in `>` also matches its bare prefix.
        assert!(matches("orders.>", "orders"));
        assert!(matches("test.events.>", "test.events"));
    }

    #[test]
    fn test_non_final_gt_is_literal() {
        assert!(matches("a.>.b", "a.>.b"));
        assert!(!matches("a.>.b", "a.x.b"));
    }

    #[test]
    fn test_covered() {
        let patterns = ["billing.>", "orders.*"];
        assert!(covered(&patterns, "orders.created"));
        assert!(covered(&patterns, "billing.invoice.paid"));
        assert!(!covered(&patterns, "users.created"));
    }

    #[test]
    fn test_overlap_literals() {
        assert!(overlap("a.b.c", "a.b.c"));
        assert!(!overlap("a.b.c", "a.b.d"));
        assert!(!overlap("a.b", "a.b.c"));
    }

    #[test]
    fn test_overlap_wildcards() {
        assert!(overlap("a.*.c", "a.b.c"));
        assert!(overlap("a.*", "*.b"));
        assert!(!overlap("a.*", "b.*"));
        assert!(overlap("a.>", "a.b.c"));
        assert!(overlap("test.events.>", "test.events.users.>"));
        assert!(overlap(">", "anything.at.all"));
    }

    #[test]
    fn test_overlap_implies_common_subject() {
        // Every overlapping pair here has a witness subject matched by both.
        let cases = [
            ("a.*.c", "a.b.*", "a.b.c"),
            ("a.>", "a.b.>", "a.b.x"),
            ("*.*", "a.*", "a.b"),
        ];
        for (p, q, witness) in cases {
            assert!(overlap(p, q));
            assert!(matches(p, witness));
            assert!(matches(q, witness));
        }
    }

    #[test]
    fn test_topic_subject() {
        let subjects = SubjectBuilder::new("test", "svc-a");
        assert_eq!(
            subjects.topic_subject("orders.created"),
            "test.svc-a.orders.created"
        );
    }

    #[test]
    fn test_normalize_topic() {
        assert_eq!(normalize_topic("Orders Created!"), "orders_created_");
        assert_eq!(normalize_topic("orders.created"), "orders.created");
        assert_eq!(normalize_topic("orders.*"), "orders.*");
        assert_eq!(normalize_topic("orders.>"), "orders.>");
        assert_eq!(normalize_topic("invoice-paid"), "invoice-paid");
    }

    #[test]
    fn test_legacy_subject() {
        let subjects = SubjectBuilder::new("test", "svc-a");
        assert_eq!(
            subjects.legacy_subject("billing", "invoice", "paid"),
            "test.events.billing.invoice.paid"
        );
    }

    #[test]
    fn test_parse_topic() {
        let subjects = SubjectBuilder::new("test", "svc-a");
        let parts = subjects.parse_topic("test.svc-a.orders.created").unwrap();
        assert_eq!(parts.env, "test");
        assert_eq!(parts.app, "svc-a");
        assert_eq!(parts.topic, "orders.created");

        assert!(subjects.parse_topic("test.other.orders.created").is_none());
        assert!(subjects.parse_topic("prod.svc-a.orders.created").is_none());
        assert!(subjects.parse_topic("test.svc-a.").is_none());
    }
}
