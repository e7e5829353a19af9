use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::gmail::MailGateway;
use crate::models::LabelAssignment;
use crate::retry::{LabelError, MAX_RETRIES, RetryPolicy, VERIFY_ATTEMPTS};

/// Gmail's mutable star marker, applied in place of the read-only IMPORTANT.
const STARRED_ID: &str = "STARRED";
/// Custom label used when starring cannot be verified.
const IMPORTANT_FALLBACK_NAME: &str = "📌 Importante";
/// Provider limit on label display names.
const MAX_LABEL_LEN: usize = 100;

/// Built-in labels with fixed provider ids, keyed by lowercase synonym
/// (English and Spanish). These are referenced, never created.
const SYSTEM_LABELS: &[(&str, &str)] = &[
    ("inbox", "INBOX"),
    ("sent", "SENT"),
    ("enviados", "SENT"),
    ("spam", "SPAM"),
    ("trash", "TRASH"),
    ("papelera", "TRASH"),
    ("draft", "DRAFT"),
    ("drafts", "DRAFT"),
    ("borradores", "DRAFT"),
    ("starred", "STARRED"),
    ("destacado", "STARRED"),
    ("unread", "UNREAD"),
    ("no leído", "UNREAD"),
];

const IMPORTANT_SYNONYMS: &[&str] = &["important", "importante"];

/// How a label name is handled. Dispatch happens once, up front, so each arm
/// of the workflow stays independently testable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelKind {
    /// Synonym of IMPORTANT, which the modify API treats as read-only.
    /// Handled through the starred fallback chain.
    Importance,
    /// Fixed provider id; creation is never attempted.
    System(&'static str),
    /// User label (already normalized), resolved through the cache or
    /// created on demand.
    Custom(String),
}

impl LabelKind {
    pub fn for_name(name: &str) -> LabelKind {
        let lower = name.trim().to_lowercase();
        if IMPORTANT_SYNONYMS.contains(&lower.as_str()) {
            return LabelKind::Importance;
        }
        if let Some((_, id)) = SYSTEM_LABELS.iter().find(|(syn, _)| *syn == lower) {
            return LabelKind::System(id);
        }
        LabelKind::Custom(normalize_label_name(name))
    }
}

/// Trim, collapse internal whitespace runs, and strip characters Gmail
/// rejects in label names. An empty or over-long result is replaced with a
/// generated time-based name so the creation call always gets usable input.
pub fn normalize_label_name(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '"' | '\'' | '`'))
        .collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.is_empty() || collapsed.chars().count() > MAX_LABEL_LEN {
        let fallback = format!("Label-{}", chrono::Utc::now().timestamp_millis());
        debug!(raw, fallback, "label name unusable after normalization");
        fallback
    } else {
        collapsed
    }
}

/// Resolves label names to provider ids and applies them to messages, with
/// verification and bounded retries. The name→id cache is the one piece of
/// shared state; it is guarded by a `tokio::sync::Mutex` and refreshed
/// wholesale from the provider, never partially invalidated.
pub struct LabelApplier<G> {
    gateway: G,
    policy: RetryPolicy,
    cache: Mutex<HashMap<String, String>>,
}

impl<G: MailGateway> LabelApplier<G> {
    pub fn new(gateway: G, policy: RetryPolicy) -> Self {
        Self {
            gateway,
            policy,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Apply `label_name` to `message_id`, creating the label if needed and
    /// verifying the mutation took effect. All expected failure modes are
    /// folded into the returned boolean; nothing is propagated to the caller.
    pub async fn apply_label(&self, message_id: &str, label_name: &str) -> bool {
        if message_id.trim().is_empty() {
            error!("empty message id");
            return false;
        }
        if label_name.trim().is_empty() {
            error!(message_id, "empty label name");
            return false;
        }

        match LabelKind::for_name(label_name) {
            LabelKind::Importance => self.apply_importance(message_id).await,
            kind => self.apply_with_retry(message_id, label_name, &kind).await,
        }
    }

    /// Outer retry loop around resolve → apply → verify.
    async fn apply_with_retry(&self, message_id: &str, label_name: &str, kind: &LabelKind) -> bool {
        let system = matches!(kind, LabelKind::System(_));

        for attempt in 0..MAX_RETRIES {
            debug!(
                attempt = attempt + 1,
                max = MAX_RETRIES,
                message_id,
                label_name,
                "applying label"
            );

            let err = match self.attempt_apply(message_id, kind).await {
                Ok(()) => {
                    info!(message_id, label_name, "label applied and verified");
                    return true;
                }
                Err(err) => err,
            };

            warn!(attempt = attempt + 1, %err, message_id, label_name, "attempt failed");
            let exhausted = attempt + 1 == MAX_RETRIES;

            match err {
                // None of these can be fixed by trying again.
                LabelError::Authorization(_) | LabelError::NotFound(_) | LabelError::Resolve(_) => {
                    return false;
                }
                // Custom labels either verify or they don't; only system
                // labels are prone enough to propagation delay to warrant
                // another full cycle.
                LabelError::Unverified(_) if !system => return false,
                LabelError::Unverified(_) => {
                    if exhausted {
                        return false;
                    }
                    sleep(self.policy.base_delay()).await;
                }
                LabelError::RateLimit(_) => {
                    if exhausted {
                        return false;
                    }
                    sleep(self.policy.rate_limit_backoff()).await;
                }
                LabelError::Transient(_) => {
                    if exhausted {
                        return false;
                    }
                    sleep(self.policy.backoff(attempt)).await;
                }
            }
        }

        error!(message_id, label_name, "all attempts exhausted");
        false
    }

    /// One full resolve → apply → verify cycle.
    async fn attempt_apply(&self, message_id: &str, kind: &LabelKind) -> Result<(), LabelError> {
        let label_id = match kind {
            LabelKind::System(id) => {
                debug!(system_id = id, "system label, fixed id");
                (*id).to_owned()
            }
            LabelKind::Custom(name) => self.get_or_create_with_retry(name).await?,
            LabelKind::Importance => STARRED_ID.to_owned(),
        };

        self.apply_resolved(message_id, &label_id).await
    }

    /// Add `label_id` to the message unless it is already present, then
    /// verify it shows up. A successful modify call alone is not trusted.
    async fn apply_resolved(&self, message_id: &str, label_id: &str) -> Result<(), LabelError> {
        let current = self
            .gateway
            .message_label_ids(message_id)
            .await
            .map_err(|e| LabelError::NotFound(format!("message {message_id}: {e:#}")))?;

        if current.iter().any(|id| id == label_id) {
            debug!(message_id, label_id, "label already present, nothing to do");
            return Ok(());
        }

        self.gateway
            .add_label(message_id, label_id)
            .await
            .map_err(LabelError::from_gateway)?;

        sleep(self.policy.settle_delay()).await;

        if self.verify(message_id, label_id).await {
            Ok(())
        } else {
            Err(LabelError::Unverified(label_id.to_owned()))
        }
    }

    /// Re-read the message's label set until the id shows up, with growing
    /// pauses. Gmail applies label mutations asynchronously.
    async fn verify(&self, message_id: &str, label_id: &str) -> bool {
        for attempt in 0..VERIFY_ATTEMPTS {
            sleep(self.policy.verify_delay(attempt)).await;

            match self.gateway.message_label_ids(message_id).await {
                Ok(ids) => {
                    let present = ids.iter().any(|id| id == label_id);
                    debug!(
                        attempt = attempt + 1,
                        max = VERIFY_ATTEMPTS,
                        message_id,
                        label_id,
                        present,
                        "verification read"
                    );
                    if present {
                        return true;
                    }
                }
                Err(err) => warn!(attempt = attempt + 1, %err, "verification read failed"),
            }
        }
        false
    }

    /// IMPORTANT cannot be set through the modify API, so star the message
    /// instead; if the star cannot be verified, fall back to a dedicated
    /// custom label.
    async fn apply_importance(&self, message_id: &str) -> bool {
        debug!(message_id, "importance requested, applying star marker");

        match self.apply_resolved(message_id, STARRED_ID).await {
            Ok(()) => {
                info!(message_id, "message starred in place of IMPORTANT");
                true
            }
            Err(err) => {
                warn!(%err, message_id, "star marker failed, falling back to custom label");
                self.apply_custom_important(message_id).await
            }
        }
    }

    async fn apply_custom_important(&self, message_id: &str) -> bool {
        let label_id = match self.get_or_create_with_retry(IMPORTANT_FALLBACK_NAME).await {
            Ok(id) => id,
            Err(err) => {
                error!(%err, "could not resolve the fallback importance label");
                return false;
            }
        };

        match self.apply_resolved(message_id, &label_id).await {
            Ok(()) => {
                info!(message_id, label = IMPORTANT_FALLBACK_NAME, "fallback label applied");
                true
            }
            Err(err) => {
                error!(%err, message_id, "fallback importance label failed");
                false
            }
        }
    }

    /// Get-or-create with its own bounded retries. Exhaustion is terminal for
    /// the outer loop; authorization errors abort straight away.
    async fn get_or_create_with_retry(&self, name: &str) -> Result<String, LabelError> {
        let mut last = String::new();

        for attempt in 0..MAX_RETRIES {
            match self.get_or_create(name).await {
                Ok(id) => return Ok(id),
                Err(err) => {
                    warn!(attempt = attempt + 1, %err, name, "get-or-create failed");
                    let classified = LabelError::from_gateway(err);
                    if matches!(classified, LabelError::Authorization(_)) {
                        return Err(classified);
                    }
                    last = classified.to_string();
                    if attempt + 1 < MAX_RETRIES {
                        sleep(self.policy.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(LabelError::Resolve(format!("{name}: {last}")))
    }

    /// Resolve a normalized name under the cache lock: wholesale refresh,
    /// exact match, case-insensitive match, then a single creation call with
    /// the new mapping inserted before the lock is released. The propagation
    /// pause happens after release so waiters are not serialized behind it.
    async fn get_or_create(&self, name: &str) -> anyhow::Result<String> {
        let created = {
            let mut cache = self.cache.lock().await;
            self.refresh_locked(&mut cache).await?;

            if let Some(id) = cache.get(name) {
                debug!(name, id, "label found in cache");
                return Ok(id.clone());
            }

            let lower = name.to_lowercase();
            if let Some(id) = cache
                .iter()
                .find(|(existing, _)| existing.to_lowercase() == lower)
                .map(|(_, id)| id.clone())
            {
                debug!(name, id, "label found by case-insensitive match");
                return Ok(id);
            }

            info!(name, "creating label");
            let label = self.gateway.create_label(name).await?;
            cache.insert(label.name.clone(), label.id.clone());
            info!(name, id = label.id, "label created");
            label.id
        };

        sleep(self.policy.creation_delay()).await;
        Ok(created)
    }

    /// Replace the cache contents with the provider's current label list.
    async fn refresh_locked(&self, cache: &mut HashMap<String, String>) -> anyhow::Result<()> {
        let labels = self.gateway.list_labels().await?;
        cache.clear();
        cache.extend(labels.into_iter().map(|l| (l.name, l.id)));
        debug!(count = cache.len(), "label cache refreshed");
        Ok(())
    }

    /// Force a cache refresh and return the full name→id mapping.
    pub async fn list_all_labels(&self) -> anyhow::Result<HashMap<String, String>> {
        let mut cache = self.cache.lock().await;
        self.refresh_locked(&mut cache).await?;
        Ok(cache.clone())
    }

    /// Apply a sequence of classifications, strictly in input order with a
    /// fixed pause between items. One item failing does not stop the rest;
    /// the result maps each message id to its outcome.
    pub async fn apply_batch(&self, assignments: &[LabelAssignment]) -> HashMap<String, bool> {
        info!(count = assignments.len(), "starting batch labeling");
        let mut results = HashMap::new();

        for (index, assignment) in assignments.iter().enumerate() {
            let label = &assignment.classification.label;
            debug!(
                item = index + 1,
                total = assignments.len(),
                id = assignment.id,
                label,
                confidence = assignment.classification.confidence,
                "batch item"
            );

            let ok = self.apply_label(&assignment.id, label).await;
            if !ok {
                warn!(id = assignment.id, label, "batch item failed");
            }
            results.insert(assignment.id.clone(), ok);

            if index + 1 < assignments.len() {
                sleep(self.policy.batch_delay()).await;
            }
        }

        let succeeded = results.values().filter(|ok| **ok).count();
        info!(
            succeeded,
            failed = results.len() - succeeded,
            "batch labeling finished"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classification, Label};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Default)]
    struct MockState {
        labels: Vec<Label>,
        message_labels: HashMap<String, Vec<String>>,
        list_error: Option<String>,
        modify_error: Option<String>,
        // Label ids whose mutations are accepted but never land, simulating
        // a modify call that "succeeds" without becoming observable.
        dropped_ids: HashSet<String>,
        list_calls: usize,
        create_calls: usize,
        get_calls: usize,
        modify_calls: usize,
    }

    #[derive(Default)]
    struct MockGateway {
        state: StdMutex<MockState>,
    }

    impl MockGateway {
        fn new() -> Self {
            Self::default()
        }

        fn with_label(self, name: &str, id: &str) -> Self {
            self.state.lock().unwrap().labels.push(Label {
                id: id.to_string(),
                name: name.to_string(),
                label_type: "user".to_string(),
            });
            self
        }

        fn with_message(self, id: &str, label_ids: &[&str]) -> Self {
            self.state.lock().unwrap().message_labels.insert(
                id.to_string(),
                label_ids.iter().map(|s| s.to_string()).collect(),
            );
            self
        }

        fn failing_list(self, message: &str) -> Self {
            self.state.lock().unwrap().list_error = Some(message.to_string());
            self
        }

        fn failing_modify(self, message: &str) -> Self {
            self.state.lock().unwrap().modify_error = Some(message.to_string());
            self
        }

        fn dropping(self, label_id: &str) -> Self {
            self.state
                .lock()
                .unwrap()
                .dropped_ids
                .insert(label_id.to_string());
            self
        }

        fn list_calls(&self) -> usize {
            self.state.lock().unwrap().list_calls
        }

        fn create_calls(&self) -> usize {
            self.state.lock().unwrap().create_calls
        }

        fn get_calls(&self) -> usize {
            self.state.lock().unwrap().get_calls
        }

        fn modify_calls(&self) -> usize {
            self.state.lock().unwrap().modify_calls
        }

        fn message_has(&self, message_id: &str, label_id: &str) -> bool {
            self.state
                .lock()
                .unwrap()
                .message_labels
                .get(message_id)
                .is_some_and(|ids| ids.iter().any(|id| id == label_id))
        }

        fn has_label_named(&self, name: &str) -> bool {
            self.state
                .lock()
                .unwrap()
                .labels
                .iter()
                .any(|l| l.name == name)
        }
    }

    #[async_trait]
    impl MailGateway for MockGateway {
        async fn list_labels(&self) -> anyhow::Result<Vec<Label>> {
            let mut state = self.state.lock().unwrap();
            state.list_calls += 1;
            if let Some(message) = &state.list_error {
                return Err(anyhow!("{message}"));
            }
            Ok(state.labels.clone())
        }

        async fn create_label(&self, name: &str) -> anyhow::Result<Label> {
            let mut state = self.state.lock().unwrap();
            state.create_calls += 1;
            let label = Label {
                id: format!("Label_{}", state.create_calls),
                name: name.to_string(),
                label_type: "user".to_string(),
            };
            state.labels.push(label.clone());
            Ok(label)
        }

        async fn message_label_ids(&self, message_id: &str) -> anyhow::Result<Vec<String>> {
            let mut state = self.state.lock().unwrap();
            state.get_calls += 1;
            state
                .message_labels
                .get(message_id)
                .cloned()
                .ok_or_else(|| anyhow!("message {message_id} not found"))
        }

        async fn add_label(&self, message_id: &str, label_id: &str) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.modify_calls += 1;
            if let Some(message) = &state.modify_error {
                return Err(anyhow!("{message}"));
            }
            if state.dropped_ids.contains(label_id) {
                return Ok(());
            }
            let entry = state
                .message_labels
                .entry(message_id.to_string())
                .or_default();
            if !entry.iter().any(|id| id == label_id) {
                entry.push(label_id.to_string());
            }
            Ok(())
        }
    }

    fn applier(gateway: MockGateway) -> LabelApplier<MockGateway> {
        LabelApplier::new(gateway, RetryPolicy::immediate())
    }

    fn assignment(id: &str, label: &str) -> LabelAssignment {
        LabelAssignment {
            id: id.to_string(),
            classification: Classification {
                label: label.to_string(),
                confidence: 0.9,
                rationale: None,
            },
        }
    }

    #[test]
    fn test_normalize_strips_and_collapses() {
        assert_eq!(normalize_label_name("  Proj<ect>  name  "), "Project name");
        assert_eq!(normalize_label_name("a`b\"c'd"), "abcd");
        assert_eq!(normalize_label_name("Facturas"), "Facturas");
    }

    #[test]
    fn test_normalize_replaces_unusable_names() {
        let fallback = normalize_label_name("<>\"'`");
        assert!(fallback.starts_with("Label-"));

        let long = "x".repeat(101);
        assert!(normalize_label_name(&long).starts_with("Label-"));
        // Exactly at the limit is still allowed through.
        let max = "x".repeat(100);
        assert_eq!(normalize_label_name(&max), max);
    }

    #[test]
    fn test_label_kind_dispatch() {
        assert_eq!(LabelKind::for_name("IMPORTANT"), LabelKind::Importance);
        assert_eq!(LabelKind::for_name("importante"), LabelKind::Importance);
        assert_eq!(LabelKind::for_name("Inbox"), LabelKind::System("INBOX"));
        assert_eq!(LabelKind::for_name("Destacado"), LabelKind::System("STARRED"));
        assert_eq!(LabelKind::for_name("PAPELERA"), LabelKind::System("TRASH"));
        assert_eq!(LabelKind::for_name("no leído"), LabelKind::System("UNREAD"));
        assert_eq!(
            LabelKind::for_name(" My  Label "),
            LabelKind::Custom("My Label".to_string())
        );
    }

    #[tokio::test]
    async fn test_empty_inputs_fail_without_network() {
        let applier = applier(MockGateway::new());

        assert!(!applier.apply_label("", "Work").await);
        assert!(!applier.apply_label("msg1", "").await);
        assert!(!applier.apply_label("msg1", "   ").await);

        let gateway = applier.gateway();
        assert_eq!(gateway.list_calls(), 0);
        assert_eq!(gateway.get_calls(), 0);
        assert_eq!(gateway.modify_calls(), 0);
        assert_eq!(gateway.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_system_label_never_creates() {
        let applier = applier(MockGateway::new().with_message("msg1", &["UNREAD"]));

        assert!(applier.apply_label("msg1", "Inbox").await);

        let gateway = applier.gateway();
        assert!(gateway.message_has("msg1", "INBOX"));
        assert_eq!(gateway.create_calls(), 0);
        // Fixed ids skip cache resolution entirely.
        assert_eq!(gateway.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_existing_label_matched_case_insensitively() {
        let applier = applier(
            MockGateway::new()
                .with_label("Work", "L1")
                .with_message("msg1", &[]),
        );

        assert!(applier.apply_label("msg1", "work").await);

        let gateway = applier.gateway();
        assert!(gateway.message_has("msg1", "L1"));
        assert_eq!(gateway.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_absent_label_created_exactly_once() {
        let applier = applier(
            MockGateway::new()
                .with_message("msg1", &[])
                .with_message("msg2", &[]),
        );

        assert!(applier.apply_label("msg1", "Projects").await);
        assert!(applier.apply_label("msg2", "Projects").await);

        let gateway = applier.gateway();
        assert_eq!(gateway.create_calls(), 1);
        assert!(gateway.message_has("msg1", "Label_1"));
        assert!(gateway.message_has("msg2", "Label_1"));
    }

    #[tokio::test]
    async fn test_second_apply_short_circuits() {
        let applier = applier(
            MockGateway::new()
                .with_label("Work", "L1")
                .with_message("msg1", &[]),
        );

        assert!(applier.apply_label("msg1", "Work").await);
        assert_eq!(applier.gateway().modify_calls(), 1);

        // Label is present now; the second call must not mutate.
        assert!(applier.apply_label("msg1", "Work").await);
        assert_eq!(applier.gateway().modify_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_message_fails_without_retry() {
        let applier = applier(MockGateway::new().with_label("Work", "L1"));

        assert!(!applier.apply_label("msg1", "Work").await);

        let gateway = applier.gateway();
        assert_eq!(gateway.get_calls(), 1);
        assert_eq!(gateway.modify_calls(), 0);
    }

    #[tokio::test]
    async fn test_importance_applies_star_marker() {
        let applier = applier(MockGateway::new().with_message("msg1", &[]));

        assert!(applier.apply_label("msg1", "IMPORTANT").await);

        let gateway = applier.gateway();
        assert!(gateway.message_has("msg1", "STARRED"));
        assert_eq!(gateway.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_importance_falls_back_to_custom_label() {
        let applier = applier(
            MockGateway::new()
                .with_message("msg1", &[])
                .dropping("STARRED"),
        );

        assert!(applier.apply_label("msg1", "important").await);

        let gateway = applier.gateway();
        assert!(gateway.has_label_named(IMPORTANT_FALLBACK_NAME));
        assert_eq!(gateway.create_calls(), 1);
        assert!(gateway.message_has("msg1", "Label_1"));
        assert!(!gateway.message_has("msg1", "STARRED"));
    }

    #[tokio::test]
    async fn test_importance_fails_when_both_paths_fail() {
        // The fallback label is created as Label_1 and its mutations are
        // dropped too, so neither alternative verifies.
        let applier = applier(
            MockGateway::new()
                .with_message("msg1", &[])
                .dropping("STARRED")
                .dropping("Label_1"),
        );

        assert!(!applier.apply_label("msg1", "Importante").await);
    }

    #[tokio::test]
    async fn test_failing_resolver_called_exactly_max_retries_times() {
        let applier = applier(
            MockGateway::new()
                .with_message("msg1", &[])
                .failing_list("connection reset by peer"),
        );

        assert!(!applier.apply_label("msg1", "Work").await);

        let gateway = applier.gateway();
        assert_eq!(gateway.list_calls(), MAX_RETRIES as usize);
        assert_eq!(gateway.create_calls(), 0);
        assert_eq!(gateway.modify_calls(), 0);
    }

    #[tokio::test]
    async fn test_authorization_error_aborts_immediately() {
        let applier = applier(
            MockGateway::new()
                .with_label("Work", "L1")
                .with_message("msg1", &[])
                .failing_modify("Request had insufficient authentication scopes"),
        );

        assert!(!applier.apply_label("msg1", "Work").await);
        assert_eq!(applier.gateway().modify_calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_up_to_bound() {
        let applier = applier(
            MockGateway::new()
                .with_label("Work", "L1")
                .with_message("msg1", &[])
                .failing_modify("User-rate limit exceeded"),
        );

        assert!(!applier.apply_label("msg1", "Work").await);
        assert_eq!(applier.gateway().modify_calls(), MAX_RETRIES as usize);
    }

    #[tokio::test]
    async fn test_system_label_verification_miss_reenters_outer_loop() {
        let applier = applier(
            MockGateway::new()
                .with_message("msg1", &[])
                .dropping("SPAM"),
        );

        assert!(!applier.apply_label("msg1", "spam").await);
        assert_eq!(applier.gateway().modify_calls(), MAX_RETRIES as usize);
    }

    #[tokio::test]
    async fn test_custom_label_verification_miss_is_terminal() {
        let applier = applier(
            MockGateway::new()
                .with_label("Work", "L1")
                .with_message("msg1", &[])
                .dropping("L1"),
        );

        assert!(!applier.apply_label("msg1", "Work").await);
        assert_eq!(applier.gateway().modify_calls(), 1);
    }

    #[tokio::test]
    async fn test_batch_continues_past_failures_in_order() {
        let applier = applier(
            MockGateway::new()
                .with_message("msg1", &[])
                .with_message("msg3", &[]),
        );

        let assignments = vec![
            assignment("msg1", "Work"),
            assignment("msg2", "Work"), // missing message
            assignment("msg3", "Personal"),
        ];
        let results = applier.apply_batch(&assignments).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results.get("msg1"), Some(&true));
        assert_eq!(results.get("msg2"), Some(&false));
        assert_eq!(results.get("msg3"), Some(&true));
        // One creation per distinct label, despite the mid-batch failure.
        assert_eq!(applier.gateway().create_calls(), 2);
    }

    #[tokio::test]
    async fn test_list_all_labels_forces_refresh() {
        let applier = applier(MockGateway::new().with_label("Work", "L1"));

        let labels = applier.list_all_labels().await.unwrap();
        assert_eq!(labels.get("Work"), Some(&"L1".to_string()));

        applier.list_all_labels().await.unwrap();
        assert_eq!(applier.gateway().list_calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_create_once() {
        let applier = Arc::new(applier(
            MockGateway::new()
                .with_message("msg1", &[])
                .with_message("msg2", &[]),
        ));

        let a = Arc::clone(&applier);
        let b = Arc::clone(&applier);
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.apply_label("msg1", "Shared").await }),
            tokio::spawn(async move { b.apply_label("msg2", "Shared").await }),
        );

        assert!(first.unwrap());
        assert!(second.unwrap());
        // The cache mutex serializes get-or-create; the second resolution
        // sees the label created by the first.
        assert_eq!(applier.gateway().create_calls(), 1);
    }

    #[tokio::test]
    async fn test_batch_input_parses_classifier_output() {
        let raw = r#"[{"id":"msg1","label":"Facturas","confidence":0.93,"rationale":"invoice"}]"#;
        let assignments: Vec<LabelAssignment> = serde_json::from_str(raw).unwrap();
        assert_eq!(assignments[0].classification.label, "Facturas");

        let applier = applier(MockGateway::new().with_message("msg1", &[]));
        let results = applier.apply_batch(&assignments).await;
        assert_eq!(results.get("msg1"), Some(&true));
    }
}
