use std::{
    collections::{BTreeMap, VecDeque},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    common::{
        data::{Exchange, RecordedResponse, RequestRecord, Responder, ResponseTemplate, RuleId},
        util::{lock, panic_message},
    },
    server::matchers::RequestMatcher,
};

/// A rule as it lives in the rule table: never mutated after registration apart from its hit
/// counter.
#[derive(Debug)]
pub(crate) struct ActiveRule {
    pub id: RuleId,
    pub matcher: RequestMatcher,
    pub responder: Responder,
    hits: AtomicUsize,
}

impl ActiveRule {
    pub fn new(id: RuleId, matcher: RequestMatcher, responder: Responder) -> Self {
        Self {
            id,
            matcher,
            responder,
            hits: AtomicUsize::new(0),
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// What the rule table decided for a request.
#[derive(Debug)]
pub(crate) enum Resolution {
    Rule(Arc<ActiveRule>),
    Default(ResponseTemplate),
    /// A caller-supplied predicate of `rule` panicked while the request was being matched.
    Failed { rule: RuleId, reason: String },
}

pub(crate) struct StubServerState {
    history_limit: usize,
    next_rule_id: usize,
    next_sequence: usize,
    initial_default_response: ResponseTemplate,
    default_response: ResponseTemplate,
    rules: Arc<Vec<Arc<ActiveRule>>>,
    history: VecDeque<Arc<RequestRecord>>,
    responses: BTreeMap<usize, RecordedResponse>,
}

impl StubServerState {
    pub fn new(history_limit: usize, default_response: ResponseTemplate) -> Self {
        StubServerState {
            history_limit,
            next_rule_id: 0,
            next_sequence: 0,
            initial_default_response: default_response.clone(),
            default_response,
            rules: Arc::new(Vec::new()),
            history: VecDeque::new(),
            responses: BTreeMap::new(),
        }
    }
}

pub(crate) trait StateManager {
    fn reset(&self);

    fn add_rule(&self, matcher: RequestMatcher, responder: Responder) -> RuleId;
    fn remove_rule(&self, id: RuleId) -> bool;
    fn rule_hits(&self, id: RuleId) -> Option<usize>;
    fn set_default_response(&self, response: ResponseTemplate);

    fn record_request(&self, req: RequestRecord) -> Arc<RequestRecord>;
    fn record_response(&self, sequence: usize, res: RecordedResponse);
    fn history(&self) -> Vec<Arc<RequestRecord>>;
    fn exchanges(&self) -> Vec<Exchange>;
    fn delete_history(&self);

    fn resolve(&self, req: &RequestRecord) -> Resolution;
}

pub(crate) struct StubStateManager {
    state: Mutex<StubServerState>,
}

impl StubStateManager {
    pub fn new(history_limit: usize, default_response: ResponseTemplate) -> Self {
        Self {
            state: Mutex::new(StubServerState::new(history_limit, default_response)),
        }
    }
}

impl Default for StubStateManager {
    fn default() -> Self {
        StubStateManager::new(usize::MAX, ResponseTemplate::not_found())
    }
}

impl StateManager for StubStateManager {
    fn reset(&self) {
        let mut state = lock(&self.state);
        state.rules = Arc::new(Vec::new());
        state.history.clear();
        state.responses.clear();
        state.default_response = state.initial_default_response.clone();
    }

    fn add_rule(&self, matcher: RequestMatcher, responder: Responder) -> RuleId {
        let mut state = lock(&self.state);

        let id = RuleId(state.next_rule_id);
        state.next_rule_id += 1;

        let mut rules = Vec::with_capacity(state.rules.len() + 1);
        rules.extend(state.rules.iter().cloned());
        rules.push(Arc::new(ActiveRule::new(id, matcher, responder)));
        state.rules = Arc::new(rules);

        tracing::debug!("Added rule {}", id);

        id
    }

    fn remove_rule(&self, id: RuleId) -> bool {
        let mut state = lock(&self.state);

        if !state.rules.iter().any(|rule| rule.id == id) {
            return false;
        }

        let rules = state
            .rules
            .iter()
            .filter(|rule| rule.id != id)
            .cloned()
            .collect();
        state.rules = Arc::new(rules);

        tracing::debug!("Removed rule {}", id);

        true
    }

    fn rule_hits(&self, id: RuleId) -> Option<usize> {
        let state = lock(&self.state);
        state
            .rules
            .iter()
            .find(|rule| rule.id == id)
            .map(|rule| rule.hits())
    }

    fn set_default_response(&self, response: ResponseTemplate) {
        let mut state = lock(&self.state);
        state.default_response = response;
    }

    fn record_request(&self, req: RequestRecord) -> Arc<RequestRecord> {
        let mut state = lock(&self.state);

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let req = Arc::new(req.with_sequence(sequence));

        if state.history_limit == 0 {
            return req;
        }

        while state.history.len() >= state.history_limit {
            if let Some(oldest) = state.history.pop_front() {
                state.responses.remove(&oldest.sequence());
            }
        }

        state.history.push_back(req.clone());

        req
    }

    fn record_response(&self, sequence: usize, res: RecordedResponse) {
        let mut state = lock(&self.state);

        // The request may have been evicted or cleared while it was being answered.
        if state
            .history
            .binary_search_by_key(&sequence, |req| req.sequence())
            .is_ok()
        {
            state.responses.insert(sequence, res);
        }
    }

    fn history(&self) -> Vec<Arc<RequestRecord>> {
        let state = lock(&self.state);
        state.history.iter().cloned().collect()
    }

    fn exchanges(&self) -> Vec<Exchange> {
        let state = lock(&self.state);
        state
            .history
            .iter()
            .map(|req| Exchange {
                request: req.clone(),
                response: state.responses.get(&req.sequence()).cloned(),
            })
            .collect()
    }

    fn delete_history(&self) {
        let mut state = lock(&self.state);
        state.history.clear();
        state.responses.clear();
    }

    fn resolve(&self, req: &RequestRecord) -> Resolution {
        let (rules, default_response) = {
            let state = lock(&self.state);
            (state.rules.clone(), state.default_response.clone())
        };

        // Predicates are caller code and run without holding the state lock.
        for rule in rules.iter() {
            match panic::catch_unwind(AssertUnwindSafe(|| rule.matcher.matches(req))) {
                Ok(false) => continue,
                Ok(true) => {
                    rule.hits.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!("Request {} {} matched rule {}", req.method(), req.path(), rule.id);
                    return Resolution::Rule(rule.clone());
                }
                Err(payload) => {
                    let reason = format!("matcher panicked: {}", panic_message(payload));
                    tracing::warn!("Rule {} failed to match {} {}: {}", rule.id, req.method(), req.path(), reason);
                    return Resolution::Failed {
                        rule: rule.id,
                        reason,
                    };
                }
            }
        }

        tracing::debug!("No rule matched request {} {}", req.method(), req.path());
        Resolution::Default(default_response)
    }
}
