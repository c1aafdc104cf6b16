use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{DomainPhase, results_key};

/// Where a run is in its phase sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState<P> {
    Pending,
    Running(P),
    Completed,
    Failed(P),
    Cancelled,
}

impl<P> RunState<P> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

/// Everything one generation run works on.
#[derive(Debug, Clone)]
pub struct DomainContext<P> {
    pub pipeline_id: String,
    pub generation_id: Uuid,
    /// Correlation id of the start message, carried by every reply
    pub correlation_id: Uuid,
    pub data: Value,
    pub context: Value,
    pub state: RunState<P>,
    outputs: Vec<(P, Value)>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<P: DomainPhase> DomainContext<P> {
    pub fn new(
        pipeline_id: impl Into<String>,
        generation_id: Uuid,
        correlation_id: Uuid,
        data: Value,
        context: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id: pipeline_id.into(),
            generation_id,
            correlation_id,
            data,
            context,
            state: RunState::Pending,
            outputs: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn current_phase(&self) -> Option<P> {
        match self.state {
            RunState::Running(p) | RunState::Failed(p) => Some(p),
            _ => None,
        }
    }

    pub(super) fn set_state(&mut self, state: RunState<P>) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub(super) fn record_output(&mut self, phase: P, output: Value) {
        self.outputs.push((phase, output));
        self.updated_at = Utc::now();
    }

    /// Output of an earlier phase.
    pub fn output(&self, phase: P) -> Option<&Value> {
        self.outputs
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, v)| v)
    }

    /// Output of the most recent phase, if any has run.
    pub fn previous(&self) -> Option<&Value> {
        self.outputs.last().map(|(_, v)| v)
    }

    /// Every output so far, keyed `{phase}_results`.
    pub fn results(&self) -> Map<String, Value> {
        self.outputs
            .iter()
            .map(|(p, v)| (results_key(*p), v.clone()))
            .collect()
    }

    /// Look up a value in the start input, falling back to the source data.
    pub fn input(&self, key: &str) -> Option<&Value> {
        self.data
            .get(key)
            .or_else(|| self.data.get(crate::pipeline::SOURCE_KEY)?.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Step {
        One,
        Two,
    }

    impl DomainPhase for Step {
        fn as_str(&self) -> &'static str {
            match self {
                Step::One => "one",
                Step::Two => "two",
            }
        }
    }

    #[test]
    fn test_results_are_keyed_by_phase() {
        let mut ctx: DomainContext<Step> =
            DomainContext::new("p1", Uuid::new_v4(), Uuid::new_v4(), json!({}), json!({}));
        assert!(ctx.previous().is_none());
        ctx.record_output(Step::One, json!(1));
        ctx.record_output(Step::Two, json!(2));

        assert_eq!(ctx.output(Step::One), Some(&json!(1)));
        assert_eq!(ctx.previous(), Some(&json!(2)));
        let results = ctx.results();
        assert_eq!(results["one_results"], json!(1));
        assert_eq!(results["two_results"], json!(2));
    }

    #[test]
    fn test_input_falls_back_to_source() {
        let ctx: DomainContext<Step> = DomainContext::new(
            "p1",
            Uuid::new_v4(),
            Uuid::new_v4(),
            json!({"source": {"records": [1]}, "quality": {"score": 1}}),
            Value::Null,
        );
        assert_eq!(ctx.input("records"), Some(&json!([1])));
        assert_eq!(ctx.input("quality"), Some(&json!({"score": 1})));
        assert!(ctx.input("missing").is_none());
    }

    #[test]
    fn test_current_phase_tracks_state() {
        let mut ctx: DomainContext<Step> =
            DomainContext::new("p1", Uuid::new_v4(), Uuid::new_v4(), json!({}), json!({}));
        assert_eq!(ctx.current_phase(), None);
        ctx.set_state(RunState::Running(Step::Two));
        assert_eq!(ctx.current_phase(), Some(Step::Two));
        ctx.set_state(RunState::Completed);
        assert!(ctx.state.is_terminal());
        assert_eq!(ctx.current_phase(), None);
    }
}
