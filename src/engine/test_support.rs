//! In-memory engine used by protocol tests.

use super::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Deterministic `BuildEngine` with scripted goals, targets, and outcomes.
pub struct FakeEngine {
    goals: Vec<GoalDescriptor>,
    targets: Vec<TargetHandle>,
    metadata: HashMap<String, TargetMetadata>,
    outcomes: HashMap<String, GoalOutcome>,
    hanging_goals: Vec<String>,
    pub invocations: Arc<Mutex<Vec<GoalInvocation>>>,
}

impl FakeEngine {
    /// Two goals (`test`, `lint`) and one target (`//pkg:lib`), matching the
    /// smallest interesting session.
    pub fn sample() -> Self {
        let mut engine = Self::empty();
        engine.goals = vec![
            GoalDescriptor {
                name: "test".to_string(),
                description: Some("Run tests".to_string()),
                param_schema: None,
            },
            GoalDescriptor {
                name: "lint".to_string(),
                description: Some("Run linters".to_string()),
                param_schema: None,
            },
        ];
        engine.targets = vec![TargetHandle {
            address: "//pkg:lib".to_string(),
        }];
        engine.metadata.insert(
            "//pkg:lib".to_string(),
            TargetMetadata {
                address: "//pkg:lib".to_string(),
                kind: "library".to_string(),
                dependencies: vec!["//pkg:dep".to_string()],
                sources: vec!["pkg/lib.rs".to_string()],
                attributes: BTreeMap::new(),
            },
        );
        engine
    }

    pub fn empty() -> Self {
        FakeEngine {
            goals: Vec::new(),
            targets: Vec::new(),
            metadata: HashMap::new(),
            outcomes: HashMap::new(),
            hanging_goals: Vec::new(),
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_goal(mut self, goal: GoalDescriptor) -> Self {
        self.goals.push(goal);
        self
    }

    pub fn with_target(mut self, address: &str, metadata: TargetMetadata) -> Self {
        self.targets.push(TargetHandle {
            address: address.to_string(),
        });
        self.metadata.insert(address.to_string(), metadata);
        self
    }

    /// Script the outcome of one goal; goals without a script exit 0.
    pub fn with_outcome(mut self, goal: &str, outcome: GoalOutcome) -> Self {
        self.outcomes.insert(goal.to_string(), outcome);
        self
    }

    /// Make a goal block until its cancellation token fires.
    pub fn with_hanging_goal(mut self, goal: &str) -> Self {
        self.hanging_goals.push(goal.to_string());
        self
    }

    pub async fn invocation_count(&self) -> usize {
        self.invocations.lock().await.len()
    }
}

#[async_trait]
impl BuildEngine for FakeEngine {
    async fn list_goals(&self) -> Result<Vec<GoalDescriptor>, EngineError> {
        Ok(self.goals.clone())
    }

    async fn list_targets(&self) -> Result<Vec<TargetHandle>, EngineError> {
        Ok(self.targets.clone())
    }

    async fn target_metadata(&self, address: &str) -> Result<TargetMetadata, EngineError> {
        self.metadata
            .get(address)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("target {address}")))
    }

    async fn invoke_goal(
        &self,
        invocation: GoalInvocation,
        cancel: CancellationToken,
    ) -> Result<GoalOutcome, EngineError> {
        if !self.goals.iter().any(|g| g.name == invocation.goal) {
            return Err(EngineError::NotFound(format!("goal {}", invocation.goal)));
        }

        let goal = invocation.goal.clone();
        self.invocations.lock().await.push(invocation);

        if self.hanging_goals.iter().any(|g| g == &goal) {
            cancel.cancelled().await;
            return Err(EngineError::Cancelled);
        }

        Ok(self.outcomes.get(&goal).cloned().unwrap_or(GoalOutcome {
            exit_code: 0,
            stdout: format!("{goal} ok\n"),
            stderr: String::new(),
        }))
    }
}
