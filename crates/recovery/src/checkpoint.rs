//! Checkpoint manager: named verification points and their verifiers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CheckpointError;
use crate::events::{EventBus, ExecutionEvent};
use crate::history::BoundedHistory;
use crate::model::{ActionContext, Checkpoint};

pub type CheckpointId = Uuid;
pub type VerifierId = Uuid;

/// Registered checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDefinition {
    pub id: CheckpointId,
    pub name: String,
    pub description: String,
    pub after_action: String,
    pub gates_progress: bool,
    pub created_at: DateTime<Utc>,
}

impl CheckpointDefinition {
    pub fn new(name: impl Into<String>, after_action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            after_action: after_action.into(),
            gates_progress: false,
            created_at: Utc::now(),
        }
    }
}

impl From<&Checkpoint> for CheckpointDefinition {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: checkpoint.name.clone(),
            description: checkpoint.description.clone(),
            after_action: checkpoint.after_action.clone(),
            gates_progress: checkpoint.gates_progress,
            created_at: Utc::now(),
        }
    }
}

/// What a single verifier concluded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierOutcome {
    pub verified: bool,
    pub confidence: f64,
    pub details: Option<serde_json::Value>,
}

impl VerifierOutcome {
    pub fn passed(confidence: f64) -> Self {
        Self {
            verified: true,
            confidence,
            details: None,
        }
    }

    pub fn failed(confidence: f64) -> Self {
        Self {
            verified: false,
            confidence,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Verifies that a checkpoint's condition holds
#[async_trait]
pub trait CheckpointVerifier: Send + Sync {
    async fn verify(
        &self,
        checkpoint: &CheckpointDefinition,
        context: &ActionContext,
    ) -> anyhow::Result<VerifierOutcome>;

    fn name(&self) -> &str {
        "verifier"
    }
}

/// Always verifies with full confidence
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultVerifier;

#[async_trait]
impl CheckpointVerifier for DefaultVerifier {
    async fn verify(
        &self,
        _checkpoint: &CheckpointDefinition,
        _context: &ActionContext,
    ) -> anyhow::Result<VerifierOutcome> {
        Ok(VerifierOutcome::passed(1.0))
    }

    fn name(&self) -> &str {
        "default"
    }
}

pub fn create_default_verifier() -> Arc<dyn CheckpointVerifier> {
    Arc::new(DefaultVerifier)
}

/// Adapts a synchronous closure into a verifier
pub struct FnVerifier<F> {
    name: String,
    f: F,
}

impl<F> FnVerifier<F>
where
    F: Fn(&CheckpointDefinition, &ActionContext) -> anyhow::Result<VerifierOutcome> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> CheckpointVerifier for FnVerifier<F>
where
    F: Fn(&CheckpointDefinition, &ActionContext) -> anyhow::Result<VerifierOutcome> + Send + Sync,
{
    async fn verify(
        &self,
        checkpoint: &CheckpointDefinition,
        context: &ActionContext,
    ) -> anyhow::Result<VerifierOutcome> {
        (self.f)(checkpoint, context)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of one verifier within a verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndividualVerification {
    pub verifier_id: VerifierId,
    pub verifier_name: String,
    pub verified: bool,
    pub confidence: f64,
    pub error: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// Aggregated outcome of verifying a checkpoint once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub id: Uuid,
    pub checkpoint_id: CheckpointId,
    pub checkpoint_name: String,
    pub execution_id: Uuid,
    pub verified: bool,
    pub confidence: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
    pub results: Vec<IndividualVerification>,
}

pub struct CheckpointManager {
    definitions: DashMap<CheckpointId, CheckpointDefinition>,
    by_name: DashMap<String, CheckpointId>,
    verifiers: DashMap<CheckpointId, Vec<(VerifierId, Arc<dyn CheckpointVerifier>)>>,
    history: BoundedHistory<VerificationResult>,
    events: EventBus,
}

impl CheckpointManager {
    pub fn new(history_size: usize, events: EventBus) -> Self {
        Self {
            definitions: DashMap::new(),
            by_name: DashMap::new(),
            verifiers: DashMap::new(),
            history: BoundedHistory::new(history_size),
            events,
        }
    }

    /// Register a definition; a later registration with the same name wins
    /// name lookups
    pub fn register_checkpoint(&self, definition: CheckpointDefinition) -> CheckpointId {
        let id = definition.id;
        debug!(checkpoint = %definition.name, checkpoint_id = %id, "Registered checkpoint");
        self.by_name.insert(definition.name.clone(), id);
        self.definitions.insert(id, definition);
        id
    }

    pub fn get_checkpoint(&self, id: CheckpointId) -> Option<CheckpointDefinition> {
        self.definitions.get(&id).map(|d| d.clone())
    }

    pub fn find_by_name(&self, name: &str) -> Option<CheckpointDefinition> {
        let id = *self.by_name.get(name)?;
        self.get_checkpoint(id)
    }

    pub fn register_verifier(
        &self,
        checkpoint_id: CheckpointId,
        verifier: Arc<dyn CheckpointVerifier>,
    ) -> Result<VerifierId, CheckpointError> {
        if !self.definitions.contains_key(&checkpoint_id) {
            return Err(CheckpointError::UnknownCheckpoint(checkpoint_id));
        }
        let verifier_id = Uuid::new_v4();
        debug!(
            checkpoint_id = %checkpoint_id,
            verifier = verifier.name(),
            "Registered checkpoint verifier"
        );
        self.verifiers
            .entry(checkpoint_id)
            .or_default()
            .push((verifier_id, verifier));
        Ok(verifier_id)
    }

    pub fn verifier_count(&self, checkpoint_id: CheckpointId) -> usize {
        self.verifiers.get(&checkpoint_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Look up a strategy checkpoint by name, registering it with the default
    /// verifier when it is unknown
    pub fn ensure_registered(&self, checkpoint: &Checkpoint) -> CheckpointId {
        if let Some(existing) = self.find_by_name(&checkpoint.name) {
            return existing.id;
        }
        let id = self.register_checkpoint(CheckpointDefinition::from(checkpoint));
        // Cannot fail: the definition was inserted above
        let _ = self.register_verifier(id, create_default_verifier());
        id
    }

    /// Run every verifier of a checkpoint in registration order
    pub async fn verify_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        context: &ActionContext,
    ) -> Result<VerificationResult, CheckpointError> {
        let definition = self
            .get_checkpoint(checkpoint_id)
            .ok_or(CheckpointError::UnknownCheckpoint(checkpoint_id))?;
        let verifiers: Vec<(VerifierId, Arc<dyn CheckpointVerifier>)> = self
            .verifiers
            .get(&checkpoint_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        if verifiers.is_empty() {
            return Err(CheckpointError::NoVerifiers(definition.name.clone()));
        }

        self.events.publish(ExecutionEvent::CheckpointProcessing {
            execution_id: context.execution_id,
            checkpoint: definition.name.clone(),
        });

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut results = Vec::with_capacity(verifiers.len());
        for (verifier_id, verifier) in verifiers {
            let individual = match verifier.verify(&definition, context).await {
                Ok(outcome) => IndividualVerification {
                    verifier_id,
                    verifier_name: verifier.name().to_string(),
                    verified: outcome.verified,
                    confidence: outcome.confidence.clamp(0.0, 1.0),
                    error: None,
                    details: outcome.details,
                },
                Err(e) => {
                    warn!(
                        checkpoint = %definition.name,
                        verifier = verifier.name(),
                        "Checkpoint verifier error: {}",
                        e
                    );
                    IndividualVerification {
                        verifier_id,
                        verifier_name: verifier.name().to_string(),
                        verified: false,
                        confidence: 0.0,
                        error: Some(e.to_string()),
                        details: None,
                    }
                }
            };
            results.push(individual);
        }

        let verified = results.iter().all(|r| r.verified);
        let confidence = results.iter().map(|r| r.confidence).sum::<f64>() / results.len() as f64;
        let result = VerificationResult {
            id: Uuid::new_v4(),
            checkpoint_id,
            checkpoint_name: definition.name.clone(),
            execution_id: context.execution_id,
            verified,
            confidence,
            started_at,
            completed_at: Utc::now(),
            duration: clock.elapsed(),
            results,
        };
        self.history.push(result.clone());

        if verified {
            info!(
                execution_id = %context.execution_id,
                checkpoint = %definition.name,
                confidence,
                "Checkpoint verified"
            );
            self.events.publish(ExecutionEvent::CheckpointReached {
                execution_id: context.execution_id,
                checkpoint: definition.name,
                verification_id: result.id,
                confidence,
            });
        } else {
            warn!(
                execution_id = %context.execution_id,
                checkpoint = %definition.name,
                confidence,
                "Checkpoint verification failed"
            );
            self.events.publish(ExecutionEvent::CheckpointFailed {
                execution_id: context.execution_id,
                checkpoint: definition.name,
                verification_id: result.id,
                confidence,
            });
        }
        Ok(result)
    }

    pub fn get_verification(&self, verification_id: Uuid) -> Option<VerificationResult> {
        self.history.find(|r| r.id == verification_id)
    }

    /// Oldest first
    pub fn verification_history(&self) -> Vec<VerificationResult> {
        self.history.snapshot()
    }
}
