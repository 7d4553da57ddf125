// ABOUTME: Built-in executor that returns its resolved input as output
// ABOUTME: Lets workflows be dry-run end to end without external services

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::{Result, StepExecutor, StepInvocation};

pub struct EchoExecutor;

#[async_trait]
impl StepExecutor for EchoExecutor {
    async fn execute(&self, invocation: StepInvocation) -> Result<Map<String, Value>> {
        debug!(
            "Echoing {} input keys for step {}",
            invocation.input.len(),
            invocation.step_id
        );
        Ok(invocation.input)
    }
}
