//! Dependency resolver
//!
//! A unit is dispatchable only when every prerequisite is complete. Any
//! count other than zero, including a nonsensical negative one, keeps the
//! unit waiting.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::debug;

use super::queue::WorkUnit;
use super::store::DependencyIndex;

pub struct DependencyResolver {
    index: Arc<dyn DependencyIndex>,
}

impl DependencyResolver {
    pub fn new(index: Arc<dyn DependencyIndex>) -> Self {
        Self { index }
    }

    pub async fn is_satisfied(&self, unit: &WorkUnit) -> Result<bool> {
        let tenant = unit.tenant();
        let envelope = &unit.envelope;

        for dependence in &envelope.depend_on {
            if dependence.targets(&envelope.model_name, &envelope.object_id) {
                continue;
            }
            let open = self
                .index
                .count_open(tenant, dependence)
                .await
                .with_context(|| format!("Failed to count open units for {}", dependence))?;
            if open != 0 {
                debug!(
                    tenant_id = %tenant,
                    resource_id = %envelope.resource_id,
                    dependence = %dependence,
                    open,
                    "Waiting on dependence"
                );
                return Ok(false);
            }
        }

        let earlier = self
            .index
            .count_open_before(
                tenant,
                &envelope.model_name,
                &envelope.object_id,
                &envelope.resource_id,
            )
            .await
            .context("Failed to count earlier versions")?;
        if earlier != 0 {
            debug!(
                tenant_id = %tenant,
                resource_id = %envelope.resource_id,
                model_name = %envelope.model_name,
                object_id = %envelope.object_id,
                earlier,
                "Waiting on earlier version of the same object"
            );
            return Ok(false);
        }

        if let Some(event_id) = unit.event_trigger_id {
            if !unit.model_depend_on.is_empty() {
                let unfinished = self
                    .index
                    .count_unfinished_models(tenant, event_id, &unit.model_depend_on)
                    .await
                    .context("Failed to count unfinished prerequisite models")?;
                if unfinished != 0 {
                    debug!(
                        tenant_id = %tenant,
                        resource_id = %envelope.resource_id,
                        model_name = %envelope.model_name,
                        unfinished,
                        "Waiting on prerequisite models"
                    );
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}
