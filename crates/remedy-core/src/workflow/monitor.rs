//! Dynamic monitor: polls success criteria and rollback triggers after the
//! steps have run.
//!
//! Sampling happens at the end of each check interval, for at most
//! `max(1, monitoring_duration / check_interval)` ticks. Within a tick the
//! rollback triggers are evaluated first; a firing trigger ends monitoring
//! even if every success criterion holds in the same sample.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use remedy_types::event::RemediationEvent;
use remedy_types::execution::{MonitoringOutcome, MonitoringReport, MonitoringSample};
use remedy_types::plan::RemediationPlan;
use tokio_util::sync::CancellationToken;

use super::context::WorkflowContext;
use super::probe::Probe;
use crate::event::EventBus;

pub struct DynamicMonitor<'a, P> {
    probe: &'a P,
    events: Option<&'a EventBus>,
}

impl<'a, P: Probe> DynamicMonitor<'a, P> {
    pub fn new(probe: &'a P) -> Self {
        Self {
            probe,
            events: None,
        }
    }

    pub fn with_events(mut self, events: &'a EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Observe the post-execution state for the plan's monitoring window.
    ///
    /// Criteria are the monitoring plan's success criteria (the primary
    /// action's when none are declared) plus its validation probes. With no
    /// criteria, surviving the window without a trigger counts as success.
    pub async fn observe(
        &self,
        plan: &RemediationPlan,
        ctx: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> MonitoringReport {
        let monitoring = &plan.monitoring;
        let criteria: Vec<&String> = if monitoring.success_criteria.is_empty() {
            plan.primary_action.success_criteria.iter().collect()
        } else {
            monitoring.success_criteria.iter().collect()
        };
        let criteria: Vec<&String> = criteria
            .into_iter()
            .chain(&monitoring.validation_probes)
            .collect();
        let triggers = &plan.rollback.triggers;

        if criteria.is_empty() && triggers.is_empty() {
            tracing::debug!(workflow_id = %ctx.workflow_id, "nothing to monitor");
            return MonitoringReport::skipped();
        }

        let interval_secs = monitoring.check_interval_secs.max(1);
        let interval = Duration::from_secs(interval_secs);
        let max_ticks = (monitoring.monitoring_duration_secs / interval_secs).max(1) as u32;

        tracing::info!(
            workflow_id = %ctx.workflow_id,
            criteria = criteria.len(),
            triggers = triggers.len(),
            max_ticks,
            interval_secs,
            "monitoring started"
        );

        let mut samples = Vec::new();
        let mut probe_errors = 0u32;

        for tick in 1..=max_ticks {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(workflow_id = %ctx.workflow_id, tick, "monitoring cancelled");
                    return self.finish(ctx, MonitoringOutcome::Cancelled, tick - 1, max_ticks, samples, probe_errors);
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let mut sample = MonitoringSample {
                tick,
                at: Utc::now(),
                criteria: HashMap::new(),
                triggers: HashMap::new(),
            };

            let mut fired = None;
            for trigger in triggers {
                let holds = self.sample(trigger, ctx, &mut probe_errors).await;
                sample.triggers.insert(trigger.clone(), holds);
                if holds {
                    fired = Some(trigger.clone());
                    break;
                }
            }

            if let Some(trigger) = fired {
                tracing::warn!(
                    workflow_id = %ctx.workflow_id,
                    tick,
                    trigger = trigger.as_str(),
                    "rollback trigger fired"
                );
                self.publish_tick(ctx, tick, false, true);
                samples.push(sample);
                return self.finish(
                    ctx,
                    MonitoringOutcome::RollbackTriggered { trigger },
                    tick,
                    max_ticks,
                    samples,
                    probe_errors,
                );
            }

            let mut all_met = true;
            for criterion in &criteria {
                let holds = self.sample(criterion, ctx, &mut probe_errors).await;
                sample.criteria.insert((*criterion).clone(), holds);
                all_met &= holds;
            }
            let succeeded = !criteria.is_empty() && all_met;

            tracing::debug!(workflow_id = %ctx.workflow_id, tick, criteria_met = succeeded, "monitoring tick");
            self.publish_tick(ctx, tick, succeeded, false);
            samples.push(sample);

            if succeeded {
                return self.finish(
                    ctx,
                    MonitoringOutcome::Succeeded,
                    tick,
                    max_ticks,
                    samples,
                    probe_errors,
                );
            }
        }

        let outcome = if criteria.is_empty() {
            MonitoringOutcome::Succeeded
        } else {
            let mut escalations = Vec::new();
            for rule in &monitoring.escalation_rules {
                let applies = match &rule.condition {
                    None => true,
                    Some(condition) => self.sample(condition, ctx, &mut probe_errors).await,
                };
                if applies {
                    escalations.push(rule.name.clone());
                }
            }
            MonitoringOutcome::Inconclusive { escalations }
        };
        self.finish(ctx, outcome, max_ticks, max_ticks, samples, probe_errors)
    }

    /// Sample one expression; probe errors count as "not satisfied".
    async fn sample(&self, expression: &str, ctx: &WorkflowContext, errors: &mut u32) -> bool {
        match self.probe.sample(expression, ctx).await {
            Ok(holds) => holds,
            Err(err) => {
                *errors += 1;
                tracing::warn!(
                    workflow_id = %ctx.workflow_id,
                    expression,
                    error = %err,
                    "probe failed, treating as unsatisfied"
                );
                false
            }
        }
    }

    fn publish_tick(&self, ctx: &WorkflowContext, tick: u32, criteria_met: bool, trigger_fired: bool) {
        if let Some(events) = self.events {
            events.publish(RemediationEvent::MonitoringTick {
                workflow_id: ctx.workflow_id,
                tick,
                criteria_met,
                trigger_fired,
            });
        }
    }

    fn finish(
        &self,
        ctx: &WorkflowContext,
        outcome: MonitoringOutcome,
        ticks: u32,
        max_ticks: u32,
        samples: Vec<MonitoringSample>,
        probe_errors: u32,
    ) -> MonitoringReport {
        tracing::info!(workflow_id = %ctx.workflow_id, ?outcome, ticks, probe_errors, "monitoring finished");
        if let Some(events) = self.events {
            events.publish(RemediationEvent::MonitoringFinished {
                workflow_id: ctx.workflow_id,
                outcome: outcome.clone(),
                ticks,
            });
        }
        MonitoringReport {
            outcome,
            ticks,
            max_ticks,
            samples,
            probe_errors,
        }
    }
}
