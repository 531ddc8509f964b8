use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sweep_observability::{redact_text, short_hash};
use sweep_types::WorkItem;

use crate::handler::{ActionHandler, ActionSpec, HandlerError, ItemOutcome, RunContext};
use crate::run_log::RunLogKind;

pub const BUILTIN_GROUP: &str = "builtin";
pub const SIGNER_KEY_SECRET: &str = "signer_key";

const ACTIONS: &[ActionSpec] = &[
    ActionSpec::isolated("probe"),
    ActionSpec::isolated("signed_probe"),
    ActionSpec::joint("fanout"),
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ProbeParams {
    fail_items: Vec<String>,
    skip_delay: bool,
    latency_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FanoutParams {
    source: Option<String>,
    per_item_delay_ms: u64,
    fail_items: Vec<String>,
}

/// Self-contained actions so the kernel can be driven end to end without
/// any external integration.
pub struct BuiltinHandler;

impl BuiltinHandler {
    async fn probe(&self, item: &WorkItem, ctx: &RunContext) -> Result<ItemOutcome, HandlerError> {
        let params: ProbeParams = ctx.params()?;
        if params.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(params.latency_ms)).await;
        }
        if params.fail_items.iter().any(|id| id == &item.id) {
            return Err(HandlerError::item(format!("probe rejected `{}`", item.id)));
        }
        Ok(ItemOutcome {
            skip_delay: params.skip_delay,
        })
    }

    async fn signed_probe(
        &self,
        item: &WorkItem,
        ctx: &RunContext,
    ) -> Result<ItemOutcome, HandlerError> {
        let key = ctx.secret(SIGNER_KEY_SECRET)?;
        let signature = short_hash(&format!("{key}:{}", item.id));
        tracing::debug!(
            item_id = %item.id,
            key = %redact_text(&key),
            "signed probe"
        );
        ctx.log(RunLogKind::Info, format!("{} signed {signature}", item.id))
            .await;
        self.probe(item, ctx).await
    }
}

#[async_trait]
impl ActionHandler for BuiltinHandler {
    fn group(&self) -> &str {
        BUILTIN_GROUP
    }

    fn actions(&self) -> &[ActionSpec] {
        ACTIONS
    }

    fn required_secrets(&self, action: &str) -> Vec<String> {
        match action {
            "signed_probe" => vec![SIGNER_KEY_SECRET.to_string()],
            _ => Vec::new(),
        }
    }

    async fn execute_isolated(
        &self,
        item: &WorkItem,
        ctx: &RunContext,
    ) -> Result<ItemOutcome, HandlerError> {
        match ctx.action() {
            "probe" => self.probe(item, ctx).await,
            "signed_probe" => self.signed_probe(item, ctx).await,
            other => Err(HandlerError::UnsupportedAction {
                group: BUILTIN_GROUP.to_string(),
                action: other.to_string(),
            }),
        }
    }

    async fn execute_joint(&self, items: &[WorkItem], ctx: &RunContext) -> Result<(), HandlerError> {
        if ctx.action() != "fanout" {
            return Err(HandlerError::UnsupportedAction {
                group: BUILTIN_GROUP.to_string(),
                action: ctx.action().to_string(),
            });
        }
        let params: FanoutParams = ctx.params()?;
        let source = params.source.as_deref().unwrap_or("inline");
        ctx.log(
            RunLogKind::Info,
            format!("fanout over {} items from {source}", items.len()),
        )
        .await;

        for (idx, item) in items.iter().enumerate() {
            if ctx.is_cancelled() {
                ctx.log(RunLogKind::Warning, format!("fanout stopped after {idx} items"))
                    .await;
                break;
            }
            if params.fail_items.iter().any(|id| id == &item.id) {
                ctx.record_fail(&item.id, "fanout rejected item").await?;
            } else {
                ctx.record_success(&item.id).await?;
            }
            if params.per_item_delay_ms > 0 && idx + 1 < items.len() {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(params.per_item_delay_ms)) => {}
                    _ = ctx.cancelled() => {}
                }
            }
        }
        Ok(())
    }
}
