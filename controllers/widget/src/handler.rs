//! Widget operation handler.
//!
//! Logs every lifecycle event and, on each reconciliation tick, lists the
//! widgets in the watched namespace and reports how far each one is from
//! its desired state.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crds::Widget;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use kube_controller::{Cancelled, OperationHandler, ResourceDescriptor};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handles widget events. One instance serves exactly one call.
pub struct WidgetOperationHandler {
    api: Api<Widget>,
    descriptor: Arc<ResourceDescriptor>,
}

impl WidgetOperationHandler {
    pub fn new(api: Api<Widget>, descriptor: Arc<ResourceDescriptor>) -> Self {
        Self { api, descriptor }
    }
}

#[async_trait]
impl OperationHandler<Widget> for WidgetOperationHandler {
    async fn on_added(&self, widget: &Widget, _cancel: &CancellationToken) -> anyhow::Result<()> {
        info!("Widget added: {}", summarize(widget, &self.descriptor, Utc::now()));
        Ok(())
    }

    async fn on_updated(&self, widget: &Widget, _cancel: &CancellationToken) -> anyhow::Result<()> {
        info!("Widget updated: {}", summarize(widget, &self.descriptor, Utc::now()));
        Ok(())
    }

    async fn on_deleted(&self, widget: &Widget, _cancel: &CancellationToken) -> anyhow::Result<()> {
        info!("Widget deleted: {}", widget.name_any());
        Ok(())
    }

    async fn on_bookmarked(&self, widget: &Widget, _cancel: &CancellationToken) -> anyhow::Result<()> {
        debug!(
            "Widgets delivered up to resource version {}",
            widget.resource_version().unwrap_or_default()
        );
        Ok(())
    }

    async fn on_error(&self, widget: &Widget, _cancel: &CancellationToken) -> anyhow::Result<()> {
        warn!(
            "Widget watch reported an error (resource version {})",
            widget.resource_version().unwrap_or_else(|| "unknown".to_string())
        );
        Ok(())
    }

    async fn check_current_state(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let params = ListParams::default();
        let widgets = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Cancelled.into()),
            listed = self.api.list(&params) => listed.context("Failed to list widgets")?,
        };

        let now = Utc::now();
        let pending = widgets.items.iter().filter(|widget| !is_ready(widget)).count();
        info!(
            "Reconciling {} widget(s) in {}, {} not ready",
            widgets.items.len(),
            self.descriptor.namespace(),
            pending
        );
        for widget in &widgets.items {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            debug!("  {}", summarize(widget, &self.descriptor, now));
        }
        Ok(())
    }
}

fn is_ready(widget: &Widget) -> bool {
    widget.status.as_ref().is_some_and(|status| status.ready)
}

/// One-line description of a widget for the logs.
fn summarize(widget: &Widget, descriptor: &ResourceDescriptor, now: DateTime<Utc>) -> String {
    let mut line = format!(
        "{}/{} replicas={}",
        widget.namespace().unwrap_or_default(),
        widget.name_any(),
        widget.spec.replicas.map_or_else(|| "-".to_string(), |n| n.to_string())
    );

    match &widget.status {
        Some(status) => {
            line.push_str(if status.ready { " ready" } else { " not-ready" });
            if let Some(observed) = status.observed_replicas {
                line.push_str(&format!(" observed={observed}"));
            }
            if let Some(last) = status.last_reconciled {
                line.push_str(&format!(" reconciled {}s ago", (now - last).num_seconds()));
            }
        }
        None => line.push_str(" pending"),
    }

    if let Some(annotation) = descriptor.status_of(widget) {
        line.push_str(&format!(" status={annotation}"));
    }
    line
}
