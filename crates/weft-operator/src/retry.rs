use weft_resolver::TemplateScope;
use weft_workflow::{NodePhase, NodeStatus, NodeType, Template, format_duration};

use crate::context::{NodeRequest, Operation};
use crate::error::OperatorError;
use crate::substitute::{Params, substitute};

impl Operation<'_> {
  /// A retry node runs its template as attempts `name(0)`, `name(1)`, ...
  /// until one succeeds, the policy declines, or the limit is used up.
  pub(crate) async fn execute_retry(
    &mut self,
    req: &NodeRequest,
    node_id: &str,
    template: &Template,
    scope: &TemplateScope,
  ) -> Result<NodeStatus, OperatorError> {
    let strategy = template.retry_strategy.clone().unwrap_or_default();
    let retry = match self.node(node_id).cloned() {
      Some(node) => node,
      None => {
        let node = self.new_node(req, node_id, NodeType::Retry, NodePhase::Running);
        self.put_node(node)
      }
    };
    let limit = match strategy.limit() {
      Ok(limit) => limit,
      Err(e) => return Ok(self.finish(node_id, NodePhase::Failed, Some(&e.to_string()), None)),
    };

    let mut attempts = retry.children.len();
    let mut last = retry.children.last().and_then(|id| self.node(id)).cloned();
    if last.as_ref().is_some_and(|n| !n.fulfilled()) {
      let progressed = self.run_attempt(req, node_id, attempts - 1, template, scope).await?;
      if !progressed.fulfilled() {
        return Ok(self.node(node_id).cloned().unwrap_or(retry));
      }
      last = Some(progressed);
    }

    if let Some(last) = &last {
      if last.successful() {
        return Ok(self.finish(node_id, NodePhase::Succeeded, Some(""), last.outputs.clone()));
      }
      let within_limit = limit.is_none_or(|limit| attempts <= limit as usize);
      let may_retry =
        strategy.should_retry(last.phase) && within_limit && self.stop_reason(req.on_exit).is_none();
      if !may_retry {
        return Ok(self.finish(node_id, last.phase, Some(&last.message), last.outputs.clone()));
      }

      if let Some(backoff) = &strategy.backoff {
        let failed = u32::try_from(attempts).unwrap_or(u32::MAX);
        let delay = match backoff.delay(failed) {
          Ok(delay) => delay,
          Err(e) => return Ok(self.finish(node_id, NodePhase::Failed, Some(&e.to_string()), None)),
        };
        let ready_at = chrono::Duration::from_std(delay)
          .ok()
          .zip(last.finished_at)
          .and_then(|(delay, finished)| finished.checked_add_signed(delay));
        if let Some(ready_at) = ready_at
          && self.until(ready_at).is_some()
        {
          let message = format!("Backoff for {}", format_duration(delay));
          return Ok(self.finish(node_id, NodePhase::Running, Some(&message), None));
        }
      }
    }

    let attempt = self.run_attempt(req, node_id, attempts, template, scope).await?;
    attempts += 1;
    tracing::debug!(node = %req.node_name, attempts, attempt = %attempt.name, "retry_attempt_started");
    Ok(self.finish(node_id, NodePhase::Running, Some(""), None))
  }

  async fn run_attempt(
    &mut self,
    req: &NodeRequest,
    retry_id: &str,
    n: usize,
    template: &Template,
    scope: &TemplateScope,
  ) -> Result<NodeStatus, OperatorError> {
    let attempt_req = req.attempt(n);
    let attempt_id = self.wf.node_id(&attempt_req.node_name);
    let existing = self.node(&attempt_id).cloned();

    let mut params = Params::new();
    params.insert("retries".to_string(), n.to_string());
    let attempt_template = substitute(template, &params, &[])?;

    let node = self
      .dispatch(&attempt_req, &attempt_id, existing, &attempt_template, scope)
      .await?;
    self.add_child(retry_id, &node.id);
    Ok(node)
  }
}
