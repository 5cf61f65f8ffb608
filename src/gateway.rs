//! The Gateway: owns the request lifecycle and the approval state machine.
//!
//! `run_tool`, `run_approved`, and `deny_approval` are the only entry
//! points. Each is a single logical task; the only shared mutable state is
//! the [`crate::audit::AuditStore`] and the `Approval` row it guards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{ApprovalStatus, AuditStore, RunStatus};
use crate::error::{ErrorCode, Result, StandardCode};
use crate::policy::{Decision, PolicyConfig, PolicyEngine};
use crate::registry::ToolRegistry;

/// Ambient call context: at minimum `profile_id` / `session_id`, both
/// defaulting to `"unknown"` when absent (matches the original's
/// `context.get("profile_id", "unknown")`), plus whatever else a caller
/// wants a handler to see (e.g. `channel`).
pub type Context = HashMap<String, Value>;

fn context_str(context: &Context, key: &str) -> String {
    context
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
    Timeout,
    ApprovalRequired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
}

/// `{ status, tool_name, tool_version, request_id, data, error?, meta }`
/// (spec §4.3.4) — the envelope every gateway entry point returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: Status,
    pub tool_name: String,
    pub tool_version: String,
    pub request_id: String,
    pub data: Value,
    pub error: Option<ResultError>,
    pub meta: Value,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, Status::Ok | Status::ApprovalRequired)
    }
}

const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Single choke point for running tools safely: discover, validate input,
/// evaluate policy, execute under a soft latency budget, validate output,
/// and record the whole lifecycle in the audit store.
pub struct Gateway {
    registry: Arc<ToolRegistry>,
    policy_config: PolicyConfig,
    store: Arc<dyn AuditStore>,
    default_timeout_ms: u64,
}

impl Gateway {
    pub fn new(registry: Arc<ToolRegistry>, policy_config: PolicyConfig, store: Arc<dyn AuditStore>) -> Self {
        Self {
            registry,
            policy_config,
            store,
            default_timeout_ms: 10_000,
        }
    }

    pub fn with_default_timeout_ms(mut self, default_timeout_ms: u64) -> Self {
        self.default_timeout_ms = default_timeout_ms;
        self
    }

    fn err_envelope(
        &self,
        tool_name: &str,
        request_id: &str,
        code: ErrorCode,
        message: impl Into<String>,
        details: Value,
        latency_ms: i64,
        status: Status,
    ) -> ToolResult {
        ToolResult {
            status,
            tool_name: tool_name.to_string(),
            tool_version: TOOL_VERSION.to_string(),
            request_id: request_id.to_string(),
            data: Value::Object(Default::default()),
            error: Some(ResultError {
                code,
                message: message.into(),
                details,
            }),
            meta: serde_json::json!({ "latency_ms": latency_ms, "source": "gateway" }),
        }
    }

    async fn finalize_and_log(
        &self,
        tool_run_id: &str,
        profile_id: &str,
        session_id: &str,
        status: RunStatus,
        output: Value,
        error: Value,
        latency_ms: i64,
        event_type: &str,
        event_payload: Value,
    ) {
        if let Err(e) = self
            .store
            .finalize_tool_run(tool_run_id, status, output, error, latency_ms)
            .await
        {
            error!(tool_run_id, error = %e, "failed to finalize tool_run; row may remain in started state");
        }
        if let Err(e) = self.store.log_event(event_type, profile_id, session_id, event_payload).await {
            error!(tool_run_id, event_type, error = %e, "failed to log audit event");
        }
    }

    /// spec §4.3.1.
    pub async fn run_tool(
        &self,
        tool_name: &str,
        input: Value,
        context: &Context,
        timeout_ms: Option<u64>,
        validate_output: bool,
    ) -> Result<ToolResult> {
        let request_id = Uuid::new_v4().to_string();
        let t0 = Instant::now();
        let timeout_ms = timeout_ms.unwrap_or(self.default_timeout_ms);
        let profile_id = context_str(context, "profile_id");
        let session_id = context_str(context, "session_id");

        // Step 2: these writes MUST succeed before the call can fail externally.
        self.store
            .log_event(
                "tool_called",
                &profile_id,
                &session_id,
                serde_json::json!({ "tool_name": tool_name, "request_id": request_id }),
            )
            .await?;
        let run = self
            .store
            .create_tool_run(&request_id, &profile_id, &session_id, tool_name, input.clone())
            .await?;

        // Step 3: resolve tool.
        let tool = match self.registry.get(tool_name) {
            Ok(tool) => tool,
            Err(e) => {
                let res = self.err_envelope(
                    tool_name,
                    &request_id,
                    ErrorCode::Standard(StandardCode::NotFound),
                    format!("Unknown tool '{tool_name}'"),
                    serde_json::json!({ "error": e.to_string() }),
                    elapsed_ms(t0),
                    Status::Error,
                );
                self.finalize_and_log(
                    &run.tool_run_id,
                    &profile_id,
                    &session_id,
                    RunStatus::Error,
                    res.data.clone(),
                    result_error_json(&res),
                    elapsed_ms(t0),
                    "tool_failed",
                    serde_json::json!({ "tool_name": tool_name, "request_id": request_id }),
                )
                .await;
                return Ok(res);
            }
        };

        // Step 4: input validation.
        if let Err(e) = crate::schema::validate(&tool.spec.input_schema, &input, tool_name) {
            let res = self.err_envelope(
                tool_name,
                &request_id,
                e.code(),
                "Input validation failed",
                e.details(),
                elapsed_ms(t0),
                Status::Error,
            );
            self.finalize_and_log(
                &run.tool_run_id,
                &profile_id,
                &session_id,
                RunStatus::Error,
                res.data.clone(),
                result_error_json(&res),
                elapsed_ms(t0),
                "tool_failed",
                serde_json::json!({ "tool_name": tool_name, "request_id": request_id }),
            )
            .await;
            return Ok(res);
        }

        // Step 5: policy.
        let decision = PolicyEngine::evaluate(&tool.spec, &input, context, &self.policy_config);
        match decision.decision {
            Decision::Deny => {
                let res = self.err_envelope(
                    tool_name,
                    &request_id,
                    ErrorCode::Standard(StandardCode::PolicyViolation),
                    decision.reason.clone().unwrap_or_else(|| "Policy denied tool execution".to_string()),
                    decision.details.clone(),
                    elapsed_ms(t0),
                    Status::Error,
                );
                self.finalize_and_log(
                    &run.tool_run_id,
                    &profile_id,
                    &session_id,
                    RunStatus::Error,
                    res.data.clone(),
                    result_error_json(&res),
                    elapsed_ms(t0),
                    "policy_violation",
                    serde_json::json!({ "tool_name": tool_name, "request_id": request_id, "details": decision.details }),
                )
                .await;
                return Ok(res);
            }
            Decision::RequireApproval => {
                let approval_payload = serde_json::json!({
                    "tool_name": tool_name,
                    "mode": tool.spec.mode,
                    "reason": decision.reason.clone().unwrap_or_else(|| "Approval required".to_string()),
                    "proposed_input": decision.sanitized_input,
                });
                let approval = self
                    .store
                    .create_approval(&run.tool_run_id, &profile_id, approval_payload.clone())
                    .await?;

                let data = serde_json::json!({
                    "approval_request": approval_payload,
                    "approval_id": approval.approval_id,
                });
                let res = ToolResult {
                    status: Status::ApprovalRequired,
                    tool_name: tool_name.to_string(),
                    tool_version: TOOL_VERSION.to_string(),
                    request_id: request_id.clone(),
                    data,
                    error: None,
                    meta: serde_json::json!({
                        "latency_ms": elapsed_ms(t0),
                        "timeout_ms": timeout_ms,
                        "source": "gateway",
                    }),
                };
                self.finalize_and_log(
                    &run.tool_run_id,
                    &profile_id,
                    &session_id,
                    RunStatus::ApprovalRequired,
                    res.data.clone(),
                    Value::Null,
                    elapsed_ms(t0),
                    "approval_requested",
                    serde_json::json!({ "tool_name": tool_name, "request_id": request_id, "approval_id": approval.approval_id }),
                )
                .await;
                return Ok(res);
            }
            Decision::Allow => {}
        }

        // Steps 6-9.
        let res = self
            .execute_and_finalize(
                &run.tool_run_id,
                tool_name,
                tool,
                decision.sanitized_input,
                context,
                &request_id,
                &profile_id,
                &session_id,
                t0,
                timeout_ms,
                validate_output,
                None,
            )
            .await;
        Ok(res)
    }

    /// Shared tail of `run_tool` and `run_approved`: execute (6), soft
    /// timeout check (7), output validation (8), finalize (9).
    #[allow(clippy::too_many_arguments)]
    async fn execute_and_finalize(
        &self,
        tool_run_id: &str,
        tool_name: &str,
        tool: &crate::registry::Tool,
        sanitized_input: Value,
        context: &Context,
        request_id: &str,
        profile_id: &str,
        session_id: &str,
        t0: Instant,
        timeout_ms: u64,
        validate_output: bool,
        approval_id: Option<&str>,
    ) -> ToolResult {
        let event_payload = |error: Option<&ResultError>| {
            let mut payload = serde_json::json!({ "tool_name": tool_name, "request_id": request_id });
            if let Some(id) = approval_id {
                payload["approval_id"] = Value::String(id.to_string());
            }
            if let Some(err) = error {
                payload["error"] = serde_json::to_value(err).unwrap_or(Value::Null);
            }
            payload
        };

        let output = match tool.handler.call(sanitized_input, context).await {
            Ok(output) => output,
            Err(tool_err) => {
                let code = ErrorCode::Tool(tool_err.code.clone());
                let res = self.err_envelope(
                    tool_name,
                    request_id,
                    code,
                    tool_err.message.clone(),
                    tool_err.details.clone(),
                    elapsed_ms(t0),
                    Status::Error,
                );
                self.finalize_and_log(
                    tool_run_id,
                    profile_id,
                    session_id,
                    RunStatus::Error,
                    res.data.clone(),
                    result_error_json(&res),
                    elapsed_ms(t0),
                    "tool_failed",
                    event_payload(res.error.as_ref()),
                )
                .await;
                return res;
            }
        };

        let elapsed = elapsed_ms(t0);
        if elapsed as u64 > timeout_ms {
            warn!(tool_name, elapsed, timeout_ms, "tool exceeded soft timeout");
            let res = self.err_envelope(
                tool_name,
                request_id,
                ErrorCode::Standard(StandardCode::Timeout),
                format!("Tool exceeded timeout ({timeout_ms}ms)"),
                serde_json::json!({ "elapsed_ms": elapsed, "timeout_ms": timeout_ms }),
                elapsed,
                Status::Timeout,
            );
            self.finalize_and_log(
                tool_run_id,
                profile_id,
                session_id,
                RunStatus::Timeout,
                res.data.clone(),
                result_error_json(&res),
                elapsed,
                "tool_failed",
                event_payload(res.error.as_ref()),
            )
            .await;
            return res;
        }

        if validate_output {
            if let Some(output_schema) = &tool.spec.output_schema {
                if let Err(e) = crate::schema::validate(output_schema, &output, tool_name) {
                    let res = self.err_envelope(
                        tool_name,
                        request_id,
                        e.code(),
                        "Output validation failed",
                        e.details(),
                        elapsed,
                        Status::Error,
                    );
                    self.finalize_and_log(
                        tool_run_id,
                        profile_id,
                        session_id,
                        RunStatus::Error,
                        res.data.clone(),
                        result_error_json(&res),
                        elapsed,
                        "tool_failed",
                        event_payload(res.error.as_ref()),
                    )
                    .await;
                    return res;
                }
            }
        }

        let res = ToolResult {
            status: Status::Ok,
            tool_name: tool_name.to_string(),
            tool_version: TOOL_VERSION.to_string(),
            request_id: request_id.to_string(),
            data: output,
            error: None,
            meta: serde_json::json!({ "latency_ms": elapsed, "timeout_ms": timeout_ms, "source": "gateway" }),
        };
        self.finalize_and_log(
            tool_run_id,
            profile_id,
            session_id,
            RunStatus::Ok,
            res.data.clone(),
            Value::Null,
            elapsed,
            "tool_succeeded",
            event_payload(None),
        )
        .await;
        info!(tool_name, request_id, "tool run ok");
        res
    }

    /// spec §4.3.2: state-machine gate plus re-validation against the
    /// stored `ToolRun`.
    pub async fn run_approved(
        &self,
        approval_id: &str,
        context: &Context,
        timeout_ms: Option<u64>,
        validate_output: bool,
    ) -> Result<ToolResult> {
        let request_id = Uuid::new_v4().to_string();
        let t0 = Instant::now();
        let timeout_ms = timeout_ms.unwrap_or(self.default_timeout_ms);
        let profile_id = context_str(context, "profile_id");
        let session_id = context_str(context, "session_id");

        let approval = match self.store.get_approval(approval_id).await? {
            Some(a) => a,
            None => {
                return Ok(self.err_envelope(
                    "approval.resolve",
                    &request_id,
                    ErrorCode::Standard(StandardCode::NotFound),
                    "Approval not found",
                    serde_json::json!({ "approval_id": approval_id }),
                    elapsed_ms(t0),
                    Status::Error,
                ));
            }
        };

        if approval.status != ApprovalStatus::Pending {
            return Ok(self.err_envelope(
                "approval.resolve",
                &request_id,
                ErrorCode::Standard(StandardCode::PolicyViolation),
                "Approval is not pending",
                serde_json::json!({ "approval_id": approval_id, "status": approval.status }),
                elapsed_ms(t0),
                Status::Error,
            ));
        }

        let run = match self.store.get_tool_run(&approval.tool_run_id).await? {
            Some(r) => r,
            None => {
                return Ok(self.err_envelope(
                    "approval.resolve",
                    &request_id,
                    ErrorCode::Standard(StandardCode::NotFound),
                    "Tool run for approval not found",
                    serde_json::json!({ "approval_id": approval_id, "tool_run_id": approval.tool_run_id }),
                    elapsed_ms(t0),
                    Status::Error,
                ));
            }
        };

        let tool_name = approval
            .approval_context_json
            .get("tool_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let proposed_input = approval
            .approval_context_json
            .get("proposed_input")
            .cloned()
            .unwrap_or(Value::Null);

        let Some(tool_name) = tool_name else {
            return Ok(self.err_envelope(
                "approval.resolve",
                &request_id,
                ErrorCode::Standard(StandardCode::InternalError),
                "Malformed approval context (missing tool_name)",
                serde_json::json!({ "approval_id": approval_id }),
                elapsed_ms(t0),
                Status::Error,
            ));
        };

        // Linearization point: loses the race -> caller already handled above.
        let won = self.store.resolve_approval(approval_id, ApprovalStatus::Approved).await?;
        if !won {
            return Ok(self.err_envelope(
                "approval.resolve",
                &request_id,
                ErrorCode::Standard(StandardCode::PolicyViolation),
                "Approval is not pending",
                serde_json::json!({ "approval_id": approval_id, "status": "approved" }),
                elapsed_ms(t0),
                Status::Error,
            ));
        }
        self.store
            .log_event(
                "approval_granted",
                &profile_id,
                &session_id,
                serde_json::json!({ "approval_id": approval_id, "tool_name": tool_name }),
            )
            .await?;

        // Re-validate: tool lookup, input validation, policy (deny still denies).
        let tool = match self.registry.get(&tool_name) {
            Ok(tool) => tool,
            Err(e) => {
                let res = self.err_envelope(
                    &tool_name,
                    &request_id,
                    ErrorCode::Standard(StandardCode::NotFound),
                    format!("Unknown tool '{tool_name}'"),
                    serde_json::json!({ "error": e.to_string() }),
                    elapsed_ms(t0),
                    Status::Error,
                );
                self.finalize_and_log(
                    &run.tool_run_id,
                    &profile_id,
                    &session_id,
                    RunStatus::Error,
                    res.data.clone(),
                    result_error_json(&res),
                    elapsed_ms(t0),
                    "tool_failed",
                    serde_json::json!({ "tool_name": tool_name, "approval_id": approval_id }),
                )
                .await;
                return Ok(res);
            }
        };

        if let Err(e) = crate::schema::validate(&tool.spec.input_schema, &proposed_input, &tool_name) {
            let res = self.err_envelope(
                &tool_name,
                &request_id,
                e.code(),
                "Input validation failed (approved run)",
                e.details(),
                elapsed_ms(t0),
                Status::Error,
            );
            self.finalize_and_log(
                &run.tool_run_id,
                &profile_id,
                &session_id,
                RunStatus::Error,
                res.data.clone(),
                result_error_json(&res),
                elapsed_ms(t0),
                "tool_failed",
                serde_json::json!({ "tool_name": tool_name, "approval_id": approval_id }),
            )
            .await;
            return Ok(res);
        }

        let decision = PolicyEngine::evaluate(&tool.spec, &proposed_input, context, &self.policy_config);
        if decision.decision == Decision::Deny {
            let res = self.err_envelope(
                &tool_name,
                &request_id,
                ErrorCode::Standard(StandardCode::PolicyViolation),
                decision.reason.clone().unwrap_or_else(|| "Policy denied approved execution".to_string()),
                decision.details.clone(),
                elapsed_ms(t0),
                Status::Error,
            );
            self.finalize_and_log(
                &run.tool_run_id,
                &profile_id,
                &session_id,
                RunStatus::Error,
                res.data.clone(),
                result_error_json(&res),
                elapsed_ms(t0),
                "policy_violation",
                serde_json::json!({ "tool_name": tool_name, "approval_id": approval_id, "details": decision.details }),
            )
            .await;
            return Ok(res);
        }

        let res = self
            .execute_and_finalize(
                &run.tool_run_id,
                &tool_name,
                tool,
                decision.sanitized_input,
                context,
                &request_id,
                &profile_id,
                &session_id,
                t0,
                timeout_ms,
                validate_output,
                Some(approval_id),
            )
            .await;
        Ok(res)
    }

    /// spec §4.3.3.
    pub async fn deny_approval(&self, approval_id: &str, context: &Context) -> Result<()> {
        let profile_id = context_str(context, "profile_id");
        let session_id = context_str(context, "session_id");

        if let Some(approval) = self.store.get_approval(approval_id).await? {
            if approval.status == ApprovalStatus::Pending {
                let won = self.store.resolve_approval(approval_id, ApprovalStatus::Denied).await?;
                if won {
                    self.store
                        .log_event(
                            "approval_denied",
                            &profile_id,
                            &session_id,
                            serde_json::json!({ "approval_id": approval_id }),
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    pub async fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
        limit: i64,
    ) -> Result<Vec<crate::audit::Approval>> {
        self.store.list_approvals(status, limit).await
    }
}

fn elapsed_ms(t0: Instant) -> i64 {
    t0.elapsed().as_millis() as i64
}

fn result_error_json(res: &ToolResult) -> Value {
    res.error
        .as_ref()
        .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
        .unwrap_or(Value::Null)
}
