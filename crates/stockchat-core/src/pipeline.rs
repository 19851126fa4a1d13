use serde_json::json;
use stockchat_agent::Agent;
use stockchat_db::{
    QueryExecutionError, QueryValidationError, ValidatedQuerySet, execute_queries, is_empty_result,
    verify_and_extract_sql_query,
};
use stockchat_providers::ProviderError;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::tracker::now_epoch_secs;

/// Question/answer pairs each agent keeps per session after rotation.
pub const MAX_HISTORY_QUESTIONS: usize = 3;

const FALLBACK_QUERY_PLACEHOLDER: &str = "No query generated";
const INTERNAL_ERROR_MESSAGE: &str = "Internal server error. Please retry later.";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] QueryValidationError),
    #[error(transparent)]
    Execution(#[from] QueryExecutionError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("SQL agent is missing its database engine")]
    MissingEngine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Error,
}

impl ResponseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// The only two shapes a pipeline run can produce. A handled fallback is
/// still a success; `Error` means the fallback call itself failed.
#[derive(Debug, Clone)]
pub struct PredictOutcome {
    pub status: ResponseStatus,
    pub response: String,
}

struct StageFailure {
    error: PipelineError,
    /// Present when validation had already produced a query set, so the
    /// fallback can show the user what was attempted.
    queries: Option<ValidatedQuerySet>,
}

/// Run one question through the full pipeline. Blocks on the provider and
/// the engine; callers on an async runtime must offload this to a worker
/// thread.
pub fn handle_question(ctx: &AppContext, session_id: i64, question: &str) -> PredictOutcome {
    let request_id = Uuid::new_v4();
    // Recorded before any fallible work so a session whose request dies
    // mid-pipeline is still tracked for eventual cleanup.
    ctx.activity().touch(session_id, now_epoch_secs());

    let sql_agent = ctx.sql_agent();
    let nlp_agent = ctx.nlp_agent();
    let max_rows = ctx.config().limits.max_result_rows;

    match answer_question(&sql_agent, &nlp_agent, session_id, question, max_rows) {
        Ok(response) => {
            sql_agent
                .memory()
                .rotate_history(session_id, MAX_HISTORY_QUESTIONS);
            nlp_agent
                .memory()
                .rotate_history(session_id, MAX_HISTORY_QUESTIONS);
            info!("request {request_id}: answered session {session_id}");
            PredictOutcome {
                status: ResponseStatus::Success,
                response,
            }
        }
        Err(failure) => run_fallback(
            &nlp_agent,
            session_id,
            question,
            max_rows,
            failure,
            request_id,
        ),
    }
}

fn answer_question(
    sql_agent: &Agent,
    nlp_agent: &Agent,
    session_id: i64,
    question: &str,
    max_rows: u32,
) -> Result<String, StageFailure> {
    let before_queries = |error: PipelineError| StageFailure {
        error,
        queries: None,
    };

    let sql_reply = sql_agent
        .get_response_with_memory(session_id, question, None)
        .map_err(|err| before_queries(err.into()))?;

    let queries = verify_and_extract_sql_query(&sql_reply.content, max_rows)
        .map_err(|err| before_queries(err.into()))?;

    let engine = sql_agent
        .engine()
        .ok_or_else(|| before_queries(PipelineError::MissingEngine))?;

    let data = execute_queries(engine, &queries).map_err(|err| StageFailure {
        error: err.into(),
        queries: Some(queries.clone()),
    })?;

    let data_text = if is_empty_result(&data) {
        // Sentinel payload: the summarizing agent never has to tell empty
        // from absent on its own.
        json!({ "result": "no matching item" }).to_string()
    } else {
        serde_json::to_string(&data).unwrap_or_else(|err| format!("unserializable result: {err}"))
    };

    let reply = nlp_agent
        .get_response_with_memory(
            session_id,
            question,
            Some(&[
                ("query", queries.joined()),
                ("data", data_text),
                ("result_limit", max_rows.to_string()),
            ]),
        )
        .map_err(|err| StageFailure {
            error: err.into(),
            queries: Some(queries.clone()),
        })?;

    Ok(reply.content)
}

/// Degrade a stage failure into a second model call that explains it. Only
/// a failure of this call surfaces as a transport-level error.
fn run_fallback(
    nlp_agent: &Agent,
    session_id: i64,
    question: &str,
    max_rows: u32,
    failure: StageFailure,
    request_id: Uuid,
) -> PredictOutcome {
    let StageFailure { error, queries } = failure;
    let query_repr = match &queries {
        Some(set) => set.joined(),
        None => FALLBACK_QUERY_PLACEHOLDER.to_string(),
    };
    if queries.is_some() {
        warn!(
            "request {request_id}: session {session_id} fell back after query validation: {error}"
        );
    } else {
        warn!(
            "request {request_id}: session {session_id} fell back before any query was validated: {error}"
        );
    }

    match nlp_agent.get_response_with_memory(
        session_id,
        question,
        Some(&[
            ("query", query_repr),
            ("data", error.to_string()),
            ("result_limit", max_rows.to_string()),
        ]),
    ) {
        Ok(reply) => PredictOutcome {
            status: ResponseStatus::Success,
            response: reply.content,
        },
        Err(nlp_error) => {
            error!(
                "request {request_id}: fallback call failed for session {session_id}: {nlp_error}"
            );
            PredictOutcome {
                status: ResponseStatus::Error,
                response: INTERNAL_ERROR_MESSAGE.to_string(),
            }
        }
    }
}
