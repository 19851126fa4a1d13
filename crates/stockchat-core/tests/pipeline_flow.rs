use std::collections::VecDeque;
use std::sync::Mutex;

use stockchat_agent::Agent;
use stockchat_core::{
    AppContext, MAX_HISTORY_QUESTIONS, ResponseStatus, handle_question,
};
use stockchat_common::ServiceConfig;
use stockchat_db::create_engine;
use stockchat_providers::{ChatTurn, ModelClient, ModelResponse, ProviderError};

enum Step {
    Reply(&'static str),
    Fail,
}

/// Replays a script of replies and failures; repeats the last reply when
/// the script runs dry so multi-request tests stay short.
struct ScriptedClient {
    steps: Mutex<VecDeque<Step>>,
    default_reply: &'static str,
}

impl ScriptedClient {
    fn new(steps: Vec<Step>, default_reply: &'static str) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            default_reply,
        }
    }
}

impl ModelClient for ScriptedClient {
    fn invoke(
        &self,
        _system_prompt: &str,
        _history: &[ChatTurn],
        _input: &str,
    ) -> Result<ModelResponse, ProviderError> {
        let step = self.steps.lock().expect("steps lock").pop_front();
        match step {
            Some(Step::Reply(content)) => Ok(ModelResponse {
                content: content.to_string(),
            }),
            Some(Step::Fail) => Err(ProviderError::Api {
                provider: "scripted".to_string(),
                status: 500,
                detail: "scripted provider failure".to_string(),
            }),
            None => Ok(ModelResponse {
                content: self.default_reply.to_string(),
            }),
        }
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

fn context_with(sql_steps: Vec<Step>, nlp_steps: Vec<Step>) -> AppContext {
    let engine = create_engine("sqlite::memory:").expect("engine");
    engine
        .execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, quantity INTEGER NOT NULL);
             INSERT INTO items (name, quantity) VALUES ('bolt', 120), ('washer', 40), ('bracket', 7);",
        )
        .expect("seed schema");

    let sql_agent = Agent::new(
        "sql",
        Box::new(ScriptedClient::new(sql_steps, "SELECT name FROM items")),
        "generate sql".to_string(),
    )
    .with_engine(engine);
    let nlp_agent = Agent::new(
        "nlp",
        Box::new(ScriptedClient::new(nlp_steps, "Here is your answer.")),
        "summarize {query} {data} {result_limit}".to_string(),
    );

    let mut config = ServiceConfig::default();
    config.database_dsn = "sqlite::memory:".to_string();
    AppContext::new(config, sql_agent, nlp_agent)
}

#[test]
fn happy_path_answers_and_records_one_pair_per_agent() {
    let ctx = context_with(
        vec![Step::Reply("SELECT name, quantity FROM items;")],
        vec![Step::Reply("You stock three item kinds.")],
    );

    let outcome = handle_question(&ctx, 42, "what do we stock?");
    assert_eq!(outcome.status, ResponseStatus::Success);
    assert_eq!(outcome.response, "You stock three item kinds.");

    assert!(ctx.activity().last_seen(42).is_some());
    assert_eq!(ctx.sql_agent().memory().history(42).len(), 2);
    assert_eq!(ctx.nlp_agent().memory().history(42).len(), 2);
}

#[test]
fn history_is_rotated_to_three_pairs() {
    let ctx = context_with(Vec::new(), Vec::new());

    for round in 0..5 {
        let outcome = handle_question(&ctx, 7, &format!("question {round}"));
        assert_eq!(outcome.status, ResponseStatus::Success);
    }

    let cap = MAX_HISTORY_QUESTIONS * 2;
    assert!(ctx.sql_agent().memory().history(7).len() <= cap);
    assert!(ctx.nlp_agent().memory().history(7).len() <= cap);
}

#[test]
fn non_sql_reply_falls_back_to_an_explanation() {
    let ctx = context_with(
        vec![Step::Reply("I cannot answer that.")],
        vec![Step::Reply("Sorry, I could not look that up.")],
    );

    let outcome = handle_question(&ctx, 1, "what is the meaning of life?");
    assert_eq!(outcome.status, ResponseStatus::Success);
    assert_eq!(outcome.response, "Sorry, I could not look that up.");
}

#[test]
fn execution_failure_falls_back_with_success_status() {
    let ctx = context_with(
        vec![Step::Reply("SELECT name FROM warehouses;")],
        vec![Step::Reply("Something went wrong reading the database.")],
    );

    let outcome = handle_question(&ctx, 2, "list warehouses");
    assert_eq!(outcome.status, ResponseStatus::Success);
    assert_eq!(
        outcome.response,
        "Something went wrong reading the database."
    );
}

#[test]
fn sql_provider_failure_still_reaches_the_fallback() {
    let ctx = context_with(
        vec![Step::Fail],
        vec![Step::Reply("The assistant is having trouble right now.")],
    );

    let outcome = handle_question(&ctx, 3, "anything in stock?");
    assert_eq!(outcome.status, ResponseStatus::Success);
    assert_eq!(
        outcome.response,
        "The assistant is having trouble right now."
    );
}

#[test]
fn fallback_failure_is_the_only_terminal_error() {
    let ctx = context_with(vec![Step::Reply("not sql at all")], vec![Step::Fail]);

    let outcome = handle_question(&ctx, 4, "hello?");
    assert_eq!(outcome.status, ResponseStatus::Error);
    assert_eq!(outcome.response, "Internal server error. Please retry later.");
}

#[test]
fn activity_is_tracked_even_when_everything_fails() {
    let ctx = context_with(vec![Step::Fail], vec![Step::Fail]);

    let outcome = handle_question(&ctx, 5, "hello?");
    assert_eq!(outcome.status, ResponseStatus::Error);
    assert!(ctx.activity().last_seen(5).is_some());
}

#[test]
fn empty_results_are_summarized_not_errored() {
    let ctx = context_with(
        vec![Step::Reply("SELECT name FROM items WHERE quantity > 9000;")],
        vec![Step::Reply("Nothing in stock matches that.")],
    );

    let outcome = handle_question(&ctx, 6, "anything above nine thousand?");
    assert_eq!(outcome.status, ResponseStatus::Success);
    assert_eq!(outcome.response, "Nothing in stock matches that.");
}
