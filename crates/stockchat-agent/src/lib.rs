pub mod memory;
pub mod prompt;

use std::sync::PoisonError;

use stockchat_common::ServiceConfig;
use stockchat_db::EngineHandle;
use stockchat_providers::{
    ChatTurn, ModelClient, ModelOptions, ModelResponse, ProviderError, ProviderRegistry,
};
use tracing::debug;

pub use memory::ConversationMemory;

const SQL_TEMPERATURE: f32 = 0.1;
const NLP_TEMPERATURE: f32 = 0.3;
const MODEL_MAX_RETRIES: u32 = 2;

/// A bound unit of model handle, prompt template and conversation memory.
/// The SQL agent additionally carries the engine handle it queries.
pub struct Agent {
    name: &'static str,
    model: Box<dyn ModelClient>,
    system_prompt: String,
    memory: ConversationMemory,
    engine: Option<EngineHandle>,
}

impl Agent {
    pub fn new(name: &'static str, model: Box<dyn ModelClient>, system_prompt: String) -> Self {
        Self {
            name,
            model,
            system_prompt,
            memory: ConversationMemory::new(),
            engine: None,
        }
    }

    pub fn with_engine(mut self, engine: EngineHandle) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn engine(&self) -> Option<&EngineHandle> {
        self.engine.as_ref()
    }

    /// Invoke the model with the session's accumulated history plus the new
    /// input, then record both sides of the exchange.
    ///
    /// The session's history lock is held across the provider call, which
    /// serializes concurrent requests for the same session while leaving
    /// other sessions untouched. This blocks on network I/O and must run
    /// off the request-accepting thread.
    pub fn get_response_with_memory(
        &self,
        session_id: i64,
        input: &str,
        dynamic_variables: Option<&[(&str, String)]>,
    ) -> Result<ModelResponse, ProviderError> {
        let prompt = match dynamic_variables {
            Some(variables) => prompt::render(&self.system_prompt, variables),
            None => self.system_prompt.clone(),
        };

        let handle = self.memory.session_handle(session_id);
        let mut history = handle.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(
            "{} agent invoking {} for session {session_id} with {} prior turns",
            self.name,
            self.model.model_id(),
            history.len()
        );
        let response = self.model.invoke(&prompt, &history, input)?;
        history.push(ChatTurn::user(input));
        history.push(ChatTurn::assistant(response.content.clone()));
        Ok(response)
    }
}

fn model_options(config: &ServiceConfig, temperature: f32) -> ModelOptions {
    ModelOptions {
        provider: config.model.provider.clone(),
        model: config.model.model_id.clone(),
        temperature,
        max_retries: MODEL_MAX_RETRIES,
        endpoint: config.model.endpoint.clone(),
        api_key: None,
    }
}

pub fn build_sql_agent(
    config: &ServiceConfig,
    registry: &ProviderRegistry,
    engine: EngineHandle,
) -> Result<Agent, ProviderError> {
    let model = registry.build(&model_options(config, SQL_TEMPERATURE))?;
    Ok(Agent::new("sql", model, prompt::sql_system_prompt()).with_engine(engine))
}

pub fn build_nlp_agent(
    config: &ServiceConfig,
    registry: &ProviderRegistry,
) -> Result<Agent, ProviderError> {
    let model = registry.build(&model_options(config, NLP_TEMPERATURE))?;
    Ok(Agent::new(
        "nlp",
        model,
        prompt::NLP_SYSTEM_PROMPT.to_string(),
    ))
}

/// Build the process-wide agent pair. The engine handle is threaded through
/// so rotation can reuse the open engine instead of reconnecting.
pub fn build_agents(
    config: &ServiceConfig,
    registry: &ProviderRegistry,
    engine: EngineHandle,
) -> Result<(Agent, Agent), ProviderError> {
    let sql_agent = build_sql_agent(config, registry, engine)?;
    let nlp_agent = build_nlp_agent(config, registry)?;
    Ok((sql_agent, nlp_agent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use stockchat_providers::Role;

    /// Shared view into what a scripted client was asked to do.
    #[derive(Clone, Default)]
    struct Probe {
        history_lens: std::sync::Arc<Mutex<Vec<usize>>>,
        prompts: std::sync::Arc<Mutex<Vec<String>>>,
    }

    /// Test double that replays canned responses and records how much
    /// history each invocation saw.
    struct ScriptedClient {
        replies: Mutex<Vec<String>>,
        probe: Probe,
    }

    impl ScriptedClient {
        fn new(replies: &[&str], probe: Probe) -> Self {
            let mut queued: Vec<String> = replies.iter().map(|r| r.to_string()).collect();
            queued.reverse();
            Self {
                replies: Mutex::new(queued),
                probe,
            }
        }
    }

    impl ModelClient for ScriptedClient {
        fn invoke(
            &self,
            system_prompt: &str,
            history: &[ChatTurn],
            _input: &str,
        ) -> Result<ModelResponse, ProviderError> {
            self.probe
                .history_lens
                .lock()
                .expect("lens lock")
                .push(history.len());
            self.probe
                .prompts
                .lock()
                .expect("prompt lock")
                .push(system_prompt.to_string());
            let content = self
                .replies
                .lock()
                .expect("replies lock")
                .pop()
                .unwrap_or_else(|| "out of script".to_string());
            Ok(ModelResponse { content })
        }

        fn model_id(&self) -> &str {
            "scripted"
        }
    }

    fn scripted_agent(replies: &[&str], system_prompt: &str) -> (Agent, Probe) {
        let probe = Probe::default();
        let agent = Agent::new(
            "sql",
            Box::new(ScriptedClient::new(replies, probe.clone())),
            system_prompt.to_string(),
        );
        (agent, probe)
    }

    #[test]
    fn exchanges_append_in_order_and_history_accumulates() {
        let (agent, _probe) = scripted_agent(&["first answer", "second answer"], "be helpful");

        let first = agent
            .get_response_with_memory(42, "first question", None)
            .expect("first call");
        assert_eq!(first.content, "first answer");

        agent
            .get_response_with_memory(42, "second question", None)
            .expect("second call");

        let turns = agent.memory().history(42);
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].content, "first question");
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].content, "first answer");
        assert_eq!(turns[3].content, "second answer");
    }

    #[test]
    fn sessions_do_not_share_history() {
        let (agent, _probe) = scripted_agent(&["a", "b"], "be helpful");
        agent
            .get_response_with_memory(1, "from one", None)
            .expect("call");
        agent
            .get_response_with_memory(2, "from two", None)
            .expect("call");

        assert_eq!(agent.memory().history(1).len(), 2);
        assert_eq!(agent.memory().history(2).len(), 2);
        assert_eq!(agent.memory().history(1)[0].content, "from one");
    }

    #[test]
    fn dynamic_variables_render_into_the_prompt_per_call() {
        let probe = Probe::default();
        let client = ScriptedClient::new(&["ok", "ok"], probe.clone());
        let agent = Agent::new("nlp", Box::new(client), "data is {data}".to_string());

        agent
            .get_response_with_memory(9, "question", Some(&[("data", "three rows".to_string())]))
            .expect("call");
        agent
            .get_response_with_memory(9, "again", Some(&[("data", "empty".to_string())]))
            .expect("call");

        let prompts = probe.prompts.lock().expect("prompts");
        assert_eq!(prompts[0], "data is three rows");
        assert_eq!(prompts[1], "data is empty");
    }

    #[test]
    fn model_sees_prior_turns_on_later_calls() {
        let (agent, probe) = scripted_agent(&["a", "b", "c"], "be helpful");
        for question in ["one", "two", "three"] {
            agent
                .get_response_with_memory(5, question, None)
                .expect("call");
        }
        let lens = probe.history_lens.lock().expect("lens");
        assert_eq!(*lens, vec![0, 2, 4]);
        assert_eq!(agent.memory().history(5).len(), 6);
    }

    #[test]
    fn unknown_provider_fails_agent_construction() {
        let config = ServiceConfig {
            model: stockchat_common::ModelSettings {
                provider: "nonesuch".to_string(),
                model_id: "m".to_string(),
                endpoint: None,
            },
            ..ServiceConfig::default()
        };
        let registry = ProviderRegistry::with_defaults();
        let err = build_nlp_agent(&config, &registry).err().expect("should fail");
        assert!(matches!(err, ProviderError::UnknownProvider { .. }));
    }

    #[test]
    fn ollama_agent_pair_builds_offline() {
        let config = ServiceConfig::default();
        let registry = ProviderRegistry::with_defaults();
        let engine = stockchat_db::create_engine("sqlite::memory:").expect("engine");
        let (sql_agent, nlp_agent) =
            build_agents(&config, &registry, engine).expect("agents build");
        assert!(sql_agent.engine().is_some());
        assert!(nlp_agent.engine().is_none());
    }
}
