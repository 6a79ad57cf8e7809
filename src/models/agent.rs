use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::conversation::Conversation;
use crate::models::knowledge::KnowledgeItem;
use crate::models::overlay;
use crate::store::{self, encode, Collection, Direction, DocumentStore, Patch, Query, StoreError, Write};

pub const DEFAULT_MODEL: &str = "deepseek/deepseek-chat-v3.1:free";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 500;
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful customer support assistant. Answer using the knowledge base and hand over to a human when unsure.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
    Training,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Retrieval and answering parameters read by the AI backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct AiConfig {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub confidence_threshold: f64,
    pub max_retrieval_docs: u32,
    pub rag_enabled: bool,
    pub fallback_to_human: bool,
    pub system_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_system_prompt: Option<String>,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub auto_retrain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trained_at: Option<i64>,
}

impl Default for AiConfig {
    fn default() -> Self {
        AiConfig {
            enabled: true,
            provider: "openrouter".to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            confidence_threshold: 0.7,
            max_retrieval_docs: 5,
            rag_enabled: true,
            fallback_to_human: true,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            custom_system_prompt: None,
            embedding_provider: "voyage".to_string(),
            embedding_model: "voyage-3".to_string(),
            auto_retrain: false,
            last_trained_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentStats {
    pub total_conversations: u64,
    pub total_messages: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    #[serde(default)]
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub settings: AgentSettings,
    #[serde(default)]
    pub ai_config: AiConfig,
    #[serde(default)]
    pub stats: AgentStats,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Default for Agent {
    fn default() -> Self {
        Agent {
            id: Uuid::new_v4().to_string(),
            workspace_id: String::new(),
            name: String::new(),
            description: String::new(),
            status: AgentStatus::Active,
            settings: AgentSettings::default(),
            ai_config: AiConfig::default(),
            stats: AgentStats::default(),
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// Nested objects are partial: only the keys present are changed.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgent {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub settings: Option<Value>,
    #[serde(default)]
    pub ai_config: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAgent {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<AgentStatus>,
    pub settings: Option<Value>,
    pub ai_config: Option<Value>,
}

fn validate_name(name: &str) -> AppResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Agent name is required".to_string()));
    }
    Ok(name.to_string())
}

fn validate_settings(settings: &AgentSettings) -> AppResult<()> {
    if !(0.0..=2.0).contains(&settings.temperature) {
        return Err(AppError::Validation("Temperature must be between 0 and 2".to_string()));
    }
    if settings.max_tokens == 0 {
        return Err(AppError::Validation("Max tokens must be positive".to_string()));
    }
    Ok(())
}

impl Agent {
    pub async fn create(store: &dyn DocumentStore, workspace_id: &str, data: CreateAgent) -> AppResult<Self> {
        let mut agent = Agent {
            workspace_id: workspace_id.to_string(),
            name: validate_name(&data.name)?,
            description: data.description.unwrap_or_default().trim().to_string(),
            ..Default::default()
        };
        if let Some(settings) = data.settings {
            agent.settings = overlay(&agent.settings, settings, "settings")?;
        }
        validate_settings(&agent.settings)?;
        if let Some(ai_config) = data.ai_config {
            agent.ai_config = overlay(&agent.ai_config, ai_config, "aiConfig")?;
        }

        store
            .commit(vec![Write::create(Collection::Agents, &agent.id, encode(&agent)?)])
            .await?;
        info!("Agent created: {} ({}) in {}", agent.name, agent.id, workspace_id);

        Self::get(store, &agent.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("agent {}", agent.id)))
    }

    pub async fn get(store: &dyn DocumentStore, id: &str) -> AppResult<Option<Self>> {
        Ok(store::fetch(store, Collection::Agents, id).await?)
    }

    /// Loads the agent only if it belongs to the workspace.
    pub async fn get_in_workspace(store: &dyn DocumentStore, workspace_id: &str, id: &str) -> AppResult<Self> {
        Self::get(store, id)
            .await?
            .filter(|agent| agent.workspace_id == workspace_id)
            .ok_or_else(|| AppError::NotFound("Agent".to_string()))
    }

    /// Newest first.
    pub async fn list(store: &dyn DocumentStore, workspace_id: &str) -> AppResult<Vec<Self>> {
        let agents: Vec<Agent> = store::fetch_all(
            store,
            &Query::new(Collection::Agents)
                .filter("workspaceId", workspace_id)
                .order_by("createdAt", Direction::Desc),
        )
        .await?;
        debug!("Found {} agents in workspace {}", agents.len(), workspace_id);
        Ok(agents)
    }

    pub async fn update(
        store: &dyn DocumentStore,
        workspace_id: &str,
        id: &str,
        data: UpdateAgent,
    ) -> AppResult<Self> {
        let current = Self::get_in_workspace(store, workspace_id, id).await?;

        let mut patch = Patch::new();
        if let Some(name) = data.name {
            patch = patch.set("name", validate_name(&name)?);
        }
        if let Some(description) = data.description {
            patch = patch.set("description", description.trim());
        }
        if let Some(status) = data.status {
            patch = patch.set("status", serde_json::to_value(status).map_err(StoreError::from)?);
        }
        if let Some(settings) = data.settings {
            let settings = overlay(&current.settings, settings, "settings")?;
            validate_settings(&settings)?;
            patch = patch.set("settings", serde_json::to_value(settings).map_err(StoreError::from)?);
        }
        if let Some(ai_config) = data.ai_config {
            let ai_config = overlay(&current.ai_config, ai_config, "aiConfig")?;
            patch = patch.set("aiConfig", serde_json::to_value(ai_config).map_err(StoreError::from)?);
        }

        store.commit(vec![Write::update(Collection::Agents, id, patch)]).await?;
        debug!("Agent updated: {}", id);
        Self::get_in_workspace(store, workspace_id, id).await
    }

    /// Copies configuration into a new active agent named `"{name} (Copy)"`
    /// with zeroed stats.
    pub async fn duplicate(store: &dyn DocumentStore, workspace_id: &str, id: &str) -> AppResult<Self> {
        let original = Self::get_in_workspace(store, workspace_id, id).await?;
        let copy = Agent {
            workspace_id: original.workspace_id.clone(),
            name: format!("{} (Copy)", original.name),
            description: original.description.clone(),
            status: AgentStatus::Active,
            settings: original.settings.clone(),
            ai_config: AiConfig {
                last_trained_at: None,
                ..original.ai_config.clone()
            },
            stats: AgentStats::default(),
            ..Default::default()
        };

        store
            .commit(vec![Write::create(Collection::Agents, &copy.id, encode(&copy)?)])
            .await?;
        info!("Agent {} duplicated as {}", id, copy.id);
        Self::get_in_workspace(store, workspace_id, &copy.id).await
    }

    /// Every write needed to remove the agent and what hangs off it:
    /// widgets, conversations with their messages, knowledge items (whose
    /// vector entries are queued in the deletion outbox), actions and leads.
    pub async fn cascade_writes(store: &dyn DocumentStore, agent: &Agent) -> AppResult<Vec<Write>> {
        let mut writes = Vec::new();

        for widget in store
            .query(&Query::new(Collection::AgentChannels).filter("agentId", agent.id.as_str()))
            .await?
        {
            writes.push(Write::delete(Collection::AgentChannels, &widget.id));
        }

        for conversation in Conversation::list_for_agent(store, &agent.id).await? {
            writes.extend(Conversation::deletion_writes(store, &conversation.id).await?);
        }

        for item in KnowledgeItem::list_for_agent(store, &agent.id).await? {
            writes.extend(item.deletion_writes()?);
        }

        for collection in [Collection::AgentActions, Collection::LeadSubmissions] {
            for doc in store
                .query(&Query::new(collection).filter("agentId", agent.id.as_str()))
                .await?
            {
                writes.push(Write::delete(collection, &doc.id));
            }
        }

        writes.push(Write::delete(Collection::Agents, &agent.id));
        Ok(writes)
    }

    /// Deletes the agent and everything scoped to it in one batch. Returns
    /// how many vector deletions were queued.
    pub async fn delete(store: &dyn DocumentStore, workspace_id: &str, id: &str) -> AppResult<usize> {
        let agent = Self::get_in_workspace(store, workspace_id, id).await?;
        let writes = Self::cascade_writes(store, &agent).await?;
        let queued = writes
            .iter()
            .filter(|w| w.collection() == Collection::VectorDeletions)
            .count();

        store.commit(writes).await?;
        info!("Agent {} deleted, {} vector deletions queued", id, queued);
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::action::{ActionKind, AgentAction, CreateAction};
    use crate::models::conversation::NewConversation;
    use crate::models::knowledge::{KnowledgeItem, KnowledgeType};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn support() -> CreateAgent {
        CreateAgent {
            name: "Support".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_applies_defaults() {
        let store = MemoryStore::new();
        let agent = Agent::create(&store, "w1", support()).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.settings.model, DEFAULT_MODEL);
        assert_eq!(agent.settings.max_tokens, 500);
        assert_eq!(agent.stats.total_conversations, 0);
        assert!(agent.created_at > 0);
    }

    #[tokio::test]
    async fn create_rejects_blank_name_and_bad_temperature() {
        let store = MemoryStore::new();
        let blank = Agent::create(&store, "w1", CreateAgent { name: "  ".into(), ..Default::default() }).await;
        assert!(matches!(blank, Err(AppError::Validation(_))));

        let hot = Agent::create(
            &store,
            "w1",
            CreateAgent {
                name: "Hot".into(),
                settings: Some(json!({"temperature": 3.5})),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(hot, Err(AppError::Validation(_))));
        assert_eq!(store.document_count(Collection::Agents), 0);
    }

    #[tokio::test]
    async fn list_is_newest_first_and_scoped() {
        let store = MemoryStore::new();
        for name in ["One", "Two", "Three"] {
            Agent::create(&store, "w1", CreateAgent { name: name.into(), ..Default::default() })
                .await
                .unwrap();
        }
        Agent::create(&store, "w2", support()).await.unwrap();

        let names: Vec<_> = Agent::list(&store, "w1").await.unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["Three", "Two", "One"]);
    }

    #[tokio::test]
    async fn update_merges_partial_settings() {
        let store = MemoryStore::new();
        let agent = Agent::create(&store, "w1", support()).await.unwrap();
        let updated = Agent::update(
            &store,
            "w1",
            &agent.id,
            UpdateAgent {
                settings: Some(json!({"temperature": 0.2})),
                status: Some(AgentStatus::Training),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.settings.temperature, 0.2);
        assert_eq!(updated.settings.model, DEFAULT_MODEL);
        assert_eq!(updated.status, AgentStatus::Training);

        let foreign = Agent::update(&store, "w2", &agent.id, UpdateAgent::default()).await;
        assert!(matches!(foreign, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_resets_stats() {
        let store = MemoryStore::new();
        let agent = Agent::create(&store, "w1", support()).await.unwrap();
        store
            .commit(vec![Write::update(
                Collection::Agents,
                &agent.id,
                Patch::new().set("stats.totalMessages", 12).set("status", "inactive"),
            )])
            .await
            .unwrap();

        let copy = Agent::duplicate(&store, "w1", &agent.id).await.unwrap();
        assert_eq!(copy.name, "Support (Copy)");
        assert_eq!(copy.status, AgentStatus::Active);
        assert_eq!(copy.stats, AgentStats::default());
        assert_ne!(copy.id, agent.id);
    }

    #[tokio::test]
    async fn delete_cascades_and_queues_vector_deletions() {
        let store = MemoryStore::new();
        let agent = Agent::create(&store, "w1", support()).await.unwrap();
        let conversation = Conversation::create(
            &store,
            &agent,
            NewConversation {
                customer_name: "Ann".into(),
                customer_email: "ann@example.com".into(),
                initial_message: Some("Hello".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        KnowledgeItem::insert(
            &store,
            KnowledgeItem {
                agent_id: agent.id.clone(),
                workspace_id: "w1".into(),
                title: "Hours".into(),
                kind: KnowledgeType::Faq,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        AgentAction::create(
            &store,
            &agent,
            CreateAction {
                kind: ActionKind::CollectLeads,
                name: "Leads".into(),
                description: None,
                configuration: None,
            },
        )
        .await
        .unwrap();

        let queued = Agent::delete(&store, "w1", &agent.id).await.unwrap();
        assert_eq!(queued, 1);
        assert!(Agent::get(&store, &agent.id).await.unwrap().is_none());
        assert!(Conversation::get(&store, &conversation.id).await.unwrap().is_none());
        assert_eq!(store.document_count(Collection::Messages), 0);
        assert_eq!(store.document_count(Collection::KnowledgeBase), 0);
        assert_eq!(store.document_count(Collection::VectorDeletions), 1);
        assert_eq!(store.document_count(Collection::AgentActions), 0);
    }
}
