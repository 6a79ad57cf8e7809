use std::collections::{BTreeMap, BTreeSet};

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::agent::Agent;
use crate::store::{self, encode, Collection, Direction, DocumentStore, Patch, Query, StoreError, Write};

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex");
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    CollectLeads,
    CustomButton,
    CalendlySlots,
    CustomAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Active,
    Inactive,
    #[default]
    Draft,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct Channels {
    pub chat_widget: bool,
    pub help_page: bool,
}

impl Default for Channels {
    fn default() -> Self {
        Channels {
            chat_widget: true,
            help_page: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Email,
    Phone,
    Textarea,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeadField {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub placeholder: String,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "type", default)]
    pub kind: FieldType,
}

impl LeadField {
    fn new(name: &str, label: &str, kind: FieldType) -> Self {
        LeadField {
            id: name.to_string(),
            name: name.to_string(),
            label: label.to_string(),
            placeholder: String::new(),
            required: true,
            kind,
        }
    }

    fn display_label(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.name
        } else {
            &self.label
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct LeadsGeneral {
    pub description: String,
    pub trigger_condition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct LeadMessages {
    pub success_message: String,
    pub dismiss_message: String,
}

impl Default for LeadMessages {
    fn default() -> Self {
        LeadMessages {
            success_message: "Thanks! We'll be in touch soon.".to_string(),
            dismiss_message: "No problem, let us know if you change your mind.".to_string(),
        }
    }
}

/// Form the agent shows when a visitor should leave contact details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectLeadsConfig {
    pub general: LeadsGeneral,
    pub fields: Vec<LeadField>,
    pub messages: LeadMessages,
    pub channels: Channels,
}

impl Default for CollectLeadsConfig {
    fn default() -> Self {
        CollectLeadsConfig {
            general: LeadsGeneral::default(),
            fields: vec![
                LeadField::new("name", "Name", FieldType::Text),
                LeadField::new("email", "Email", FieldType::Email),
            ],
            messages: LeadMessages::default(),
            channels: Channels::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionGeneral {
    pub action_name: String,
    pub description: String,
    pub when_to_use: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ButtonSettings {
    pub button_text: String,
    pub button_url: String,
    pub open_in_new_tab: bool,
}

impl Default for ButtonSettings {
    fn default() -> Self {
        ButtonSettings {
            button_text: String::new(),
            button_url: String::new(),
            open_in_new_tab: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomButtonConfig {
    pub general: ActionGeneral,
    pub button: ButtonSettings,
    pub channels: Channels,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CalendlySettings {
    pub event_type_uri: String,
    pub event_type_name: String,
    /// Minutes.
    pub duration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CalendlyConfig {
    pub general: ActionGeneral,
    pub calendly: CalendlySettings,
    pub channels: Channels,
}

/// Something the agent can do during a chat, stored in `agentActions`.
/// `configuration` holds the config struct matching `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentAction {
    #[serde(default)]
    pub id: String,
    pub agent_id: String,
    pub workspace_id: String,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default)]
    pub configuration: Value,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub configuration: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAction {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ActionStatus>,
    /// Sections present here replace their keys in the stored sections;
    /// `fields` is replaced whole.
    pub configuration: Option<Value>,
}

/// Contact details a visitor left through a collect-leads action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeadSubmission {
    #[serde(default)]
    pub id: String,
    pub agent_id: String,
    pub action_id: String,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub submitted_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitLead {
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Request details recorded with a lead.
#[derive(Debug, Clone, Default)]
pub struct LeadOrigin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

fn decode_config<T: DeserializeOwned>(value: Value) -> AppResult<T> {
    serde_json::from_value(value).map_err(|e| AppError::Validation(format!("Invalid configuration: {}", e)))
}

fn to_value<T: Serialize>(value: &T) -> AppResult<Value> {
    Ok(serde_json::to_value(value).map_err(StoreError::from)?)
}

fn check_url(url: &str) -> AppResult<()> {
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(AppError::Validation(format!("{} is not a valid http(s) URL", url))),
    }
}

fn check_leads(config: &CollectLeadsConfig) -> AppResult<()> {
    if config.fields.is_empty() {
        return Err(AppError::Validation("A lead form needs at least one field".to_string()));
    }
    let mut seen = BTreeSet::new();
    for field in &config.fields {
        if field.name.trim().is_empty() {
            return Err(AppError::Validation("Every lead field needs a name".to_string()));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(AppError::Validation(format!("Duplicate lead field {}", field.name)));
        }
    }
    Ok(())
}

/// Fills defaults for the action type and validates the result. `live`
/// additionally requires what an active action needs to be usable.
fn normalize_config(kind: ActionKind, value: Value, live: bool) -> AppResult<Value> {
    match kind {
        ActionKind::CollectLeads => {
            let mut config: CollectLeadsConfig = decode_config(value)?;
            for field in &mut config.fields {
                if field.id.is_empty() {
                    field.id = field.name.clone();
                }
            }
            check_leads(&config)?;
            to_value(&config)
        }
        ActionKind::CustomButton => {
            let config: CustomButtonConfig = decode_config(value)?;
            if !config.button.button_url.is_empty() {
                check_url(&config.button.button_url)?;
            }
            if live && (config.button.button_text.trim().is_empty() || config.button.button_url.is_empty()) {
                return Err(AppError::Validation(
                    "A button needs text and a URL before it can be activated".to_string(),
                ));
            }
            to_value(&config)
        }
        ActionKind::CalendlySlots => {
            let config: CalendlyConfig = decode_config(value)?;
            if !config.calendly.event_type_uri.is_empty() {
                check_url(&config.calendly.event_type_uri)?;
                if config.calendly.duration == 0 {
                    return Err(AppError::Validation("Event duration must be positive".to_string()));
                }
            }
            if live && config.calendly.event_type_uri.is_empty() {
                return Err(AppError::Validation(
                    "Pick a Calendly event type before activating".to_string(),
                ));
            }
            to_value(&config)
        }
        ActionKind::CustomAction => match value {
            Value::Object(_) => Ok(value),
            _ => Err(AppError::Validation("Configuration must be an object".to_string())),
        },
    }
}

/// Shallow-merges each section object of `update` into `current`; other
/// keys are replaced.
fn merge_config(current: &Value, update: Value) -> AppResult<Value> {
    let Value::Object(changes) = update else {
        return Err(AppError::Validation("Configuration must be an object".to_string()));
    };
    let mut merged = match current {
        Value::Object(map) => map.clone(),
        _ => Default::default(),
    };
    for (key, value) in changes {
        match (merged.get_mut(&key), value) {
            (Some(Value::Object(section)), Value::Object(patch)) => section.extend(patch),
            (Some(slot), value) => *slot = value,
            (None, value) => {
                merged.insert(key, value);
            }
        }
    }
    Ok(Value::Object(merged))
}

impl AgentAction {
    pub fn leads_config(&self) -> AppResult<CollectLeadsConfig> {
        if self.kind != ActionKind::CollectLeads {
            return Err(AppError::Validation(format!("{} does not collect leads", self.name)));
        }
        decode_config(self.configuration.clone())
    }

    /// New actions start as drafts.
    pub async fn create(store: &dyn DocumentStore, agent: &Agent, data: CreateAction) -> AppResult<Self> {
        let name = data.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation("Action name is required".to_string()));
        }
        let configuration = normalize_config(
            data.kind,
            data.configuration.unwrap_or_else(|| Value::Object(Default::default())),
            false,
        )?;

        let action = AgentAction {
            id: Uuid::new_v4().to_string(),
            agent_id: agent.id.clone(),
            workspace_id: agent.workspace_id.clone(),
            kind: data.kind,
            name,
            description: data.description.unwrap_or_default(),
            status: ActionStatus::Draft,
            configuration,
            created_at: 0,
            updated_at: 0,
        };
        store
            .commit(vec![Write::create(Collection::AgentActions, &action.id, encode(&action)?)])
            .await?;
        info!("Action {} ({:?}) created for agent {}", action.id, action.kind, agent.id);
        Self::get_for_agent(store, &agent.id, &action.id).await
    }

    pub async fn get_for_agent(store: &dyn DocumentStore, agent_id: &str, id: &str) -> AppResult<Self> {
        store::fetch::<AgentAction>(store, Collection::AgentActions, id)
            .await?
            .filter(|a| a.agent_id == agent_id)
            .ok_or_else(|| AppError::NotFound("Action".to_string()))
    }

    pub async fn list_for_agent(store: &dyn DocumentStore, agent_id: &str) -> AppResult<Vec<Self>> {
        Ok(store::fetch_all(
            store,
            &Query::new(Collection::AgentActions)
                .filter("agentId", agent_id)
                .order_by("createdAt", Direction::Desc),
        )
        .await?)
    }

    /// What the chat runtime may offer, optionally narrowed to one type.
    pub async fn active_for_agent(
        store: &dyn DocumentStore,
        agent_id: &str,
        kind: Option<ActionKind>,
    ) -> AppResult<Vec<Self>> {
        let mut query = Query::new(Collection::AgentActions)
            .filter("agentId", agent_id)
            .filter("status", "active");
        if let Some(kind) = kind {
            query = query.filter("type", to_value(&kind)?);
        }
        Ok(store::fetch_all(store, &query.order_by("createdAt", Direction::Asc)).await?)
    }

    pub async fn update(store: &dyn DocumentStore, agent_id: &str, id: &str, data: UpdateAction) -> AppResult<Self> {
        let current = Self::get_for_agent(store, agent_id, id).await?;

        let mut patch = Patch::new().set_opt("description", data.description);
        if let Some(name) = data.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(AppError::Validation("Action name is required".to_string()));
            }
            patch = patch.set("name", name);
        }
        if let Some(status) = data.status {
            patch = patch.set("status", to_value(&status)?);
        }

        let live = data.status.unwrap_or(current.status) == ActionStatus::Active;
        let configuration = match data.configuration {
            Some(update) => merge_config(&current.configuration, update)?,
            None => current.configuration.clone(),
        };
        let configuration = normalize_config(current.kind, configuration, live)?;
        if configuration != current.configuration {
            patch = patch.set("configuration", configuration);
        }

        if patch.is_empty() {
            return Ok(current);
        }
        store
            .commit(vec![Write::update(Collection::AgentActions, id, patch)])
            .await?;
        debug!("Action {} updated", id);
        Self::get_for_agent(store, agent_id, id).await
    }

    /// Removes the action together with the leads it collected.
    pub async fn delete(store: &dyn DocumentStore, agent_id: &str, id: &str) -> AppResult<usize> {
        Self::get_for_agent(store, agent_id, id).await?;
        let mut writes: Vec<Write> = store
            .query(&Query::new(Collection::LeadSubmissions).filter("actionId", id))
            .await?
            .iter()
            .map(|doc| Write::delete(Collection::LeadSubmissions, &doc.id))
            .collect();
        let leads = writes.len();
        writes.push(Write::delete(Collection::AgentActions, id));
        store.commit(writes).await?;
        info!("Action {} deleted with {} leads", id, leads);
        Ok(leads)
    }

    /// Records a visitor's answers to an active collect-leads action. Only
    /// configured fields are kept.
    pub async fn submit_lead(
        store: &dyn DocumentStore,
        action_id: &str,
        data: SubmitLead,
        origin: LeadOrigin,
    ) -> AppResult<(Self, LeadSubmission)> {
        let action: AgentAction = store::fetch(store, Collection::AgentActions, action_id)
            .await?
            .filter(|a: &AgentAction| a.status == ActionStatus::Active)
            .ok_or_else(|| AppError::NotFound("Action".to_string()))?;
        let config = action.leads_config()?;

        let mut answers = BTreeMap::new();
        for field in &config.fields {
            let value = data
                .data
                .get(&field.name)
                .map(|v| v.trim().to_string())
                .unwrap_or_default();
            if value.is_empty() {
                if field.required {
                    return Err(AppError::Validation(format!("{} is required", field.display_label())));
                }
                continue;
            }
            if field.kind == FieldType::Email && !EMAIL_RE.is_match(&value) {
                return Err(AppError::Validation(format!(
                    "{} must be a valid email address",
                    field.display_label()
                )));
            }
            answers.insert(field.name.clone(), value);
        }

        let submission = LeadSubmission {
            id: Uuid::new_v4().to_string(),
            agent_id: action.agent_id.clone(),
            action_id: action.id.clone(),
            workspace_id: action.workspace_id.clone(),
            conversation_id: data.conversation_id.filter(|c| !c.is_empty()),
            data: answers,
            ip_address: origin.ip_address,
            user_agent: origin.user_agent,
            submitted_at: 0,
        };
        store
            .commit(vec![Write::create(
                Collection::LeadSubmissions,
                &submission.id,
                encode(&submission)?,
            )
            .with_server_timestamp("submittedAt")])
            .await?;
        info!("Lead {} collected by action {}", submission.id, action.id);

        let stored = store::fetch(store, Collection::LeadSubmissions, &submission.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("lead {}", submission.id)))?;
        Ok((action, stored))
    }
}

impl LeadSubmission {
    pub async fn list_for_action(store: &dyn DocumentStore, action_id: &str) -> AppResult<Vec<Self>> {
        Ok(store::fetch_all(
            store,
            &Query::new(Collection::LeadSubmissions)
                .filter("actionId", action_id)
                .order_by("submittedAt", Direction::Desc),
        )
        .await?)
    }

    pub async fn list_for_agent(store: &dyn DocumentStore, agent_id: &str) -> AppResult<Vec<Self>> {
        Ok(store::fetch_all(
            store,
            &Query::new(Collection::LeadSubmissions)
                .filter("agentId", agent_id)
                .order_by("submittedAt", Direction::Desc),
        )
        .await?)
    }

    /// Name and email to show for the lead, read from the form's email
    /// field and its `name` (or first text) field.
    pub fn contact(&self, config: &CollectLeadsConfig) -> (Option<String>, Option<String>) {
        let value = |field: &LeadField| self.data.get(&field.name).cloned();
        let email = config
            .fields
            .iter()
            .find(|f| f.kind == FieldType::Email)
            .and_then(value);
        let name = config
            .fields
            .iter()
            .find(|f| f.name == "name")
            .or_else(|| config.fields.iter().find(|f| f.kind == FieldType::Text))
            .and_then(value);
        (name, email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::agent::CreateAgent;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn setup() -> (MemoryStore, Agent) {
        let store = MemoryStore::new();
        let agent = Agent::create(
            &store,
            "w1",
            CreateAgent {
                name: "Support".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        (store, agent)
    }

    fn leads_form() -> CreateAction {
        CreateAction {
            kind: ActionKind::CollectLeads,
            name: "Collect leads".into(),
            description: None,
            configuration: None,
        }
    }

    async fn activate(store: &MemoryStore, action: &AgentAction) -> AgentAction {
        AgentAction::update(
            store,
            &action.agent_id,
            &action.id,
            UpdateAction {
                status: Some(ActionStatus::Active),
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    fn answers(pairs: &[(&str, &str)]) -> SubmitLead {
        SubmitLead {
            data: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            conversation_id: None,
        }
    }

    #[tokio::test]
    async fn new_lead_form_is_a_draft_with_default_fields() {
        let (store, agent) = setup().await;
        let action = AgentAction::create(&store, &agent, leads_form()).await.unwrap();
        assert_eq!(action.status, ActionStatus::Draft);
        let config = action.leads_config().unwrap();
        let names: Vec<_> = config.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["name", "email"]);
        assert!(config.channels.chat_widget);
    }

    #[tokio::test]
    async fn configuration_sections_merge_and_fields_replace() {
        let (store, agent) = setup().await;
        let action = AgentAction::create(&store, &agent, leads_form()).await.unwrap();
        let updated = AgentAction::update(
            &store,
            &agent.id,
            &action.id,
            UpdateAction {
                configuration: Some(json!({
                    "messages": { "successMessage": "Got it!" },
                    "fields": [{ "name": "phone", "label": "Phone", "type": "phone", "required": true }]
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let config = updated.leads_config().unwrap();
        assert_eq!(config.messages.success_message, "Got it!");
        assert_eq!(config.messages.dismiss_message, LeadMessages::default().dismiss_message);
        assert_eq!(config.fields.len(), 1);
        assert_eq!(config.fields[0].id, "phone");
    }

    #[tokio::test]
    async fn button_cannot_go_live_without_a_url() {
        let (store, agent) = setup().await;
        let button = AgentAction::create(
            &store,
            &agent,
            CreateAction {
                kind: ActionKind::CustomButton,
                name: "Pricing".into(),
                description: None,
                configuration: Some(json!({ "button": { "buttonText": "See pricing" } })),
            },
        )
        .await
        .unwrap();

        let err = AgentAction::update(
            &store,
            &agent.id,
            &button.id,
            UpdateAction {
                status: Some(ActionStatus::Active),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let live = AgentAction::update(
            &store,
            &agent.id,
            &button.id,
            UpdateAction {
                status: Some(ActionStatus::Active),
                configuration: Some(json!({ "button": { "buttonUrl": "https://acme.co/pricing" } })),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(live.status, ActionStatus::Active);
        assert_eq!(live.configuration["button"]["buttonText"], "See pricing");

        let active = AgentAction::active_for_agent(&store, &agent.id, Some(ActionKind::CustomButton))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert!(AgentAction::active_for_agent(&store, &agent.id, Some(ActionKind::CalendlySlots))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn lead_keeps_only_configured_fields() {
        let (store, agent) = setup().await;
        let action = AgentAction::create(&store, &agent, leads_form()).await.unwrap();
        let action = activate(&store, &action).await;

        let (_, lead) = AgentAction::submit_lead(
            &store,
            &action.id,
            answers(&[("name", " Bob "), ("email", "bob@example.com"), ("extra", "x")]),
            LeadOrigin {
                ip_address: Some("10.0.0.1".into()),
                user_agent: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(lead.data.len(), 2);
        assert_eq!(lead.data["name"], "Bob");
        assert_eq!(lead.workspace_id, "w1");
        assert!(lead.submitted_at > 0);

        let (name, email) = lead.contact(&action.leads_config().unwrap());
        assert_eq!(name.as_deref(), Some("Bob"));
        assert_eq!(email.as_deref(), Some("bob@example.com"));

        assert_eq!(LeadSubmission::list_for_agent(&store, &agent.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_or_inactive_lead_submissions_are_rejected() {
        let (store, agent) = setup().await;
        let action = AgentAction::create(&store, &agent, leads_form()).await.unwrap();

        let draft = AgentAction::submit_lead(&store, &action.id, answers(&[("name", "Bob")]), LeadOrigin::default()).await;
        assert!(matches!(draft, Err(AppError::NotFound(_))));

        activate(&store, &action).await;
        let missing = AgentAction::submit_lead(&store, &action.id, answers(&[("name", "Bob")]), LeadOrigin::default())
            .await
            .unwrap_err();
        assert!(matches!(missing, AppError::Validation(ref m) if m == "Email is required"));

        let malformed = AgentAction::submit_lead(
            &store,
            &action.id,
            answers(&[("name", "Bob"), ("email", "bob@")]),
            LeadOrigin::default(),
        )
        .await;
        assert!(matches!(malformed, Err(AppError::Validation(_))));
        assert_eq!(store.document_count(Collection::LeadSubmissions), 0);
    }

    #[tokio::test]
    async fn delete_removes_collected_leads() {
        let (store, agent) = setup().await;
        let action = AgentAction::create(&store, &agent, leads_form()).await.unwrap();
        activate(&store, &action).await;
        AgentAction::submit_lead(
            &store,
            &action.id,
            answers(&[("name", "Bob"), ("email", "bob@example.com")]),
            LeadOrigin::default(),
        )
        .await
        .unwrap();

        let removed = AgentAction::delete(&store, &agent.id, &action.id).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.document_count(Collection::AgentActions), 0);
        assert_eq!(store.document_count(Collection::LeadSubmissions), 0);
    }
}
