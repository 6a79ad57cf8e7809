use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::agent::Agent;
use crate::models::conversation::Conversation;
use crate::models::overlay;
use crate::store::{self, encode, Collection, Direction, DocumentStore, Patch, Query, StoreError, Write};

const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum WidgetKind {
    #[default]
    ChatWidget,
    HelpPage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct Appearance {
    pub widget_title: String,
    pub welcome_message: String,
    pub placeholder: String,
    pub primary_color: String,
    pub position: String,
    pub theme: String,
    pub suggested_messages: Vec<String>,
    pub collect_feedback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_picture_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_icon_url: Option<String>,
    pub chat_bubble_alignment: String,
}

impl Default for Appearance {
    fn default() -> Self {
        Appearance {
            widget_title: "Chat with us".to_string(),
            welcome_message: "Hi! How can we help you today?".to_string(),
            placeholder: "Type your message...".to_string(),
            primary_color: "#3b82f6".to_string(),
            position: "bottom-right".to_string(),
            theme: "light".to_string(),
            suggested_messages: Vec::new(),
            collect_feedback: true,
            footer_message: None,
            profile_picture_url: None,
            chat_icon_url: None,
            chat_bubble_alignment: "right".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DayHours {
    pub enabled: bool,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct BusinessHours {
    pub enabled: bool,
    pub timezone: String,
    pub schedule: BTreeMap<String, DayHours>,
    pub offline_message: String,
}

impl Default for BusinessHours {
    fn default() -> Self {
        let schedule = WEEKDAYS
            .iter()
            .enumerate()
            .map(|(i, day)| {
                (
                    day.to_string(),
                    DayHours {
                        enabled: i < 5,
                        start: "09:00".to_string(),
                        end: "17:00".to_string(),
                    },
                )
            })
            .collect();
        BusinessHours {
            enabled: false,
            timezone: "UTC".to_string(),
            schedule,
            offline_message: "We're currently offline. Leave a message and we'll get back to you.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactCollection {
    pub collect_name: bool,
    pub collect_email: bool,
    pub collect_phone: bool,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct WidgetAi {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub fallback_to_human: bool,
}

impl Default for WidgetAi {
    fn default() -> Self {
        WidgetAi {
            instructions: None,
            model: None,
            temperature: 0.7,
            max_tokens: 500,
            fallback_to_human: true,
        }
    }
}

/// A deployable chat surface of an agent, stored in `agentChannels`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Widget {
    #[serde(default)]
    pub id: String,
    pub agent_id: String,
    pub workspace_id: String,
    #[serde(rename = "type", default)]
    pub kind: WidgetKind,
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub appearance: Appearance,
    #[serde(default)]
    pub business_hours: BusinessHours,
    #[serde(default)]
    pub contact_collection: ContactCollection,
    #[serde(default)]
    pub ai: WidgetAi,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Default for Widget {
    fn default() -> Self {
        Widget {
            id: Uuid::new_v4().to_string(),
            agent_id: String::new(),
            workspace_id: String::new(),
            kind: WidgetKind::ChatWidget,
            name: String::new(),
            is_active: true,
            appearance: Appearance::default(),
            business_hours: BusinessHours::default(),
            contact_collection: ContactCollection::default(),
            ai: WidgetAi::default(),
            created_at: 0,
            updated_at: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateWidget {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<WidgetKind>,
    #[serde(default)]
    pub appearance: Option<Value>,
    #[serde(default)]
    pub business_hours: Option<Value>,
    #[serde(default)]
    pub contact_collection: Option<Value>,
    #[serde(default)]
    pub ai: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWidget {
    pub name: Option<String>,
    pub is_active: Option<bool>,
    pub appearance: Option<Value>,
    pub business_hours: Option<Value>,
    pub contact_collection: Option<Value>,
    pub ai: Option<Value>,
}

/// List row with the number of conversations the widget has started.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSummary {
    #[serde(flatten)]
    pub widget: Widget,
    pub total_conversations: usize,
}

fn merge_section<T>(current: &T, update: Option<Value>, what: &str) -> AppResult<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    match update {
        Some(update) => overlay(current, update, what),
        None => Ok(current.clone()),
    }
}

fn validate_hours(hours: &BusinessHours) -> AppResult<()> {
    for (day, slot) in &hours.schedule {
        if !WEEKDAYS.contains(&day.as_str()) {
            return Err(AppError::Validation(format!("Unknown weekday {}", day)));
        }
        if slot.enabled && slot.start >= slot.end {
            return Err(AppError::Validation(format!("Opening hours for {} end before they start", day)));
        }
    }
    Ok(())
}

fn to_value<T: Serialize>(value: &T) -> AppResult<Value> {
    Ok(serde_json::to_value(value).map_err(StoreError::from)?)
}

impl Widget {
    pub async fn create(store: &dyn DocumentStore, agent: &Agent, data: CreateWidget) -> AppResult<Self> {
        let name = data.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation("Widget name is required".to_string()));
        }

        let base = Widget::default();
        let widget = Widget {
            agent_id: agent.id.clone(),
            workspace_id: agent.workspace_id.clone(),
            kind: data.kind.unwrap_or_default(),
            name,
            appearance: merge_section(&base.appearance, data.appearance, "appearance")?,
            business_hours: merge_section(&base.business_hours, data.business_hours, "businessHours")?,
            contact_collection: merge_section(&base.contact_collection, data.contact_collection, "contactCollection")?,
            ai: merge_section(&base.ai, data.ai, "ai")?,
            ..base
        };
        validate_hours(&widget.business_hours)?;

        store
            .commit(vec![Write::create(Collection::AgentChannels, &widget.id, encode(&widget)?)])
            .await?;
        info!("Widget {} created for agent {}", widget.id, agent.id);
        Self::get_for_agent(store, &agent.id, &widget.id).await
    }

    pub async fn get_for_agent(store: &dyn DocumentStore, agent_id: &str, id: &str) -> AppResult<Self> {
        store::fetch::<Widget>(store, Collection::AgentChannels, id)
            .await?
            .filter(|w| w.agent_id == agent_id)
            .ok_or_else(|| AppError::NotFound("Widget".to_string()))
    }

    pub async fn count_for_agent(store: &dyn DocumentStore, agent_id: &str) -> AppResult<usize> {
        Ok(store
            .query(&Query::new(Collection::AgentChannels).filter("agentId", agent_id))
            .await?
            .len())
    }

    pub async fn list_for_agent(store: &dyn DocumentStore, agent_id: &str) -> AppResult<Vec<WidgetSummary>> {
        let widgets: Vec<Widget> = store::fetch_all(
            store,
            &Query::new(Collection::AgentChannels)
                .filter("agentId", agent_id)
                .order_by("createdAt", Direction::Desc),
        )
        .await?;

        let mut summaries = Vec::with_capacity(widgets.len());
        for widget in widgets {
            let total_conversations = Conversation::count_for_widget(store, &widget.id).await?;
            summaries.push(WidgetSummary {
                widget,
                total_conversations,
            });
        }
        debug!("Listed {} widgets for agent {}", summaries.len(), agent_id);
        Ok(summaries)
    }

    pub async fn update(store: &dyn DocumentStore, agent_id: &str, id: &str, data: UpdateWidget) -> AppResult<Self> {
        let current = Self::get_for_agent(store, agent_id, id).await?;

        let mut patch = Patch::new().set_opt("isActive", data.is_active);
        if let Some(name) = data.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(AppError::Validation("Widget name is required".to_string()));
            }
            patch = patch.set("name", name);
        }
        if data.appearance.is_some() {
            patch = patch.set("appearance", to_value(&merge_section(&current.appearance, data.appearance, "appearance")?)?);
        }
        if data.business_hours.is_some() {
            let hours = merge_section(&current.business_hours, data.business_hours, "businessHours")?;
            validate_hours(&hours)?;
            patch = patch.set("businessHours", to_value(&hours)?);
        }
        if data.contact_collection.is_some() {
            let contact = merge_section(&current.contact_collection, data.contact_collection, "contactCollection")?;
            patch = patch.set("contactCollection", to_value(&contact)?);
        }
        if data.ai.is_some() {
            patch = patch.set("ai", to_value(&merge_section(&current.ai, data.ai, "ai")?)?);
        }

        store
            .commit(vec![Write::update(Collection::AgentChannels, id, patch)])
            .await?;
        Self::get_for_agent(store, agent_id, id).await
    }

    pub async fn toggle(store: &dyn DocumentStore, agent_id: &str, id: &str) -> AppResult<Self> {
        let current = Self::get_for_agent(store, agent_id, id).await?;
        store
            .commit(vec![Write::update(
                Collection::AgentChannels,
                id,
                Patch::new().set("isActive", !current.is_active),
            )])
            .await?;
        info!("Widget {} is now {}", id, if current.is_active { "inactive" } else { "active" });
        Self::get_for_agent(store, agent_id, id).await
    }

    /// Conversations started through the widget are kept.
    pub async fn delete(store: &dyn DocumentStore, agent_id: &str, id: &str) -> AppResult<()> {
        Self::get_for_agent(store, agent_id, id).await?;
        store
            .commit(vec![Write::delete(Collection::AgentChannels, id)])
            .await?;
        info!("Widget {} deleted", id);
        Ok(())
    }

    pub async fn duplicate(store: &dyn DocumentStore, agent_id: &str, id: &str) -> AppResult<Self> {
        let mut copy = Self::get_for_agent(store, agent_id, id).await?;
        copy.id = Uuid::new_v4().to_string();
        copy.name = format!("{} (Copy)", copy.name);
        copy.is_active = true;
        store
            .commit(vec![Write::create(Collection::AgentChannels, &copy.id, encode(&copy)?)])
            .await?;
        info!("Widget {} duplicated as {}", id, copy.id);
        Self::get_for_agent(store, agent_id, &copy.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::agent::CreateAgent;
    use crate::models::conversation::NewConversation;
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

    fn named(name: &str) -> CreateWidget {
        CreateWidget {
            name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_merges_partial_appearance() {
        let (store, agent) = setup().await;
        let widget = Widget::create(
            &store,
            &agent,
            CreateWidget {
                appearance: Some(json!({"primaryColor": "#ff0000"})),
                ..named("Site chat")
            },
        )
        .await
        .unwrap();
        assert!(widget.is_active);
        assert_eq!(widget.kind, WidgetKind::ChatWidget);
        assert_eq!(widget.appearance.primary_color, "#ff0000");
        assert_eq!(widget.appearance.placeholder, "Type your message...");
        assert_eq!(widget.business_hours.schedule.len(), 7);
    }

    #[tokio::test]
    async fn list_reports_real_conversation_counts() {
        let (store, agent) = setup().await;
        let busy = Widget::create(&store, &agent, named("Busy")).await.unwrap();
        let quiet = Widget::create(&store, &agent, named("Quiet")).await.unwrap();
        for _ in 0..2 {
            Conversation::create(
                &store,
                &agent,
                NewConversation {
                    widget_id: Some(busy.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        let summaries = Widget::list_for_agent(&store, &agent.id).await.unwrap();
        let counts: Vec<_> = summaries
            .iter()
            .map(|s| (s.widget.id.clone(), s.total_conversations))
            .collect();
        assert_eq!(counts, vec![(quiet.id, 0), (busy.id, 2)]);
    }

    #[tokio::test]
    async fn toggle_and_duplicate() {
        let (store, agent) = setup().await;
        let widget = Widget::create(&store, &agent, named("Site chat")).await.unwrap();

        let off = Widget::toggle(&store, &agent.id, &widget.id).await.unwrap();
        assert!(!off.is_active);

        let copy = Widget::duplicate(&store, &agent.id, &widget.id).await.unwrap();
        assert_eq!(copy.name, "Site chat (Copy)");
        assert!(copy.is_active);
        assert_ne!(copy.id, widget.id);
    }

    #[tokio::test]
    async fn inverted_hours_are_rejected() {
        let (store, agent) = setup().await;
        let widget = Widget::create(&store, &agent, named("Site chat")).await.unwrap();
        let err = Widget::update(
            &store,
            &agent.id,
            &widget.id,
            UpdateWidget {
                business_hours: Some(json!({
                    "schedule": {"monday": {"enabled": true, "start": "18:00", "end": "09:00"}}
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
