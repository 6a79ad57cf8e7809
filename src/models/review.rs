use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::{self, encode, Collection, Direction, DocumentStore, Patch, Query, StoreError, Write};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Textarea,
    Rating,
    Select,
    Checkbox,
    Email,
    Phone,
    Date,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReviewField {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FieldType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_rating: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rating: Option<u32>,
    #[serde(default)]
    pub order: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ReviewFormSettings {
    pub allow_anonymous: bool,
    pub require_email: bool,
    pub show_progress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    pub thank_you_message: String,
    pub collect_location: bool,
    pub collect_device_info: bool,
}

impl Default for ReviewFormSettings {
    fn default() -> Self {
        ReviewFormSettings {
            allow_anonymous: true,
            require_email: false,
            show_progress: true,
            redirect_url: None,
            thank_you_message: "Thank you for your feedback!".to_string(),
            collect_location: false,
            collect_device_info: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReviewForm {
    #[serde(default)]
    pub id: String,
    pub workspace_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub fields: Vec<ReviewField>,
    #[serde(default)]
    pub settings: ReviewFormSettings,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReviewFormInput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fields: Vec<ReviewField>,
    #[serde(default)]
    pub settings: Option<ReviewFormSettings>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReviewForm {
    pub title: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub fields: Option<Vec<ReviewField>>,
    pub settings: Option<ReviewFormSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    pub user_agent: Option<String>,
    pub platform: Option<String>,
    pub browser: Option<String>,
    pub screen_resolution: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct Location {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct Respondent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponse {
    pub field_id: String,
    pub value: Value,
    #[serde(default)]
    pub field_type: Option<FieldType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSubmission {
    #[serde(default)]
    pub id: String,
    pub form_id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub respondent: Respondent,
    pub responses: Vec<ReviewResponse>,
    pub is_anonymous: bool,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReview {
    pub responses: Vec<ReviewResponse>,
    #[serde(default)]
    pub respondent: Respondent,
}

#[derive(Debug, Clone, Serialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldAnalytics {
    pub field_id: String,
    pub field_label: String,
    pub field_type: FieldType,
    pub response_count: usize,
    pub average_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, ToSchema)]
pub struct LocationStat {
    pub country: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, ToSchema)]
pub struct DeviceStat {
    pub platform: String,
    pub browser: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, ToSchema)]
pub struct TimeStat {
    pub date: String,
    pub submissions: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReviewAnalytics {
    pub total_submissions: usize,
    pub completion_rate: f64,
    pub average_rating: f64,
    pub field_analytics: Vec<FieldAnalytics>,
    pub location_stats: Vec<LocationStat>,
    pub device_stats: Vec<DeviceStat>,
    pub time_stats: Vec<TimeStat>,
}

const UNKNOWN: &str = "Unknown";

/// Assigns field ids and positions in list order.
fn prepare_fields(fields: Vec<ReviewField>) -> AppResult<Vec<ReviewField>> {
    fields
        .into_iter()
        .enumerate()
        .map(|(order, mut field)| {
            if field.label.trim().is_empty() {
                return Err(AppError::Validation(format!("Field {} needs a label", order + 1)));
            }
            if matches!(field.kind, FieldType::Select | FieldType::Checkbox) && field.options.is_empty() {
                return Err(AppError::Validation(format!("Field \"{}\" needs options", field.label)));
            }
            if field.id.is_empty() {
                field.id = format!("field_{}", Uuid::new_v4().simple());
            }
            field.order = order;
            Ok(field)
        })
        .collect()
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

impl ReviewForm {
    pub async fn create(store: &dyn DocumentStore, workspace_id: &str, data: ReviewFormInput) -> AppResult<Self> {
        let title = data.title.trim().to_string();
        if title.is_empty() {
            return Err(AppError::Validation("Form title is required".to_string()));
        }
        let form = ReviewForm {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            title,
            description: data.description,
            is_active: true,
            fields: prepare_fields(data.fields)?,
            settings: data.settings.unwrap_or_default(),
            created_at: 0,
            updated_at: 0,
        };
        store
            .commit(vec![Write::create(Collection::ReviewForms, &form.id, encode(&form)?)])
            .await?;
        info!("Review form {} created in {}", form.id, workspace_id);
        Self::get_in_workspace(store, workspace_id, &form.id).await
    }

    pub async fn get(store: &dyn DocumentStore, id: &str) -> AppResult<Option<Self>> {
        Ok(store::fetch(store, Collection::ReviewForms, id).await?)
    }

    pub async fn get_in_workspace(store: &dyn DocumentStore, workspace_id: &str, id: &str) -> AppResult<Self> {
        Self::get(store, id)
            .await?
            .filter(|f| f.workspace_id == workspace_id)
            .ok_or_else(|| AppError::NotFound("Review form".to_string()))
    }

    pub async fn list(store: &dyn DocumentStore, workspace_id: &str) -> AppResult<Vec<Self>> {
        Ok(store::fetch_all(
            store,
            &Query::new(Collection::ReviewForms)
                .filter("workspaceId", workspace_id)
                .order_by("createdAt", Direction::Desc),
        )
        .await?)
    }

    pub async fn update(
        store: &dyn DocumentStore,
        workspace_id: &str,
        id: &str,
        data: UpdateReviewForm,
    ) -> AppResult<Self> {
        Self::get_in_workspace(store, workspace_id, id).await?;
        let mut patch = Patch::new()
            .set_opt("description", data.description)
            .set_opt("isActive", data.is_active);
        if let Some(title) = data.title {
            let title = title.trim().to_string();
            if title.is_empty() {
                return Err(AppError::Validation("Form title is required".to_string()));
            }
            patch = patch.set("title", title);
        }
        if let Some(fields) = data.fields {
            let fields = serde_json::to_value(prepare_fields(fields)?).map_err(StoreError::from)?;
            patch = patch.set("fields", fields);
        }
        if let Some(settings) = data.settings {
            patch = patch.set("settings", serde_json::to_value(settings).map_err(StoreError::from)?);
        }
        store
            .commit(vec![Write::update(Collection::ReviewForms, id, patch)])
            .await?;
        Self::get_in_workspace(store, workspace_id, id).await
    }

    /// Removes the form and its submissions together.
    pub async fn delete(store: &dyn DocumentStore, workspace_id: &str, id: &str) -> AppResult<()> {
        Self::get_in_workspace(store, workspace_id, id).await?;
        let mut writes: Vec<Write> = store
            .query(&Query::new(Collection::ReviewSubmissions).filter("formId", id))
            .await?
            .iter()
            .map(|doc| Write::delete(Collection::ReviewSubmissions, &doc.id))
            .collect();
        writes.push(Write::delete(Collection::ReviewForms, id));
        store.commit(writes).await?;
        info!("Review form {} deleted", id);
        Ok(())
    }

    /// Public submission. Rejects inactive forms, missing required answers
    /// and a missing email when the form requires one.
    pub async fn submit(store: &dyn DocumentStore, id: &str, data: SubmitReview) -> AppResult<ReviewSubmission> {
        let form = Self::get(store, id)
            .await?
            .ok_or_else(|| AppError::NotFound("Review form".to_string()))?;
        if !form.is_active {
            return Err(AppError::Validation("Review form is not active".to_string()));
        }

        let email = data.respondent.email.as_deref().map(str::trim).filter(|e| !e.is_empty());
        if form.settings.require_email && email.is_none() {
            return Err(AppError::Validation("Email is required".to_string()));
        }
        for field in form.fields.iter().filter(|f| f.required) {
            let answered = data
                .responses
                .iter()
                .any(|r| r.field_id == field.id && !is_blank(&r.value));
            if !answered {
                return Err(AppError::Validation(format!("\"{}\" is required", field.label)));
            }
        }

        let responses: Vec<ReviewResponse> = data
            .responses
            .into_iter()
            .filter_map(|r| {
                let field = form.fields.iter().find(|f| f.id == r.field_id)?;
                Some(ReviewResponse {
                    field_type: Some(field.kind),
                    ..r
                })
            })
            .collect();

        let is_anonymous = email.is_none() && data.respondent.name.as_deref().map_or(true, |n| n.trim().is_empty());
        if is_anonymous && !form.settings.allow_anonymous {
            return Err(AppError::Validation("Please tell us who you are".to_string()));
        }

        let mut respondent = data.respondent;
        if !form.settings.collect_device_info {
            respondent.device = None;
        }
        let submission = ReviewSubmission {
            id: Uuid::new_v4().to_string(),
            form_id: form.id.clone(),
            workspace_id: form.workspace_id.clone(),
            respondent,
            responses,
            is_anonymous,
            created_at: 0,
        };
        store
            .commit(vec![Write::create(
                Collection::ReviewSubmissions,
                &submission.id,
                encode(&submission)?,
            )])
            .await?;
        debug!("Review submission {} for form {}", submission.id, form.id);

        store::fetch(store, Collection::ReviewSubmissions, &submission.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("submission {}", submission.id)))
    }

    pub async fn submissions(store: &dyn DocumentStore, form_id: &str) -> AppResult<Vec<ReviewSubmission>> {
        Ok(store::fetch_all(
            store,
            &Query::new(Collection::ReviewSubmissions)
                .filter("formId", form_id)
                .order_by("createdAt", Direction::Desc),
        )
        .await?)
    }

    pub async fn analytics(store: &dyn DocumentStore, workspace_id: &str, id: &str) -> AppResult<ReviewAnalytics> {
        let form = Self::get_in_workspace(store, workspace_id, id).await?;
        let submissions = Self::submissions(store, id).await?;
        Ok(analyze(&form, &submissions))
    }
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Aggregates submissions. Every stored submission counts as complete.
pub fn analyze(form: &ReviewForm, submissions: &[ReviewSubmission]) -> ReviewAnalytics {
    let ratings: Vec<f64> = submissions
        .iter()
        .flat_map(|s| &s.responses)
        .filter(|r| r.field_type == Some(FieldType::Rating))
        .filter_map(|r| r.value.as_f64())
        .collect();

    let field_analytics = form
        .fields
        .iter()
        .map(|field| {
            let values: Vec<&Value> = submissions
                .iter()
                .filter_map(|s| s.responses.iter().find(|r| r.field_id == field.id))
                .map(|r| &r.value)
                .collect();
            let average_value = if field.kind == FieldType::Rating {
                average(&values.iter().filter_map(|v| v.as_f64()).collect::<Vec<_>>())
            } else {
                None
            };
            FieldAnalytics {
                field_id: field.id.clone(),
                field_label: field.label.clone(),
                field_type: field.kind,
                response_count: values.len(),
                average_value,
            }
        })
        .collect();

    let mut countries: BTreeMap<String, usize> = BTreeMap::new();
    let mut devices: BTreeMap<(String, String), usize> = BTreeMap::new();
    let mut days: BTreeMap<String, usize> = BTreeMap::new();
    for submission in submissions {
        let country = submission
            .respondent
            .location
            .as_ref()
            .and_then(|l| l.country.clone())
            .unwrap_or_else(|| UNKNOWN.to_string());
        *countries.entry(country).or_default() += 1;

        let device = submission.respondent.device.clone().unwrap_or_default();
        let key = (
            device.platform.unwrap_or_else(|| UNKNOWN.to_string()),
            device.browser.unwrap_or_else(|| UNKNOWN.to_string()),
        );
        *devices.entry(key).or_default() += 1;

        if let Some(day) = Utc.timestamp_millis_opt(submission.created_at).single() {
            *days.entry(day.format("%Y-%m-%d").to_string()).or_default() += 1;
        }
    }

    ReviewAnalytics {
        total_submissions: submissions.len(),
        completion_rate: 100.0,
        average_rating: average(&ratings).unwrap_or(0.0),
        field_analytics,
        location_stats: countries
            .into_iter()
            .map(|(country, count)| LocationStat { country, count })
            .collect(),
        device_stats: devices
            .into_iter()
            .map(|((platform, browser), count)| DeviceStat { platform, browser, count })
            .collect(),
        time_stats: days
            .into_iter()
            .map(|(date, submissions)| TimeStat { date, submissions })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn field(kind: FieldType, label: &str, required: bool) -> ReviewField {
        ReviewField {
            id: String::new(),
            kind,
            label: label.into(),
            placeholder: None,
            required,
            options: Vec::new(),
            min_rating: None,
            max_rating: None,
            order: 0,
        }
    }

    async fn form(store: &MemoryStore) -> ReviewForm {
        ReviewForm::create(
            store,
            "w1",
            ReviewFormInput {
                title: "How did we do?".into(),
                fields: vec![
                    field(FieldType::Rating, "Overall", true),
                    field(FieldType::Textarea, "Comments", false),
                ],
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    fn answer(form: &ReviewForm, rating: Value, browser: Option<&str>) -> SubmitReview {
        SubmitReview {
            responses: vec![ReviewResponse {
                field_id: form.fields[0].id.clone(),
                value: rating,
                field_type: None,
            }],
            respondent: Respondent {
                device: browser.map(|b| DeviceInfo {
                    platform: Some("MacIntel".into()),
                    browser: Some(b.into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn fields_get_ids_and_order() {
        let store = MemoryStore::new();
        let form = form(&store).await;
        assert!(form.is_active);
        assert!(form.fields.iter().all(|f| f.id.starts_with("field_")));
        assert_eq!(form.fields[1].order, 1);
    }

    #[tokio::test]
    async fn required_field_is_enforced() {
        let store = MemoryStore::new();
        let form = form(&store).await;
        let err = ReviewForm::submit(&store, &form.id, answer(&form, json!(""), None)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(store.document_count(Collection::ReviewSubmissions), 0);
    }

    #[tokio::test]
    async fn analytics_aggregate_ratings_and_devices() {
        let store = MemoryStore::new();
        let form = form(&store).await;
        ReviewForm::submit(&store, &form.id, answer(&form, json!(5), Some("Chrome"))).await.unwrap();
        ReviewForm::submit(&store, &form.id, answer(&form, json!(3), Some("Chrome"))).await.unwrap();
        ReviewForm::submit(&store, &form.id, answer(&form, json!(4), None)).await.unwrap();

        let stats = ReviewForm::analytics(&store, "w1", &form.id).await.unwrap();
        assert_eq!(stats.total_submissions, 3);
        assert_eq!(stats.completion_rate, 100.0);
        assert_eq!(stats.average_rating, 4.0);
        assert_eq!(stats.field_analytics[0].response_count, 3);
        assert_eq!(stats.field_analytics[0].average_value, Some(4.0));
        assert_eq!(stats.field_analytics[1].response_count, 0);
        assert_eq!(
            stats.location_stats,
            vec![LocationStat { country: "Unknown".into(), count: 3 }]
        );
        assert_eq!(
            stats.device_stats,
            vec![
                DeviceStat { platform: "MacIntel".into(), browser: "Chrome".into(), count: 2 },
                DeviceStat { platform: "Unknown".into(), browser: "Unknown".into(), count: 1 },
            ]
        );
        assert_eq!(stats.time_stats.iter().map(|t| t.submissions).sum::<usize>(), 3);
    }

    #[tokio::test]
    async fn inactive_form_rejects_submissions() {
        let store = MemoryStore::new();
        let form = form(&store).await;
        ReviewForm::update(
            &store,
            "w1",
            &form.id,
            UpdateReviewForm {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let result = ReviewForm::submit(&store, &form.id, answer(&form, json!(5), None)).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
