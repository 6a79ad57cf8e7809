//! Knowledge-base ingestion: turns a loosely typed submission into a
//! validated [`Submission`], hands it to the AI backend and mirrors the
//! result as a `knowledgeBase` record.

pub mod crawl;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::backend::{FaqRequest, FileUpload, NotionImportRequest, StoreRequest};
use crate::email::Email;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::agent::Agent;
use crate::models::knowledge::{KnowledgeItem, KnowledgeStatus, KnowledgeType};
use crate::storage::BlobStorage;
use crate::store::{Collection, Patch, Write};
use crate::AppState;

use self::crawl::{CommitRequest, CrawlTarget};

pub const FAQ_TITLE_LEN: usize = 50;
pub const UNTITLED: &str = "Untitled";

/// A file picked in the dialog, read fully into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// The dialog payload as the client sends it. Every field is optional;
/// [`SubmissionForm::validate`] decides what the chosen type needs.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionForm {
    #[serde(rename = "type", default)]
    pub kind: KnowledgeType,
    pub title: Option<String>,
    /// Comma separated.
    pub tags: Option<String>,
    pub question: Option<String>,
    pub answer: Option<String>,
    pub url: Option<String>,
    pub max_pages: Option<u32>,
    pub is_sitemap: Option<bool>,
    pub api_key: Option<String>,
    pub page_id: Option<String>,
    pub is_database: Option<bool>,
    pub content: Option<String>,
    #[serde(skip)]
    pub file: Option<UploadedFile>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Faq {
        question: String,
        answer: String,
    },
    Website {
        url: String,
        max_pages: u32,
        is_sitemap: bool,
    },
    Notion {
        api_key: String,
        page_id: String,
        is_database: bool,
    },
    Pdf {
        file: UploadedFile,
    },
    Text {
        file: UploadedFile,
    },
    Manual {
        content: String,
    },
}

impl Submission {
    pub fn kind(&self) -> KnowledgeType {
        match self {
            Submission::Faq { .. } => KnowledgeType::Faq,
            Submission::Website { .. } => KnowledgeType::Website,
            Submission::Notion { .. } => KnowledgeType::Notion,
            Submission::Pdf { .. } => KnowledgeType::Pdf,
            Submission::Text { .. } => KnowledgeType::Text,
            Submission::Manual { .. } => KnowledgeType::Manual,
        }
    }
}

/// A submission that passed validation, with its title resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub title: String,
    pub tags: Vec<String>,
    pub submission: Submission,
}

fn required(value: Option<String>, message: &str) -> AppResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation(message.to_string()))
}

pub fn normalize_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

impl SubmissionForm {
    /// Checks the fields the chosen type needs. Runs before any network
    /// call so an incomplete form never reaches the backend.
    pub fn validate(self) -> AppResult<Draft> {
        let title = self
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let tags = self.tags.as_deref().map(normalize_tags).unwrap_or_default();

        let (submission, fallback_title) = match self.kind {
            KnowledgeType::Faq => {
                let question = required(self.question, "Please enter a question for the FAQ")?;
                let answer = required(self.answer, "Please enter an answer for the FAQ")?;
                let fallback = question.chars().take(FAQ_TITLE_LEN).collect::<String>();
                (Submission::Faq { question, answer }, fallback)
            }
            KnowledgeType::Website => {
                let url = required(self.url, "Please enter a website URL")?;
                let max_pages = self.max_pages.unwrap_or(crawl::MAX_PAGES).clamp(1, crawl::MAX_PAGES);
                (
                    Submission::Website {
                        url: url.clone(),
                        max_pages,
                        is_sitemap: self.is_sitemap.unwrap_or(false),
                    },
                    url,
                )
            }
            KnowledgeType::Notion => {
                let api_key = required(self.api_key, "Please enter your Notion API key")?;
                let page_id = required(
                    self.page_id,
                    "Please select a Notion page or enter a page/database ID",
                )?;
                (
                    Submission::Notion {
                        api_key,
                        page_id,
                        is_database: self.is_database.unwrap_or(false),
                    },
                    UNTITLED.to_string(),
                )
            }
            KnowledgeType::Pdf | KnowledgeType::Text => {
                let file = self.file.filter(|f| !f.bytes.is_empty()).ok_or_else(|| {
                    AppError::Validation(format!(
                        "Please select a {} file to upload",
                        self.kind.as_str().to_uppercase()
                    ))
                })?;
                let fallback = file.file_name.clone();
                let submission = if self.kind == KnowledgeType::Pdf {
                    Submission::Pdf { file }
                } else {
                    Submission::Text { file }
                };
                (submission, fallback)
            }
            KnowledgeType::Manual => {
                let content = required(self.content, "Please enter content for manual entry")?;
                (Submission::Manual { content }, UNTITLED.to_string())
            }
        };

        Ok(Draft {
            title: title.unwrap_or(fallback_title),
            tags,
            submission,
        })
    }
}

/// Tracks which (user, agent) pairs have a submission outstanding.
#[derive(Clone, Default)]
pub struct InFlight {
    active: Arc<Mutex<HashSet<(String, String)>>>,
}

/// Releases its slot when dropped, whether the submission finished or failed.
pub struct InFlightGuard {
    active: Arc<Mutex<HashSet<(String, String)>>>,
    key: (String, String),
}

impl InFlight {
    pub fn acquire(&self, user_id: &str, agent_id: &str) -> AppResult<InFlightGuard> {
        let key = (user_id.to_string(), agent_id.to_string());
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(key.clone()) {
            debug!("Rejecting duplicate submission for agent {}", agent_id);
            return Err(AppError::Conflict(
                "A submission for this agent is already in progress".to_string(),
            ));
        }
        Ok(InFlightGuard {
            active: self.active.clone(),
            key,
        })
    }

    pub fn len(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Embedding settings for new content: the agent's own configuration,
/// or the service defaults when the agent leaves them blank.
pub fn embedding_for(state: &AppState, agent: &Agent) -> (String, String) {
    let pick = |value: &str, fallback: &str| {
        if value.trim().is_empty() {
            fallback.to_string()
        } else {
            value.to_string()
        }
    };
    (
        pick(
            &agent.ai_config.embedding_provider,
            &state.config.default_embedding_provider,
        ),
        pick(&agent.ai_config.embedding_model, &state.config.default_embedding_model),
    )
}

fn file_summary(kind: KnowledgeType, file: &UploadedFile) -> String {
    format!(
        "{} file uploaded: {} ({:.2} MB)",
        kind.as_str().to_uppercase(),
        file.file_name,
        file.size() as f64 / 1024.0 / 1024.0
    )
}

/// A ready record for `agent` carrying the embedding settings in use.
pub fn base_item(
    state: &AppState,
    agent: &Agent,
    kind: KnowledgeType,
    title: &str,
    tags: Vec<String>,
) -> KnowledgeItem {
    let (embedding_provider, embedding_model) = embedding_for(state, agent);
    KnowledgeItem {
        agent_id: agent.id.clone(),
        workspace_id: agent.workspace_id.clone(),
        title: title.to_string(),
        kind,
        tags,
        status: KnowledgeStatus::Ready,
        embedding_provider,
        embedding_model,
        ..Default::default()
    }
}

/// Runs a validated submission end to end and returns the stored record.
pub async fn submit(
    state: &AppState,
    user: &AuthenticatedUser,
    agent: &Agent,
    draft: Draft,
) -> AppResult<KnowledgeItem> {
    let _guard = state.in_flight.acquire(&user.user_id, &agent.id)?;
    let kind = draft.submission.kind();
    info!(
        "Ingesting {} \"{}\" for agent {}",
        kind.as_str(),
        draft.title,
        agent.id
    );

    let base = base_item(state, agent, kind, &draft.title, draft.tags.clone());

    let item = match draft.submission {
        Submission::Faq { question, answer } => {
            let receipt = state
                .backend
                .store_faq(&FaqRequest {
                    agent_id: agent.id.clone(),
                    title: draft.title.clone(),
                    question: question.clone(),
                    answer: answer.clone(),
                    kind: "faq".to_string(),
                    embedding_provider: base.embedding_provider.clone(),
                    embedding_model: base.embedding_model.clone(),
                    widget_id: Some(agent.id.clone()),
                    metadata: json!({
                        "business_id": agent.workspace_id,
                        "tags": draft.tags,
                    }),
                })
                .await?;
            KnowledgeItem {
                content: format!("Q: {}\n\nA: {}", question, answer),
                question: Some(question),
                answer: Some(answer),
                vector_id: receipt.vector_id,
                chunks_created: receipt.chunks_created,
                ..base
            }
        }
        Submission::Website {
            url,
            max_pages,
            is_sitemap,
        } => {
            let preview = crawl::preview(
                &state.backend,
                agent,
                &CrawlTarget {
                    url,
                    title: draft.title.clone(),
                    max_pages,
                    is_sitemap,
                },
            )
            .await?;
            let commit = CommitRequest::from_preview(draft.title.clone(), preview);
            let saved = crawl::commit_chunks(&state.backend, agent, &commit, |progress| {
                debug!(
                    "Saved {}/{} chunks for {}",
                    progress.committed, progress.total, commit.url
                );
            })
            .await?;
            crawl::website_item(base, &commit, saved)
        }
        Submission::Notion {
            api_key,
            page_id,
            is_database,
        } => {
            let request = NotionImportRequest {
                api_key,
                page_id: (!is_database).then(|| page_id.clone()),
                database_id: is_database.then(|| page_id.clone()),
                widget_id: agent.id.clone(),
                title: Some(draft.title.clone()).filter(|t| t != UNTITLED),
                embedding_provider: base.embedding_provider.clone(),
                embedding_model: base.embedding_model.clone(),
                metadata: json!({ "workspace_id": agent.workspace_id }),
            };
            let receipt = if is_database {
                state.backend.notion_import_database(&request).await?
            } else {
                state.backend.notion_import_page(&request).await?
            };
            KnowledgeItem {
                content: receipt.content.clone().unwrap_or_default(),
                notion_page_id: Some(page_id),
                notion_url: receipt.url.clone(),
                is_database: Some(is_database),
                chunks_created: Some(receipt.chunks_created.unwrap_or(0)),
                vector_id: receipt.vector_id,
                ..base
            }
        }
        Submission::Pdf { file } | Submission::Text { file } => {
            upload_file(state, agent, base, file).await?
        }
        Submission::Manual { content } => {
            let item = KnowledgeItem::insert(
                state.store.as_ref(),
                KnowledgeItem { content, ..base },
            )
            .await?;
            return finish(state, user, agent, store_manual(state, item).await?).await;
        }
    };

    let item = KnowledgeItem::insert(state.store.as_ref(), item).await?;
    finish(state, user, agent, item).await
}

async fn upload_file(
    state: &AppState,
    agent: &Agent,
    base: KnowledgeItem,
    file: UploadedFile,
) -> AppResult<KnowledgeItem> {
    let receipt = state
        .backend
        .upload_file(FileUpload {
            file_name: file.file_name.clone(),
            content_type: file.content_type.clone(),
            bytes: file.bytes.clone(),
            agent_id: agent.id.clone(),
            workspace_id: agent.workspace_id.clone(),
            title: base.title.clone(),
            document_type: base.kind.as_str().to_string(),
            embedding_provider: base.embedding_provider.clone(),
            embedding_model: base.embedding_model.clone(),
        })
        .await?;

    let mut file_url = receipt.file_url.clone();
    if let Some(blobs) = &state.blobs {
        let key = BlobStorage::object_key(&agent.workspace_id, &agent.id, &base.id, &file.file_name);
        match blobs.put(&key, file.bytes.clone(), &file.content_type).await {
            Ok(url) => file_url = Some(url),
            Err(e) => warn!("Keeping upload without a stored copy: {}", e),
        }
    }

    Ok(KnowledgeItem {
        content: file_summary(base.kind, &file),
        file_name: Some(file.file_name.clone()),
        file_size: Some(file.size()),
        file_type: Some(file.content_type.clone()),
        file_url,
        vector_id: receipt.vector_id,
        chunks_created: receipt.chunks_created,
        ..base
    })
}

/// Manual entries are recorded first and embedded afterwards. A backend
/// failure leaves the record in place, marked as errored.
async fn store_manual(state: &AppState, item: KnowledgeItem) -> AppResult<KnowledgeItem> {
    let request = StoreRequest {
        id: item.id.clone(),
        workspace_id: item.workspace_id.clone(),
        agent_id: item.agent_id.clone(),
        title: item.title.clone(),
        content: item.content.clone(),
        kind: item.kind.as_str().to_string(),
        website_url: None,
    };

    let patch = match state.backend.store_document(&request, &item.embedding_model).await {
        Ok(receipt) => Patch::new()
            .set_opt("vectorId", receipt.vector_id)
            .set_opt("chunksCreated", receipt.chunks_created),
        Err(e) => {
            warn!("Embedding manual entry {} failed: {}", item.id, e);
            Patch::new().set("status", "error")
        }
    };
    if !patch.is_empty() {
        state
            .store
            .commit(vec![Write::update(Collection::KnowledgeBase, &item.id, patch)])
            .await?;
    }

    KnowledgeItem::get(state.store.as_ref(), &item.id)
        .await?
        .ok_or_else(|| AppError::NotFound("Knowledge item".to_string()))
}

async fn finish(
    state: &AppState,
    user: &AuthenticatedUser,
    agent: &Agent,
    item: KnowledgeItem,
) -> AppResult<KnowledgeItem> {
    let notifier = state.notifier.clone();
    let email = Email::ArticleProcessed {
        email: user.email.clone(),
        user_name: Some(user.display_name()),
        article_title: item.title.clone(),
        article_type: item.kind.as_str().to_string(),
        agent_name: Some(agent.name.clone()),
        chunks_count: item.chunks_created,
    };
    tokio::spawn(async move {
        notifier.send(email).await;
    });
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(kind: KnowledgeType) -> SubmissionForm {
        SubmissionForm {
            kind,
            ..Default::default()
        }
    }

    fn message(result: AppResult<Draft>) -> String {
        match result {
            Err(AppError::Validation(message)) => message,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn tags_are_trimmed_and_empties_dropped() {
        assert_eq!(normalize_tags(" a,  b ,,c "), vec!["a", "b", "c"]);
        assert!(normalize_tags(" , ").is_empty());
    }

    #[test]
    fn faq_requires_both_fields() {
        assert_eq!(
            message(form(KnowledgeType::Faq).validate()),
            "Please enter a question for the FAQ"
        );
        let only_question = SubmissionForm {
            question: Some("What are your hours?".into()),
            answer: Some("   ".into()),
            ..form(KnowledgeType::Faq)
        };
        assert_eq!(
            message(only_question.validate()),
            "Please enter an answer for the FAQ"
        );
    }

    #[test]
    fn faq_title_defaults_to_question_prefix() {
        let question = "How long does shipping take to addresses outside the continental US?";
        let draft = SubmissionForm {
            question: Some(question.into()),
            answer: Some("5-10 days".into()),
            tags: Some("shipping, intl".into()),
            ..form(KnowledgeType::Faq)
        }
        .validate()
        .unwrap();
        assert_eq!(draft.title, question.chars().take(50).collect::<String>());
        assert_eq!(draft.tags, vec!["shipping", "intl"]);
    }

    #[test]
    fn every_type_names_its_missing_field() {
        assert_eq!(message(form(KnowledgeType::Website).validate()), "Please enter a website URL");
        assert_eq!(
            message(form(KnowledgeType::Notion).validate()),
            "Please enter your Notion API key"
        );
        let key_only = SubmissionForm {
            api_key: Some("secret_x".into()),
            ..form(KnowledgeType::Notion)
        };
        assert_eq!(
            message(key_only.validate()),
            "Please select a Notion page or enter a page/database ID"
        );
        assert_eq!(
            message(form(KnowledgeType::Pdf).validate()),
            "Please select a PDF file to upload"
        );
        assert_eq!(
            message(form(KnowledgeType::Text).validate()),
            "Please select a TEXT file to upload"
        );
        assert_eq!(
            message(form(KnowledgeType::Manual).validate()),
            "Please enter content for manual entry"
        );
    }

    #[test]
    fn website_pages_are_capped() {
        let draft = SubmissionForm {
            url: Some("https://acme.co".into()),
            max_pages: Some(5000),
            ..form(KnowledgeType::Website)
        }
        .validate()
        .unwrap();
        assert_eq!(draft.title, "https://acme.co");
        assert_eq!(
            draft.submission,
            Submission::Website {
                url: "https://acme.co".into(),
                max_pages: crawl::MAX_PAGES,
                is_sitemap: false,
            }
        );
    }

    #[test]
    fn file_title_defaults_to_file_name() {
        let draft = SubmissionForm {
            file: Some(UploadedFile {
                file_name: "handbook.pdf".into(),
                content_type: "application/pdf".into(),
                bytes: vec![1; 2048],
            }),
            ..form(KnowledgeType::Pdf)
        }
        .validate()
        .unwrap();
        assert_eq!(draft.title, "handbook.pdf");
        assert_eq!(draft.submission.kind(), KnowledgeType::Pdf);
    }

    #[test]
    fn file_summary_reports_megabytes() {
        let file = UploadedFile {
            file_name: "handbook.pdf".into(),
            content_type: "application/pdf".into(),
            bytes: vec![0; 1_572_864],
        };
        assert_eq!(
            file_summary(KnowledgeType::Pdf, &file),
            "PDF file uploaded: handbook.pdf (1.50 MB)"
        );
    }

    #[test]
    fn in_flight_guard_blocks_until_dropped() {
        let in_flight = InFlight::default();
        let guard = in_flight.acquire("u1", "a1").unwrap();
        assert!(matches!(in_flight.acquire("u1", "a1"), Err(AppError::Conflict(_))));
        assert!(in_flight.acquire("u1", "a2").is_ok());
        drop(guard);
        assert!(in_flight.acquire("u1", "a1").is_ok());
        assert!(in_flight.is_empty());
    }
}
