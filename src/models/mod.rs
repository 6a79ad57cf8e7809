pub mod action;
pub mod agent;
pub mod conversation;
pub mod invite;
pub mod knowledge;
pub mod member;
pub mod message;
pub mod review;
pub mod widget;
pub mod workspace;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::store::StoreError;

pub use action::{AgentAction, LeadSubmission};
pub use agent::Agent;
pub use conversation::Conversation;
pub use invite::WorkspaceInvite;
pub use knowledge::{KnowledgeItem, VectorDeletion};
pub use member::WorkspaceMember;
pub use message::Message;
pub use review::ReviewForm;
pub use widget::Widget;
pub use workspace::Workspace;

/// Overlays the keys of a partial JSON object on a typed value and reads it
/// back, so a partial update can never store a malformed nested object.
pub(crate) fn overlay<T>(current: &T, update: Value, what: &str) -> AppResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let Value::Object(changes) = update else {
        return Err(AppError::Validation(format!("{} must be an object", what)));
    };
    let mut merged = serde_json::to_value(current).map_err(StoreError::from)?;
    if let Value::Object(map) = &mut merged {
        map.extend(changes);
    }
    serde_json::from_value(merged).map_err(|e| AppError::Validation(format!("Invalid {}: {}", what, e)))
}
