use std::collections::BTreeSet;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{
    apply_write, Collection, Direction, Document, DocumentStore, Query, StoreError, Subscription,
    Write, CREATED_AT, UPDATED_AT,
};

const CHANNEL: &str = "document_changes";

/// Documents live in a single JSONB table keyed by `(collection, id)`.
/// Commits publish the touched collection names on `document_changes`,
/// which is what live queries listen on.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        info!("Document store migrations applied");
        Ok(())
    }
}

fn select_sql(query: &Query) -> QueryBuilder<'static, Postgres> {
    let containment: Map<String, Value> = query.filters.iter().cloned().collect();

    let mut builder = QueryBuilder::new("SELECT id, data FROM documents WHERE collection = ");
    builder.push_bind(query.collection.as_str());
    builder.push(" AND data @> ");
    builder.push_bind(Json(Value::Object(containment)));

    match &query.order {
        Some((field, direction)) => {
            builder.push(" ORDER BY data -> ");
            builder.push_bind(field.clone());
            builder.push(match direction {
                Direction::Asc => "::text ASC NULLS LAST, id ASC",
                Direction::Desc => "::text DESC NULLS LAST, id ASC",
            });
        }
        None => {
            builder.push(" ORDER BY id ASC");
        }
    }
    if let Some(limit) = query.limit {
        builder.push(" LIMIT ");
        builder.push_bind(limit as i64);
    }
    builder
}

async fn run_query(pool: &PgPool, query: &Query) -> Result<Vec<Document>, StoreError> {
    let start = Instant::now();

    let mut builder = select_sql(query);
    let rows = builder
        .build_query_as::<(String, Json<Value>)>()
        .fetch_all(pool)
        .await?;

    debug!(
        "Query on {} returned {} documents in {:?}",
        query.collection,
        rows.len(),
        start.elapsed()
    );
    Ok(rows
        .into_iter()
        .map(|(id, Json(data))| Document { id, data })
        .collect())
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query_as::<_, (String, Json<Value>)>(
            r#"
            SELECT id, data FROM documents
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(collection.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, Json(data))| Document { id, data }))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        run_query(&self.pool, query).await
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut touched = BTreeSet::new();

        for write in &writes {
            let existing = sqlx::query_as::<_, (Json<Value>,)>(
                r#"
                SELECT data FROM documents
                WHERE collection = $1 AND id = $2
                FOR UPDATE
                "#,
            )
            .bind(write.collection().as_str())
            .bind(write.id())
            .fetch_optional(&mut *tx)
            .await?
            .map(|(Json(data),)| data);

            match apply_write(existing.as_ref(), write, now)? {
                // A row that does not exist yet cannot be locked, so a
                // concurrent create only loses at the primary key.
                Some(data) if matches!(write, Write::Create { .. }) => {
                    let inserted = sqlx::query(
                        r#"
                        INSERT INTO documents (collection, id, data, created_at, updated_at)
                        VALUES ($1, $2, $3, $4, $4)
                        ON CONFLICT (collection, id) DO NOTHING
                        "#,
                    )
                    .bind(write.collection().as_str())
                    .bind(write.id())
                    .bind(Json(&data))
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    if inserted.rows_affected() == 0 {
                        return Err(StoreError::AlreadyExists {
                            collection: write.collection(),
                            id: write.id().to_string(),
                        });
                    }
                }
                Some(data) => {
                    let created_at = data.get(CREATED_AT).and_then(Value::as_i64).unwrap_or(now);
                    let updated_at = data.get(UPDATED_AT).and_then(Value::as_i64).unwrap_or(now);
                    sqlx::query(
                        r#"
                        INSERT INTO documents (collection, id, data, created_at, updated_at)
                        VALUES ($1, $2, $3, $4, $5)
                        ON CONFLICT (collection, id)
                        DO UPDATE SET data = EXCLUDED.data, updated_at = EXCLUDED.updated_at
                        "#,
                    )
                    .bind(write.collection().as_str())
                    .bind(write.id())
                    .bind(Json(&data))
                    .bind(created_at)
                    .bind(updated_at)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
                        .bind(write.collection().as_str())
                        .bind(write.id())
                        .execute(&mut *tx)
                        .await?;
                }
            }
            touched.insert(write.collection().as_str());
        }

        for collection in &touched {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(CHANNEL)
                .bind(*collection)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!("Committed {} writes across {:?}", writes.len(), touched);
        Ok(())
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANNEL).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let initial = run_query(&self.pool, &query).await?;
        let _ = sender.send(initial);

        let pool = self.pool.clone();
        let collection = query.collection;
        let handle = tokio::spawn(async move {
            loop {
                let notification = match listener.recv().await {
                    Ok(notification) => notification,
                    Err(e) => {
                        error!("Live query listener failed: {:?}", e);
                        break;
                    }
                };
                if notification.payload() != collection.as_str() {
                    continue;
                }
                match run_query(&pool, &query).await {
                    Ok(snapshot) => {
                        if sender.send(snapshot).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to refresh live query on {}: {:?}", collection, e),
                }
            }
        });

        Ok(Subscription::new(receiver, move || {
            debug!("Detaching live query on {}", collection);
            handle.abort();
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;
    use uuid::Uuid;

    use super::*;
    use crate::models::workspace::{CreateWorkspace, Workspace};
    use crate::store::Patch;

    /// Connects to `TEST_DATABASE_URL`. Tests return early when it is unset.
    async fn test_store() -> Option<PgStore> {
        let url = match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("TEST_DATABASE_URL not set, skipping Postgres test");
                return None;
            }
        };
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(&url)
            .await
            .expect("Failed to connect to Postgres");
        let store = PgStore::new(pool);
        store.migrate().await.unwrap();
        Some(store)
    }

    async fn next(sub: &mut Subscription) -> Vec<Document> {
        tokio::time::timeout(Duration::from_secs(5), sub.next_snapshot())
            .await
            .unwrap()
            .unwrap()
    }

    fn run_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    #[tokio::test]
    async fn filters_and_orders_documents() {
        let Some(store) = test_store().await else { return };
        let run = run_id();
        store
            .commit(vec![
                Write::create(Collection::Agents, &format!("{}-a", run), json!({ "run": run, "rank": 2 })),
                Write::create(Collection::Agents, &format!("{}-b", run), json!({ "run": run, "rank": 1 })),
                Write::create(Collection::Agents, &format!("{}-c", run), json!({ "run": run, "rank": 3 })),
                Write::create(Collection::Agents, &format!("{}-d", run), json!({ "run": "other", "rank": 9 })),
            ])
            .await
            .unwrap();

        let desc = store
            .query(&Query::new(Collection::Agents).filter("run", run.as_str()).order_by("rank", Direction::Desc))
            .await
            .unwrap();
        let ranks: Vec<_> = desc.iter().map(|d| d.data["rank"].as_i64().unwrap()).collect();
        assert_eq!(ranks, vec![3, 2, 1]);

        let top = store
            .query(
                &Query::new(Collection::Agents)
                    .filter("run", run.as_str())
                    .order_by("rank", Direction::Asc)
                    .limit(2),
            )
            .await
            .unwrap();
        let ranks: Vec<_> = top.iter().map(|d| d.data["rank"].as_i64().unwrap()).collect();
        assert_eq!(ranks, vec![1, 2]);
    }

    #[tokio::test]
    async fn limit_without_order_sorts_by_id() {
        let Some(store) = test_store().await else { return };
        let run = run_id();
        store
            .commit(vec![
                Write::create(Collection::WorkspaceInvites, &format!("{}-2", run), json!({ "run": run })),
                Write::create(Collection::WorkspaceInvites, &format!("{}-1", run), json!({ "run": run })),
            ])
            .await
            .unwrap();

        let found = store
            .query(&Query::new(Collection::WorkspaceInvites).filter("run", run.as_str()).limit(1))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, format!("{}-1", run));
    }

    #[tokio::test]
    async fn workspace_is_found_by_slug() {
        let Some(store) = test_store().await else { return };
        let slug = format!("pg-{}", &run_id()[..12]);
        let created = Workspace::create(
            &store,
            "u1",
            "ann@acme.co",
            "Ann",
            CreateWorkspace {
                name: "Acme".to_string(),
                url: slug.clone(),
                description: None,
                settings: None,
            },
        )
        .await
        .unwrap();

        let found = Workspace::get_by_slug(&store, &slug).await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert!(Workspace::slug_exists(&store, &slug).await.unwrap());
    }

    #[tokio::test]
    async fn update_of_missing_document_fails() {
        let Some(store) = test_store().await else { return };
        let result = store
            .commit(vec![Write::update(Collection::Agents, &run_id(), Patch::new().set("name", "x"))])
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn create_conflict_rolls_back_the_batch() {
        let Some(store) = test_store().await else { return };
        let run = run_id();
        store
            .commit(vec![Write::create(Collection::Agents, &run, json!({ "name": "first" }))])
            .await
            .unwrap();

        let other = format!("{}-other", run);
        let result = store
            .commit(vec![
                Write::create(Collection::Agents, &other, json!({ "name": "y" })),
                Write::create(Collection::Agents, &run, json!({ "name": "dup" })),
            ])
            .await;
        assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));
        assert!(store.get(Collection::Agents, &other).await.unwrap().is_none());
        let kept = store.get(Collection::Agents, &run).await.unwrap().unwrap();
        assert_eq!(kept.data["name"], "first");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_of_one_id_have_a_single_winner() {
        let Some(store) = test_store().await else { return };
        let store = Arc::new(store);
        let slug = run_id();

        let attempts: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let slug = slug.clone();
                tokio::spawn(async move {
                    store
                        .commit(vec![Write::create(
                            Collection::WorkspaceSlugs,
                            &slug,
                            json!({ "workspaceId": format!("w{}", i) }),
                        )])
                        .await
                })
            })
            .collect();

        let mut created = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(()) => created += 1,
                Err(StoreError::AlreadyExists { .. }) => {}
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn subscription_delivers_a_snapshot_per_commit() {
        let Some(store) = test_store().await else { return };
        let run = run_id();
        let query = Query::new(Collection::ReviewSubmissions)
            .filter("run", run.as_str())
            .order_by("createdAt", Direction::Asc);
        let mut sub = store.subscribe(query).await.unwrap();

        assert!(next(&mut sub).await.is_empty());

        store
            .commit(vec![Write::create(Collection::ReviewSubmissions, &format!("{}-1", run), json!({ "run": run }))])
            .await
            .unwrap();
        assert_eq!(next(&mut sub).await.len(), 1);

        store
            .commit(vec![Write::create(Collection::ReviewSubmissions, &format!("{}-2", run), json!({ "run": run }))])
            .await
            .unwrap();
        assert_eq!(next(&mut sub).await.len(), 2);

        sub.unsubscribe();
        assert!(sub.next_snapshot().await.is_none());
    }
}
