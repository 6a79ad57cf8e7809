use anyhow::anyhow;
use shuttle_runtime::SecretStore;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub backend_url: String,
    pub dashboard_url: String,
    pub database_url: Option<String>,
    pub loops_api_key: Option<String>,
    pub email_api_url: String,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_price_pro: Option<String>,
    pub stripe_price_enterprise: Option<String>,
    pub aws_region: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub s3_bucket: Option<String>,
    pub default_embedding_provider: String,
    pub default_embedding_model: String,
}

// Secrets win over the process environment.
fn lookup(secret_store: &SecretStore, key: &str) -> Option<String> {
    secret_store
        .get(key)
        .or_else(|| std::env::var(key).ok())
        .filter(|value| !value.trim().is_empty())
}

impl AppConfig {
    pub fn new(secret_store: &SecretStore) -> Result<Self, anyhow::Error> {
        let jwt_secret =
            lookup(secret_store, "JWT_SECRET").ok_or_else(|| anyhow!("JWT_SECRET not found"))?;

        let backend_url = lookup(secret_store, "BACKEND_URL")
            .ok_or_else(|| anyhow!("BACKEND_URL not found"))?
            .trim_end_matches('/')
            .to_string();

        let dashboard_url = lookup(secret_store, "DASHBOARD_URL")
            .unwrap_or_else(|| "http://localhost:3000".to_string());

        let email_api_url = lookup(secret_store, "EMAIL_API_URL")
            .unwrap_or_else(|| "https://app.loops.so/api/v1".to_string());

        Ok(AppConfig {
            jwt_secret,
            backend_url,
            dashboard_url,
            database_url: lookup(secret_store, "DATABASE_URL"),
            loops_api_key: lookup(secret_store, "LOOPS_API_KEY"),
            email_api_url,
            stripe_secret_key: lookup(secret_store, "STRIPE_SECRET_KEY"),
            stripe_webhook_secret: lookup(secret_store, "STRIPE_WEBHOOK_SECRET"),
            stripe_price_pro: lookup(secret_store, "STRIPE_PRICE_PRO"),
            stripe_price_enterprise: lookup(secret_store, "STRIPE_PRICE_ENTERPRISE"),
            aws_region: lookup(secret_store, "AWS_REGION"),
            aws_access_key_id: lookup(secret_store, "AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: lookup(secret_store, "AWS_SECRET_ACCESS_KEY"),
            s3_bucket: lookup(secret_store, "S3_BUCKET"),
            default_embedding_provider: lookup(secret_store, "DEFAULT_EMBEDDING_PROVIDER")
                .unwrap_or_else(|| "openai".to_string()),
            default_embedding_model: lookup(secret_store, "DEFAULT_EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-large".to_string()),
        })
    }

    /// Configuration for tests and local runs against the given backend.
    pub fn local(backend_url: &str, jwt_secret: &str) -> Self {
        AppConfig {
            jwt_secret: jwt_secret.to_string(),
            backend_url: backend_url.trim_end_matches('/').to_string(),
            dashboard_url: "http://localhost:3000".to_string(),
            database_url: None,
            loops_api_key: None,
            email_api_url: "https://app.loops.so/api/v1".to_string(),
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            stripe_price_pro: None,
            stripe_price_enterprise: None,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            s3_bucket: None,
            default_embedding_provider: "openai".to_string(),
            default_embedding_model: "text-embedding-3-large".to_string(),
        }
    }
}
