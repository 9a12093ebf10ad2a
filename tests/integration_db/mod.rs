use dotenv::dotenv;
use lazy_static::lazy_static;
use livevote_server::db::{self, PgStore};
use sqlx::{postgres::PgConnectOptions, PgPool};
use tokio::sync::Mutex;
use tracing::{debug, span};

lazy_static! {
    static ref CREATE_DB_MUTEX: Mutex<()> = Mutex::new(());
}

async fn create_test_db(pool: PgPool, test_db: &str) {
    let _lock = CREATE_DB_MUTEX.lock().await;
    debug!("Creating new test db");

    sqlx::query(&format!("DROP DATABASE IF EXISTS {}", test_db))
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(&format!("CREATE DATABASE {}", test_db))
        .execute(&pool)
        .await
        .unwrap();
}

async fn drop_test_db(pool: PgPool, test_db: &str) {
    let _lock = CREATE_DB_MUTEX.lock().await;
    debug!("Dropping test db");
    sqlx::query(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", test_db))
        .execute(&pool)
        .await
        .unwrap();
}

/// Throwaway migrated database, dropped again when the value goes away.
pub struct IntegrationTestDb {
    db_name: String,
    store: PgStore,
    template_connect_options: PgConnectOptions,
}

impl IntegrationTestDb {
    /// `None` when `DATABASE_URL` is not set, so the Postgres tests are
    /// skipped on machines without a database.
    pub async fn new() -> Option<Self> {
        dotenv().ok();
        let template_connect_options: PgConnectOptions = match std::env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => url.parse().unwrap(),
            _ => {
                eprintln!("DATABASE_URL not set, skipping postgres test");
                return None;
            }
        };

        // Creating test database with random name
        let db_name = format!("integration_{}", uuid::Uuid::new_v4().simple());
        let span = span!(tracing::Level::DEBUG, "test_db", test_db = db_name.as_str());
        let _enter = span.enter();
        let template_pool = db::new_pool_with(template_connect_options.clone())
            .await
            .unwrap();
        create_test_db(template_pool, &db_name).await;

        let integration_options = template_connect_options.clone().database(&db_name);
        let pool = db::new_pool_with(integration_options).await.unwrap();
        let store = PgStore::new(pool);
        store.migrate().await.unwrap();

        Some(Self {
            db_name,
            store,
            template_connect_options,
        })
    }

    pub fn store(&self) -> PgStore {
        self.store.clone()
    }
}

impl Drop for IntegrationTestDb {
    fn drop(&mut self) {
        // Cleanup test db after test is finished
        let db_name = self.db_name.clone();
        let template_connect_options = self.template_connect_options.clone();
        let handle = std::thread::spawn(move || {
            let span = span!(tracing::Level::DEBUG, "test_db", test_db = db_name.as_str());
            let _enter = span.enter();
            actix_rt::System::new().block_on(async move {
                let template_pool = db::new_pool_with(template_connect_options)
                    .await
                    .unwrap();
                drop_test_db(template_pool, &db_name).await;
                debug!("Dropped test db");
            });
        });
        let _ = handle.join();
    }
}
