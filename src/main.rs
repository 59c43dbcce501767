use academy_enrollment::{
    config::{database, settings},
    core::{course, report},
    errors::Result,
};
use dotenvy::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file, non-fatal since env vars can be set externally
    dotenv().ok();
    info!("Attempted to load .env file.");

    // 3. Load settings and the seed catalog
    let config = settings::load_default_config()
        .inspect_err(|e| error!("Critical error loading application configuration: {}", e))?;
    info!(
        gateway_timeout_ms = config.settings.gateway_timeout_ms,
        seed_courses = config.courses.len(),
        "Successfully processed application configuration."
    );

    // 4. Connect and create the schema
    let db = database::create_connection()
        .await
        .inspect_err(|e| error!("Failed to connect to database: {}", e))?;
    database::create_tables(&db)
        .await
        .inspect(|_| info!("Database initialized successfully."))
        .inspect_err(|e| error!("Failed to initialize database: {}", e))?;

    // 5. Seed the course catalog
    course::seed_courses(&db, &config)
        .await
        .inspect(|count| info!(count, "Course catalog ready."))
        .inspect_err(|e| error!("Failed to seed courses: {}", e))?;

    // 6. Report what is waiting for an administrator
    let queue = report::review_queue(&db).await?;
    info!(pending = queue.len(), "Enrollments awaiting validation");
    for item in &queue {
        info!("{}", report::format_review_item(item));
    }

    Ok(())
}
