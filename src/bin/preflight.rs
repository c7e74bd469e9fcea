use sqlx::postgres::PgPoolOptions;
use wfs_service::domain::catalog::postgres::CATALOG_TABLES;
use wfs_service::{PgCatalog, Settings};

fn usage_and_exit() -> ! {
    eprintln!(
        "Usage: cargo run --bin preflight -- [--init-catalog-if-missing]\n\
         \n\
         Requires env vars:\n\
           DATABASE_URL\n\
         Optional:\n\
           WFS_BIND_ADDR, WFS_PUBLIC_URL, WFS_DB_MAX_CONNECTIONS,\n\
           WFS_CURSOR_BUFFER, WFS_LEGACY_VERSION_NEGOTIATION\n"
    );
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        usage_and_exit();
    }
    let init_catalog_if_missing = args.iter().any(|a| a == "--init-catalog-if-missing");

    // Force-read config (nice error messages if missing)
    let settings = Settings::from_env()?;

    println!("> Preflight:");
    println!("  WFS_BIND_ADDR={}", settings.bind_addr);
    println!("  WFS_PUBLIC_URL={}", settings.public_url);
    println!("  WFS_DB_MAX_CONNECTIONS={}", settings.db_max_connections);
    println!("  WFS_CURSOR_BUFFER={}", settings.cursor_buffer);
    println!("  WFS_LEGACY_VERSION_NEGOTIATION={}", settings.legacy_version_negotiation);

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&settings.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Cannot connect to DATABASE_URL: {}", e))?;
    let server: String = sqlx::query_scalar("SHOW server_version").fetch_one(&pool).await?;
    println!("  PostgreSQL version: {}", server);

    let postgis: Option<String> = sqlx::query_scalar("SELECT PostGIS_Version()")
        .fetch_one(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("PostGIS is not available: {}", e))?;
    println!("  PostGIS version: {}", postgis.unwrap_or_default());

    let present: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::text FROM information_schema.tables
         WHERE table_schema = current_schema() AND table_name = ANY($1)",
    )
    .bind(CATALOG_TABLES.iter().map(|t| t.to_string()).collect::<Vec<_>>())
    .fetch_all(&pool)
    .await?;
    let missing: Vec<&str> = CATALOG_TABLES
        .iter()
        .copied()
        .filter(|t| !present.iter().any(|p| p == t))
        .collect();

    if missing.is_empty() {
        println!("  Catalog tables exist.");
    } else if init_catalog_if_missing {
        println!("  Catalog tables missing ({}) -> creating...", missing.join(", "));
        PgCatalog::new(pool.clone()).ensure_schema().await?;
        println!("  Catalog tables created.");
    } else {
        return Err(anyhow::anyhow!(
            "Catalog tables missing: {}. Re-run with --init-catalog-if-missing",
            missing.join(", ")
        ));
    }

    let services: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM wfs_service")
        .fetch_one(&pool)
        .await?;
    println!("  Published services: {}", services);

    println!("> Preflight OK.");
    Ok(())
}
