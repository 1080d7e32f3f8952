use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use castro::{
    CastroError, Config, Database, Dispatcher, RequestContext, Result, Runtime, SqlDataLayer,
};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };

    // Initialize logging
    if let Err(e) = castro::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        castro::logging::init_console_only(&config.logging.level);
    }

    info!("Castro script engine {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    config.validate()?;

    let db = Database::open(&config.database.url, config.database.max_connections).await?;
    db.ensure_extension_tables(&config.scripts.table_prefix).await?;
    let data = Arc::new(SqlDataLayer::new(
        db.pool().clone(),
        tokio::runtime::Handle::current(),
        &config.scripts.table_prefix,
    ));

    // Compiling and warming interpreters blocks on the data layer.
    let boot_config = config.clone();
    let runtime = tokio::task::spawn_blocking(move || Runtime::bootstrap(&boot_config, data))
        .await
        .map_err(|e| CastroError::Script(format!("bootstrap task failed: {e}")))??;
    let dispatcher = Dispatcher::new(Arc::new(runtime));

    if config.pool.eviction_interval_secs > 0 {
        let runtime = Arc::clone(dispatcher.runtime());
        let period = Duration::from_secs(config.pool.eviction_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                runtime.pool().evict_idle();
            }
        });
    }

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        info!("No paths given, waiting for Ctrl+C");
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    for path in paths {
        match dispatcher
            .run_blocking(&path, RequestContext::new("GET", path.as_str()))
            .await
        {
            Ok(response) => {
                info!("{} -> {}", path, response.status);
                println!("{}", response.body);
            }
            Err(e) => error!("{}: {}", path, e),
        }
    }

    Ok(())
}
