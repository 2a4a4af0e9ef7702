use anyhow::{Context, Result};

pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
}

pub struct ServerConfig {
    pub port: u16,
}

pub struct DatabaseConfig {
    pub url: String,
}

pub fn load() -> Result<Config> {
    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse::<u16>()
        .context("PORT must be a valid port number")?;
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    Ok(Config {
        server: ServerConfig { port },
        database: DatabaseConfig { url },
    })
}
