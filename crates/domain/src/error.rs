/// Errors raised while loading or validating client configuration.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("unknown MCP server: {0}")]
    UnknownServer(String),
}

pub type Result<T> = std::result::Result<T, Error>;
