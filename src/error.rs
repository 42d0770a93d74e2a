use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("audio output unavailable: {0}")]
    Output(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered with status {0}")]
    HttpStatus(u16),
}

pub type Result<T> = std::result::Result<T, StreamerError>;
