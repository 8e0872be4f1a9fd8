#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Proxy(#[from] ferry_proxy::ProxyError),

    #[error("{0}")]
    Settings(#[from] ferry_settings::SettingsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
