use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("id collision: {id:#018x} is claimed by '{existing}', cannot assign it to '{requested}'")]
    IdCollision {
        id: u64,
        existing: String,
        requested: String,
    },
}
