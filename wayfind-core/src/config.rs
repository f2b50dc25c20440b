use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct WayfindConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dimensions: u32,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub queue_capacity: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    pub model: String,
    pub fast_model: String,
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// How many prior messages are replayed as generation context.
    pub history_limit: u32,
    /// Re-persist the streaming assistant message every N accumulated chars.
    pub checkpoint_chars: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            checkpoint_chars: 50,
        }
    }
}

impl WayfindConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_defaults() {
        let chat = ChatConfig::default();
        assert_eq!(chat.history_limit, 20);
        assert_eq!(chat.checkpoint_chars, 50);
    }
}
