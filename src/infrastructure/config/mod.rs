mod settings;

pub use settings::{
    ApiConfig, BrokerConfig, DatabaseConfig, DirectoryConfig, LogConfig, OtelConfig,
    ProviderConfig, RedisConfig, ServerConfig, Settings, StoreConfig, WorkerConfig,
};
