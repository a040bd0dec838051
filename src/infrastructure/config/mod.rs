mod settings;

pub use settings::{
    CacheConfig, DatabaseConfig, NotifierConfig, OtelConfig, PersisterConfig, RedisConfig,
    ServerConfig, Settings,
};
