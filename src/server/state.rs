use std::sync::Arc;
use std::time::Instant;

use crate::broker::QueueBroker;
use crate::config::Settings;
use crate::dispatcher::{Dispatcher, RecipientDirectory};
use crate::provider::Provider;
use crate::redis::RedisPool;
use crate::store::JobStore;
use crate::template::TemplateEngine;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn QueueBroker>,
    pub templates: Arc<TemplateEngine>,
    pub provider: Arc<dyn Provider>,
    pub dispatcher: Arc<Dispatcher>,
    pub redis_pool: Option<Arc<RedisPool>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        settings: Settings,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn QueueBroker>,
        provider: Arc<dyn Provider>,
        directory: Arc<dyn RecipientDirectory>,
    ) -> Self {
        let templates = Arc::new(TemplateEngine::new(store.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            broker.clone(),
            templates.clone(),
            directory,
        ));

        Self {
            settings: Arc::new(settings),
            store,
            broker,
            templates,
            provider,
            dispatcher,
            redis_pool: None,
            start_time: Instant::now(),
        }
    }

    /// Report the Redis circuit breaker on `/health`.
    pub fn with_redis_pool(mut self, pool: Arc<RedisPool>) -> Self {
        self.redis_pool = Some(pool);
        self
    }
}
